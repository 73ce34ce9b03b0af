use crate::limits::MAX_CAPACITY;
use crate::model::{ClaimantId, ResourceId};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    #[error("resource {resource_id} is full: all {capacity} slots claimed")]
    Full {
        resource_id: ResourceId,
        capacity: u32,
    },
    #[error("gave up on {resource_id} after {attempts} conflicting writes; try again")]
    ConflictExhausted {
        resource_id: ResourceId,
        attempts: u32,
    },
    #[error("reservation for {claimant_id} on {resource_id} is already in flight")]
    DuplicateInFlight {
        resource_id: ResourceId,
        claimant_id: ClaimantId,
    },
    #[error("invalid id: {0}")]
    InvalidId(&'static str),
    #[error("invalid capacity {0}: must be between 1 and {max}", max = MAX_CAPACITY)]
    InvalidCapacity(u32),
    #[error("resource already exists: {0}")]
    AlreadyExists(ResourceId),
    #[error("cannot delete resource {resource_id}: {claims} claims outstanding")]
    HasClaims {
        resource_id: ResourceId,
        claims: usize,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(#[source] std::io::Error),
}

impl EngineError {
    /// Whether the caller may reasonably retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConflictExhausted { .. } | EngineError::DuplicateInFlight { .. }
        )
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Full { .. } => "full",
            EngineError::ConflictExhausted { .. } => "conflict_exhausted",
            EngineError::DuplicateInFlight { .. } => "duplicate_in_flight",
            EngineError::InvalidId(_) | EngineError::InvalidCapacity(_) => "invalid",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::HasClaims { .. } => "has_claims",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "error",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            // Only reachable when a store reports a conflict outside the retry loop.
            StoreError::Conflict { resource_id, .. } => EngineError::ConflictExhausted {
                resource_id,
                attempts: 1,
            },
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            StoreError::HasClaims { resource_id, claims } => {
                EngineError::HasClaims { resource_id, claims }
            }
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            StoreError::Storage(e) => EngineError::Storage(e),
        }
    }
}
