//! Storage contract the reservation engine runs against.
//!
//! The engine only needs optimistic read-then-conditioned-write over a single
//! resource document. Any backend that never partially applies a write and
//! reports a version mismatch as [`StoreError::Conflict`] (distinct from an
//! absent document and from I/O failure) satisfies it.

mod resources;

pub use resources::{ResourceStore, SharedResource};

use async_trait::async_trait;

use crate::model::{Claim, ClaimantId, Resource, ResourceId};

/// The mutation carried by a conditioned write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOp {
    /// Add the claim (and with it, its claimant).
    Insert(Claim),
    /// Remove this claim, as read from the snapshot.
    Remove(Claim),
}

impl ClaimOp {
    pub fn claimant_id(&self) -> &ClaimantId {
        match self {
            ClaimOp::Insert(c) | ClaimOp::Remove(c) => &c.claimant_id,
        }
    }
}

/// Apply `op` iff the resource is still at `expected_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteIntent {
    pub resource_id: ResourceId,
    pub expected_version: u64,
    pub op: ClaimOp,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    #[error("write conflict on {resource_id}: expected version {expected}, found {actual}")]
    Conflict {
        resource_id: ResourceId,
        expected: u64,
        actual: u64,
    },
    #[error("resource already exists: {0}")]
    AlreadyExists(ResourceId),
    #[error("resource {resource_id} still has {claims} claims")]
    HasClaims { resource_id: ResourceId, claims: usize },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl StoreError {
    /// True only for the concurrent-writer signal; everything else is terminal.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// A consistent snapshot of one resource, including its version.
    async fn read(&self, resource_id: &ResourceId) -> Result<Resource, StoreError>;

    /// Atomically apply the intent if the version still matches. Returns the
    /// new version. Must never apply partially.
    async fn commit(&self, intent: WriteIntent) -> Result<u64, StoreError>;

    async fn create(
        &self,
        resource_id: ResourceId,
        name: Option<String>,
        capacity: u32,
    ) -> Result<(), StoreError>;

    /// Fails with `HasClaims` unless the resource is empty.
    async fn remove(&self, resource_id: &ResourceId) -> Result<(), StoreError>;

    /// Snapshots of every resource, ordered by id.
    async fn list(&self) -> Result<Vec<Resource>, StoreError>;
}
