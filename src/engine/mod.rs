mod backoff;
mod debounce;
mod error;

pub use backoff::{BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
pub use debounce::{DebounceGuard, DebounceKey, DebouncePermit};
pub use error::EngineError;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::store::{ClaimOp, ResourceStore, TransactionalStore, WriteIntent};

/// What one transactional round decided after looking at the snapshot.
enum Decision<T> {
    /// Terminal without writing.
    Done(T),
    /// Commit `ClaimOp` against the snapshot's version; `T` on success.
    Write(ClaimOp, T),
}

/// Capacity-bounded claim engine over a [`TransactionalStore`].
///
/// `reserve` and `cancel` run read → decide → conditioned write, retrying only
/// when the store reports a concurrent writer. The capacity check is made
/// against the same snapshot version the write is conditioned on, so no
/// committed state can exceed capacity.
pub struct ReservationEngine {
    store: Arc<dyn TransactionalStore>,
    notify: Arc<NotifyHub>,
    debounce: DebounceGuard,
    backoff: BackoffPolicy,
}

impl ReservationEngine {
    /// `notify` should be the hub the store publishes to.
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        notify: Arc<NotifyHub>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            notify,
            debounce: DebounceGuard::new(),
            backoff,
        }
    }

    /// Engine over a fresh volatile [`ResourceStore`].
    pub fn in_memory(backoff: BackoffPolicy) -> Self {
        let notify = Arc::new(NotifyHub::new());
        let store = Arc::new(ResourceStore::in_memory(notify.clone()));
        Self::new(store, notify, backoff)
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Reserve calls currently holding their duplicate guard.
    pub fn in_flight(&self) -> usize {
        self.debounce.in_flight()
    }

    // ── Claims ───────────────────────────────────────────────

    pub async fn reserve(
        &self,
        resource_id: &ResourceId,
        claimant_id: &ClaimantId,
    ) -> Result<ReserveOutcome, EngineError> {
        validate_ids(resource_id, claimant_id)?;

        let started = Instant::now();
        let result = self.reserve_guarded(resource_id, claimant_id).await;

        let outcome = match &result {
            Ok(out) => out.label(),
            Err(e) => e.label(),
        };
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::RESERVE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!(%resource_id, %claimant_id, outcome, "reserve");
        result
    }

    async fn reserve_guarded(
        &self,
        resource_id: &ResourceId,
        claimant_id: &ClaimantId,
    ) -> Result<ReserveOutcome, EngineError> {
        let key = DebounceKey::new(resource_id.clone(), claimant_id.clone());
        let Some(_permit) = self.debounce.try_permit(key) else {
            metrics::counter!(observability::DEBOUNCE_REJECTIONS_TOTAL).increment(1);
            return Err(EngineError::DuplicateInFlight {
                resource_id: resource_id.clone(),
                claimant_id: claimant_id.clone(),
            });
        };

        self.transact(resource_id, |rs| {
            if let Some(existing) = rs.claim_for(claimant_id) {
                return Ok(Decision::Done(ReserveOutcome::AlreadyReserved(existing.clone())));
            }
            if rs.is_full() {
                return Err(EngineError::Full {
                    resource_id: rs.id.clone(),
                    capacity: rs.capacity,
                });
            }
            let claim = Claim::new(rs.id.clone(), claimant_id.clone());
            Ok(Decision::Write(
                ClaimOp::Insert(claim.clone()),
                ReserveOutcome::Reserved(claim),
            ))
        })
        .await
    }

    /// Release `claimant_id`'s slot. Idempotent: a second cancel is `NotClaimed`.
    pub async fn cancel(
        &self,
        resource_id: &ResourceId,
        claimant_id: &ClaimantId,
    ) -> Result<CancelOutcome, EngineError> {
        validate_ids(resource_id, claimant_id)?;

        let result = self
            .transact(resource_id, |rs| {
                Ok(match rs.claim_for(claimant_id) {
                    None => Decision::Done(CancelOutcome::NotClaimed),
                    Some(claim) => Decision::Write(
                        ClaimOp::Remove(claim.clone()),
                        CancelOutcome::Released(claim.clone()),
                    ),
                })
            })
            .await;

        let outcome = match &result {
            Ok(out) => out.label(),
            Err(e) => e.label(),
        };
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "outcome" => outcome).increment(1);
        debug!(%resource_id, %claimant_id, outcome, "cancel");
        result
    }

    /// Current claimants, ordered by id. Single snapshot read.
    pub async fn list_claimants(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Vec<ClaimantId>, EngineError> {
        let rs = self.store.read(resource_id).await?;
        Ok(rs.claimants().cloned().collect())
    }

    /// Current claim records, ordered by claimant id.
    pub async fn list_claims(&self, resource_id: &ResourceId) -> Result<Vec<Claim>, EngineError> {
        let rs = self.store.read(resource_id).await?;
        Ok(rs.claims.into_values().collect())
    }

    /// Run read → decide → conditioned write until it lands, a decision is
    /// terminal, or attempts run out.
    async fn transact<T, F>(&self, resource_id: &ResourceId, mut decide: F) -> Result<T, EngineError>
    where
        F: FnMut(&Resource) -> Result<Decision<T>, EngineError>,
    {
        let attempts = self.backoff.max_attempts();
        for attempt in 0..attempts {
            let snapshot = self.store.read(resource_id).await?;
            let (op, outcome) = match decide(&snapshot)? {
                Decision::Done(outcome) => return Ok(outcome),
                Decision::Write(op, outcome) => (op, outcome),
            };

            let intent = WriteIntent {
                resource_id: resource_id.clone(),
                expected_version: snapshot.version,
                op,
            };
            match self.store.commit(intent).await {
                Ok(_) => return Ok(outcome),
                Err(e) if self.backoff.is_retryable(&e) => {
                    metrics::counter!(observability::CONFLICT_RETRIES_TOTAL).increment(1);
                    if attempt + 1 < attempts {
                        let delay = self.backoff.next_delay(attempt);
                        debug!(%resource_id, attempt, ?delay, "write conflict, backing off");
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%resource_id, attempts, "write conflicts exhausted retries");
        Err(EngineError::ConflictExhausted {
            resource_id: resource_id.clone(),
            attempts,
        })
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        resource_id: ResourceId,
        name: Option<String>,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_resource_id(&resource_id)?;
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(EngineError::InvalidCapacity(capacity));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        self.store.create(resource_id, name, capacity).await?;
        Ok(())
    }

    /// Fails with `HasClaims` while any slot is held.
    pub async fn delete_resource(&self, resource_id: &ResourceId) -> Result<(), EngineError> {
        self.store.remove(resource_id).await?;
        Ok(())
    }

    pub async fn resource(&self, resource_id: &ResourceId) -> Result<Resource, EngineError> {
        Ok(self.store.read(resource_id).await?)
    }

    pub async fn resources(&self) -> Result<Vec<Resource>, EngineError> {
        Ok(self.store.list().await?)
    }

    /// Follow every committed event on `resource_id`.
    pub async fn subscribe(
        &self,
        resource_id: &ResourceId,
    ) -> Result<broadcast::Receiver<Event>, EngineError> {
        self.store.read(resource_id).await?;
        Ok(self.notify.subscribe(resource_id))
    }
}

fn validate_ids(resource_id: &ResourceId, claimant_id: &ClaimantId) -> Result<(), EngineError> {
    validate_resource_id(resource_id)?;
    check_id(claimant_id.as_str(), "claimant id is empty", "claimant id too long")
}

fn validate_resource_id(resource_id: &ResourceId) -> Result<(), EngineError> {
    check_id(resource_id.as_str(), "resource id is empty", "resource id too long")
}

fn check_id(id: &str, empty: &'static str, too_long: &'static str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::InvalidId(empty));
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(())
}
