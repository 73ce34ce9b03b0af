use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::limits::MAX_RESOURCES_PER_TENANT;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::{Wal, WalHandle};

use super::{ClaimOp, StoreError, TransactionalStore, WriteIntent};

pub type SharedResource = Arc<RwLock<Resource>>;

/// In-process resource store with optional write-ahead durability.
///
/// Each resource sits behind its own `RwLock`; a conditioned write takes the
/// write lock, compares versions, logs the event and applies it before the
/// lock is released, so no reader ever sees a half-applied commit.
pub struct ResourceStore {
    resources: DashMap<ResourceId, SharedResource>,
    wal: Option<WalHandle>,
    notify: Arc<NotifyHub>,
    /// Claim commits hold this shared. Resource create/remove and compaction
    /// hold it exclusively so the log never interleaves with a snapshot.
    gate: RwLock<()>,
}

impl ResourceStore {
    /// Volatile store; state is lost on drop.
    pub fn in_memory(notify: Arc<NotifyHub>) -> Self {
        Self {
            resources: DashMap::new(),
            wal: None,
            notify,
            gate: RwLock::new(()),
        }
    }

    /// Replay the log at `wal_path` and keep appending to it.
    /// Must be called from within a tokio runtime (spawns the log writer).
    pub fn open(wal_path: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(wal_path)?;
        let replayed = events.len();

        let mut state: BTreeMap<ResourceId, Resource> = BTreeMap::new();
        for event in &events {
            match event {
                Event::ResourceCreated { id, name, capacity } => {
                    state.insert(id.clone(), Resource::new(id.clone(), name.clone(), *capacity));
                }
                Event::ResourceDeleted { id } => {
                    state.remove(id);
                }
                other => {
                    if let Some(rs) = state.get_mut(other.resource_id()) {
                        rs.apply(other);
                    }
                }
            }
        }

        let wal = WalHandle::spawn(Wal::open(wal_path)?);
        let resources = DashMap::new();
        for (id, rs) in state {
            resources.insert(id, Arc::new(RwLock::new(rs)));
        }
        info!(
            path = %wal_path.display(),
            events = replayed,
            resources = resources.len(),
            "replayed claim log"
        );

        Ok(Self {
            resources,
            wal: Some(wal),
            notify,
            gate: RwLock::new(()),
        })
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn get(&self, id: &ResourceId) -> Option<SharedResource> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    /// Log first, then apply and publish. On a log failure nothing is applied.
    async fn persist(&self, event: &Event) -> Result<(), StoreError> {
        if let Some(wal) = &self.wal {
            wal.append(event).await?;
        }
        Ok(())
    }

    /// Appends since the last compaction; always 0 for a volatile store.
    pub async fn appends_since_compact(&self) -> io::Result<u64> {
        match &self.wal {
            Some(wal) => wal.appends_since_compact().await,
            None => Ok(0),
        }
    }

    /// Rewrite the log as the minimal event list for the current state.
    /// Returns false when there is nothing to do.
    pub async fn compact_if_needed(&self, threshold: u64) -> io::Result<bool> {
        let Some(wal) = &self.wal else {
            return Ok(false);
        };
        if wal.appends_since_compact().await? < threshold {
            return Ok(false);
        }

        let _exclusive = self.gate.write().await;
        let shared: Vec<SharedResource> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in shared {
            events.extend(rs.read().await.snapshot_events());
        }
        let count = events.len();
        wal.compact(events).await?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, "compacted claim log");
        Ok(true)
    }
}

#[async_trait]
impl TransactionalStore for ResourceStore {
    async fn read(&self, resource_id: &ResourceId) -> Result<Resource, StoreError> {
        let rs = self
            .get(resource_id)
            .ok_or_else(|| StoreError::NotFound(resource_id.clone()))?;
        let guard = rs.read().await;
        Ok(guard.clone())
    }

    async fn commit(&self, intent: WriteIntent) -> Result<u64, StoreError> {
        let _shared = self.gate.read().await;
        let rs = self
            .get(&intent.resource_id)
            .ok_or_else(|| StoreError::NotFound(intent.resource_id.clone()))?;
        let mut guard = rs.write().await;

        if guard.version != intent.expected_version {
            return Err(StoreError::Conflict {
                resource_id: intent.resource_id,
                expected: intent.expected_version,
                actual: guard.version,
            });
        }

        let event = match intent.op {
            ClaimOp::Insert(claim) => Event::ClaimCreated { claim },
            ClaimOp::Remove(claim) => Event::ClaimReleased {
                id: claim.id,
                resource_id: claim.resource_id,
                claimant_id: claim.claimant_id,
            },
        };
        self.persist(&event).await?;
        guard.apply(&event);
        self.notify.send(&event);
        Ok(guard.version)
    }

    async fn create(
        &self,
        resource_id: ResourceId,
        name: Option<String>,
        capacity: u32,
    ) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;
        if self.resources.contains_key(&resource_id) {
            return Err(StoreError::AlreadyExists(resource_id));
        }
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(StoreError::LimitExceeded("too many resources"));
        }

        let event = Event::ResourceCreated {
            id: resource_id.clone(),
            name: name.clone(),
            capacity,
        };
        self.persist(&event).await?;
        let rs = Resource::new(resource_id.clone(), name, capacity);
        self.resources.insert(resource_id, Arc::new(RwLock::new(rs)));
        self.notify.send(&event);
        Ok(())
    }

    async fn remove(&self, resource_id: &ResourceId) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;
        let rs = self
            .get(resource_id)
            .ok_or_else(|| StoreError::NotFound(resource_id.clone()))?;
        let claims = rs.read().await.claimed();
        if claims > 0 {
            return Err(StoreError::HasClaims {
                resource_id: resource_id.clone(),
                claims,
            });
        }

        let event = Event::ResourceDeleted {
            id: resource_id.clone(),
        };
        self.persist(&event).await?;
        self.resources.remove(resource_id);
        self.notify.send(&event);
        self.notify.remove(resource_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Resource>, StoreError> {
        let shared: Vec<SharedResource> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            out.push(rs.read().await.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("claimd_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn rid(s: &str) -> ResourceId {
        ResourceId::from(s)
    }

    fn insert(resource: &str, claimant: &str, expected_version: u64) -> WriteIntent {
        WriteIntent {
            resource_id: rid(resource),
            expected_version,
            op: ClaimOp::Insert(Claim::new(rid(resource), ClaimantId::from(claimant))),
        }
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let store = ResourceStore::in_memory(Arc::new(NotifyHub::new()));
        let err = store.read(&rid("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!err.is_conflict());
    }

    #[tokio::test]
    async fn commit_at_current_version_applies() {
        let store = ResourceStore::in_memory(Arc::new(NotifyHub::new()));
        store.create(rid("r"), None, 2).await.unwrap();

        let v = store.commit(insert("r", "alice", 0)).await.unwrap();
        assert_eq!(v, 1);
        let rs = store.read(&rid("r")).await.unwrap();
        assert_eq!(rs.version, 1);
        assert!(rs.claim_for(&ClaimantId::from("alice")).is_some());
    }

    #[tokio::test]
    async fn stale_version_is_conflict_and_applies_nothing() {
        let store = ResourceStore::in_memory(Arc::new(NotifyHub::new()));
        store.create(rid("r"), None, 5).await.unwrap();
        store.commit(insert("r", "alice", 0)).await.unwrap();

        let err = store.commit(insert("r", "bob", 0)).await.unwrap_err();
        match err {
            StoreError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
        let rs = store.read(&rid("r")).await.unwrap();
        assert_eq!(rs.claimed(), 1);
        assert_eq!(rs.version, 1);
    }

    #[tokio::test]
    async fn commit_to_missing_resource_is_not_found() {
        let store = ResourceStore::in_memory(Arc::new(NotifyHub::new()));
        let err = store.commit(insert("ghost", "a", 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let store = ResourceStore::in_memory(Arc::new(NotifyHub::new()));
        store.create(rid("r"), None, 1).await.unwrap();
        let err = store.create(rid("r"), None, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn remove_with_claims_rejected() {
        let store = ResourceStore::in_memory(Arc::new(NotifyHub::new()));
        store.create(rid("r"), None, 1).await.unwrap();
        store.commit(insert("r", "a", 0)).await.unwrap();

        let err = store.remove(&rid("r")).await.unwrap_err();
        assert!(matches!(err, StoreError::HasClaims { claims: 1, .. }));

        let rs = store.read(&rid("r")).await.unwrap();
        let claim = rs.claim_for(&ClaimantId::from("a")).unwrap().clone();
        store
            .commit(WriteIntent {
                resource_id: rid("r"),
                expected_version: rs.version,
                op: ClaimOp::Remove(claim),
            })
            .await
            .unwrap();
        store.remove(&rid("r")).await.unwrap();
        assert_eq!(store.resource_count(), 0);
    }

    #[tokio::test]
    async fn list_is_sorted_by_id() {
        let store = ResourceStore::in_memory(Arc::new(NotifyHub::new()));
        for id in ["c", "a", "b"] {
            store.create(rid(id), None, 1).await.unwrap();
        }
        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn commits_are_published() {
        let notify = Arc::new(NotifyHub::new());
        let store = ResourceStore::in_memory(notify.clone());
        store.create(rid("r"), None, 1).await.unwrap();
        let mut rx = notify.subscribe(&rid("r"));

        store.commit(insert("r", "a", 0)).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::ClaimCreated { ref claim } if claim.claimant_id.as_str() == "a"));
    }

    #[tokio::test]
    async fn reopen_replays_claims() {
        let path = test_wal_path("reopen_replays.wal");
        {
            let store = ResourceStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
            assert!(store.is_durable());
            store.create(rid("r"), Some("Gala".into()), 3).await.unwrap();
            store.commit(insert("r", "alice", 0)).await.unwrap();
            store.commit(insert("r", "bob", 1)).await.unwrap();
            store.create(rid("tmp"), None, 1).await.unwrap();
            store.remove(&rid("tmp")).await.unwrap();
        }

        let store = ResourceStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(store.resource_count(), 1);
        let rs = store.read(&rid("r")).await.unwrap();
        assert_eq!(rs.name.as_deref(), Some("Gala"));
        assert_eq!(rs.capacity, 3);
        let claimants: Vec<&str> = rs.claimants().map(|c| c.as_str()).collect();
        assert_eq!(claimants, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn commits_after_torn_tail_survive_restart() {
        use std::io::Write;

        let path = test_wal_path("torn_then_commit.wal");
        {
            let store = ResourceStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
            store.create(rid("r"), None, 1).await.unwrap();
        }
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2, 3]).unwrap();
        }
        {
            let store = ResourceStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
            assert_eq!(store.commit(insert("r", "alice", 0)).await.unwrap(), 1);
        }

        let store = ResourceStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
        let rs = store.read(&rid("r")).await.unwrap();
        let claimants: Vec<&str> = rs.claimants().map(|c| c.as_str()).collect();
        assert_eq!(claimants, vec!["alice"]);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction_preserves.wal");
        {
            let store = ResourceStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
            store.create(rid("r"), None, 1).await.unwrap();
            for i in 0..10u64 {
                let rs = store.read(&rid("r")).await.unwrap();
                let op = match rs.claims.values().next() {
                    Some(claim) => ClaimOp::Remove(claim.clone()),
                    None => ClaimOp::Insert(Claim::new(rid("r"), ClaimantId::from(format!("c{i}")))),
                };
                store
                    .commit(WriteIntent {
                        resource_id: rid("r"),
                        expected_version: rs.version,
                        op,
                    })
                    .await
                    .unwrap();
            }
            store.commit(insert("r", "keeper", 10)).await.unwrap();

            assert!(!store.compact_if_needed(1_000).await.unwrap());
            assert!(store.compact_if_needed(5).await.unwrap());
            assert_eq!(store.appends_since_compact().await.unwrap(), 0);
        }

        assert_eq!(Wal::replay(&path).unwrap().len(), 2);
        let store = ResourceStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
        let rs = store.read(&rid("r")).await.unwrap();
        let claimants: Vec<&str> = rs.claimants().map(|c| c.as_str()).collect();
        assert_eq!(claimants, vec!["keeper"]);
    }

    #[tokio::test]
    async fn volatile_store_never_compacts() {
        let store = ResourceStore::in_memory(Arc::new(NotifyHub::new()));
        assert!(!store.is_durable());
        assert!(!store.compact_if_needed(0).await.unwrap());
    }
}
