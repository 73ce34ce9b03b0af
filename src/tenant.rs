use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::info;

use crate::compactor;
use crate::engine::{BackoffPolicy, ReservationEngine};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::store::ResourceStore;

type TenantSlot = Arc<OnceCell<Arc<ReservationEngine>>>;

/// Per-tenant engines. Each tenant gets its own store, claim log and compactor.
/// Tenant = database name from the pgwire connection, keyed by its sanitized
/// form so that one log file always belongs to exactly one engine.
pub struct TenantManager {
    engines: DashMap<String, TenantSlot>,
    data_dir: PathBuf,
    compact_threshold: u64,
    backoff: BackoffPolicy,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, backoff: BackoffPolicy) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            backoff,
        }
    }

    /// Tenants whose log has been opened.
    pub fn tenant_count(&self) -> usize {
        self.engines
            .iter()
            .filter(|e| e.value().initialized())
            .count()
    }

    /// Get or lazily create the engine for `tenant`.
    pub async fn get_or_create(&self, tenant: &str) -> io::Result<Arc<ReservationEngine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let existing = self.engines.get(&safe_name).map(|slot| slot.value().clone());
        let slot = match existing {
            Some(slot) => slot,
            None => {
                if self.engines.len() >= MAX_TENANTS {
                    return Err(io::Error::other("too many tenants"));
                }
                // The shard lock is only held to insert the empty slot.
                self.engines.entry(safe_name.clone()).or_default().clone()
            }
        };

        // Concurrent first connections wait on the same cell, so a log is opened once.
        let engine = slot
            .get_or_try_init(|| self.open_tenant(&safe_name))
            .await?;
        Ok(engine.clone())
    }

    async fn open_tenant(&self, safe_name: &str) -> io::Result<Arc<ReservationEngine>> {
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());

        // Replay is file I/O; keep it off the async workers.
        let replay_notify = notify.clone();
        let store = tokio::task::spawn_blocking(move || {
            ResourceStore::open(&wal_path, replay_notify)
        })
        .await
        .map_err(io::Error::other)??;
        let store = Arc::new(store);

        tokio::spawn(compactor::run_compactor(
            store.clone(),
            self.compact_threshold,
        ));
        let engine = Arc::new(ReservationEngine::new(store, notify, self.backoff));

        info!(tenant = safe_name, "tenant opened");
        // This tenant's cell is not initialized until we return.
        let active = self.tenant_count() + 1;
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(active as f64);
        Ok(engine)
    }
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
