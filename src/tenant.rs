use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::collab::Collaborators;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// background reaper/compactor. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    pending_ttl_ms: i64,
    collab: Arc<Collaborators>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, pending_ttl_ms: i64) -> Self {
        Self::with_collaborators(data_dir, compact_threshold, pending_ttl_ms, Collaborators::noop())
    }

    pub fn with_collaborators(
        data_dir: PathBuf,
        compact_threshold: u64,
        pending_ttl_ms: i64,
        collab: Arc<Collaborators>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            pending_ttl_ms,
            collab,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.collab.clone())?);

        let reaper_engine = engine.clone();
        let ttl = self.pending_ttl_ms;
        tokio::spawn(async move {
            reaper::run_reaper(reaper_engine, ttl).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
