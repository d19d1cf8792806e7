use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::{FanoutSink, NotificationSink, NotifyHub};

/// One tenant's ledger plus the hub its LISTEN sessions subscribe to.
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    engine_config: EngineConfig,
    /// Extra sink every tenant also notifies (e.g. the delivery queue).
    delivery: Option<Arc<dyn NotificationSink>>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, engine_config: EngineConfig) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
            engine_config,
            delivery: None,
        }
    }

    pub fn with_delivery(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.delivery = Some(sink);
        self
    }

    /// Get or lazily create the tenant for `name`.
    pub fn get_or_create(&self, name: &str) -> io::Result<Arc<Tenant>> {
        if let Some(tenant) = self.tenants.get(name) {
            return Ok(tenant.value().clone());
        }
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = name
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }

        // The entry guard keeps two first connections from opening the same WAL twice.
        let tenant = self
            .tenants
            .entry(name.to_string())
            .or_try_insert_with(|| self.open(&safe_name))?
            .value()
            .clone();
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(tenant)
    }

    fn open(&self, safe_name: &str) -> io::Result<Arc<Tenant>> {
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let hub = Arc::new(NotifyHub::new());
        let sink: Arc<dyn NotificationSink> = match &self.delivery {
            Some(delivery) => Arc::new(FanoutSink::new(vec![hub.clone(), delivery.clone()])),
            None => hub.clone(),
        };
        let engine = Arc::new(Engine::new(wal_path, sink, self.engine_config.clone())?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        info!(tenant = safe_name, "tenant opened");
        Ok(Arc::new(Tenant { engine, hub }))
    }
}
