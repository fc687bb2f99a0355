//! Shared state behind every IPC connection.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Instant;

use nova_hub_core::HubConfig;
use nova_hub_core::HubStore;
use nova_hub_core::Mailbox;
use nova_hub_core::Orchestrator;
use nova_hub_core::authz::Authorizer;
use nova_hub_core::authz::StaticAuthorizer;
use nova_hub_core::db::DbError;
use nova_hub_core::engine::Engine;
use nova_hub_core::ledger::RouteLocks;
use nova_hub_core::notify::BroadcastNotifier;

/// Default actor recorded for sysop operations that name none.
pub const DEFAULT_ACTOR: &str = "sysop";

pub struct HubService {
    store: HubStore,
    mailbox: Mailbox,
    orchestrator: Arc<Orchestrator>,
    events: Arc<BroadcastNotifier>,
    started_at: Instant,
    connection_count: AtomicU32,
}

impl HubService {
    /// Wire the hub together around an open store.
    pub fn new(config: &HubConfig, store: HubStore, engine: Arc<dyn Engine>) -> Self {
        let events = Arc::new(BroadcastNotifier::new());
        let locks = Arc::new(RouteLocks::new());
        let authz: Arc<dyn Authorizer> = Arc::new(StaticAuthorizer::from_config(config));
        let mailbox = Mailbox::new(
            store.clone(),
            authz,
            events.clone(),
            Arc::clone(&locks),
            config.gap_policy(),
        );
        let orchestrator = Arc::new(Orchestrator::from_config(
            config,
            store.clone(),
            engine,
            events.clone(),
            locks,
        ));
        Self {
            store,
            mailbox,
            orchestrator,
            events,
            started_at: Instant::now(),
            connection_count: AtomicU32::new(0),
        }
    }

    /// Open the configured database and wire the hub.
    pub fn open(config: &HubConfig, engine: Arc<dyn Engine>) -> Result<Self, DbError> {
        let store = HubStore::open(&config.database_path(), config.database.pool_size)?;
        Ok(Self::new(config, store, engine))
    }

    pub fn store(&self) -> &HubStore {
        &self.store
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn events(&self) -> &BroadcastNotifier {
        &self.events
    }

    /// Service uptime in seconds.
    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn inc_connections(&self) -> u32 {
        self.connection_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dec_connections(&self) -> u32 {
        self.connection_count
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1)
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::Relaxed)
    }
}
