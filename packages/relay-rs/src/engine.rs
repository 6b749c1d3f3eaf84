//! Engine lifecycle: wiring, startup, and graceful shutdown.
//!
//! [`EngineBuilder`] wires stores, handlers, and configuration into an
//! [`Engine`]; [`Engine::start`] performs the startup sequence and hands
//! back an [`EngineHandle`] that owns the background tasks:
//!
//! 1. Validate configuration (fail fast on anything unrunnable).
//! 2. Ensure partition rows exist; a count mismatch is fatal.
//! 3. Register this instance as `RUNNING`.
//! 4. Run one rebalance so the first tick already owns partitions.
//! 5. Spawn the heartbeat, rebalance, and poll loops.
//!
//! Shutdown mirrors it: mark the instance `STOPPING`, cancel the token so
//! the dispatch loop stops enqueuing keys, release owned partitions,
//! drain the limiter up to the configured deadline (reporting stragglers,
//! whose locks expire naturally), release once more to cover claims the
//! rebalance loop raced in, and mark the instance `STOPPED`.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::coordinator::PartitionCoordinator;
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::instance::InstanceRegistrar;
use crate::interceptor::DeliveryInterceptor;
use crate::limiter::ProcessingLimiter;
use crate::lock::LockManager;
use crate::registry::HandlerRegistry;
use crate::store::{InstanceStore, LockStore, PartitionStore, RecordStore};

/// Wires an [`Engine`] together.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: SharedClock,
    registry: HandlerRegistry,
    records: Option<Arc<dyn RecordStore>>,
    locks: Option<Arc<dyn LockStore>>,
    instances: Option<Arc<dyn InstanceStore>>,
    partitions: Option<Arc<dyn PartitionStore>>,
    delivery_interceptors: Vec<Arc<dyn DeliveryInterceptor>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            registry: HandlerRegistry::new(),
            records: None,
            locks: None,
            instances: None,
            partitions: None,
            delivery_interceptors: Vec::new(),
        }
    }

    /// Replace the wall clock (tests inject a manual clock here).
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.records = Some(store);
        self
    }

    pub fn with_lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.locks = Some(store);
        self
    }

    pub fn with_instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.instances = Some(store);
        self
    }

    pub fn with_partition_store(mut self, store: Arc<dyn PartitionStore>) -> Self {
        self.partitions = Some(store);
        self
    }

    /// Use one value for all four stores (anything implementing every
    /// store trait, such as the in-memory test store).
    pub fn with_stores<S>(self, store: Arc<S>) -> Self
    where
        S: RecordStore + LockStore + InstanceStore + PartitionStore + 'static,
    {
        self.with_record_store(store.clone())
            .with_lock_store(store.clone())
            .with_instance_store(store.clone())
            .with_partition_store(store)
    }

    /// Install the handler registry built by the integrator.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Append a delivery interceptor; they run in registration order
    /// around every handler invocation.
    pub fn with_delivery_interceptor(mut self, interceptor: Arc<dyn DeliveryInterceptor>) -> Self {
        self.delivery_interceptors.push(interceptor);
        self
    }

    /// Validate and wire everything. Fails fast on configuration or
    /// registration problems; touches no storage.
    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;
        let records = self.records.ok_or(EngineError::MissingStore("record store"))?;
        let locks = self.locks.ok_or(EngineError::MissingStore("lock store"))?;
        let instances = self
            .instances
            .ok_or(EngineError::MissingStore("instance store"))?;
        let partitions = self
            .partitions
            .ok_or(EngineError::MissingStore("partition store"))?;

        let token = CancellationToken::new();
        let limiter = Arc::new(ProcessingLimiter::new(self.config.concurrency_limit));
        let registrar = Arc::new(InstanceRegistrar::new(
            instances.clone(),
            self.clock.clone(),
            &self.config.instance,
        ));
        let coordinator = Arc::new(PartitionCoordinator::new(
            partitions.clone(),
            instances,
            self.clock.clone(),
            registrar.instance_id().to_owned(),
            self.config.instance.heartbeat_timeout,
            self.config.partitions.rebalance_interval,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            records,
            LockManager::new(locks, self.clock.clone(), &self.config.locking),
            Arc::new(self.registry),
            limiter.clone(),
            coordinator.clone(),
            self.delivery_interceptors,
            self.config.retry.build(),
            self.clock.clone(),
            self.config.batch_size,
            token.clone(),
        ));

        Ok(Engine {
            config: self.config,
            clock: self.clock,
            partitions,
            registrar,
            coordinator,
            dispatcher,
            limiter,
            token,
        })
    }
}

/// A wired but not yet started engine.
pub struct Engine {
    config: EngineConfig,
    clock: SharedClock,
    partitions: Arc<dyn PartitionStore>,
    registrar: Arc<InstanceRegistrar>,
    coordinator: Arc<PartitionCoordinator>,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<ProcessingLimiter>,
    token: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// This process's generated instance id.
    pub fn instance_id(&self) -> &str {
        self.registrar.instance_id()
    }

    /// Run the startup sequence and spawn the background loops.
    pub async fn start(self) -> Result<EngineHandle, EngineError> {
        if !self.config.enabled {
            info!("outbox engine disabled by configuration");
            return Ok(self.into_handle(false, Vec::new()));
        }

        let existing = self.partitions.count().await?;
        if existing == 0 {
            self.partitions
                .init(self.config.partition_count, self.clock.now())
                .await?;
        } else if existing != self.config.partition_count {
            return Err(EngineError::PartitionCountChanged {
                found: existing,
                configured: self.config.partition_count,
            });
        }

        self.registrar.register().await?;
        self.coordinator.rebalance().await?;

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(
            self.registrar.clone().run(self.token.clone()),
        ));
        tasks.push(tokio::spawn(
            self.coordinator.clone().run(self.token.clone()),
        ));
        tasks.push(tokio::spawn(poll_loop(
            self.dispatcher.clone(),
            self.config.poll_interval,
            self.token.clone(),
        )));

        info!(
            instance_id = %self.registrar.instance_id(),
            partitions = self.config.partition_count,
            concurrency_limit = self.config.concurrency_limit,
            "outbox engine started"
        );
        Ok(self.into_handle(true, tasks))
    }

    fn into_handle(self, enabled: bool, tasks: Vec<JoinHandle<()>>) -> EngineHandle {
        EngineHandle {
            enabled,
            token: self.token,
            tasks,
            registrar: self.registrar,
            coordinator: self.coordinator,
            limiter: self.limiter,
            graceful_shutdown_timeout: self.config.graceful_shutdown_timeout,
        }
    }
}

async fn poll_loop(
    dispatcher: Arc<Dispatcher>,
    poll_interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => dispatcher.run_tick().await,
        }
    }
}

/// A running engine. Dropping the handle detaches the background tasks;
/// call [`shutdown`](EngineHandle::shutdown) for an orderly stop.
pub struct EngineHandle {
    enabled: bool,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    registrar: Arc<InstanceRegistrar>,
    coordinator: Arc<PartitionCoordinator>,
    limiter: Arc<ProcessingLimiter>,
    graceful_shutdown_timeout: std::time::Duration,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Whether the engine actually started loops.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn instance_id(&self) -> &str {
        self.registrar.instance_id()
    }

    /// Partitions currently owned by this instance.
    pub fn owned_partitions(&self) -> Vec<i32> {
        self.coordinator.owned_partitions()
    }

    /// Keys being processed right now.
    pub fn in_flight_keys(&self) -> Vec<String> {
        self.limiter.in_flight_keys()
    }

    /// Keys processed since startup.
    pub fn processed(&self) -> u64 {
        self.limiter.processed()
    }

    /// Orderly stop: stop enqueuing, release partitions, drain in-flight
    /// work up to the configured deadline, mark the instance stopped.
    pub async fn shutdown(mut self) {
        if !self.enabled {
            return;
        }
        info!("outbox engine stopping");
        if let Err(e) = self.registrar.mark_stopping().await {
            warn!(error = %e, "failed to mark instance as stopping");
        }

        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        if let Err(e) = self.coordinator.release_all().await {
            warn!(error = %e, "partition release failed");
        }
        if let Err(timeout) = self.limiter.await_all(self.graceful_shutdown_timeout).await {
            warn!(
                keys = ?timeout.keys,
                "in-flight keys did not drain before the deadline; their locks expire naturally"
            );
        }
        // The rebalance loop may have claimed something between the first
        // release and its own cancellation.
        if let Err(e) = self.coordinator.release_all().await {
            warn!(error = %e, "final partition release failed");
        }
        if let Err(e) = self.registrar.mark_stopped().await {
            warn!(error = %e, "failed to mark instance as stopped");
        }
        info!("outbox engine stopped");
    }

    /// Kill the background tasks without any cleanup, as a crash would.
    /// Locks and partition leases are left behind for peers to reclaim.
    /// Intended for failover testing.
    pub fn abort(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::testing::{ManualClock, MemoryStore};

    fn memory_engine(config: EngineConfig) -> Result<Engine, EngineError> {
        EngineBuilder::new(config)
            .with_clock(Arc::new(ManualClock::epoch()))
            .with_stores(Arc::new(MemoryStore::new()))
            .build()
    }

    #[test]
    fn test_build_requires_stores() {
        let err = EngineBuilder::new(EngineConfig::default()).build().unwrap_err();
        assert!(matches!(err, EngineError::MissingStore("record store")));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = EngineConfig {
            partition_count: 0,
            ..Default::default()
        };
        let err = memory_engine(config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_disabled_engine_starts_nothing() {
        let config = EngineConfig {
            enabled: false,
            ..Default::default()
        };
        let handle = memory_engine(config).unwrap().start().await.unwrap();
        assert!(!handle.is_enabled());
        assert!(handle.owned_partitions().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_partition_count_change_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        store.init(8, clock.now()).await.unwrap();

        let config = EngineConfig {
            partition_count: 16,
            ..Default::default()
        };
        let engine = EngineBuilder::new(config)
            .with_clock(clock)
            .with_stores(store)
            .build()
            .unwrap();

        let err = engine.start().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::PartitionCountChanged {
                found: 8,
                configured: 16
            }
        ));
    }

    #[tokio::test]
    async fn test_startup_claims_partitions() {
        let config = EngineConfig {
            partition_count: 4,
            ..Default::default()
        };
        let handle = memory_engine(config).unwrap().start().await.unwrap();
        assert_eq!(handle.owned_partitions(), vec![0, 1, 2, 3]);
        handle.shutdown().await;
    }
}
