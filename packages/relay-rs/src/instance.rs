//! Instance registration and heartbeats.
//!
//! Each process registers one instance row at startup and keeps it fresh
//! with a periodic heartbeat. Liveness is derived, never stored: an
//! instance is live iff `status = RUNNING` and its heartbeat is younger
//! than the configured timeout. Every heartbeat tick also sweeps other
//! instances that stopped heartbeating, which is idempotent and safe to
//! run from any number of instances concurrently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{to_delta, Clock, SharedClock};
use crate::config::InstanceConfig;
use crate::store::InstanceStore;

/// Lifecycle state of a dispatcher instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::Stopped => "STOPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STARTING" => Some(InstanceStatus::Starting),
            "RUNNING" => Some(InstanceStatus::Running),
            "STOPPING" => Some(InstanceStatus::Stopping),
            "STOPPED" => Some(InstanceStatus::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered dispatcher process.
#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: String,
    pub hostname: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Registers this instance and keeps its heartbeat fresh.
pub struct InstanceRegistrar {
    store: Arc<dyn InstanceStore>,
    clock: SharedClock,
    instance_id: String,
    hostname: String,
    port: u16,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl InstanceRegistrar {
    pub fn new(store: Arc<dyn InstanceStore>, clock: SharedClock, config: &InstanceConfig) -> Self {
        let hostname = config
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_owned());
        Self {
            store,
            clock,
            instance_id: format!("relay-{}", Uuid::new_v4()),
            hostname,
            port: config.port,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }

    /// The generated identifier for this process.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Insert this instance as `RUNNING`.
    pub async fn register(&self) -> Result<()> {
        let now = self.clock.now();
        self.store
            .register(&Instance {
                instance_id: self.instance_id.clone(),
                hostname: self.hostname.clone(),
                port: self.port,
                status: InstanceStatus::Running,
                started_at: now,
                last_heartbeat: now,
            })
            .await
    }

    /// One heartbeat tick: refresh our own row, then sweep stale peers.
    pub async fn tick(&self) -> Result<u64> {
        let now = self.clock.now();
        self.store.heartbeat(&self.instance_id, now).await?;
        let cutoff = now - to_delta(self.heartbeat_timeout);
        let swept = self.store.sweep_stale(cutoff).await?;
        if swept > 0 {
            warn!(count = swept, "marked unresponsive instances as stopped");
        }
        Ok(swept)
    }

    pub async fn mark_stopping(&self) -> Result<()> {
        self.store
            .set_status(&self.instance_id, InstanceStatus::Stopping)
            .await
    }

    pub async fn mark_stopped(&self) -> Result<()> {
        self.store
            .set_status(&self.instance_id, InstanceStatus::Stopped)
            .await
    }

    /// Heartbeat loop; runs until the token is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.tick().await; // registration already stamped a heartbeat
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(instance_id = %self.instance_id, error = %e, "heartbeat failed");
                    } else {
                        debug!(instance_id = %self.instance_id, "heartbeat");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::testing::{ManualClock, MemoryStore};

    fn config() -> InstanceConfig {
        InstanceConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            hostname: Some("test-host".to_owned()),
            port: 0,
        }
    }

    #[tokio::test]
    async fn test_register_inserts_running_instance() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let registrar = InstanceRegistrar::new(store.clone(), clock.clone(), &config());

        registrar.register().await.unwrap();

        let live = store.live(clock.now()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].instance_id, registrar.instance_id());
        assert_eq!(live[0].status, InstanceStatus::Running);
        assert_eq!(live[0].hostname, "test-host");
    }

    #[tokio::test]
    async fn test_tick_refreshes_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let registrar = InstanceRegistrar::new(store.clone(), clock.clone(), &config());
        registrar.register().await.unwrap();

        clock.advance(Duration::from_secs(10));
        registrar.tick().await.unwrap();

        let live = store.live(clock.now()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].last_heartbeat, clock.now());
    }

    #[tokio::test]
    async fn test_stale_instances_are_swept() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let dead = InstanceRegistrar::new(store.clone(), clock.clone(), &config());
        dead.register().await.unwrap();

        // The dead instance never heartbeats again.
        clock.advance(Duration::from_secs(60));
        let sweeper = InstanceRegistrar::new(store.clone(), clock.clone(), &config());
        sweeper.register().await.unwrap();
        let swept = sweeper.tick().await.unwrap();
        assert_eq!(swept, 1);

        let cutoff = clock.now() - chrono::Duration::seconds(15);
        let live = store.live(cutoff).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].instance_id, sweeper.instance_id());
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_converge() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let dead = InstanceRegistrar::new(store.clone(), clock.clone(), &config());
        dead.register().await.unwrap();

        clock.advance(Duration::from_secs(60));
        let a = InstanceRegistrar::new(store.clone(), clock.clone(), &config());
        let b = InstanceRegistrar::new(store.clone(), clock.clone(), &config());
        a.register().await.unwrap();
        b.register().await.unwrap();

        // Both sweep; the second pass finds nothing left to do.
        let first = a.tick().await.unwrap();
        let second = b.tick().await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_mark_stopped_removes_from_live_set() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let registrar = InstanceRegistrar::new(store.clone(), clock.clone(), &config());
        registrar.register().await.unwrap();

        registrar.mark_stopped().await.unwrap();
        let live = store.live(clock.now() - chrono::Duration::seconds(15)).await.unwrap();
        assert!(live.is_empty());
    }
}
