//! Runner: accepts connections from applications and executes their work.
//!
//! # Example
//!
//! ```ignore
//! use taskwire::runner::Runner;
//! use taskwire::transport::{TlsConnector, TlsListener};
//!
//! let runner = Runner::builder(config)
//!     .function("add", |(a, b): (i64, i64), _ctx| async move { Ok::<_, WorkError>(a + b) })
//!     .build()?;
//!
//! runner.start_status_reporter(Arc::new(TlsConnector::new(&tls, conn_config)?))?;
//! runner.run(TlsListener::bind("0.0.0.0:7420", &server_tls, conn_config).await?).await?;
//! ```

mod executor;
mod status;

pub use status::{StatusKind, StatusRecord, StatusReporter};

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembly::{DependencyResolver, ResourceCache};
use crate::config::RunnerConfig;
use crate::connection::Connection;
use crate::error::{Result, TaskwireError};
use crate::transport::{Connector, TlsConnector, TlsListener};
use crate::work::{WorkContext, WorkError, WorkRegistry};

/// Builder for a [`Runner`].
pub struct RunnerBuilder {
    config: RunnerConfig,
    registry: WorkRegistry,
    fallback: Option<Arc<dyn DependencyResolver>>,
}

impl RunnerBuilder {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            registry: WorkRegistry::new(),
            fallback: None,
        }
    }

    /// Register a function.
    pub fn function<F, T, R, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T, WorkContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, WorkError>> + Send + 'static,
    {
        self.registry.register(name, handler);
        self
    }

    /// Use an existing registry, replacing functions registered so far.
    pub fn registry(mut self, registry: WorkRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Consulted when neither the cache nor the application has a dependency.
    pub fn fallback_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.fallback = Some(resolver);
        self
    }

    pub fn build(self) -> Result<Runner> {
        if self.config.slots == 0 {
            return Err(TaskwireError::Config("runner needs at least one slot".into()));
        }
        self.config.connection.validate()?;
        if self.registry.is_empty() {
            tracing::warn!("Runner built without registered functions");
        }

        let cache = Arc::new(ResourceCache::new(self.config.cache_max_age()));
        Ok(Runner {
            shared: Arc::new(Shared {
                slots: Arc::new(Semaphore::new(self.config.slots)),
                registry: Arc::new(self.registry),
                fallback: self.fallback,
                cache,
                queued: AtomicU32::new(0),
                events: OnceLock::new(),
                shutdown: CancellationToken::new(),
                config: self.config,
            }),
        })
    }
}

struct Shared {
    config: RunnerConfig,
    registry: Arc<WorkRegistry>,
    cache: Arc<ResourceCache>,
    fallback: Option<Arc<dyn DependencyResolver>>,
    slots: Arc<Semaphore>,
    /// Tasks waiting for a slot.
    queued: AtomicU32,
    events: OnceLock<mpsc::UnboundedSender<StatusKind>>,
    shutdown: CancellationToken,
}

/// Executes work units for connected applications. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    shared: Arc<Shared>,
}

impl Runner {
    pub fn builder(config: RunnerConfig) -> RunnerBuilder {
        RunnerBuilder::new(config)
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.shared.cache
    }

    pub fn available_slots(&self) -> u32 {
        self.shared.slots.available_permits() as u32
    }

    pub fn queue_length(&self) -> u32 {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Stop accepting work, abort running tasks and report `Stopping`.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            tracing::info!(runner_id = %self.shared.config.runner_id, "Runner shutting down");
        }
        self.shared.shutdown.cancel();
    }

    /// Current state as a status record.
    pub fn status_record(&self, status: StatusKind) -> StatusRecord {
        let config = &self.shared.config;
        StatusRecord {
            runner_id: config.runner_id.clone(),
            endpoint: config.advertise_endpoint.clone(),
            status,
            platform: config.platform.clone(),
            os_version: config.os_version.clone(),
            available_slots: self.available_slots(),
            queue_length: self.queue_length(),
            label: config.label.clone(),
            tags: config.tags.clone(),
        }
    }

    fn emit(&self, kind: StatusKind) {
        if let Some(events) = self.shared.events.get() {
            let _ = events.send(kind);
        }
    }

    /// Wait for a free slot. The wait counts toward the queue length.
    async fn acquire_slot(&self) -> Result<SlotGuard> {
        let waiting = QueueGuard::enter(self);
        let permit = self
            .shared
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TaskwireError::General {
                message: "runner is shutting down".into(),
                detail: None,
            })?;
        drop(waiting);
        self.emit(StatusKind::BeginJob);
        Ok(SlotGuard {
            runner: self.clone(),
            permit: Some(permit),
        })
    }

    /// Serve one application connection until it closes.
    pub async fn serve_connection(&self, conn: Connection) {
        executor::serve_session(self.clone(), conn).await
    }

    /// Report status to the configured mediator in the background.
    pub fn start_status_reporter(&self, connector: Arc<dyn Connector>) -> Result<JoinHandle<()>> {
        let mediator = self
            .shared
            .config
            .mediator
            .clone()
            .ok_or_else(|| TaskwireError::Config("no mediator configured".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .events
            .set(tx)
            .map_err(|_| TaskwireError::Config("status reporter already started".into()))?;

        let reporter = StatusReporter::new(self.clone(), connector, mediator, rx);
        Ok(tokio::spawn(reporter.run()))
    }

    /// Report status to the configured mediator over TLS, using the runner's
    /// `tls` and `connection` settings.
    pub fn start_tls_status_reporter(&self) -> Result<JoinHandle<()>> {
        let config = &self.shared.config;
        if config.mediator.is_none() {
            return Err(TaskwireError::Config("no mediator configured".into()));
        }
        let connector = TlsConnector::new(&config.tls, config.connection.clone())?;
        self.start_status_reporter(Arc::new(connector))
    }

    /// Accept connections until [`shutdown`](Self::shutdown).
    pub async fn run(&self, listener: TlsListener) -> Result<()> {
        let shutdown = self.shutdown_token();
        let sweeper = self.shared.cache.spawn_sweeper(
            Duration::from_millis(self.shared.config.cache_sweep_interval_ms.max(1)),
            shutdown.clone(),
        );
        tracing::info!(
            runner_id = %self.shared.config.runner_id,
            slots = self.shared.config.slots,
            "Runner accepting connections"
        );

        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = listener.accept() => incoming,
            };
            let incoming = match incoming {
                Ok(incoming) => incoming,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            let runner = self.clone();
            tokio::spawn(async move {
                let peer = incoming.peer();
                match incoming.establish().await {
                    Ok(conn) => runner.serve_connection(conn).await,
                    Err(e) => tracing::warn!(%peer, error = %e, "Handshake failed"),
                }
            });
        }

        let _ = sweeper.await;
        Ok(())
    }
}

/// Counts a task as queued while it waits for a slot.
struct QueueGuard<'a> {
    queued: &'a AtomicU32,
}

impl<'a> QueueGuard<'a> {
    fn enter(runner: &'a Runner) -> Self {
        runner.shared.queued.fetch_add(1, Ordering::AcqRel);
        Self {
            queued: &runner.shared.queued,
        }
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds a slot for one running task; reports `FinishJob` when released,
/// including when the task is aborted.
struct SlotGuard {
    runner: Runner,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Free the slot first so the report counts it.
        drop(self.permit.take());
        self.runner.emit(StatusKind::FinishJob);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(slots: usize) -> RunnerConfig {
        RunnerConfig {
            runner_id: "r-test".into(),
            slots,
            label: Some("blue".into()),
            tags: vec!["gpu".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_rejects_zero_slots() {
        assert!(matches!(
            Runner::builder(config(0)).build(),
            Err(TaskwireError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_status_record_reflects_config() {
        let runner = Runner::builder(config(3)).build().unwrap();
        let record = runner.status_record(StatusKind::Starting);
        assert_eq!(record.runner_id, "r-test");
        assert_eq!(record.available_slots, 3);
        assert_eq!(record.queue_length, 0);
        assert_eq!(record.label.as_deref(), Some("blue"));
        assert_eq!(record.tags, vec!["gpu"]);
    }

    #[tokio::test]
    async fn test_slot_accounting() {
        let runner = Runner::builder(config(1)).build().unwrap();
        let held = runner.acquire_slot().await.unwrap();
        assert_eq!(runner.available_slots(), 0);

        let waiter = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.acquire_slot().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.queue_length(), 1);

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(runner.queue_length(), 0);
        assert_eq!(runner.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_aborted_waiter_leaves_queue() {
        let runner = Runner::builder(config(1)).build().unwrap();
        let _held = runner.acquire_slot().await.unwrap();
        let waiter = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.acquire_slot().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(runner.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_tls_reporter_uses_runner_trust_settings() {
        let mut cfg = config(1);
        cfg.mediator = Some("mediator.local:7400".into());
        cfg.tls.trust = crate::config::TrustMode::Thumbprint("not-a-thumbprint".into());
        let runner = Runner::builder(cfg).build().unwrap();

        match runner.start_tls_status_reporter() {
            Err(TaskwireError::Config(message)) => assert!(message.contains("thumbprint")),
            other => panic!("expected Config error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_reporter_requires_mediator() {
        struct Never;
        impl Connector for Never {
            fn connect<'a>(&'a self, _: &'a str) -> crate::work::BoxFuture<'a, Result<Connection>> {
                Box::pin(async { Err(TaskwireError::ConnectionClosed) })
            }
        }
        let runner = Runner::builder(config(1)).build().unwrap();
        assert!(matches!(
            runner.start_status_reporter(Arc::new(Never)),
            Err(TaskwireError::Config(_))
        ));
    }
}
