//! Mediator: tracks runner status and assigns runners to applications.
//!
//! Runners stream [`RunnerStatus`](crate::message::RunnerStatus) reports on
//! channel 11. Applications send a `RunnerRequest` on channel 10 and get a
//! `RunnerAssignment` or `RunnerUnavailable` back.

mod selection;

pub use selection::{RunnerFilter, StatusTable};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MediatorConfig;
use crate::connection::{Channel, Connection};
use crate::error::Result;
use crate::message::{Message, MessageChannel, RunnerAssignment, RunnerUnavailable};
use crate::protocol::channels;
use crate::transport::TlsListener;

/// Mediator server. Cheap to clone.
#[derive(Clone)]
pub struct Mediator {
    table: Arc<StatusTable>,
    config: Arc<MediatorConfig>,
    shutdown: CancellationToken,
}

impl Mediator {
    pub fn new(config: MediatorConfig) -> Self {
        Self {
            table: Arc::new(StatusTable::new(config.staleness())),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn table(&self) -> &Arc<StatusTable> {
        &self.table
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Evict stale runners every sweep interval until shutdown.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let table = self.table.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        table.evict_stale();
                    }
                }
            }
        })
    }

    /// Serve every channel a peer opens on `conn` until it closes.
    pub async fn serve_connection(&self, conn: Connection) {
        tracing::debug!(peer = conn.peer(), "Peer connected");
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    conn.close();
                    return;
                }
                accepted = conn.accept_channel() => accepted,
            };
            let Some(channel) = accepted else {
                tracing::debug!(peer = conn.peer(), "Peer disconnected");
                return;
            };
            let mediator = self.clone();
            let peer = conn.peer().to_string();
            tokio::spawn(async move { mediator.serve_channel(channel, peer).await });
        }
    }

    async fn serve_channel(&self, channel: Channel, peer: String) {
        match channel.number() {
            channels::APPLICATION_MEDIATOR => self.serve_application(MessageChannel::new(channel)).await,
            channels::RUNNER_MEDIATOR => self.serve_runner(MessageChannel::new(channel)).await,
            other => tracing::warn!(peer = %peer, channel = other, "Unsupported channel"),
        }
    }

    async fn serve_application(&self, channel: MessageChannel) {
        loop {
            let request = match channel.receive().await {
                Ok(Message::RunnerRequest(request)) => request,
                Ok(Message::Disconnect(_)) | Err(_) => return,
                Ok(other) => {
                    tracing::warn!(message = other.name(), "Unexpected message from application");
                    continue;
                }
            };

            let reply: Message = match self.table.select(&request.filter) {
                Ok(record) => {
                    tracing::info!(
                        runner_id = %record.runner_id,
                        endpoint = %record.endpoint,
                        slots = record.available_slots,
                        "Runner assigned"
                    );
                    RunnerAssignment {
                        runner_id: record.runner_id,
                        endpoint: record.endpoint,
                    }
                    .into()
                }
                Err(e) => {
                    tracing::info!(filter = ?request.filter, "No runner available");
                    RunnerUnavailable {
                        detail: e.to_string(),
                    }
                    .into()
                }
            };

            if channel.send(&reply).await.is_err() {
                return;
            }
        }
    }

    async fn serve_runner(&self, channel: MessageChannel) {
        loop {
            match channel.receive().await {
                Ok(Message::RunnerStatus(status)) => {
                    tracing::trace!(runner_id = %status.record.runner_id, status = ?status.record.status, "Status");
                    self.table.update(status.record);
                }
                Ok(Message::Disconnect(_)) => return,
                Ok(other) => {
                    tracing::warn!(message = other.name(), "Unexpected message from runner");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Runner status stream ended");
                    return;
                }
            }
        }
    }

    /// Accept connections until [`shutdown`](Self::shutdown).
    pub async fn run(&self, listener: TlsListener) -> Result<()> {
        let sweeper = self.spawn_sweeper();
        loop {
            let incoming = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                incoming = listener.accept() => incoming,
            };
            let incoming = match incoming {
                Ok(incoming) => incoming,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            let mediator = self.clone();
            tokio::spawn(async move {
                let peer = incoming.peer();
                match incoming.establish().await {
                    Ok(conn) => mediator.serve_connection(conn).await,
                    Err(e) => tracing::warn!(%peer, error = %e, "Handshake failed"),
                }
            });
        }
        let _ = sweeper.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::error::TaskwireError;
    use crate::message::{RunnerRequest, RunnerStatus};
    use crate::runner::{StatusKind, StatusRecord};
    use tokio::io::duplex;

    fn connect(mediator: &Mediator) -> Connection {
        let config = ConnectionConfig::default().with_heartbeat(0, 0);
        let (a, b) = duplex(64 * 1024);
        let server = Connection::accept(b, config.clone());
        let mediator = mediator.clone();
        tokio::spawn(async move { mediator.serve_connection(server).await });
        Connection::initiate(a, config)
    }

    fn status(id: &str, slots: u32, kind: StatusKind) -> Message {
        RunnerStatus {
            record: StatusRecord {
                runner_id: id.into(),
                endpoint: format!("{}.local:7420", id),
                status: kind,
                platform: "linux-x86_64".into(),
                os_version: "6".into(),
                available_slots: slots,
                queue_length: 0,
                label: None,
                tags: vec![],
            },
        }
        .into()
    }

    #[tokio::test]
    async fn test_status_then_assignment() {
        let mediator = Mediator::new(MediatorConfig::default());

        let runner = connect(&mediator);
        let reports = MessageChannel::new(runner.channel(channels::RUNNER_MEDIATOR).unwrap());
        reports.send(&status("r1", 4, StatusKind::Starting)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mediator.table().len(), 1);

        let app = connect(&mediator);
        let requests = MessageChannel::new(app.channel(channels::APPLICATION_MEDIATOR).unwrap());
        requests
            .send(&RunnerRequest { filter: RunnerFilter::default() }.into())
            .await
            .unwrap();
        let assignment: RunnerAssignment = requests.receive_typed().await.unwrap();
        assert_eq!(assignment.runner_id, "r1");
        assert_eq!(assignment.endpoint, "r1.local:7420");
    }

    #[tokio::test]
    async fn test_unavailable_when_empty() {
        let mediator = Mediator::new(MediatorConfig::default());
        let app = connect(&mediator);
        let requests = MessageChannel::new(app.channel(channels::APPLICATION_MEDIATOR).unwrap());
        requests
            .send(&RunnerRequest { filter: RunnerFilter::default().with_tag("tpu") }.into())
            .await
            .unwrap();
        let reply: RunnerUnavailable = requests.receive_typed().await.unwrap();
        assert!(reply.detail.contains("No available runner"));
    }

    #[tokio::test]
    async fn test_stopping_report_removes_runner() {
        let mediator = Mediator::new(MediatorConfig::default());
        let runner = connect(&mediator);
        let reports = MessageChannel::new(runner.channel(channels::RUNNER_MEDIATOR).unwrap());
        reports.send(&status("r1", 4, StatusKind::Starting)).await.unwrap();
        reports.send(&status("r1", 4, StatusKind::Stopping)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(mediator.table().is_empty());
        assert!(matches!(
            mediator.table().select(&RunnerFilter::default()),
            Err(TaskwireError::NoAvailableRunner(_))
        ));
    }

    #[tokio::test]
    async fn test_sweeper_evicts_silent_runner() {
        let config = MediatorConfig {
            staleness_ms: 50,
            sweep_interval_ms: 10,
            ..Default::default()
        };
        let mediator = Mediator::new(config);
        let sweeper = mediator.spawn_sweeper();

        let runner = connect(&mediator);
        let reports = MessageChannel::new(runner.channel(channels::RUNNER_MEDIATOR).unwrap());
        reports.send(&status("r1", 4, StatusKind::Starting)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mediator.table().len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mediator.table().is_empty());

        mediator.shutdown();
        sweeper.await.unwrap();
    }
}
