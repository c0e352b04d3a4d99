//! Runner status records and the reporter that streams them to a mediator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::Runner;
use crate::connection::Connection;
use crate::error::Result;
use crate::message::{Disconnect, Message, MessageChannel, RunnerStatus};
use crate::protocol::channels;
use crate::transport::Connector;

/// Event that triggered a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusKind {
    Starting = 1,
    Stopping = 2,
    BeginJob = 3,
    /// Also used for the periodic refresh.
    UpdateJob = 4,
    FinishJob = 5,
}

impl StatusKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Starting),
            2 => Some(Self::Stopping),
            3 => Some(Self::BeginJob),
            4 => Some(Self::UpdateJob),
            5 => Some(Self::FinishJob),
            _ => None,
        }
    }
}

/// A runner's self-description at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub runner_id: String,
    /// Where applications should connect.
    pub endpoint: String,
    pub status: StatusKind,
    pub platform: String,
    pub os_version: String,
    pub available_slots: u32,
    pub queue_length: u32,
    pub label: Option<String>,
    pub tags: Vec<String>,
}

/// Keeps a mediator informed of a runner's state.
///
/// Sends `Starting` on every (re)connect, one report per state change, an
/// `UpdateJob` refresh every status interval and `Stopping` on shutdown.
pub struct StatusReporter {
    runner: Runner,
    connector: Arc<dyn Connector>,
    mediator: String,
    events: mpsc::UnboundedReceiver<StatusKind>,
}

impl StatusReporter {
    pub(super) fn new(
        runner: Runner,
        connector: Arc<dyn Connector>,
        mediator: String,
        events: mpsc::UnboundedReceiver<StatusKind>,
    ) -> Self {
        Self {
            runner,
            connector,
            mediator,
            events,
        }
    }

    pub async fn run(mut self) {
        let shutdown = self.runner.shutdown_token();
        let reconnect_delay = Duration::from_millis(self.runner.config().reconnect_delay_ms);

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.connector.connect(&self.mediator) => result,
            };

            match connected {
                Ok(conn) => match self.session(&conn).await {
                    Ok(()) => return,
                    Err(e) => {
                        conn.close();
                        tracing::warn!(mediator = %self.mediator, error = %e, "Lost mediator connection");
                    }
                },
                Err(e) => {
                    tracing::warn!(mediator = %self.mediator, error = %e, "Cannot reach mediator");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }
    }

    fn report(&self, kind: StatusKind) -> Message {
        RunnerStatus {
            record: self.runner.status_record(kind),
        }
        .into()
    }

    /// Report until shutdown (`Ok`) or until the connection fails (`Err`).
    async fn session(&mut self, conn: &Connection) -> Result<()> {
        let shutdown = self.runner.shutdown_token();
        let channel = MessageChannel::new(conn.channel(channels::RUNNER_MEDIATOR)?);

        // Events from before this connection are covered by Starting.
        while self.events.try_recv().is_ok() {}
        channel.send(&self.report(StatusKind::Starting)).await?;
        tracing::info!(mediator = %self.mediator, "Reporting status to mediator");

        let period = Duration::from_millis(self.runner.config().status_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = channel.send(&self.report(StatusKind::Stopping)).await;
                    let _ = channel
                        .send(&Disconnect { reason: "runner stopping".into() }.into())
                        .await;
                    conn.close();
                    return Ok(());
                }
                Some(kind) = self.events.recv() => channel.send(&self.report(kind)).await?,
                _ = ticker.tick() => channel.send(&self.report(StatusKind::UpdateJob)).await?,
                _ = conn.closed() => return Err(conn.close_error()),
            }
        }
    }
}
