//! Task submission with retry, deadline and cancellation.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::jobs::{JobRecord, JobStore};
use super::{Completed, Task, TaskState};
use crate::assembly::{serve_assembly_requests, DependencyResolver, MapResolver};
use crate::config::{Target, TaskConfig};
use crate::connection::Connection;
use crate::error::{Result, TaskwireError};
use crate::message::{
    Disconnect, Message, MessageChannel, RunnerAssignment, RunnerRequest, TaskCancel, TaskRequest,
    TypedMessage,
};
use crate::protocol::channels;
use crate::transport::{Connector, TlsConnector};
use crate::work::WorkUnit;

/// Submits work units to runners.
///
/// # Example
///
/// ```ignore
/// let client = TaskClient::new(TaskConfig::new(Target::Mediator(addr)), connector)
///     .with_resolver(Arc::new(DirectoryResolver::new("./deps")));
///
/// let done = client.submit(WorkUnit::new("add", &(1, 2))?).await?;
/// let sum: i64 = done.decode_output()?;
/// ```
pub struct TaskClient {
    config: Arc<TaskConfig>,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn DependencyResolver>,
    jobs: Option<Arc<dyn JobStore>>,
}

enum Outcome {
    Finished(Result<Bytes>),
    Cancelled,
    TimedOut,
}

impl TaskClient {
    pub fn new(config: TaskConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            resolver: Arc::new(MapResolver::new()),
            jobs: None,
        }
    }

    /// Client dialing over TLS with the trust and connection settings of
    /// `config`.
    pub fn from_config(config: TaskConfig) -> Result<Self> {
        let connector = TlsConnector::from_task_config(&config)?;
        Ok(Self::new(config, Arc::new(connector)))
    }

    /// Answers the runner's dependency requests.
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Record every submission and state change in `jobs`.
    pub fn with_job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Run `work` on a runner and wait for its result.
    pub async fn submit(&self, work: WorkUnit) -> Result<Completed> {
        self.submit_with_cancel(work, CancellationToken::new()).await
    }

    /// Like [`submit`](Self::submit); cancelling `cancel` tells the runner to
    /// abort and returns [`TaskwireError::Cancelled`] immediately.
    pub async fn submit_with_cancel(&self, mut work: WorkUnit, cancel: CancellationToken) -> Result<Completed> {
        let id = work
            .task_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let deadline = self.config.timeout().map(|timeout| Instant::now() + timeout);
        let mut task = Task::new(id, work.function.clone(), deadline);
        let payload = work.encode()?;

        self.audit_created(&task);
        tracing::debug!(task_id = %task.id, function = %task.function, "Task submitted");

        loop {
            task.attempts += 1;
            let attempt = AttemptSlot::default();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                _ = expiry(task.deadline) => Outcome::TimedOut,
                result = self.run_attempt(&mut task, payload.clone(), &attempt) => Outcome::Finished(result),
            };

            match outcome {
                Outcome::Finished(Ok(output)) => {
                    task.advance(TaskState::Completed);
                    self.audit(&task, None);
                    tracing::info!(task_id = %task.id, attempts = task.attempts, "Task completed");
                    return Ok(Completed {
                        output,
                        attempts: task.attempts,
                    });
                }
                Outcome::Finished(Err(e)) if e.is_retryable() => {
                    attempt.close();
                    if self.config.allows_attempt(task.attempts) {
                        tracing::warn!(task_id = %task.id, attempt = task.attempts, error = %e, "Attempt failed, retrying");
                        self.audit(&task, Some(&e));
                        continue;
                    }
                    let err = TaskwireError::RetriesExhausted {
                        attempts: task.attempts,
                        last: Box::new(e),
                    };
                    return Err(self.fail(&mut task, TaskState::Failed, err));
                }
                Outcome::Finished(Err(e)) => {
                    attempt.close();
                    return Err(self.fail(&mut task, TaskState::Failed, e));
                }
                Outcome::Cancelled => {
                    attempt.cancel("cancelled by application");
                    let err = TaskwireError::Cancelled("cancelled by application".into());
                    return Err(self.fail(&mut task, TaskState::Cancelled, err));
                }
                Outcome::TimedOut => {
                    attempt.close();
                    return Err(self.fail(&mut task, TaskState::TimedOut, TaskwireError::TimedOut));
                }
            }
        }
    }

    fn fail(&self, task: &mut Task, state: TaskState, err: TaskwireError) -> TaskwireError {
        task.advance(state);
        self.audit(task, Some(&err));
        tracing::info!(task_id = %task.id, state = ?state, error = %err, "Task ended");
        err
    }

    async fn run_attempt(&self, task: &mut Task, payload: Bytes, attempt: &AttemptSlot) -> Result<Bytes> {
        if task.attempts > 1 {
            tokio::time::sleep(self.config.retry_delay()).await;
        }

        let endpoint = self.resolve_runner(attempt).await?;
        let conn = self.connector.connect(&endpoint).await?;
        attempt.connected(&conn);

        let task_channel = Arc::new(MessageChannel::new(conn.channel(channels::TASK)?));
        let assembly = MessageChannel::new(conn.channel(channels::ASSEMBLY)?);
        attempt.task_opened(task_channel.clone());
        tokio::spawn(serve_assembly_requests(assembly, self.resolver.clone()));

        task_channel.send(&TaskRequest { payload }.into()).await?;
        task.advance(TaskState::Sent);
        self.audit_sent(task, &endpoint);
        tracing::debug!(task_id = %task.id, runner = %endpoint, attempt = task.attempts, "Task sent");

        let result = receive_outcome(&task_channel).await;
        if !conn.is_closed() {
            let _ = task_channel
                .send(&Disconnect { reason: "task finished".into() }.into())
                .await;
        }
        conn.close();
        result
    }

    /// Endpoint of the runner for this attempt.
    async fn resolve_runner(&self, attempt: &AttemptSlot) -> Result<String> {
        let mediator = match &self.config.target {
            Target::Runner(endpoint) => return Ok(endpoint.clone()),
            Target::Mediator(mediator) => mediator,
        };

        let conn = self.connector.connect(mediator).await?;
        attempt.connected(&conn);
        let result = self.request_runner(&conn).await;
        conn.close();

        if let Ok(endpoint) = &result {
            tracing::debug!(mediator = %mediator, runner = %endpoint, "Runner assigned");
        }
        result
    }

    async fn request_runner(&self, conn: &Connection) -> Result<String> {
        let channel = MessageChannel::new(conn.channel(channels::APPLICATION_MEDIATOR)?);
        channel
            .send(&RunnerRequest { filter: self.config.filter.clone() }.into())
            .await?;

        let result = match channel.receive().await? {
            Message::RunnerAssignment(assignment) => Ok(assignment.endpoint),
            Message::RunnerUnavailable(unavailable) => Err(TaskwireError::NoAvailableRunner(unavailable.detail)),
            other => Err(TaskwireError::UnexpectedMessageType {
                expected: RunnerAssignment::NAME,
                actual: other.name(),
            }),
        };
        let _ = channel
            .send(&Disconnect { reason: "runner resolved".into() }.into())
            .await;
        result
    }

    fn audit_created(&self, task: &Task) {
        let Some(jobs) = &self.jobs else { return };
        if let Err(e) = jobs.create_job(JobRecord::new(task.id.clone(), task.function.clone())) {
            tracing::warn!(task_id = %task.id, error = %e, "Cannot record job");
        }
    }

    fn audit_sent(&self, task: &Task, runner: &str) {
        let Some(jobs) = &self.jobs else { return };
        let mut record = self.stored_record(jobs.as_ref(), task);
        record.state = task.state();
        record.attempts = task.attempts;
        record.runner = Some(runner.to_string());
        if let Err(e) = jobs.update_job(record) {
            tracing::warn!(task_id = %task.id, error = %e, "Cannot update job");
        }
    }

    fn audit(&self, task: &Task, error: Option<&TaskwireError>) {
        let Some(jobs) = &self.jobs else { return };
        let mut record = self.stored_record(jobs.as_ref(), task);
        record.state = task.state();
        record.attempts = task.attempts;
        record.error = error.map(|e| e.to_string());
        if let Err(e) = jobs.update_job(record) {
            tracing::warn!(task_id = %task.id, error = %e, "Cannot update job");
        }
    }

    fn stored_record(&self, jobs: &dyn JobStore, task: &Task) -> JobRecord {
        jobs.get_job(&task.id)
            .unwrap_or_else(|| JobRecord::new(task.id.clone(), task.function.clone()))
    }
}

async fn receive_outcome(channel: &MessageChannel) -> Result<Bytes> {
    loop {
        match channel.receive().await? {
            Message::TaskResponse(response) => return Ok(response.payload),
            Message::TaskError(error) => return Err(error.into_error()),
            Message::Disconnect(disconnect) => {
                tracing::debug!(reason = %disconnect.reason, "Runner ended the session");
                return Err(TaskwireError::ConnectionClosed);
            }
            other => {
                tracing::warn!(message = other.name(), "Unexpected message on task channel");
            }
        }
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The connection and task channel of the attempt in flight, kept outside
/// the attempt future so they can be closed when it is dropped.
#[derive(Default)]
struct AttemptSlot {
    state: Mutex<AttemptState>,
}

#[derive(Default)]
struct AttemptState {
    conn: Option<Connection>,
    task: Option<Arc<MessageChannel>>,
}

impl AttemptSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, AttemptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connected(&self, conn: &Connection) {
        let mut state = self.lock();
        if let Some(previous) = state.conn.replace(conn.clone()) {
            previous.close();
        }
        state.task = None;
    }

    fn task_opened(&self, task: Arc<MessageChannel>) {
        self.lock().task = Some(task);
    }

    fn close(&self) {
        if let Some(conn) = self.lock().conn.take() {
            conn.close();
        }
    }

    /// Tell the runner to abort, then close. Does not wait.
    fn cancel(&self, reason: &str) {
        let state = std::mem::take(&mut *self.lock());
        match (state.conn, state.task) {
            (Some(conn), Some(task)) => {
                let reason = reason.to_string();
                tokio::spawn(async move {
                    let _ = task.send(&TaskCancel { reason }.into()).await;
                    conn.close();
                });
            }
            (Some(conn), None) => conn.close(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrustMode;

    #[test]
    fn test_from_config_applies_tls_trust() {
        let mut config = TaskConfig::default();
        config.tls.trust = TrustMode::Thumbprint("abc".into());
        match TaskClient::from_config(config) {
            Err(TaskwireError::Config(message)) => assert!(message.contains("thumbprint")),
            Err(other) => panic!("expected Config error, got {:?}", other),
            Ok(_) => panic!("short thumbprint accepted"),
        }

        let mut config = TaskConfig::default();
        config.tls.trust = TrustMode::Thumbprint("ab".repeat(32));
        assert!(TaskClient::from_config(config).is_ok());
    }

    #[test]
    fn test_from_config_applies_connection_settings() {
        let mut config = TaskConfig::default();
        config.tls.trust = TrustMode::Unchecked;
        config.connection = config.connection.with_heartbeat(500, 100);
        assert!(matches!(
            TaskClient::from_config(config),
            Err(TaskwireError::Config(_))
        ));
    }
}
