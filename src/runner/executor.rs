//! Runner side of the task execution protocol.
//!
//! One session per application connection:
//!
//! ```text
//! Application                         Runner
//!   │── TaskRequest{work unit} ────────►│ decode, resolve dependencies,
//!   │◄─ AssemblyRequest (channel 21) ───│ wait for a slot, run
//!   │── AssemblyResponse ──────────────►│
//!   │◄─ TaskResponse / TaskError ───────│
//!   │── Disconnect ────────────────────►│ session ends
//! ```
//!
//! `TaskCancel`, `Disconnect` or a lost connection abort the running work
//! and end the session; nothing is sent for an aborted task.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use super::Runner;
use crate::assembly::{AssemblyClient, AssemblyResolver};
use crate::connection::Connection;
use crate::error::{Result, TaskwireError};
use crate::message::{Message, MessageChannel, TaskError, TaskResponse};
use crate::protocol::channels;
use crate::work::{WorkContext, WorkUnit};

pub(super) async fn serve_session(runner: Runner, conn: Connection) {
    let shutdown = runner.shutdown_token();
    tracing::debug!(peer = conn.peer(), "Application connected");

    let task_channel = loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                conn.close();
                return;
            }
            accepted = conn.accept_channel() => accepted,
        };
        match accepted {
            Some(channel) if channel.number() == channels::TASK => break channel,
            Some(channel) => {
                tracing::debug!(peer = conn.peer(), channel = channel.number(), "Ignoring channel");
            }
            None => return,
        }
    };

    let assemblies = match conn.channel(channels::ASSEMBLY) {
        Ok(channel) => AssemblyResolver::new(runner.shared.cache.clone())
            .with_remote(AssemblyClient::new(MessageChannel::new(channel)))
            .with_fallback(runner.shared.fallback.clone()),
        Err(e) => {
            tracing::warn!(peer = conn.peer(), error = %e, "Cannot open assembly channel");
            conn.close();
            return;
        }
    };

    let task = Arc::new(MessageChannel::new(task_channel));
    let mut inbox = spawn_inbox(task.clone());
    run_session(&runner, &task, &mut inbox, Arc::new(assemblies), &shutdown).await;

    conn.close();
    tracing::debug!(peer = conn.peer(), "Application session ended");
}

/// Forward received messages into a queue so they can be awaited inside
/// `select!` without losing partially read envelopes.
fn spawn_inbox(task: Arc<MessageChannel>) -> mpsc::UnboundedReceiver<Result<Message>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let received = task.receive().await;
            let failed = received.is_err();
            if tx.send(received).is_err() || failed {
                return;
            }
        }
    });
    rx
}

async fn run_session(
    runner: &Runner,
    task: &MessageChannel,
    inbox: &mut mpsc::UnboundedReceiver<Result<Message>>,
    assemblies: Arc<AssemblyResolver>,
    shutdown: &CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = inbox.recv() => received,
        };
        let request = match received {
            Some(Ok(Message::TaskRequest(request))) => request,
            Some(Ok(Message::Disconnect(disconnect))) => {
                tracing::debug!(reason = %disconnect.reason, "Application disconnected");
                return;
            }
            Some(Ok(Message::TaskCancel(_))) => {
                tracing::trace!("Cancel with no task running");
                continue;
            }
            Some(Ok(other)) => {
                tracing::warn!(message = other.name(), "Unexpected message on task channel");
                continue;
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Task channel failed");
                return;
            }
            None => return,
        };

        let cancel = CancellationToken::new();
        let mut execution = tokio::spawn(execute(
            runner.clone(),
            assemblies.clone(),
            request.payload,
            cancel.clone(),
        ));

        let finished: std::result::Result<Result<Bytes>, JoinError> = loop {
            tokio::select! {
                joined = &mut execution => break joined,
                received = inbox.recv() => match received {
                    Some(Ok(Message::TaskCancel(c))) => {
                        tracing::info!(reason = %c.reason, "Task cancelled by application");
                        cancel.cancel();
                        execution.abort();
                        // The slot is free once the aborted task is joined.
                        let _ = (&mut execution).await;
                        return;
                    }
                    Some(Ok(Message::TaskRequest(_))) => {
                        tracing::warn!("TaskRequest while a task is running; ignored");
                    }
                    Some(Ok(other)) if !matches!(other, Message::Disconnect(_)) => {
                        tracing::warn!(message = other.name(), "Unexpected message on task channel");
                    }
                    _ => {
                        tracing::info!("Application gone; aborting task");
                        cancel.cancel();
                        execution.abort();
                        return;
                    }
                },
                _ = shutdown.cancelled() => {
                    cancel.cancel();
                    execution.abort();
                    return;
                }
            }
        };

        let reply: Option<Message> = match finished {
            Ok(Ok(output)) => Some(TaskResponse { payload: output }.into()),
            Ok(Err(e)) => {
                tracing::info!(error = %e, "Task failed");
                Some(TaskError::from_error(&e).into())
            }
            Err(join) if join.is_panic() => {
                let detail = panic_message(join.into_panic());
                tracing::error!(detail = %detail, "Work handler panicked");
                Some(
                    TaskError::from_error(&TaskwireError::General {
                        message: "work handler panicked".into(),
                        detail: Some(detail),
                    })
                    .into(),
                )
            }
            Err(_) => None,
        };

        if let Some(reply) = reply {
            if let Err(e) = task.send(&reply).await {
                tracing::debug!(error = %e, "Cannot deliver task outcome");
                return;
            }
        }
    }
}

async fn execute(
    runner: Runner,
    assemblies: Arc<AssemblyResolver>,
    payload: Bytes,
    cancel: CancellationToken,
) -> Result<Bytes> {
    let unit = WorkUnit::decode(&payload)?;
    let task_id = unit
        .task_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(
        task_id = %task_id,
        function = %unit.function,
        dependencies = unit.dependencies.len(),
        "Task received"
    );

    if !runner.shared.registry.contains(&unit.function) {
        return Err(TaskwireError::deserialization(format!(
            "Unknown function '{}'",
            unit.function
        )));
    }
    let dependencies = assemblies.resolve_all(&unit.dependencies).await?;

    let _slot = runner.acquire_slot().await?;
    let ctx = WorkContext::new(task_id.clone(), dependencies, cancel);
    let output = runner.shared.registry.dispatch(&unit, ctx).await?;
    tracing::info!(task_id = %task_id, size = output.len(), "Task completed");
    Ok(output)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
