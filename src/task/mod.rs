//! Application side of task execution.
//!
//! [`TaskClient`] submits a [`WorkUnit`](crate::work::WorkUnit) to a runner,
//! answers the runner's dependency requests and drives the task to one of its
//! terminal states, retrying transport failures within the configured budget.

mod client;
mod jobs;

pub use client::TaskClient;
pub use jobs::{JobRecord, JobStore, MemoryJobStore};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Lifecycle of a submitted task.
///
/// `Submitted → Sent → (Completed | Failed | Cancelled | TimedOut)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Sent,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Client-side bookkeeping for one submission.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub function: String,
    /// Attempts started so far.
    pub attempts: u32,
    pub deadline: Option<Instant>,
    state: TaskState,
}

impl Task {
    pub fn new(id: impl Into<String>, function: impl Into<String>, deadline: Option<Instant>) -> Self {
        Self {
            id: id.into(),
            function: function.into(),
            attempts: 0,
            deadline,
            state: TaskState::Submitted,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Move to `next`. A terminal state is final; returns whether the state
    /// changed.
    pub fn advance(&mut self, next: TaskState) -> bool {
        if self.state.is_terminal() || self.state == next {
            return false;
        }
        self.state = next;
        true
    }
}

/// Successful outcome of [`TaskClient::submit`].
#[derive(Debug, Clone)]
pub struct Completed {
    /// MsgPack-encoded return value of the work handler.
    pub output: Bytes,
    pub attempts: u32,
}

impl Completed {
    pub fn decode_output<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.output)
    }
}
