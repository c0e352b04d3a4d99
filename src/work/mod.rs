//! Work units and their execution on the runner.
//!
//! A [`WorkUnit`] names a registered function, the dependencies it needs and
//! its MsgPack-encoded arguments. The runner looks the function up in a
//! [`WorkRegistry`] and calls it with a [`WorkContext`] holding the resolved
//! dependencies.
//!
//! # Example
//!
//! ```ignore
//! use taskwire::work::{WorkRegistry, WorkUnit};
//!
//! let mut registry = WorkRegistry::new();
//! registry.register("add", |(a, b): (i64, i64), _ctx| async move {
//!     Ok::<_, taskwire::work::WorkError>(a + b)
//! });
//!
//! let unit = WorkUnit::new("add", &(2, 3))?;
//! ```

mod context;
mod registry;

pub use context::WorkContext;
pub use registry::{BoxFuture, TypedWorkHandler, WorkError, WorkHandler, WorkRegistry};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::MsgPackCodec;
use crate::error::{Result, TaskwireError};

/// A function call to run remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Set by the task client so both ends log the same id.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Registered function name.
    pub function: String,
    /// Named resources the function needs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// MsgPack-encoded arguments.
    pub args: Bytes,
}

impl WorkUnit {
    /// Build a work unit, encoding `args` with MsgPack.
    pub fn new<A: Serialize>(function: impl Into<String>, args: &A) -> Result<Self> {
        Ok(Self::raw(function, MsgPackCodec::encode(args)?))
    }

    /// Build a work unit from pre-encoded arguments.
    pub fn raw(function: impl Into<String>, args: Bytes) -> Self {
        Self {
            task_id: None,
            function: function.into(),
            dependencies: Vec::new(),
            args,
        }
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn encode(&self) -> Result<Bytes> {
        MsgPackCodec::encode(self)
    }

    /// Decode a work unit received from the application.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes).map_err(|e| TaskwireError::Deserialization {
            message: "Cannot decode work unit".to_string(),
            detail: Some(e.to_string()),
        })
    }
}
