//! # taskwire
//!
//! Remote task execution over a multiplexed, encrypted connection.
//!
//! An application hands a [`WorkUnit`] (a function name, encoded arguments
//! and named dependencies) to a [`Runner`]. The runner fetches dependencies it
//! lacks from the application, executes the work and returns the encoded
//! result or a typed failure. A [`Mediator`] tracks runner status and picks a
//! runner for each task.
//!
//! ## Architecture
//!
//! - **Frames** (`protocol`): `[type:1][channel:2][length:4][payload]`, big-endian
//! - **Connection** (`connection`): one stream multiplexed into numbered channels,
//!   with heartbeats and a single writer task
//! - **Messages** (`message`): `[tag:1][length:4][body]` typed envelopes on a channel
//! - **Channels**: 10 application↔mediator, 11 runner↔mediator, 20 task, 21 assembly
//!
//! ## Example
//!
//! ```ignore
//! use taskwire::{Target, TaskClient, TaskConfig, WorkUnit};
//!
//! #[tokio::main]
//! async fn main() -> taskwire::Result<()> {
//!     let connector = Arc::new(TlsConnector::new(&tls, ConnectionConfig::default())?);
//!     let client = TaskClient::new(TaskConfig::new(Target::Mediator("mediator:7400".into())), connector);
//!
//!     let done = client.submit(WorkUnit::new("add", &(1i64, 2i64))?).await?;
//!     let sum: i64 = done.decode_output()?;
//!     assert_eq!(sum, 3);
//!     Ok(())
//! }
//! ```

pub mod assembly;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod mediator;
pub mod message;
pub mod protocol;
pub mod runner;
pub mod task;
pub mod transport;
pub mod work;

mod writer;

pub use assembly::{DependencyResolver, DirectoryResolver, MapResolver};
pub use config::{
    ConnectionConfig, MediatorConfig, RunnerConfig, Target, TaskConfig, TlsClientConfig, TlsServerConfig,
    TrustMode,
};
pub use connection::{Channel, Connection};
pub use error::{ErrorKind, Result, TaskwireError};
pub use mediator::{Mediator, RunnerFilter};
pub use message::{Message, MessageChannel};
pub use runner::{Runner, RunnerBuilder};
pub use task::{Completed, JobStore, MemoryJobStore, TaskClient, TaskState};
pub use transport::Connector;
pub use work::{WorkContext, WorkError, WorkRegistry, WorkUnit};
