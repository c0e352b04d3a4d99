//! Context passed to work handlers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// What a handler can see besides its arguments.
///
/// `WorkContext` is `Clone`; clones share the dependency map and the
/// cancellation token.
#[derive(Clone)]
pub struct WorkContext {
    task_id: String,
    dependencies: Arc<HashMap<String, Bytes>>,
    cancel: CancellationToken,
}

impl WorkContext {
    pub fn new(
        task_id: impl Into<String>,
        dependencies: HashMap<String, Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            dependencies: Arc::new(dependencies),
            cancel,
        }
    }

    #[inline]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Bytes of a resolved dependency.
    pub fn dependency(&self, name: &str) -> Option<&Bytes> {
        self.dependencies.get(name)
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    /// Whether the task has been cancelled. Long-running handlers may poll
    /// this; the runner aborts the handler future regardless.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
