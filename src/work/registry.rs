//! Registry mapping function names to work handlers.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{WorkContext, WorkUnit};
use crate::codec::MsgPackCodec;
use crate::error::{Result, TaskwireError};

/// Error a handler returns when the work itself fails.
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A callable unit of work.
pub trait WorkHandler: Send + Sync + 'static {
    /// Run with MsgPack-encoded arguments; yields the MsgPack-encoded result.
    ///
    /// Argument decoding failures are `Deserialization`, handler errors are
    /// `Invokation`.
    fn call(&self, args: &[u8], ctx: WorkContext) -> BoxFuture<'static, Result<Bytes>>;
}

/// Wrapper that decodes arguments and encodes the result around a plain
/// async function.
pub struct TypedWorkHandler<F, T, R, Fut>
where
    F: Fn(T, WorkContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, WorkError>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedWorkHandler<F, T, R, Fut>
where
    F: Fn(T, WorkContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, WorkError>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> WorkHandler for TypedWorkHandler<F, T, R, Fut>
where
    F: Fn(T, WorkContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, WorkError>> + Send + 'static,
{
    fn call(&self, args: &[u8], ctx: WorkContext) -> BoxFuture<'static, Result<Bytes>> {
        let parsed: T = match MsgPackCodec::decode(args) {
            Ok(v) => v,
            Err(e) => {
                let detail = e.to_string();
                return Box::pin(async move {
                    Err(TaskwireError::Deserialization {
                        message: "Cannot decode work arguments".to_string(),
                        detail: Some(detail),
                    })
                });
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            match fut.await {
                Ok(value) => MsgPackCodec::encode(&value).map_err(|e| TaskwireError::General {
                    message: "Cannot encode work result".to_string(),
                    detail: Some(e.to_string()),
                }),
                Err(e) => Err(TaskwireError::Invokation {
                    message: e.to_string(),
                    detail: Some(format!("{:?}", e)),
                }),
            }
        })
    }
}

/// Registry of functions a runner can execute.
#[derive(Default)]
pub struct WorkRegistry {
    functions: HashMap<String, Arc<dyn WorkHandler>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register<F, T, R, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(T, WorkContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, WorkError>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(TypedWorkHandler::new(handler)));
    }

    /// Register a hand-written handler.
    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn WorkHandler>) {
        if self.functions.insert(name.to_string(), handler).is_some() {
            tracing::warn!(function = name, "Replacing registered function");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkHandler>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Run `unit` with the handler registered for its function.
    pub async fn dispatch(&self, unit: &WorkUnit, ctx: WorkContext) -> Result<Bytes> {
        let handler = self.get(&unit.function).ok_or_else(|| {
            TaskwireError::deserialization(format!("Unknown function '{}'", unit.function))
        })?;
        handler.call(&unit.args, ctx).await
    }
}
