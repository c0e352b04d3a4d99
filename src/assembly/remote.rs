//! Assembly channel endpoints: the runner's requester and the application's
//! responder.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use super::{DependencyResolver, ResourceCache};
use crate::error::{ErrorKind, Result, TaskwireError};
use crate::message::{AssemblyError, AssemblyRequest, AssemblyResponse, Message, MessageChannel};

/// Runner side of the Assembly channel.
///
/// One request is outstanding at a time; the lock covers the whole
/// request/response pair.
pub struct AssemblyClient {
    channel: Mutex<MessageChannel>,
}

impl AssemblyClient {
    pub fn new(channel: MessageChannel) -> Self {
        Self {
            channel: Mutex::new(channel),
        }
    }

    /// Ask the application for `name`. `Ok(None)` means it answered with
    /// `AssemblyError`.
    pub async fn fetch(&self, name: &str) -> Result<Option<Bytes>> {
        let channel = self.channel.lock().await;
        channel
            .send(&AssemblyRequest { name: name.to_string() }.into())
            .await?;

        match channel.receive().await? {
            Message::AssemblyResponse(response) if response.name == name => Ok(Some(response.bytes)),
            Message::AssemblyResponse(response) => Err(TaskwireError::Protocol(format!(
                "Requested assembly '{}', received '{}'",
                name, response.name
            ))),
            Message::AssemblyError(error) => {
                tracing::debug!(name, detail = %error.detail, "Application cannot provide assembly");
                Ok(None)
            }
            other => Err(TaskwireError::UnexpectedMessageType {
                expected: "AssemblyResponse",
                actual: other.name(),
            }),
        }
    }
}

/// Runner-side lookup: cache, then the application, then a local fallback.
pub struct AssemblyResolver {
    cache: Arc<ResourceCache>,
    remote: Option<AssemblyClient>,
    fallback: Option<Arc<dyn DependencyResolver>>,
}

impl AssemblyResolver {
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self {
            cache,
            remote: None,
            fallback: None,
        }
    }

    pub fn with_remote(mut self, remote: AssemblyClient) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_fallback(mut self, fallback: Option<Arc<dyn DependencyResolver>>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Bytes for `name`.
    ///
    /// A dependency nobody can provide is a `Deserialization` failure. Losing
    /// the connection to the application is reported as such.
    pub async fn resolve(&self, name: &str) -> Result<Bytes> {
        if let Some(bytes) = self.cache.get(name) {
            tracing::trace!(name, "Assembly cache hit");
            return Ok(bytes);
        }

        let mut detail = None;
        if let Some(remote) = &self.remote {
            match remote.fetch(name).await {
                Ok(Some(bytes)) => {
                    self.cache.insert(name, bytes.clone());
                    return Ok(bytes);
                }
                Ok(None) => detail = Some("application has no such assembly".to_string()),
                Err(e) if e.kind() == ErrorKind::Transport => return Err(e),
                Err(e) => {
                    tracing::warn!(name, error = %e, "Assembly request failed");
                    detail = Some(e.to_string());
                }
            }
        }

        if let Some(fallback) = &self.fallback {
            if let Some(bytes) = fallback.resolve(name).await {
                self.cache.insert(name, bytes.clone());
                return Ok(bytes);
            }
        }

        Err(TaskwireError::Deserialization {
            message: format!("Cannot resolve dependency '{}'", name),
            detail,
        })
    }

    /// Resolve every name, stopping at the first failure.
    pub async fn resolve_all(&self, names: &[String]) -> Result<HashMap<String, Bytes>> {
        let mut resolved = HashMap::with_capacity(names.len());
        for name in names {
            if resolved.contains_key(name) {
                continue;
            }
            let bytes = self.resolve(name).await?;
            resolved.insert(name.clone(), bytes);
        }
        Ok(resolved)
    }
}

/// Answer `AssemblyRequest`s on `channel` until the connection closes.
pub async fn serve_assembly_requests(channel: MessageChannel, resolver: Arc<dyn DependencyResolver>) {
    loop {
        let message = match channel.receive().await {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(error = %e, "Assembly responder stopped");
                return;
            }
        };

        let reply: Message = match message {
            Message::AssemblyRequest(request) => match resolver.resolve(&request.name).await {
                Some(bytes) => {
                    tracing::debug!(name = %request.name, size = bytes.len(), "Serving assembly");
                    AssemblyResponse {
                        name: request.name,
                        bytes,
                    }
                    .into()
                }
                None => {
                    tracing::warn!(name = %request.name, "Runner requested unknown assembly");
                    AssemblyError {
                        name: request.name,
                        detail: "not found".to_string(),
                    }
                    .into()
                }
            },
            Message::Disconnect(_) => return,
            other => {
                tracing::warn!(message = other.name(), "Unexpected message on assembly channel");
                continue;
            }
        };

        if channel.send(&reply).await.is_err() {
            return;
        }
    }
}
