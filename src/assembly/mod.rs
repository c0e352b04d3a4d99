//! Dependency ("assembly") resolution.
//!
//! A runner that lacks a dependency named by a work unit asks the application
//! for it on the Assembly channel (21):
//!
//! ```text
//! Runner                          Application
//!   │── AssemblyRequest{name} ──────►│  DependencyResolver::resolve
//!   │◄── AssemblyResponse{name, ..} ─│  (or AssemblyError{name, detail})
//! ```
//!
//! On the runner the lookup order is: [`ResourceCache`], then the
//! application, then an optional runner-local fallback resolver.

mod cache;
mod remote;

pub use cache::{CachedResource, ResourceCache};
pub use remote::{serve_assembly_requests, AssemblyClient, AssemblyResolver};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::work::BoxFuture;

/// Source of dependency bytes by name.
pub trait DependencyResolver: Send + Sync + 'static {
    /// Bytes for `name`, or `None` if this resolver does not know it.
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Bytes>>;
}

/// Resolver backed by an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    entries: HashMap<String, Bytes>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Bytes>) {
        self.entries.insert(name.into(), bytes.into());
    }
}

impl DependencyResolver for MapResolver {
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Bytes>> {
        let found = self.entries.get(name).cloned();
        Box::pin(async move { found })
    }
}

/// Resolver serving files from one directory.
///
/// Names are plain file names; anything that could escape the root is
/// refused.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_plain_name(name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(|c: char| c == '/' || c == '\\' || c == '\0')
    }
}

impl DependencyResolver for DirectoryResolver {
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            if !Self::is_plain_name(name) {
                tracing::warn!(name, "Refusing dependency name with path components");
                return None;
            }
            let path = self.root.join(name);
            match tokio::fs::read(&path).await {
                Ok(data) => Some(Bytes::from(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot read dependency");
                    None
                }
            }
        })
    }
}
