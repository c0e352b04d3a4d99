//! In-memory network shared by the integration tests.
//!
//! Endpoints map to a [`Runner`] or [`Mediator`]; dialing one creates a
//! `tokio::io::duplex` pair and serves the accepted half in the background.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskwire::work::BoxFuture;
use taskwire::{Connection, ConnectionConfig, Connector, Mediator, Result, Runner, RunnerConfig, TaskwireError};

#[derive(Clone)]
enum Service {
    Runner(Runner),
    Mediator(Mediator),
}

pub struct MemoryNetwork {
    services: Mutex<HashMap<String, Service>>,
    dials: AtomicU32,
    dialed: Mutex<Vec<Connection>>,
    config: ConnectionConfig,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(HashMap::new()),
            dials: AtomicU32::new(0),
            dialed: Mutex::new(Vec::new()),
            config: ConnectionConfig::default(),
        })
    }

    pub fn add_runner(&self, endpoint: &str, runner: Runner) {
        self.services
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), Service::Runner(runner));
    }

    pub fn add_mediator(&self, endpoint: &str, mediator: Mediator) {
        self.services
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), Service::Mediator(mediator));
    }

    /// Connection attempts so far, including refused ones.
    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Client halves of every established connection.
    pub fn dialed(&self) -> Vec<Connection> {
        self.dialed.lock().unwrap().clone()
    }
}

impl Connector for MemoryNetwork {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async move {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let service = self.services.lock().unwrap().get(endpoint).cloned();
            let Some(service) = service else {
                return Err(TaskwireError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("nothing listens on {}", endpoint),
                )));
            };

            let (client, server) = tokio::io::duplex(256 * 1024);
            let server = Connection::builder(self.config.clone())
                .passive_channels(true)
                .peer(format!("client->{}", endpoint))
                .start(server);
            match service {
                Service::Runner(runner) => {
                    tokio::spawn(async move { runner.serve_connection(server).await });
                }
                Service::Mediator(mediator) => {
                    tokio::spawn(async move { mediator.serve_connection(server).await });
                }
            }

            let conn = Connection::builder(self.config.clone())
                .peer(endpoint.to_string())
                .start(client);
            self.dialed.lock().unwrap().push(conn.clone());
            Ok(conn)
        })
    }
}

pub fn runner_config(id: &str, slots: usize) -> RunnerConfig {
    RunnerConfig {
        runner_id: id.to_string(),
        advertise_endpoint: id.to_string(),
        slots,
        ..Default::default()
    }
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Wraps a [`MemoryNetwork`] and cuts the first `drops` connections it
/// hands out `after` they are established.
pub struct DroppingConnector {
    network: Arc<MemoryNetwork>,
    drops: u32,
    after: Duration,
    dials: AtomicU32,
}

impl DroppingConnector {
    pub fn new(network: Arc<MemoryNetwork>, drops: u32, after: Duration) -> Arc<Self> {
        Arc::new(Self {
            network,
            drops,
            after,
            dials: AtomicU32::new(0),
        })
    }
}

impl Connector for DroppingConnector {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async move {
            let conn = self.network.connect(endpoint).await?;
            if self.dials.fetch_add(1, Ordering::SeqCst) < self.drops {
                let doomed = conn.clone();
                let after = self.after;
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    doomed.close();
                });
            }
            Ok(conn)
        })
    }
}
