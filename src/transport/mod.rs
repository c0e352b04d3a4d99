//! Transport module - dialing and accepting connections.
//!
//! Production traffic runs over TLS ([`tls`]). Everything above this module
//! only sees a [`Connector`] and [`Connection`]s, so tests can substitute
//! in-memory streams.

pub mod tls;

pub use tls::{thumbprint, Incoming, TlsConnector, TlsListener};

use std::fmt;
use std::str::FromStr;

use crate::connection::Connection;
use crate::error::{Result, TaskwireError};
use crate::work::BoxFuture;

/// Opens connections to `host:port` endpoints.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Connection>>;
}

/// A parsed `host:port` endpoint. IPv6 hosts are written in brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = TaskwireError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TaskwireError::Config(format!("invalid endpoint '{}', expected host:port", s));
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
