//! Typed configuration from environment variables.
//!
//! Loads once at startup. Everything has a default; a value that is set but
//! cannot be parsed fails fast.

pub mod presets;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::model::coerce_capacity;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    /// Per-subscriber credit for queues that were never configured.
    pub default_capacity: u32,
    /// Optional TOML file declaring queues at startup.
    pub queues_file: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            default_capacity: 1,
            queues_file: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind: parsed_var("JOBQ_BIND")?.unwrap_or(defaults.bind),
            port: parsed_var("PORT")?.unwrap_or(defaults.port),
            default_capacity: std::env::var("JOBQ_DEFAULT_CAPACITY")
                .ok()
                .map(|raw| capacity_from_str(&raw))
                .unwrap_or(defaults.default_capacity),
            queues_file: std::env::var("JOBQ_QUEUES").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Same coercion as queue configuration: junk becomes 1.
fn capacity_from_str(raw: &str) -> u32 {
    let value = raw
        .trim()
        .parse::<f64>()
        .map(serde_json::Value::from)
        .unwrap_or(serde_json::Value::Null);
    coerce_capacity(&value)
}
