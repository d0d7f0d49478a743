use std::{net::{IpAddr, Ipv4Addr, SocketAddr}, path::{Path, PathBuf}};
use anyhow::Context;
use chrono::Duration;

use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "./config.toml";

#[serde_with::serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Upstream HTTP proxy (`host:port`) every outbound connection goes through.
    /// Absent or empty means targets are dialed directly.
    #[serde(deserialize_with = "empty_as_none")]
    pub upstream_proxy: Option<String>,

    pub listen_address: IpAddr,
    pub listen_port: u16,

    /// Bound on dialing a target or the upstream proxy.
    #[serde_as(as = "serde_with::DurationSeconds<i64>")]
    pub connect_timeout: Duration,
    /// Tunnels with no traffic in either direction for this long are closed.
    #[serde_as(as = "Option<serde_with::DurationSeconds<i64>>")]
    pub idle_timeout: Option<Duration>,
    pub tcp_nodelay: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream_proxy: None,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 8008,
            connect_timeout: Duration::seconds(10),
            idle_timeout: None,
            tcp_nodelay: false,
        }
    }
}

impl Settings {
    pub fn listen_socket_address(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        self.connect_timeout.to_std().unwrap_or(std::time::Duration::ZERO)
    }

    pub fn idle_timeout(&self) -> Option<std::time::Duration> {
        self.idle_timeout.and_then(|d| d.to_std().ok())
    }
}

fn empty_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty()))
}

pub fn parse(content: &str) -> anyhow::Result<Settings> {
    let settings: Settings = toml::from_str(content)?;
    if settings.connect_timeout <= Duration::zero() {
        anyhow::bail!("connect-timeout must be a positive number of seconds");
    }
    if settings.idle_timeout.is_some_and(|d| d <= Duration::zero()) {
        anyhow::bail!("idle-timeout must be a positive number of seconds, or left out to disable it");
    }
    Ok(settings)
}

/// Loads the settings from `path`, or from `./config.toml` when no path is
/// given. Only a missing default file falls back to the defaults.
pub fn init(path: Option<PathBuf>) -> anyhow::Result<Settings> {
    let (path, explicit) = match path {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    if !explicit && !Path::new(&path).exists() {
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
}
