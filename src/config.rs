//! Proxy configuration: loading from TOML, defaults and validation.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration. Without any `[[topology.sets]]` nothing is routable
//! and forwarded commands are answered with "shard not ready".
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 6380
//!
//! [backend]
//! connect_timeout_ms = 3000
//! keepalive_interval_ms = 10000   # 0 disables keep-alive
//!
//! [topology]
//! shard_count = 1024
//!
//! [[topology.sets]]
//! id = 1
//! servers = ["10.0.0.1:7000", "10.0.0.2:7000"]
//! shards = ["0-511"]
//!
//! [[topology.sets]]
//! id = 2
//! servers = ["10.0.0.3:7000"]
//! shards = ["512-1023"]
//! ```

use crate::backend::KeepaliveConfig;
use crate::proxy::DEFAULT_MAX_PENDING;
use crate::routing::{SetId, ShardId, TopologySnapshot, DEFAULT_SHARD_COUNT};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
}

/// The client-facing listener.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Replies a single client may have outstanding before reads pause.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_pending: default_max_pending(),
        }
    }
}

/// Connections to backend nodes.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// `0` disables keep-alive pings.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
        }
    }
}

/// Shard layout and server sets.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// How long startup waits for the initial topology load.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub sets: Vec<ServerSetConfig>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            sets: Vec::new(),
        }
    }
}

/// One server set: its servers, preferred first, and the shards it owns.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerSetConfig {
    pub id: SetId,
    pub servers: Vec<String>,
    /// Shard ids or inclusive ranges: `"7"`, `"0-511"`.
    #[serde(default)]
    pub shards: Vec<String>,
}

fn default_host() -> String {
    crate::DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_PORT
}
fn default_max_pending() -> usize {
    DEFAULT_MAX_PENDING
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_keepalive_interval_ms() -> u64 {
    10_000
}
fn default_keepalive_timeout_ms() -> u64 {
    5000
}
fn default_shard_count() -> u32 {
    DEFAULT_SHARD_COUNT
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{}'", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Invalid configuration in '{}'", path.display()))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that cannot be caught by deserialization.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            bail!("server.host cannot be empty");
        }
        if self.server.max_pending == 0 {
            bail!("server.max_pending must be at least 1");
        }
        if self.backend.connect_timeout_ms == 0 {
            bail!("backend.connect_timeout_ms must be positive");
        }
        if self.backend.keepalive_interval_ms > 0 && self.backend.keepalive_timeout_ms == 0 {
            bail!("backend.keepalive_timeout_ms must be positive when keep-alive is enabled");
        }
        if self.topology.shard_count == 0 {
            bail!("topology.shard_count must be at least 1");
        }
        self.topology_snapshot().map(|_| ())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.topology.handshake_timeout_ms)
    }

    /// Keep-alive settings, or `None` when disabled.
    pub fn keepalive(&self) -> Option<KeepaliveConfig> {
        (self.backend.keepalive_interval_ms > 0).then(|| KeepaliveConfig {
            interval: Duration::from_millis(self.backend.keepalive_interval_ms),
            timeout: Duration::from_millis(self.backend.keepalive_timeout_ms),
        })
    }

    /// Builds the routing picture described by `[topology]`.
    ///
    /// Fails on malformed or out-of-range shard specs, a shard claimed by two
    /// sets, duplicate set ids, or a set without servers.
    pub fn topology_snapshot(&self) -> Result<TopologySnapshot> {
        let shard_count = self.topology.shard_count;
        let mut claimed: HashMap<ShardId, SetId> = HashMap::new();
        let mut snapshot = TopologySnapshot::default();

        for set in &self.topology.sets {
            if snapshot.sets.iter().any(|(id, _)| *id == set.id) {
                bail!("server set {} is defined twice", set.id);
            }
            if set.servers.is_empty() {
                bail!("server set {} has no servers", set.id);
            }

            for spec in &set.shards {
                let (first, last) = parse_shard_range(spec)
                    .with_context(|| format!("server set {}: bad shard spec '{}'", set.id, spec))?;
                if last >= shard_count {
                    bail!(
                        "server set {}: shard {} is out of range (shard_count = {})",
                        set.id,
                        last,
                        shard_count
                    );
                }
                for shard in first..=last {
                    if let Some(owner) = claimed.insert(shard, set.id) {
                        if owner != set.id {
                            bail!("shard {} is assigned to both set {} and set {}", shard, owner, set.id);
                        }
                    }
                }
            }

            snapshot.sets.push((set.id, set.servers.clone()));
        }

        let mut owners: Vec<(ShardId, SetId)> = claimed.into_iter().collect();
        owners.sort_unstable();
        snapshot.owners = owners;
        Ok(snapshot)
    }
}

/// Parses `"N"` or `"A-B"` (inclusive) into a shard range.
fn parse_shard_range(spec: &str) -> Result<(ShardId, ShardId)> {
    let parse = |s: &str| -> Result<ShardId> {
        s.trim()
            .parse::<ShardId>()
            .map_err(|e| anyhow!("'{}' is not a shard id: {}", s.trim(), e))
    };

    let (first, last) = match spec.split_once('-') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let shard = parse(spec)?;
            (shard, shard)
        }
    };
    if first > last {
        bail!("range start {} is after its end {}", first, last);
    }
    Ok((first, last))
}
