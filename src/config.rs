/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator. This is split up into smaller,
//! subsystem-specific config structs before being passed to components.
//!
//! Operators usually configure through the dotted string keys recognised by
//! [`Configuration::set`] (`gmcast.group`, `evs.send_window`, `gcache.size`, …), the
//! same namespace the embedding database exposes in its own option string.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::cert::CertConfig;
use crate::evs::EvsConfig;
use crate::pc::PcConfig;

/// Transport mesh configuration.
#[derive(Clone, Debug)]
pub struct GmcastConfig {
    /// Cluster name; links between differently-named clusters are refused.
    pub group: String,
    /// `host:port` this member listens on (`base_host`/`base_port`).
    pub listen_addr: String,
    /// Seed addresses dialed at startup (`gmcast.group` address list).
    pub seeds: Vec<String>,
    pub keepalive_period: Duration,
    pub peer_timeout: Duration,
    pub gossip_period: Duration,
}

impl Default for GmcastConfig {
    fn default() -> Self {
        GmcastConfig {
            group: "tandem".to_string(),
            listen_addr: "127.0.0.1:4567".to_string(),
            seeds: Vec::new(),
            keepalive_period: Duration::from_millis(500),
            peer_timeout: Duration::from_secs(5),
            gossip_period: Duration::from_secs(2),
        }
    }
}

/// Sequencing-layer knobs.
#[derive(Clone, Debug)]
pub struct GcsConfig {
    /// Capacity of the delivered-action FIFO (rounded up to a power of two).
    pub recv_queue_len: usize,
    /// Capacity of the origination FIFO.
    pub send_queue_len: usize,
    /// Apply backlog above which this member multicasts a flow-control pause.
    pub fc_upper_limit: usize,
    /// Apply backlog below which a paused member multicasts a resume.
    pub fc_lower_limit: usize,
    /// How often a synced member multicasts its commit cut.
    pub commit_cut_period: Duration,
}

impl Default for GcsConfig {
    fn default() -> Self {
        GcsConfig {
            recv_queue_len: 4096,
            send_queue_len: 1024,
            fc_upper_limit: 1024,
            fc_lower_limit: 256,
            commit_cut_period: Duration::from_millis(200),
        }
    }
}

/// Replicator-level knobs.
#[derive(Clone, Debug)]
pub struct ReplicatorConfig {
    /// Human-readable node name, used in logs and as a donor hint target.
    pub node_name: String,
    /// Serialise commits in seqno order (`repl.commit_order`).
    pub commit_order: bool,
    /// How long a causal read waits for the commit horizon
    /// (`repl.causal_read_timeout`).
    pub causal_read_timeout: Duration,
    /// Upper bound on a serialized write-set.
    pub max_ws_size: usize,
    /// How long `connect` waits for the first primary view.
    pub connect_timeout: Duration,
    /// Number of applier threads.
    pub applier_threads: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        ReplicatorConfig {
            node_name: "tandem-node".to_string(),
            commit_order: true,
            causal_read_timeout: Duration::from_secs(30),
            max_ws_size: 1 << 30,
            connect_timeout: Duration::from_secs(30),
            applier_threads: 4,
        }
    }
}

/// The full operator configuration.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub gmcast: GmcastConfig,
    pub evs: EvsConfig,
    pub pc: PcConfig,
    pub gcs: GcsConfig,
    pub cache: CacheConfig,
    pub cert: CertConfig,
    pub replicator: ReplicatorConfig,
    /// Enable the default CSV logging event handlers.
    pub log_events: bool,
    /// Pin the member UUID instead of generating one at startup. Useful for tests and
    /// for operators who want stable identities across restarts.
    pub member_id: Option<crate::types::basic::MemberId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    UnknownKey(String),
    BadValue { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownKey(key) => write!(f, "unknown configuration key: {}", key),
            ConfigError::BadValue { key, value } => {
                write!(f, "bad value for {}: {:?}", key, value)
            }
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        _ => Err(ConfigError::BadValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

impl Configuration {
    /// Apply one dotted-key option, the way the embedding database passes its option
    /// string through. Unknown keys are rejected.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "gmcast.group" => self.gmcast.group = value.to_string(),
            "gmcast.listen_addr" => self.gmcast.listen_addr = value.to_string(),
            "gmcast.peer_timeout" => self.gmcast.peer_timeout = parse_millis(key, value)?,
            "base_host" => {
                let port = self
                    .gmcast
                    .listen_addr
                    .rsplit(':')
                    .next()
                    .unwrap_or("4567")
                    .to_string();
                self.gmcast.listen_addr = format!("{}:{}", value, port);
            }
            "base_port" => {
                let host = self
                    .gmcast
                    .listen_addr
                    .rsplit_once(':')
                    .map(|(host, _)| host.to_string())
                    .unwrap_or_else(|| "127.0.0.1".to_string());
                let port: u16 = parse(key, value)?;
                self.gmcast.listen_addr = format!("{}:{}", host, port);
            }
            "evs.send_window" | "evs.user_send_window" => {
                self.evs.user_send_window = parse(key, value)?
            }
            "evs.join_retrans_period" => self.evs.join_retrans_period = parse_millis(key, value)?,
            "pc.bootstrap" => self.pc.bootstrap = parse_bool(key, value)?,
            "pc.weight" => self.pc.weight = parse(key, value)?,
            "gcache.size" => self.cache.total_size = parse(key, value)?,
            "gcache.page_size" => self.cache.page_size = parse(key, value)?,
            "gcache.mem_size" => self.cache.mem_max = parse(key, value)?,
            "gcache.dir" => self.cache.dir = PathBuf::from(value),
            "gcache.name" => self.cache.name = value.to_string(),
            "gcache.recover" => self.cache.recover = parse_bool(key, value)?,
            "cert.log_conflicts" => self.cert.log_conflicts = parse_bool(key, value)?,
            "repl.commit_order" => self.replicator.commit_order = parse_bool(key, value)?,
            "repl.causal_read_timeout" => {
                self.replicator.causal_read_timeout = parse_millis(key, value)?
            }
            "repl.max_ws_size" => self.replicator.max_ws_size = parse(key, value)?,
            "node.name" => self.replicator.node_name = value.to_string(),
            // Recognised but currently fixed: the mesh is TCP, TLS slots in through
            // the stream-engine seam.
            "socket.ssl" | "socket.ssl_key" | "socket.ssl_cert" | "socket.ssl_ca"
            | "socket.ssl_cipher" | "socket.ssl_compression" | "socket.if_addr" => {
                log::warn!("config: {} recognised but not effective in this build", key);
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Apply a `key1=value1;key2=value2` option string.
    pub fn set_options(&mut self, options: &str) -> Result<(), ConfigError> {
        for pair in options.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(|| ConfigError::BadValue {
                key: pair.to_string(),
                value: String::new(),
            })?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }
}
