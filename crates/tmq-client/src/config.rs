//! Consumer configuration
//!
//! Settings are addressed by the dotted keys the server-side consumer
//! understands (`group.id`, `auto.offset.reset`, ...) plus `ws.*` keys that
//! only shape the local transport and are never sent to the server.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Path the TMQ endpoint is served under
pub const TMQ_PATH: &str = "/rest/tmq";

/// Where a group with no committed offset starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
    None,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::None => "none",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            "none" => Ok(OffsetReset::None),
            other => Err(Error::Config(format!(
                "auto.offset.reset must be earliest, latest or none, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local transport settings; none of these reach the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportConfig {
    /// WebSocket URL of the TMQ endpoint
    pub url: String,
    /// Capacity of the outbound write queue
    pub channel_len: usize,
    /// Per-request response timeout
    pub message_timeout: Duration,
    /// Deadline for a single frame write
    pub write_wait: Duration,
    /// Ping period; zero disables keepalive
    pub keepalive_interval: Duration,
    /// Retry the initial dial on failure
    pub auto_reconnect: bool,
    pub reconnect_retry_count: u32,
    pub reconnect_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:6041".to_string(),
            channel_len: 64,
            message_timeout: Duration::from_secs(300),
            write_wait: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            auto_reconnect: false,
            reconnect_retry_count: 3,
            reconnect_interval: Duration::from_secs(2),
        }
    }
}

impl TransportConfig {
    /// The URL actually dialed: `/rest/tmq` is appended when no path is given
    pub fn endpoint(&self) -> String {
        let url = self.url.trim_end_matches('/');
        let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        if after_scheme.contains('/') {
            url.to_string()
        } else {
            format!("{}{}", url, TMQ_PATH)
        }
    }
}

/// Full consumer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerConfig {
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub db: String,
    pub group_id: String,
    pub client_id: String,
    pub auto_offset_reset: OffsetReset,
    /// Forwarded to the server, which owns the commit timer
    pub enable_auto_commit: bool,
    pub auto_commit_interval_ms: u64,
    pub with_table_name: bool,
    pub snapshot_enable: bool,
    pub enable_batch_meta: bool,
    pub session_timeout_ms: Option<u64>,
    pub max_poll_interval_ms: Option<u64>,
    pub transport: TransportConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: "taosdata".to_string(),
            db: String::new(),
            group_id: String::new(),
            client_id: String::new(),
            auto_offset_reset: OffsetReset::default(),
            enable_auto_commit: true,
            auto_commit_interval_ms: 5000,
            with_table_name: true,
            snapshot_enable: false,
            enable_batch_meta: false,
            session_timeout_ms: None,
            max_poll_interval_ms: None,
            transport: TransportConfig::default(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::Config(format!("{} expects true or false, got '{}'", key, other))),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} expects a number, got '{}'", key, value)))
}

/// Durations accept humantime strings (`5s`, `500ms`); a bare number is milliseconds
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(value)
        .map_err(|e| Error::Config(format!("{} expects a duration, got '{}': {}", key, value, e)))
}

impl ConsumerConfig {
    pub fn new(url: impl Into<String>, group_id: impl Into<String>) -> Self {
        let mut config = Self {
            group_id: group_id.into(),
            ..Self::default()
        };
        config.transport.url = url.into();
        config
    }

    /// Build from `key = value` pairs, starting from the defaults
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Apply one configuration key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "td.connect.user" => self.user = value.to_string(),
            "td.connect.pass" => self.password = value.to_string(),
            "td.connect.db" => self.db = value.to_string(),
            "group.id" => self.group_id = value.to_string(),
            "client.id" => self.client_id = value.to_string(),
            "auto.offset.reset" => self.auto_offset_reset = value.parse()?,
            "enable.auto.commit" => self.enable_auto_commit = parse_bool(key, value)?,
            "auto.commit.interval.ms" => self.auto_commit_interval_ms = parse_num(key, value)?,
            "msg.with.table.name" => self.with_table_name = parse_bool(key, value)?,
            "experimental.snapshot.enable" => self.snapshot_enable = parse_bool(key, value)?,
            "msg.enable.batchmeta" => self.enable_batch_meta = parse_bool(key, value)?,
            "session.timeout.ms" => self.session_timeout_ms = Some(parse_num(key, value)?),
            "max.poll.interval.ms" => self.max_poll_interval_ms = Some(parse_num(key, value)?),
            "ws.url" => self.transport.url = value.to_string(),
            "ws.message.channelLen" => self.transport.channel_len = parse_num(key, value)?,
            "ws.message.timeout" => self.transport.message_timeout = parse_duration(key, value)?,
            "ws.message.writeWait" => self.transport.write_wait = parse_duration(key, value)?,
            "ws.keepalive.interval" => {
                self.transport.keepalive_interval = parse_duration(key, value)?
            }
            "ws.autoReconnect" => self.transport.auto_reconnect = parse_bool(key, value)?,
            "ws.reconnectRetryCount" => {
                self.transport.reconnect_retry_count = parse_num(key, value)?
            }
            "ws.reconnectIntervalMs" => {
                self.transport.reconnect_interval = Duration::from_millis(parse_num(key, value)?)
            }
            unknown => {
                return Err(Error::Config(format!("unknown configuration key '{}'", unknown)));
            }
        }
        Ok(())
    }

    /// Check the settings a session cannot start without
    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(Error::Config("group.id is required".to_string()));
        }
        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "ws.url must start with ws:// or wss://, got '{}'",
                self.transport.url
            )));
        }
        if self.transport.channel_len == 0 {
            return Err(Error::Config("ws.message.channelLen must be positive".to_string()));
        }
        if self.transport.message_timeout.is_zero() {
            return Err(Error::Config("ws.message.timeout must be positive".to_string()));
        }
        Ok(())
    }
}
