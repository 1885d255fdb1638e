//! Transport configuration (strict parsing).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use sockeye_core::{Result, SockeyeError};

/// Top-level server configuration: one section per transport.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub websocket: WebsocketConfig,

    #[serde(default)]
    pub polling: PollingConfig,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.websocket.validate()?;
        self.polling.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebsocketConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Extra headers presented when dialing out as a client.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            buffer_size: default_buffer_size(),
            headers: HashMap::new(),
        }
    }
}

impl WebsocketConfig {
    pub fn validate(&self) -> Result<()> {
        validate_timings("websocket", self.ping_interval_ms, self.ping_timeout_ms)?;
        if self.buffer_size == 0 {
            return Err(SockeyeError::BadConfig(
                "websocket.buffer_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Extra headers added to every polling response.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            headers: HashMap::new(),
        }
    }
}

impl PollingConfig {
    pub fn validate(&self) -> Result<()> {
        validate_timings("polling", self.ping_interval_ms, self.ping_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

fn validate_timings(section: &str, interval_ms: u64, timeout_ms: u64) -> Result<()> {
    if interval_ms == 0 {
        return Err(SockeyeError::BadConfig(format!(
            "{section}.ping_interval_ms must be positive"
        )));
    }
    if timeout_ms <= interval_ms {
        return Err(SockeyeError::BadConfig(format!(
            "{section}.ping_timeout_ms must be greater than ping_interval_ms"
        )));
    }
    Ok(())
}

fn default_ping_interval_ms() -> u64 {
    30_000
}
fn default_ping_timeout_ms() -> u64 {
    60_000
}
fn default_receive_timeout_ms() -> u64 {
    60_000
}
fn default_send_timeout_ms() -> u64 {
    60_000
}
fn default_buffer_size() -> usize {
    32 * 1024
}

pub fn load_from_file(path: &str) -> Result<ServerConfig> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| SockeyeError::BadConfig(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<ServerConfig> {
    let cfg: ServerConfig =
        serde_yaml::from_str(s).map_err(|e| SockeyeError::BadConfig(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
