//! Configuration management

use crate::domain::shared::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the binary
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub account: SipAccountConfig,
    #[serde(default)]
    pub engine: EngineTimings,
}

impl Config {
    /// Load from an optional TOML file, then apply `WSPHONE__*` environment
    /// overrides (e.g. `WSPHONE__ACCOUNT__PASSWORD`).
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("WSPHONE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("account.codecs")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// SIP account as handed over by the authentication layer.
///
/// The transport label is informational only: signaling always runs over
/// the WebSocket at `ws_url`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SipAccountConfig {
    pub server: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub extension: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub transport: Option<String>,
    pub codecs: Vec<String>,
    pub display_name: Option<String>,
    pub caller_id_name: Option<String>,
    pub stun_server: Option<String>,
    pub ws_url: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SipAccountConfig {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(5060)
    }

    /// Realm if configured, otherwise the server host
    pub fn effective_realm(&self) -> &str {
        non_blank(&self.realm).unwrap_or(self.server.trim())
    }

    /// Extension takes precedence over the login username
    pub fn sip_username(&self) -> &str {
        non_blank(&self.extension)
            .or_else(|| non_blank(&self.username))
            .unwrap_or("")
    }

    pub fn effective_ws_url(&self) -> String {
        match non_blank(&self.ws_url) {
            Some(url) => url.to_string(),
            None => format!("wss://{}/ws", self.server.trim()),
        }
    }

    pub fn transport_label(&self) -> &str {
        non_blank(&self.transport).unwrap_or("WSS")
    }

    /// Name shown in the From header of outgoing INVITEs
    pub fn caller_display_name(&self) -> &str {
        non_blank(&self.display_name)
            .or_else(|| non_blank(&self.caller_id_name))
            .unwrap_or_else(|| self.sip_username())
    }

    pub fn codec_preferences(&self) -> Vec<String> {
        if self.codecs.is_empty() {
            vec!["PCMU".to_string(), "PCMA".to_string()]
        } else {
            self.codecs.clone()
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.effective_realm().is_empty() && !self.sip_username().is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.effective_realm().is_empty() {
            return Err(DomainError::ValidationError(
                "server or realm must be set".to_string(),
            ));
        }
        if self.sip_username().is_empty() {
            return Err(DomainError::ValidationError(
                "username or extension must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timers and limits of the engine. Durations are in milliseconds so the
/// values stay readable in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineTimings {
    pub register_expires_secs: u32,
    pub keepalive_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    pub sdp_timeout_ms: u64,
    pub ice_gathering_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub unregister_grace_ms: u64,
    pub ws_ping_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            register_expires_secs: 300,
            keepalive_interval_ms: 60_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: 10,
            sdp_timeout_ms: 5_000,
            ice_gathering_timeout_ms: 3_000,
            disconnect_grace_ms: 2_000,
            unregister_grace_ms: 1_000,
            ws_ping_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
            user_agent: format!("WsPhone/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineTimings {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn sdp_timeout(&self) -> Duration {
        Duration::from_millis(self.sdp_timeout_ms)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn unregister_grace(&self) -> Duration {
        Duration::from_millis(self.unregister_grace_ms)
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_millis(self.ws_ping_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
