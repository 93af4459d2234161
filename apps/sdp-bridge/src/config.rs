use std::path::PathBuf;
use std::time::Duration;

use rtc_engine::{EngineConfig, IceServer};
use serde::Deserialize;

use crate::channel::{ChannelConfig, DEFAULT_GREETING};
use crate::signaling::SignalingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    WebRtc,
    Memory,
}

impl EngineKind {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(value) if value.eq_ignore_ascii_case("memory") => EngineKind::Memory,
            _ => EngineKind::WebRtc,
        }
    }
}

/// Environment-backed settings, all read from `SDP_BRIDGE_*` variables.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_bind_addr")]
    addr: String,
    #[serde(default)]
    ice_servers: Option<String>,
    #[serde(default = "default_heartbeat_ms")]
    heartbeat_ms: u64,
    #[serde(default = "default_gathering_timeout_ms")]
    gathering_timeout_ms: u64,
    #[serde(default)]
    greeting: Option<String>,
    #[serde(default)]
    index_path: Option<String>,
    #[serde(default)]
    engine: Option<String>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            addr: default_bind_addr(),
            ice_servers: None,
            heartbeat_ms: default_heartbeat_ms(),
            gathering_timeout_ms: default_gathering_timeout_ms(),
            greeting: None,
            index_path: None,
            engine: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub log_filter: String,
    pub ice_servers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub gathering_timeout: Duration,
    pub greeting: String,
    pub index_path: PathBuf,
    pub engine: EngineKind,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let raw = config::Config::builder()
            .add_source(config::Environment::with_prefix("SDP_BRIDGE"))
            .build()
            .and_then(|c| c.try_deserialize::<RawConfig>())
            .unwrap_or_default();
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sdp_bridge=debug".into());
        Self::from_raw(raw, log_filter)
    }

    fn from_raw(raw: RawConfig, log_filter: String) -> Self {
        Self {
            bind_addr: normalize_opt(Some(raw.addr)).unwrap_or_else(default_bind_addr),
            log_filter,
            ice_servers: parse_ice_servers(raw.ice_servers.as_deref()),
            heartbeat_interval: Duration::from_millis(raw.heartbeat_ms.max(1)),
            gathering_timeout: Duration::from_millis(raw.gathering_timeout_ms.max(1)),
            greeting: normalize_opt(raw.greeting).unwrap_or_else(|| DEFAULT_GREETING.to_string()),
            index_path: normalize_opt(raw.index_path)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("index.html")),
            engine: EngineKind::parse(normalize_opt(raw.engine).as_deref()),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ice_servers: self.ice_servers.iter().map(IceServer::new).collect(),
        }
    }

    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            gathering_timeout: self.gathering_timeout,
            channel: ChannelConfig {
                greeting: self.greeting.clone(),
                heartbeat_interval: self.heartbeat_interval,
            },
        }
    }
}

/// Unset means the public STUN server; an explicitly empty list means host
/// candidates only.
fn parse_ice_servers(raw: Option<&str>) -> Vec<String> {
    match raw {
        None => EngineConfig::default()
            .ice_servers
            .into_iter()
            .flat_map(|server| server.urls)
            .collect(),
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_heartbeat_ms() -> u64 {
    1_000
}

fn default_gathering_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "SDP_BRIDGE_ADDR",
        "SDP_BRIDGE_ICE_SERVERS",
        "SDP_BRIDGE_HEARTBEAT_MS",
        "SDP_BRIDGE_GATHERING_TIMEOUT_MS",
        "SDP_BRIDGE_GREETING",
        "SDP_BRIDGE_INDEX_PATH",
        "SDP_BRIDGE_ENGINE",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        clear_env();
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.engine_config(), EngineConfig::default());
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(cfg.gathering_timeout, Duration::from_secs(10));
        assert_eq!(cfg.greeting, DEFAULT_GREETING);
        assert_eq!(cfg.index_path, PathBuf::from("index.html"));
        assert_eq!(cfg.engine, EngineKind::WebRtc);
    }

    #[test]
    #[serial]
    fn reads_overrides_from_environment() {
        clear_env();
        std::env::set_var("SDP_BRIDGE_ADDR", "127.0.0.1:9000");
        std::env::set_var("SDP_BRIDGE_HEARTBEAT_MS", "250");
        std::env::set_var("SDP_BRIDGE_GATHERING_TIMEOUT_MS", "1500");
        std::env::set_var("SDP_BRIDGE_GREETING", "  hello there ");
        std::env::set_var("SDP_BRIDGE_ENGINE", "memory");
        std::env::set_var(
            "SDP_BRIDGE_ICE_SERVERS",
            "stun:a.example:3478, turn:b.example:3478 ,",
        );
        let cfg = AppConfig::from_env();
        clear_env();

        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(cfg.gathering_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.greeting, "hello there");
        assert_eq!(cfg.engine, EngineKind::Memory);
        assert_eq!(
            cfg.ice_servers,
            vec!["stun:a.example:3478".to_string(), "turn:b.example:3478".to_string()]
        );
        let signaling = cfg.signaling_config();
        assert_eq!(signaling.channel.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(cfg.engine_config().ice_servers.len(), 2);
    }

    #[test]
    fn empty_ice_list_means_localhost_only() {
        assert!(parse_ice_servers(Some("")).is_empty());
        assert!(parse_ice_servers(Some(" , ")).is_empty());
        assert_eq!(
            parse_ice_servers(None),
            EngineConfig::default().ice_servers[0].urls
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let raw = RawConfig {
            addr: "   ".into(),
            greeting: Some(String::new()),
            index_path: Some(" ".into()),
            heartbeat_ms: 0,
            ..RawConfig::default()
        };
        let cfg = AppConfig::from_raw(raw, "info".into());
        assert_eq!(cfg.bind_addr, default_bind_addr());
        assert_eq!(cfg.greeting, DEFAULT_GREETING);
        assert_eq!(cfg.index_path, PathBuf::from("index.html"));
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(1));
    }
}
