//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Room left in a frame for the message envelope around a chunk or message body.
const FRAME_HEADROOM: usize = 64 * 1024;
/// Largest chunk or message body that still fits one frame.
pub const MAX_BODY_BYTES: usize = party_core::wire::MAX_FRAME_LEN as usize - FRAME_HEADROOM;

/// Node configuration. File: ~/.config/party/config.toml or /etc/party/config.toml.
/// Env overrides: PARTY_NAMESPACE, PARTY_DISCOVERY_PORT, PARTY_SESSION_PORT, PARTY_INBOX_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Discovery namespace (service type) joined by `connect_as`.
    pub namespace: String,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub messages: MessageConfig,
    pub transfer: TransferConfig,
    pub storage: StorageConfig,
    pub events: EventConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiscoveryConfig {
    /// Multicast UDP port (default 45680).
    pub port: u16,
    /// IPv4 multicast group (default 239.255.60.61).
    pub multicast_group: Ipv4Addr,
    pub announce_interval_ms: u64,
    /// A peer is lost after this long without an announcement.
    pub peer_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
    pub bind_addr: IpAddr,
    /// TCP listen port; 0 picks an ephemeral port, which is advertised.
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Links with no inbound traffic for this long are torn down.
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UndecodablePolicy {
    /// Log and discard.
    Drop,
    /// Emit `Event::MessageUndecodable`.
    Report,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MessageConfig {
    pub on_undecodable: UndecodablePolicy,
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Chunks queued on a link but not yet written, per transfer.
    pub window: usize,
    pub max_resource_bytes: u64,
    /// Where received resources land. Defaults to `<data dir>/inbox`.
    pub inbox_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Directory holding the persisted identity. Defaults to the platform data dir.
    pub identity_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EventConfig {
    /// Events buffered per subscriber before the slowest one starts losing the oldest.
    pub capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "multiparty".to_string(),
            discovery: DiscoveryConfig::default(),
            session: SessionConfig::default(),
            messages: MessageConfig::default(),
            transfer: TransferConfig::default(),
            storage: StorageConfig::default(),
            events: EventConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 45680,
            multicast_group: Ipv4Addr::new(239, 255, 60, 61),
            announce_interval_ms: 2_000,
            peer_timeout_ms: 10_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            idle_timeout_ms: 20_000,
        }
    }
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            on_undecodable: UndecodablePolicy::Drop,
            max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: party_core::transfer::DEFAULT_CHUNK_SIZE,
            window: 8,
            max_resource_bytes: 256 * 1024 * 1024,
            inbox_dir: None,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Config {
    /// Parse a config file. Missing sections and fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let c: Config = toml::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        c.validate()?;
        Ok(c)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let t = &self.transfer;
        if t.chunk_size == 0 || t.chunk_size > MAX_BODY_BYTES {
            return invalid(format!(
                "transfer.chunk_size must be 1..={}, got {}",
                MAX_BODY_BYTES, t.chunk_size
            ));
        }
        let m = &self.messages;
        if m.max_message_bytes == 0 || m.max_message_bytes > MAX_BODY_BYTES {
            return invalid(format!(
                "messages.max_message_bytes must be 1..={}, got {}",
                MAX_BODY_BYTES, m.max_message_bytes
            ));
        }
        let s = &self.session;
        if s.idle_timeout_ms == 0 {
            return invalid("session.idle_timeout_ms must be positive".into());
        }
        if s.heartbeat_interval_ms >= s.idle_timeout_ms {
            return invalid(format!(
                "session.heartbeat_interval_ms ({}) must be below idle_timeout_ms ({})",
                s.heartbeat_interval_ms, s.idle_timeout_ms
            ));
        }
        if self.events.capacity == 0 {
            return invalid("events.capacity must be positive".into());
        }
        Ok(())
    }

    /// Apply `PARTY_*` overrides from `lookup`. Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("PARTY_NAMESPACE") {
            self.namespace = s;
        }
        if let Some(s) = lookup("PARTY_DISCOVERY_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.discovery.port = p,
                Err(_) => warn!("ignoring PARTY_DISCOVERY_PORT={:?}", s),
            }
        }
        if let Some(s) = lookup("PARTY_SESSION_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.session.port = p,
                Err(_) => warn!("ignoring PARTY_SESSION_PORT={:?}", s),
            }
        }
        if let Some(s) = lookup("PARTY_INBOX_DIR") {
            self.transfer.inbox_dir = Some(PathBuf::from(s));
        }
    }
}

/// Load config: merge default, then config file (explicit path or first existing default path), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => Config::load_from(path)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_overrides(|key| std::env::var(key).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/party/config.toml"));
    }
    out.push(PathBuf::from("/etc/party/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match Config::load_from(&path) {
        Ok(c) => {
            debug!("loaded config from {}", path.display());
            Some(c)
        }
        Err(e) => {
            warn!("{}; using defaults", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.namespace, "multiparty");
        assert_eq!(c.discovery.port, 45680);
        assert_eq!(c.session.connect_timeout(), Duration::from_secs(10));
        assert_eq!(c.messages.on_undecodable, UndecodablePolicy::Drop);
        assert!(c.transfer.inbox_dir.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str(
            r#"
            namespace = "chat"

            [session]
            port = 7000

            [messages]
            on_undecodable = "report"
            "#,
        )
        .unwrap();
        assert_eq!(c.namespace, "chat");
        assert_eq!(c.session.port, 7000);
        assert_eq!(c.session.idle_timeout_ms, 20_000);
        assert_eq!(c.messages.on_undecodable, UndecodablePolicy::Report);
        assert_eq!(c.discovery.announce_interval_ms, 2_000);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("colour = \"blue\"").is_err());
        assert!(toml::from_str::<Config>("[session]\nprot = 1").is_err());
    }

    #[test]
    fn overrides_apply_and_bad_values_ignored() {
        let env: HashMap<&str, &str> = [
            ("PARTY_NAMESPACE", "files"),
            ("PARTY_DISCOVERY_PORT", "not-a-port"),
            ("PARTY_SESSION_PORT", "9001"),
            ("PARTY_INBOX_DIR", "/tmp/inbox"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.namespace, "files");
        assert_eq!(c.discovery.port, 45680);
        assert_eq!(c.session.port, 9001);
        assert_eq!(c.transfer.inbox_dir, Some(PathBuf::from("/tmp/inbox")));
    }

    #[test]
    fn unusable_values_rejected() {
        assert!(Config::default().validate().is_ok());

        let mut c = Config::default();
        c.transfer.chunk_size = party_core::wire::MAX_FRAME_LEN as usize;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.messages.max_message_bytes = MAX_BODY_BYTES + 1;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.session.idle_timeout_ms = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.events.capacity = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nidle_timeout_ms = 0\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "namespace = 3").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            Config::load_from(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
