//! Node and server configuration
//!
//! A [`NodeConfig`] is read from a TOML file with a `[node]` table, a `[tls]`
//! table and one table per protocol. Every field is optional; what is left
//! out falls back to the defaults in [`ServerConfig::for_kind`], which also
//! decides whether a protocol's server runs at all.

use crate::network::ddos::DdosSettings;
use crate::network::socket::MTU;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The protocols a node can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Data,
    Lookup,
    Time,
    File,
    Api,
    Rpc,
    Mining,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 7] = [
        ProtocolKind::Data,
        ProtocolKind::Lookup,
        ProtocolKind::Time,
        ProtocolKind::File,
        ProtocolKind::Api,
        ProtocolKind::Rpc,
        ProtocolKind::Mining,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Data => "data",
            ProtocolKind::Lookup => "lookup",
            ProtocolKind::Time => "time",
            ProtocolKind::File => "file",
            ProtocolKind::Api => "api",
            ProtocolKind::Rpc => "rpc",
            ProtocolKind::Mining => "mining",
        }
    }

    /// Default listening port
    pub fn default_port(&self) -> u16 {
        match self {
            ProtocolKind::Data => 9888,
            ProtocolKind::Lookup => 9887,
            ProtocolKind::Time => 9324,
            ProtocolKind::File => 80,
            ProtocolKind::Api => 8080,
            ProtocolKind::Rpc => 9336,
            ProtocolKind::Mining => 9325,
        }
    }

    /// Default TLS port, 0 if the protocol has none
    pub fn default_ssl_port(&self) -> u16 {
        match self {
            ProtocolKind::File => 443,
            ProtocolKind::Api => 7080,
            _ => 0,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// File format
// =============================================================================

/// `[node]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Where the address book and markers live
    pub data_dir: PathBuf,
    /// Client mode: dial out, never serve
    pub client: bool,
    /// Unified mode: also serve time
    pub unified: bool,
    /// Run the lookup server
    pub lookup: bool,
    /// Indexes needed by the lookup server are available
    pub indexes: bool,
    /// Run the mining server
    pub mining: bool,
    /// Document root of the file server
    pub file_root: Option<PathBuf>,
    /// Interface to bind listeners to
    pub bind: IpAddr,
    /// Peers to keep connected regardless of the address book
    pub connect: Vec<SocketAddr>,
    /// Accept loopback and private addresses into the book
    pub allow_local_peers: bool,
    /// Largest chunk a socket flush hands to the kernel
    pub max_send_size: usize,
    /// Dial timeout (ms)
    pub connect_timeout_ms: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".peerlink"),
            client: false,
            unified: false,
            lookup: true,
            indexes: false,
            mining: false,
            file_root: None,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect: Vec::new(),
            allow_local_peers: false,
            max_send_size: MTU,
            connect_timeout_ms: 5000,
        }
    }
}

/// `[tls]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
}

impl TlsSection {
    pub fn is_configured(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// Per-protocol overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    pub port: Option<u16>,
    pub ssl_port: Option<u16>,
    pub listen: Option<bool>,
    pub meters: Option<bool>,
    pub ddos: Option<bool>,
    pub manager: Option<bool>,
    pub ssl: Option<bool>,
    pub ssl_required: Option<bool>,
    pub remote: Option<bool>,
    pub max_incoming: Option<u32>,
    pub max_connections: Option<u32>,
    pub threads: Option<usize>,
    pub cscore: Option<u32>,
    pub rscore: Option<u32>,
    pub timespan: Option<u64>,
    pub cweight: Option<u32>,
    pub rweight: Option<u32>,
    pub manager_sleep_ms: Option<u64>,
    pub timeout: Option<u64>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth: Option<bool>,
}

impl ProtocolSection {
    fn has_credentials(&self) -> bool {
        self.user.is_some() && self.password.is_some()
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub tls: TlsSection,
    pub data: ProtocolSection,
    pub lookup: ProtocolSection,
    pub time: ProtocolSection,
    pub file: ProtocolSection,
    pub api: ProtocolSection,
    pub rpc: ProtocolSection,
    pub mining: ProtocolSection,
}

impl NodeConfig {
    /// Read a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn section(&self, kind: ProtocolKind) -> &ProtocolSection {
        match kind {
            ProtocolKind::Data => &self.data,
            ProtocolKind::Lookup => &self.lookup,
            ProtocolKind::Time => &self.time,
            ProtocolKind::File => &self.file,
            ProtocolKind::Api => &self.api,
            ProtocolKind::Rpc => &self.rpc,
            ProtocolKind::Mining => &self.mining,
        }
    }

    pub fn section_mut(&mut self, kind: ProtocolKind) -> &mut ProtocolSection {
        match kind {
            ProtocolKind::Data => &mut self.data,
            ProtocolKind::Lookup => &mut self.lookup,
            ProtocolKind::Time => &mut self.time,
            ProtocolKind::File => &mut self.file,
            ProtocolKind::Api => &mut self.api,
            ProtocolKind::Rpc => &mut self.rpc,
            ProtocolKind::Mining => &mut self.mining,
        }
    }

    /// Reject settings no server could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tls.cert.is_some() != self.tls.key.is_some() {
            return Err(ConfigError::Invalid(
                "[tls] needs both cert and key".to_string(),
            ));
        }

        if self.node.max_send_size == 0 {
            return Err(ConfigError::Invalid("max_send_size must be positive".to_string()));
        }

        for kind in ProtocolKind::ALL {
            let section = self.section(kind);
            if section.threads == Some(0) {
                return Err(ConfigError::Invalid(format!("[{}] threads must be positive", kind)));
            }
            if let (Some(incoming), Some(total)) = (section.max_incoming, section.max_connections) {
                if incoming > total {
                    return Err(ConfigError::Invalid(format!(
                        "[{}] max_incoming {} exceeds max_connections {}",
                        kind, incoming, total
                    )));
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Server configuration
// =============================================================================

/// Per-protocol fallbacks used by [`ServerConfig::for_kind`]
struct Defaults {
    listen: bool,
    ddos: bool,
    manager: bool,
    remote: bool,
    incoming: u32,
    connections: u32,
    threads: usize,
    cscore: u32,
    rscore: u32,
    /// seconds
    timespan: u64,
    sleep_ms: u64,
    /// seconds
    timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            listen: true,
            ddos: false,
            manager: false,
            remote: true,
            incoming: 128,
            connections: 128,
            threads: 4,
            cscore: 1,
            rscore: 50,
            timespan: 60,
            sleep_ms: 0,
            timeout: 30,
        }
    }
}

/// Settings of one server, fixed once the server is built
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub bind: IpAddr,
    pub port: u16,
    /// TLS listener port, 0 for none
    pub ssl_port: u16,
    pub listen: bool,
    pub meters: bool,
    pub ddos: bool,
    pub manager: bool,
    pub ssl: bool,
    pub ssl_required: bool,
    /// Accept connections from non-loopback addresses
    pub remote: bool,
    pub max_incoming: u32,
    pub max_connections: u32,
    pub threads: usize,
    pub ddos_settings: DdosSettings,
    pub manager_sleep: Duration,
    pub socket_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_send: usize,
    /// Peers the manager always keeps dialing
    pub connect: Vec<SocketAddr>,
}

impl ServerConfig {
    /// Plain listening server with conservative defaults
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            ssl_port: 0,
            listen: true,
            meters: false,
            ddos: false,
            manager: false,
            ssl: false,
            ssl_required: false,
            remote: true,
            max_incoming: 128,
            max_connections: 128,
            threads: 4,
            ddos_settings: DdosSettings::default(),
            manager_sleep: Duration::from_secs(1),
            socket_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_send: MTU,
            connect: Vec::new(),
        }
    }

    /// Build a protocol's server settings from the node config.
    ///
    /// Returns `Err` with the reason when the protocol should not run.
    pub fn for_kind(kind: ProtocolKind, node: &NodeConfig) -> Result<Self, String> {
        let n = &node.node;
        let s = node.section(kind);
        let client = n.client;

        let mut cfg = Self::new(kind.name(), s.port.unwrap_or_else(|| kind.default_port()));
        cfg.bind = n.bind;
        cfg.max_send = n.max_send_size.clamp(1, MTU);
        cfg.connect_timeout = Duration::from_millis(n.connect_timeout_ms);
        cfg.ssl_port = s.ssl_port.unwrap_or_else(|| kind.default_ssl_port());

        let d = match kind {
            ProtocolKind::Time => {
                let serving = n.unified && !client;
                Defaults {
                    listen: serving,
                    ddos: true,
                    manager: true,
                    remote: serving,
                    incoming: if serving { 84 } else { 0 },
                    connections: if serving { 100 } else { 8 },
                    threads: if serving { 8 } else { 1 },
                    cscore: 1,
                    rscore: 10,
                    timespan: 10,
                    sleep_ms: 60_000,
                    timeout: 10,
                    ..Defaults::default()
                }
            }
            ProtocolKind::Lookup => {
                if !n.lookup {
                    return Err("lookup = false".to_string());
                }
                Defaults {
                    listen: !client && n.indexes,
                    ddos: true,
                    rscore: 50,
                    timespan: 10,
                    ..Defaults::default()
                }
            }
            ProtocolKind::Data => {
                cfg.connect = n.connect.clone();
                Defaults {
                    listen: !client,
                    manager: true,
                    incoming: 84,
                    connections: 100,
                    threads: 8,
                    rscore: 2000,
                    timespan: 20,
                    sleep_ms: 1000,
                    timeout: 120,
                    ..Defaults::default()
                }
            }
            ProtocolKind::File => {
                if n.file_root.is_none() {
                    return Err("no file_root configured".to_string());
                }
                Defaults {
                    ddos: true,
                    threads: 8,
                    cscore: 5,
                    rscore: 5,
                    ..Defaults::default()
                }
            }
            ProtocolKind::Api => {
                if !s.has_credentials() && s.auth.unwrap_or(true) {
                    return Err(
                        "set [api] user and password, or auth = false to run without authentication"
                            .to_string(),
                    );
                }
                Defaults {
                    ddos: true,
                    remote: false,
                    threads: 8,
                    cscore: 5,
                    rscore: 5,
                    ..Defaults::default()
                }
            }
            ProtocolKind::Rpc => {
                if !s.has_credentials() {
                    return Err("set [rpc] user and password".to_string());
                }
                Defaults {
                    ddos: true,
                    remote: false,
                    cscore: 5,
                    rscore: 5,
                    ..Defaults::default()
                }
            }
            ProtocolKind::Mining => {
                if !n.mining || client {
                    return Err("mining = false or client mode".to_string());
                }
                Defaults {
                    rscore: 50,
                    ..Defaults::default()
                }
            }
        };

        // Time server gating is not overridable
        let fixed = kind == ProtocolKind::Time;

        cfg.listen = if fixed { d.listen } else { s.listen.unwrap_or(d.listen) };
        cfg.meters = s.meters.unwrap_or(false);
        cfg.ddos = s.ddos.unwrap_or(d.ddos);
        cfg.manager = s.manager.unwrap_or(d.manager);
        cfg.remote = if fixed { d.remote } else { s.remote.unwrap_or(d.remote) };
        cfg.max_incoming = if fixed && !d.listen {
            0
        } else {
            s.max_incoming.unwrap_or(d.incoming)
        };
        cfg.max_connections = s.max_connections.unwrap_or(d.connections);
        cfg.threads = s.threads.unwrap_or(d.threads).max(1);
        cfg.ddos_settings = DdosSettings {
            connection_threshold: s.cscore.unwrap_or(d.cscore),
            request_threshold: s.rscore.unwrap_or(d.rscore),
            window: Duration::from_secs(s.timespan.unwrap_or(d.timespan)),
            connection_weight: s.cweight.unwrap_or(1),
            request_weight: s.rweight.unwrap_or(1),
        };
        cfg.manager_sleep = Duration::from_millis(s.manager_sleep_ms.unwrap_or(d.sleep_ms));
        cfg.socket_timeout = Duration::from_secs(s.timeout.unwrap_or(d.timeout));

        // A manager with no sleep interval is switched off
        if cfg.manager_sleep.is_zero() {
            cfg.manager = false;
        }

        cfg.ssl = s.ssl.unwrap_or(false);
        cfg.ssl_required = cfg.ssl && s.ssl_required.unwrap_or(false);
        if !cfg.ssl {
            cfg.ssl_port = 0;
        }

        Ok(cfg)
    }

    /// Whether any TLS listener or dial will be needed
    pub fn wants_tls(&self) -> bool {
        self.ssl && (self.ssl_port != 0 || self.ssl_required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let node = NodeConfig::default();

        let data = ServerConfig::for_kind(ProtocolKind::Data, &node).unwrap();
        assert_eq!(data.port, 9888);
        assert!(data.listen && data.manager && !data.ddos && !data.meters);
        assert_eq!((data.max_incoming, data.max_connections, data.threads), (84, 100, 8));
        assert_eq!(data.ddos_settings.request_threshold, 2000);
        assert_eq!(data.ddos_settings.window, Duration::from_secs(20));
        assert_eq!(data.manager_sleep, Duration::from_secs(1));
        assert_eq!(data.socket_timeout, Duration::from_secs(120));

        let lookup = ServerConfig::for_kind(ProtocolKind::Lookup, &node).unwrap();
        assert!(!lookup.listen, "lookup needs indexes to listen");
        assert!(!lookup.manager);

        let time = ServerConfig::for_kind(ProtocolKind::Time, &node).unwrap();
        assert!(!time.listen);
        assert_eq!((time.max_incoming, time.max_connections, time.threads), (0, 8, 1));
        assert_eq!(time.manager_sleep, Duration::from_secs(60));
    }

    #[test]
    fn test_gating() {
        let mut node = NodeConfig::default();

        let api = ServerConfig::for_kind(ProtocolKind::Api, &node).unwrap_err();
        assert!(api.contains("user and password"));
        assert!(ServerConfig::for_kind(ProtocolKind::Rpc, &node).is_err());
        assert!(ServerConfig::for_kind(ProtocolKind::File, &node).is_err());
        assert!(ServerConfig::for_kind(ProtocolKind::Mining, &node).is_err());

        node.api.auth = Some(false);
        let api = ServerConfig::for_kind(ProtocolKind::Api, &node).unwrap();
        assert_eq!(api.port, 8080);
        assert!(!api.remote);

        node.rpc.user = Some("u".into());
        node.rpc.password = Some("p".into());
        assert!(ServerConfig::for_kind(ProtocolKind::Rpc, &node).is_ok());

        node.node.mining = true;
        assert!(ServerConfig::for_kind(ProtocolKind::Mining, &node).is_ok());
        node.node.client = true;
        assert!(ServerConfig::for_kind(ProtocolKind::Mining, &node).is_err());
    }

    #[test]
    fn test_unified_time_server() {
        let mut node = NodeConfig::default();
        node.node.unified = true;

        let time = ServerConfig::for_kind(ProtocolKind::Time, &node).unwrap();
        assert!(time.listen && time.remote);
        assert_eq!((time.max_incoming, time.max_connections, time.threads), (84, 100, 8));

        node.node.client = true;
        let time = ServerConfig::for_kind(ProtocolKind::Time, &node).unwrap();
        assert!(!time.listen);
    }

    #[test]
    fn test_parse_overrides() {
        let text = r#"
            [node]
            data_dir = "/tmp/peerlink"
            client = true
            connect = ["10.0.0.1:9888"]

            [data]
            listen = true
            threads = 2
            ddos = true
            cscore = 3
            cweight = 2

            [file]
            ssl = true
        "#;

        let node = NodeConfig::from_toml(text).unwrap();
        assert!(node.node.client);

        let data = ServerConfig::for_kind(ProtocolKind::Data, &node).unwrap();
        assert!(data.listen);
        assert_eq!(data.threads, 2);
        assert!(data.ddos);
        assert_eq!(data.ddos_settings.connection_threshold, 3);
        assert_eq!(data.ddos_settings.connection_weight, 2);
        assert_eq!(data.connect, vec!["10.0.0.1:9888".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            NodeConfig::from_toml("[tls]\ncert = \"c.pem\"\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("[data]\nthreads = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("[data]\nmax_incoming = 10\nmax_connections = 5\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("[node\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&temp_dir.path().join("peerlink.toml")).unwrap();
        assert!(!config.node.client);
    }
}
