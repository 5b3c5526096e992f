use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 42000;
pub const DEFAULT_AUTH_PORT: u16 = 42001;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Directory for identity, settings and the peer certificate scratch area
    pub data_dir: PathBuf,

    /// Name placed in our certificate and sent with registration requests
    pub hostname: String,

    /// Our LAN address. Detected at startup, never persisted.
    #[serde(skip, default = "default_ip")]
    pub ip: IpAddr,

    /// Interface to take `ip` from; first usable one when unset
    #[serde(default)]
    pub interface: Option<String>,

    /// v1 UDP certificate port, also the secure channel TCP port
    pub port: u16,

    /// v2 registration RPC port
    pub auth_port: u16,

    /// What peers see when they ask for our machine info
    pub display_name: String,
    #[serde(default)]
    pub user_name: String,

    /// Upper bound on concurrently served RPC connections
    #[serde(default = "default_workers")]
    pub server_workers: usize,

    #[serde(default)]
    pub legacy: LegacyTiming,
    #[serde(default)]
    pub rpc: RpcTiming,
    #[serde(default)]
    pub probe: ProbeTiming,
}

fn default_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_workers() -> usize {
    4
}

impl Default for PairingConfig {
    fn default() -> Self {
        let hostname = "localhost".to_string();
        Self {
            data_dir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".lanpair"),
            display_name: hostname.clone(),
            hostname,
            ip: default_ip(),
            interface: None,
            port: DEFAULT_PORT,
            auth_port: DEFAULT_AUTH_PORT,
            user_name: std::env::var("USER").unwrap_or_default(),
            server_workers: default_workers(),
            legacy: LegacyTiming::default(),
            rpc: RpcTiming::default(),
            probe: ProbeTiming::default(),
        }
    }
}

impl PairingConfig {
    pub fn with_host(mut self, hostname: String, ip: IpAddr) -> Self {
        self.display_name = hostname.clone();
        self.hostname = hostname;
        self.ip = ip;
        self
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.data_dir.join("identity")
    }

    pub fn peer_cert_dir(&self) -> PathBuf {
        self.data_dir.join("peer-certs")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.identity_dir())?;
        std::fs::create_dir_all(self.peer_cert_dir())?;
        Ok(())
    }
}

/// v1 request loop policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyTiming {
    pub attempt_timeout: Duration,
    pub attempts_per_round: u32,
    pub retry_wait: Duration,
}

impl Default for LegacyTiming {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(1),
            attempts_per_round: 3,
            retry_wait: Duration::from_secs(30),
        }
    }
}

/// v2 client deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcTiming {
    pub ready_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for RpcTiming {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Liveness probe pacing and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTiming {
    pub startup_interval: Duration,
    pub online_interval: Duration,
    pub offline_interval: Duration,
    pub confirm_delay: Duration,
    pub probe_timeout: Duration,
    pub startup_failure_limit: u32,
    pub steady_failure_limit: u32,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            startup_interval: Duration::from_secs(1),
            online_interval: Duration::from_secs(10),
            offline_interval: Duration::from_secs(4),
            confirm_delay: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            startup_failure_limit: 5,
            steady_failure_limit: 2,
        }
    }
}
