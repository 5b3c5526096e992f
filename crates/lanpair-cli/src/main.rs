use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use lanpair_core::config::{DEFAULT_AUTH_PORT, DEFAULT_PORT};
use lanpair_core::events::EventReceiver;
use lanpair_core::{
    GroupSecret, IdentityStore, PairingConfig, PairingService, PeerAdvert, PeerEvent,
};
use storage::{ScratchVault, SettingsStore};

type Service = PairingService<ScratchVault>;

#[derive(Parser, Debug)]
#[command(name = "lanpair", version, about = "Pair with peers on the local network")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for identity and settings
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create config, settings and the local certificate
    Init {
        /// Name to put in the certificate (defaults to the system hostname)
        #[arg(long)]
        hostname: Option<String>,

        /// Network interface to take our address from
        #[arg(long)]
        interface: Option<String>,

        /// Certificate (udp) and peer channel (tcp) port
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Registration port
        #[arg(long, default_value_t = DEFAULT_AUTH_PORT)]
        auth_port: u16,
    },

    /// Show local identity and settings
    Info,

    /// Change the group code shared with peers
    SetCode {
        code: String,
    },

    /// Run the pairing servers until Ctrl+C, pairing with anyone who registers
    Serve,

    /// Pair with a single peer and report its status
    Pair {
        /// Peer address
        #[arg(long)]
        ip: IpAddr,

        /// Peer hostname as it appears in its certificate
        #[arg(long)]
        hostname: String,

        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[arg(long, default_value_t = DEFAULT_AUTH_PORT)]
        auth_port: u16,

        /// Peer api version: 1 (udp) or 2 (registration rpc)
        #[arg(long, default_value = "2")]
        api_version: String,

        /// Peer id; defaults to hostname@ip
        #[arg(long)]
        id: Option<String>,
    },

    /// Announce ourselves to a peer that cannot discover us, then pair
    Register {
        /// Peer address
        #[arg(long)]
        ip: IpAddr,

        #[arg(long, default_value_t = DEFAULT_AUTH_PORT)]
        auth_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lanpair")
    });

    match cli.cmd {
        Commands::Init {
            hostname,
            interface,
            port,
            auth_port,
        } => {
            let hostname = hostname.unwrap_or_else(netinfo::local_hostname);
            let ip = netinfo::primary_lan_ip(interface.as_deref())?;

            let mut cfg = PairingConfig::default().with_host(hostname, ip);
            cfg.data_dir = data_dir.clone();
            cfg.interface = interface;
            cfg.port = port;
            cfg.auth_port = auth_port;
            cfg.ensure_data_dir()?;

            let cfg_json = serde_json::to_string_pretty(&cfg)?;
            std::fs::write(cfg.config_path(), cfg_json).context("Failed to write config")?;

            let settings = SettingsStore::open(cfg.settings_path())?;
            let identity =
                IdentityStore::new(cfg.identity_dir(), settings.connect_id(), &cfg.hostname, ip)
                    .get_identity()?;

            println!("✓ Initialized");
            println!("  Hostname: {}", cfg.hostname);
            println!("  Address: {}", ip);
            println!("  Id: {}", identity.local_id);
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::Info => {
            let cfg = load_config(&data_dir)?;
            let settings = SettingsStore::open(cfg.settings_path())?;
            let store = IdentityStore::new(cfg.identity_dir(), settings.connect_id(), &cfg.hostname, cfg.ip);

            println!("Device Information:");
            println!("  Hostname: {}", cfg.hostname);
            println!("  Address: {}", cfg.ip);
            println!("  Id: {}", settings.connect_id());
            println!("  Ports: {} (cert/channel), {} (registration)", cfg.port, cfg.auth_port);
            match store.load()? {
                Some(identity) => {
                    println!("  Fingerprint: {}", identity.fingerprint());
                    println!("  Full fingerprint: {}", identity.full_fingerprint());
                    if let Some(expiry) = identity.expires_at() {
                        println!("  Certificate expires: {}", expiry);
                    }
                }
                None => println!("  Certificate: none yet for this address (made on next start)"),
            }
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::SetCode { code } => {
            let cfg = load_config(&data_dir)?;
            let mut settings = SettingsStore::open(cfg.settings_path())?;
            if settings.set_group_code(&code)? {
                println!("✓ Group code updated");
            } else {
                println!("Group code unchanged");
            }
        }

        Commands::Serve => {
            let (service, events) = open_service(&data_dir).await?;
            println!("✓ Listening as {} on {}", service.config().hostname, service.config().ip);
            println!("  Press Ctrl+C to stop");
            run_until_interrupted(service, events, true).await?;
        }

        Commands::Pair {
            ip,
            hostname,
            port,
            auth_port,
            api_version,
            id,
        } => {
            let (service, events) = open_service(&data_dir).await?;
            let advert = PeerAdvert {
                peer_id: id.unwrap_or_else(|| format!("{}@{}", hostname, ip)),
                hostname,
                ip,
                port,
                auth_port,
                api_version,
            };
            spawn_connect(service.clone(), advert);
            run_until_interrupted(service, events, false).await?;
        }

        Commands::Register { ip, auth_port } => {
            let (service, events) = open_service(&data_dir).await?;
            let advert = match service.register_with(SocketAddr::new(ip, auth_port)).await {
                Ok(advert) => advert,
                Err(e) => {
                    service.shutdown().await;
                    return Err(e).context("Registration failed");
                }
            };
            println!("✓ Registered with {} ({})", advert.hostname, advert.ip);
            spawn_connect(service.clone(), advert);
            run_until_interrupted(service, events, false).await?;
        }
    }

    Ok(())
}

fn load_config(data_dir: &Path) -> Result<PairingConfig> {
    let cfg_path = data_dir.join("config.json");
    if !cfg_path.exists() {
        anyhow::bail!("Not initialized. Run 'lanpair init' first.");
    }

    let cfg_json = std::fs::read_to_string(cfg_path)?;
    let mut cfg: PairingConfig = serde_json::from_str(&cfg_json)?;
    cfg.data_dir = data_dir.to_path_buf();
    cfg.ip = netinfo::primary_lan_ip(cfg.interface.as_deref())?;
    Ok(cfg)
}

async fn open_service(data_dir: &Path) -> Result<(Arc<Service>, EventReceiver)> {
    let cfg = load_config(data_dir)?;
    cfg.ensure_data_dir()?;

    let settings = SettingsStore::open(cfg.settings_path())?;
    let identity = IdentityStore::new(cfg.identity_dir(), settings.connect_id(), &cfg.hostname, cfg.ip)
        .get_identity()
        .context("Failed to prepare identity")?;
    let vault = Arc::new(ScratchVault::new(cfg.peer_cert_dir())?);
    let secret = GroupSecret::new(settings.group_code());

    let (service, events) = PairingService::new(cfg, identity, secret, vault);
    service.start().await.context("Failed to start pairing service")?;
    Ok((Arc::new(service), events))
}

fn spawn_connect(service: Arc<Service>, advert: PeerAdvert) {
    tokio::spawn(async move {
        if !service.connect_peer(&advert).await {
            tracing::warn!("Pairing with {} failed", advert.hostname);
        }
    });
}

async fn run_until_interrupted(
    service: Arc<Service>,
    mut events: EventReceiver,
    accept_registrations: bool,
) -> Result<()> {
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r.context("Failed to listen for Ctrl+C")?;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    PeerEvent::StatusChanged { peer_id, status, reason } => match reason {
                        Some(reason) => println!("{}: {} ({})", peer_id, status, reason),
                        None => println!("{}: {}", peer_id, status),
                    },
                    PeerEvent::MachineInfo { peer_id, info } => {
                        println!("{}: {} ({})", peer_id, info.display_name, info.user_name);
                    }
                    PeerEvent::ManualRegistration(reg) if accept_registrations => {
                        match PeerAdvert::try_from(reg) {
                            Ok(advert) => spawn_connect(service.clone(), advert),
                            Err(e) => tracing::warn!("Ignoring registration: {}", e),
                        }
                    }
                    PeerEvent::ManualRegistration(reg) => {
                        tracing::debug!("Ignoring registration from {}", reg.hostname);
                    }
                }
            }
        }
    }

    println!("Shutting down...");
    service.shutdown().await;
    Ok(())
}
