mod ac;
mod autoconnect;
mod backend;
mod config;
mod daemon;
mod interface;
mod tunnel;

use clap::{Parser, Subcommand};
use daemon::client::DaemonClient;
use daemon::protocol::{DaemonRequest, DaemonResponse};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tunnel::TunnelState;
use wireguard_control::Key;

#[derive(Parser)]
#[command(name = "wgac")]
#[command(about = "WireGuard auto-connect daemon and CLI", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Daemon {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Obtain a tunnel from an auto-configure server and register it
    Connect {
        server_ip: String,
        server_port: String,
    },

    /// Release the auto connection at the last used server
    Disconnect,

    /// List registered tunnels
    List,

    /// Print the configuration of a tunnel
    Show { name: String },

    /// Bring a tunnel up
    Up { name: String },

    /// Bring a tunnel down
    Down { name: String },

    /// Delete a tunnel
    Delete { name: String },

    /// Daemon status
    Status,

    /// Run the auto-configure exchange without the daemon and print the result
    Synthesize {
        server_ip: String,
        server_port: String,

        /// Write the configuration here instead of printing it
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Generate a default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Generate as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Show configuration
    ShowConfig {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("/etc/wgac/client.toml"));

    match cli.command {
        Some(Commands::Daemon { config: cmd_config }) => {
            let config_path = cmd_config.unwrap_or(config_path);
            start_daemon(config::ClientConfig::load_or_default(&config_path)?).await?;
        }

        Some(Commands::Connect {
            server_ip,
            server_port,
        }) => {
            let request = DaemonRequest::AutoConnect {
                server_ip,
                server_port,
            };
            match send(&config_path, request).await? {
                DaemonResponse::AutoConnect {
                    success, messages, ..
                } => {
                    for message in &messages {
                        println!("{}", message);
                    }
                    if !success {
                        std::process::exit(1);
                    }
                }
                other => unexpected(other),
            }
        }

        Some(Commands::Disconnect) => expect_ok(send(&config_path, DaemonRequest::Disconnect).await?),

        Some(Commands::List) => match send(&config_path, DaemonRequest::ListTunnels).await? {
            DaemonResponse::Tunnels(tunnels) => {
                if tunnels.is_empty() {
                    println!("No tunnels");
                }
                for tunnel in tunnels {
                    println!(
                        "{:<16} {:<5} {:<20} {}",
                        tunnel.name,
                        tunnel.state,
                        tunnel.addresses.join(","),
                        tunnel.endpoint.unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            other => unexpected(other),
        },

        Some(Commands::Show { name }) => {
            match send(&config_path, DaemonRequest::ShowTunnel { name }).await? {
                DaemonResponse::TunnelConfig(text) => print!("{}", text),
                other => unexpected(other),
            }
        }

        Some(Commands::Up { name }) => set_state(&config_path, name, TunnelState::Up).await?,

        Some(Commands::Down { name }) => set_state(&config_path, name, TunnelState::Down).await?,

        Some(Commands::Delete { name }) => {
            expect_ok(send(&config_path, DaemonRequest::DeleteTunnel { name }).await?)
        }

        Some(Commands::Status) => match send(&config_path, DaemonRequest::Status).await? {
            DaemonResponse::Status {
                running,
                tunnels,
                tunnels_up,
                server,
            } => {
                println!("Daemon Status:");
                println!("  Running: {}", if running { "Yes" } else { "No" });
                println!("  Tunnels: {} ({} up)", tunnels, tunnels_up);
                println!("  Server: {}", server.as_deref().unwrap_or("none"));
            }
            other => unexpected(other),
        },

        Some(Commands::Synthesize {
            server_ip,
            server_port,
            output,
        }) => {
            let client_config = config::ClientConfig::load_or_default(&config_path)?;
            let client = ac::AcClient::new(client_config.auto_connect);
            let key = Key::generate_private();
            let tunnel = client.turn_on(&server_ip, &server_port, &key).await?;

            match output {
                Some(path) => {
                    std::fs::write(&path, tunnel.to_string())?;
                    println!("Wrote configuration to {:?}", path);
                }
                None => print!("{}", tunnel),
            }
        }

        Some(Commands::GenConfig { output, json }) => {
            let default_config = config::ClientConfig::default();
            if json {
                let content = default_config.to_json()?;
                std::fs::write(&output, content)?;
                println!("Generated JSON configuration to {:?}", output);
            } else {
                default_config.save_to_file(&output)?;
                println!("Generated TOML configuration to {:?}", output);
            }
        }

        Some(Commands::ShowConfig {
            config: cmd_config,
            json,
        }) => {
            let config_path = cmd_config.unwrap_or(config_path);
            let client_config = config::ClientConfig::load_or_default(&config_path)?;

            if json {
                println!("{}", client_config.to_json()?);
            } else {
                println!("{}", toml::to_string_pretty(&client_config)?);
            }
        }

        None => {
            start_daemon(config::ClientConfig::load_or_default(&config_path)?).await?;
        }
    }

    Ok(())
}

async fn send(
    config_path: &Path,
    request: DaemonRequest,
) -> Result<DaemonResponse, Box<dyn std::error::Error>> {
    let client_config = config::ClientConfig::load_or_default(config_path)?;
    let client = DaemonClient::new(&client_config.daemon_socket, &client_config.data_dir)?;
    Ok(client.send_request(request).await?)
}

async fn set_state(
    config_path: &Path,
    name: String,
    state: TunnelState,
) -> Result<(), Box<dyn std::error::Error>> {
    match send(config_path, DaemonRequest::SetTunnelState { name, state }).await? {
        DaemonResponse::TunnelState { name, state } => println!("✓ {} is {}", name, state),
        other => unexpected(other),
    }
    Ok(())
}

fn expect_ok(response: DaemonResponse) {
    match response {
        DaemonResponse::Ok(msg) => println!("✓ {}", msg.unwrap_or_else(|| "Done".to_string())),
        other => unexpected(other),
    }
}

fn unexpected(response: DaemonResponse) -> ! {
    match response {
        DaemonResponse::Error(e) => eprintln!("✗ Error: {}", e),
        other => eprintln!("✗ Unexpected response: {:?}", other),
    }
    std::process::exit(1);
}

async fn start_daemon(config: config::ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting wgac daemon");
    info!("  Daemon socket: {:?}", config.daemon_socket);
    info!("  Data directory: {:?}", config.data_dir);
    info!("  Auto-connect tunnel: {}", config.auto_connect.tunnel_name);

    let daemon = Arc::new(daemon::Daemon::new(config).await?);
    info!("Daemon is running");

    daemon.run().await?;

    Ok(())
}
