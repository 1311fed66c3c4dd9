//! Client side of the auto-configure exchange.
//!
//! The client introduces itself with HELLO and receives its tunnel address,
//! then sends PING and receives the server's public key, endpoint and the
//! networks to route. Those two replies plus the locally generated private key
//! make up the tunnel configuration. BYE releases the client again.

use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use wgac_shared::ac::{Command, DecodeError, FALLBACK_MAC, Message};
use wireguard_control::Key;

use crate::config::AutoConnectSettings;
use crate::tunnel::config::{PeerConfig, TunnelConfig, parse_net};

pub mod client;
pub mod host;

use client::AcConnection;

#[derive(Debug, Error)]
pub enum AcError {
    #[error("server ip or port is empty")]
    EmptyAddress,

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out {0}")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("malformed reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("server rejected {0}")]
    Rejected(Command),

    #[error("reply to {request} is missing {field}")]
    MissingField {
        request: Command,
        field: &'static str,
    },

    #[error("reply has invalid {what}: {value}")]
    InvalidField { what: &'static str, value: String },
}

/// What the client tells the server about itself, derived per connection
struct Identity {
    mac: String,
    ep_ip: String,
    ep_port: String,
    allowed_ips: String,
}

impl Identity {
    fn message(&self, cmd: Command, public_key: &str) -> Message {
        Message {
            cmd,
            mac_addr: self.mac.clone(),
            vpn_ip: "0.0.0.0".to_string(),
            vpn_netmask: "0.0.0.0".to_string(),
            public_key: public_key.to_string(),
            ep_ip: self.ep_ip.clone(),
            ep_port: self.ep_port.clone(),
            allowed_ips: self.allowed_ips.clone(),
        }
    }
}

fn require<'a>(request: Command, field: &'static str, value: &'a str) -> Result<&'a str, AcError> {
    if value.is_empty() {
        Err(AcError::MissingField { request, field })
    } else {
        Ok(value)
    }
}

fn invalid(what: &'static str, value: &str) -> AcError {
    AcError::InvalidField {
        what,
        value: value.to_string(),
    }
}

/// Runs auto-configure exchanges with the configured timeouts and retries
pub struct AcClient {
    settings: AutoConnectSettings,
}

impl AcClient {
    pub fn new(settings: AutoConnectSettings) -> Self {
        Self { settings }
    }

    fn address(server_ip: &str, server_port: &str) -> Result<String, AcError> {
        let ip = server_ip.trim();
        let port = server_port.trim();
        if ip.is_empty() || port.is_empty() {
            debug!("Server ip or port string is empty");
            return Err(AcError::EmptyAddress);
        }
        // Bare IPv6 literals need brackets to be joined with a port
        if ip.parse::<std::net::Ipv6Addr>().is_ok() {
            Ok(format!("[{}]:{}", ip, port))
        } else {
            Ok(format!("{}:{}", ip, port))
        }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.settings.retry_delay_secs)
    }

    fn identity(&self, conn: &AcConnection) -> Identity {
        let mac = match host::mac_address(self.settings.mac_interface.as_deref()) {
            Some(mac) => host::format_mac(mac),
            None => {
                debug!("No hardware address found, using fallback");
                self.settings
                    .fallback_mac
                    .clone()
                    .unwrap_or_else(|| FALLBACK_MAC.to_string())
            }
        };
        let local = conn.local_addr().ip();

        Identity {
            mac,
            ep_ip: local.to_string(),
            ep_port: self.settings.listen_port.to_string(),
            allowed_ips: host::offered_allowed_ips(&self.settings.base_allowed_ips, local),
        }
    }

    async fn connect_with_retry(&self, address: &str) -> Result<AcConnection, AcError> {
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match AcConnection::connect(
                address,
                Duration::from_secs(self.settings.connect_timeout_secs),
                Duration::from_secs(self.settings.io_timeout_secs),
            )
            .await
            {
                Ok(conn) => {
                    debug!("Client connected to server {} successfully", address);
                    return Ok(conn);
                }
                Err(e) if attempt < attempts => {
                    warn!("Failed to connect to server {}: {}", address, e);
                    tokio::time::sleep(self.retry_delay()).await;
                    debug!("Retrying to connect to server {}...", address);
                }
                Err(e) => {
                    error!("Connection to server {} is impossible: {}", address, e);
                    return Err(e);
                }
            }
        }
    }

    /// Wait before the next exchange attempt, or report that none is left.
    async fn retry_after(&self, attempt: u32, address: &str, e: &AcError) -> bool {
        if attempt < self.settings.attempts.max(1) {
            warn!("Auto connection exchange with {} failed: {}", address, e);
            tokio::time::sleep(self.retry_delay()).await;
            true
        } else {
            error!("Auto connection to server {} is impossible: {}", address, e);
            false
        }
    }

    async fn negotiate(
        &self,
        conn: &mut AcConnection,
        private_key: &str,
        public_key: &str,
    ) -> Result<TunnelConfig, AcError> {
        let identity = self.identity(conn);

        let hello = identity.message(Command::Hello, public_key);
        let assigned = conn.exchange(&hello).await?;
        let vpn_ip = require(Command::Hello, "vpnip", &assigned.vpn_ip)?;
        let vpn_addr: IpAddr = vpn_ip.parse().map_err(|_| invalid("vpnip", vpn_ip))?;

        let mut ping = identity.message(Command::Ping, public_key);
        ping.vpn_ip = assigned.vpn_ip.clone();
        ping.vpn_netmask = assigned.vpn_netmask.clone();
        let settings = conn.exchange(&ping).await?;

        let server_key = require(Command::Ping, "publickey", &settings.public_key)?;
        Key::from_base64(server_key).map_err(|_| invalid("publickey", server_key))?;
        let allowed = require(Command::Ping, "allowedips", &settings.allowed_ips)?;
        let ep_ip = require(Command::Ping, "epip", &settings.ep_ip)?;
        let ep_port = require(Command::Ping, "epport", &settings.ep_port)?;
        ep_port.parse::<u16>().map_err(|_| invalid("epport", ep_port))?;

        let mut peer = PeerConfig::new(server_key.to_string());
        for net in allowed.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            peer.allowed_ips
                .push(parse_net("allowedips", net).map_err(|_| invalid("allowedips", net))?);
        }
        peer.endpoint = Some(match ep_ip.parse::<std::net::Ipv6Addr>() {
            Ok(_) => format!("[{}]:{}", ep_ip, ep_port),
            Err(_) => format!("{}:{}", ep_ip, ep_port),
        });

        let mut config = TunnelConfig::new(private_key.to_string());
        config.interface.listen_port = Some(self.settings.listen_port);
        config.interface.addresses.push(vpn_addr.into());
        config.peers.push(peer);

        debug!("Synthesized configuration:\n{}", config);
        Ok(config)
    }

    /// Negotiate a tunnel configuration for `private_key` with the server.
    ///
    /// Each attempt runs on a fresh connection.
    pub async fn turn_on(
        &self,
        server_ip: &str,
        server_port: &str,
        private_key: &Key,
    ) -> Result<TunnelConfig, AcError> {
        let address = Self::address(server_ip, server_port)?;
        let private = private_key.to_base64();
        let public = private_key.get_public().to_base64();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut conn = self.connect_with_retry(&address).await?;
            let result = self.negotiate(&mut conn, &private, &public).await;
            conn.close().await;

            match result {
                Ok(config) => {
                    info!("Auto connection settings received from {}", address);
                    return Ok(config);
                }
                Err(e) => {
                    if !self.retry_after(attempt, &address, &e).await {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Tell the server to release the client identified by `public_key`.
    pub async fn turn_off(
        &self,
        server_ip: &str,
        server_port: &str,
        public_key: &str,
    ) -> Result<(), AcError> {
        let address = Self::address(server_ip, server_port)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut conn = self.connect_with_retry(&address).await?;
            let bye = self.identity(&conn).message(Command::Bye, public_key);
            let result = conn.exchange(&bye).await;
            conn.close().await;

            match result {
                Ok(_) => {
                    info!("Released auto connection at {}", address);
                    return Ok(());
                }
                Err(e) => {
                    if !self.retry_after(attempt, &address, &e).await {
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wgac_shared::ac::MAX_MESSAGE_LEN;

    fn settings() -> AutoConnectSettings {
        AutoConnectSettings {
            retry_delay_secs: 0,
            connect_timeout_secs: 1,
            io_timeout_secs: 1,
            ..Default::default()
        }
    }

    async fn read_message(socket: &mut tokio::net::TcpStream) -> Message {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let n = socket.read(&mut buf).await.unwrap();
        Message::decode(&buf[..n]).unwrap()
    }

    /// Serves one HELLO/PING exchange and returns what the client sent
    async fn scripted_server(
        listener: TcpListener,
        server_key: String,
        ping_reply: Command,
    ) -> (Message, Message) {
        let (mut socket, _) = listener.accept().await.unwrap();

        let hello = read_message(&mut socket).await;
        let mut reply = Message::new(Command::Hello);
        reply.vpn_ip = "10.1.1.100".to_string();
        reply.vpn_netmask = "255.255.0.0".to_string();
        socket.write_all(reply.encode().as_bytes()).await.unwrap();

        let ping = read_message(&mut socket).await;
        let mut reply = Message::new(ping_reply);
        reply.public_key = server_key;
        reply.ep_ip = "203.0.113.5".to_string();
        reply.ep_port = "51820".to_string();
        reply.allowed_ips = "10.1.0.0/16".to_string();
        socket.write_all(reply.encode().as_bytes()).await.unwrap();

        (hello, ping)
    }

    #[tokio::test]
    async fn test_turn_on_builds_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let server_key = Key::generate_private().get_public().to_base64();
        let server = tokio::spawn(scripted_server(listener, server_key.clone(), Command::Pong));

        let private = Key::generate_private();
        let client = AcClient::new(settings());
        let config = client.turn_on("127.0.0.1", &port, &private).await.unwrap();

        let (hello, ping) = server.await.unwrap();
        let public = private.get_public().to_base64();
        assert_eq!(hello.public_key, public);
        assert_eq!(hello.vpn_ip, "0.0.0.0");
        assert_eq!(hello.ep_ip, "127.0.0.1");
        assert_eq!(hello.ep_port, "51820");
        assert_eq!(hello.allowed_ips, "10.1.0.0/16,127.0.0.0/16");
        assert_eq!(ping.vpn_ip, "10.1.1.100");
        assert_eq!(ping.vpn_netmask, "255.255.0.0");

        assert_eq!(config.interface.private_key, private.to_base64());
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.addresses[0].to_string(), "10.1.1.100/32");
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].public_key, server_key);
        assert_eq!(config.peers[0].endpoint.as_deref(), Some("203.0.113.5:51820"));
        assert_eq!(config.peers[0].allowed_ips[0].to_string(), "10.1.0.0/16");
    }

    #[tokio::test]
    async fn test_turn_on_rejected_by_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let server_key = Key::generate_private().get_public().to_base64();
        tokio::spawn(scripted_server(listener, server_key, Command::Nok));

        let client = AcClient::new(AutoConnectSettings {
            attempts: 1,
            ..settings()
        });
        let result = client
            .turn_on("127.0.0.1", &port, &Key::generate_private())
            .await;
        assert!(matches!(result, Err(AcError::Rejected(Command::Ping))));
    }

    #[tokio::test]
    async fn test_empty_address_makes_no_connection() {
        let client = AcClient::new(settings());
        let result = client.turn_on("", "51820", &Key::generate_private()).await;
        assert!(matches!(result, Err(AcError::EmptyAddress)));
        let result = client.turn_off("203.0.113.5", " ", "key").await;
        assert!(matches!(result, Err(AcError::EmptyAddress)));
    }

    #[tokio::test]
    async fn test_turn_off_sends_bye() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let bye = read_message(&mut socket).await;
            socket
                .write_all(Message::new(Command::Bye).encode().as_bytes())
                .await
                .unwrap();
            bye
        });

        let client = AcClient::new(settings());
        client.turn_off("127.0.0.1", &port, "client-key").await.unwrap();

        let bye = server.await.unwrap();
        assert_eq!(bye.cmd, Command::Bye);
        assert_eq!(bye.public_key, "client-key");
    }
}
