use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use wireguard_control::Key;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("line {line}: attribute outside of a section")]
    OutsideSection { line: usize },

    #[error("line {line}: unknown section [{name}]")]
    UnknownSection { line: usize, name: String },

    #[error("line {line}: unknown attribute '{key}'")]
    UnknownAttribute { line: usize, key: String },

    #[error("line {line}: expected 'key = value'")]
    Syntax { line: usize },

    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },

    #[error("more than one [Interface] section")]
    DuplicateInterface,

    #[error("missing {0}")]
    Missing(&'static str),
}

/// `[Interface]` section of a tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub private_key: String,
    pub listen_port: Option<u16>,
    pub addresses: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub mtu: Option<u32>,
}

/// `[Peer]` section of a tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    /// `host:port`, the host may be a name that is resolved when the tunnel goes up
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    pub fn new(public_key: String) -> Self {
        Self {
            public_key,
            preshared_key: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }
}

/// A WireGuard tunnel configuration in the wg-quick format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

enum Section {
    None,
    Interface,
    Peer,
}

impl TunnelConfig {
    pub fn new(private_key: String) -> Self {
        Self {
            interface: InterfaceConfig {
                private_key,
                listen_port: None,
                addresses: Vec::new(),
                dns: Vec::new(),
                mtu: None,
            },
            peers: Vec::new(),
        }
    }

    /// Parse a configuration in the wg-quick text format.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut section = Section::None;
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = &line[1..line.len() - 1];
                if name.eq_ignore_ascii_case("interface") {
                    if interface.is_some() {
                        return Err(ConfigError::DuplicateInterface);
                    }
                    interface = Some(TunnelConfig::new(String::new()).interface);
                    section = Section::Interface;
                } else if name.eq_ignore_ascii_case("peer") {
                    peers.push(PeerConfig::new(String::new()));
                    section = Section::Peer;
                } else {
                    return Err(ConfigError::UnknownSection {
                        line: line_no,
                        name: name.to_string(),
                    });
                }
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::Syntax { line: line_no })?;
            let key = key.trim();
            let value = value.trim();

            match section {
                Section::None => return Err(ConfigError::OutsideSection { line: line_no }),
                Section::Interface => {
                    let iface = interface
                        .as_mut()
                        .ok_or(ConfigError::OutsideSection { line: line_no })?;
                    match key.to_ascii_lowercase().as_str() {
                        "privatekey" => {
                            parse_key("PrivateKey", value)?;
                            iface.private_key = value.to_string();
                        }
                        "listenport" => iface.listen_port = Some(parse_num("ListenPort", value)?),
                        "address" => iface.addresses.extend(parse_list("Address", value, parse_net)?),
                        "dns" => iface.dns.extend(parse_list("DNS", value, |what, v| {
                            IpAddr::from_str(v).map_err(|_| invalid(what, v))
                        })?),
                        "mtu" => iface.mtu = Some(parse_num("MTU", value)?),
                        _ => {
                            return Err(ConfigError::UnknownAttribute {
                                line: line_no,
                                key: key.to_string(),
                            });
                        }
                    }
                }
                Section::Peer => {
                    let peer = peers
                        .last_mut()
                        .ok_or(ConfigError::OutsideSection { line: line_no })?;
                    match key.to_ascii_lowercase().as_str() {
                        "publickey" => {
                            parse_key("PublicKey", value)?;
                            peer.public_key = value.to_string();
                        }
                        "presharedkey" => {
                            parse_key("PresharedKey", value)?;
                            peer.preshared_key = Some(value.to_string());
                        }
                        "allowedips" => peer
                            .allowed_ips
                            .extend(parse_list("AllowedIPs", value, parse_net)?),
                        "endpoint" => {
                            validate_endpoint(value)?;
                            peer.endpoint = Some(value.to_string());
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive = if value.eq_ignore_ascii_case("off") {
                                None
                            } else {
                                Some(parse_num("PersistentKeepalive", value)?)
                            };
                        }
                        _ => {
                            return Err(ConfigError::UnknownAttribute {
                                line: line_no,
                                key: key.to_string(),
                            });
                        }
                    }
                }
            }
        }

        let interface = interface.ok_or(ConfigError::Missing("[Interface] section"))?;
        if interface.private_key.is_empty() {
            return Err(ConfigError::Missing("PrivateKey"));
        }
        if peers.iter().any(|p| p.public_key.is_empty()) {
            return Err(ConfigError::Missing("PublicKey"));
        }

        Ok(Self { interface, peers })
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let iface = &self.interface;
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", iface.private_key)?;
        if let Some(port) = iface.listen_port {
            writeln!(f, "ListenPort = {}", port)?;
        }
        if !iface.addresses.is_empty() {
            writeln!(f, "Address = {}", join(&iface.addresses))?;
        }
        if !iface.dns.is_empty() {
            writeln!(f, "DNS = {}", join(&iface.dns))?;
        }
        if let Some(mtu) = iface.mtu {
            writeln!(f, "MTU = {}", mtu)?;
        }

        for peer in &self.peers {
            writeln!(f)?;
            writeln!(f, "[Peer]")?;
            writeln!(f, "PublicKey = {}", peer.public_key)?;
            if let Some(psk) = &peer.preshared_key {
                writeln!(f, "PresharedKey = {}", psk)?;
            }
            if !peer.allowed_ips.is_empty() {
                writeln!(f, "AllowedIPs = {}", join(&peer.allowed_ips))?;
            }
            if let Some(endpoint) = &peer.endpoint {
                writeln!(f, "Endpoint = {}", endpoint)?;
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                writeln!(f, "PersistentKeepalive = {}", keepalive)?;
            }
        }
        Ok(())
    }
}

fn invalid(what: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        what,
        value: value.to_string(),
    }
}

fn parse_key(what: &'static str, value: &str) -> Result<Key, ConfigError> {
    Key::from_base64(value).map_err(|_| invalid(what, value))
}

fn parse_num<T: FromStr>(what: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| invalid(what, value))
}

/// Accepts `a.b.c.d/len` as well as a bare address, which gets a host prefix.
pub fn parse_net(what: &'static str, value: &str) -> Result<IpNet, ConfigError> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| invalid(what, value))
}

fn parse_list<T>(
    what: &'static str,
    value: &str,
    parse: impl Fn(&'static str, &str) -> Result<T, ConfigError>,
) -> Result<Vec<T>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| parse(what, v))
        .collect()
}

fn validate_endpoint(value: &str) -> Result<(), ConfigError> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| invalid("Endpoint", value))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid("Endpoint", value));
    }
    Ok(())
}
