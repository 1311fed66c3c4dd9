use ipnet::{IpNet, Ipv4Net};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

const SYS_CLASS_NET: &str = "/sys/class/net";

pub fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

fn read_mac(dir: &Path, interface: &str) -> Option<[u8; 6]> {
    let content = fs::read_to_string(dir.join(interface).join("address")).ok()?;
    parse_mac(&content).filter(|mac| mac.iter().any(|b| *b != 0))
}

fn find_mac_in(dir: &Path, preferred: Option<&str>) -> Option<[u8; 6]> {
    if let Some(interface) = preferred {
        return read_mac(dir, interface);
    }

    let mut names: Vec<String> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    names.iter().find_map(|name| read_mac(dir, name))
}

/// Hardware address of `preferred`, or of the first interface that has one
pub fn mac_address(preferred: Option<&str>) -> Option<[u8; 6]> {
    find_mac_in(Path::new(SYS_CLASS_NET), preferred)
}

/// Networks the client offers to route: the configured ones plus the /16 of
/// its own IPv4 address.
pub fn offered_allowed_ips(base: &[IpNet], local: IpAddr) -> String {
    let mut nets: Vec<IpNet> = base.to_vec();
    if let IpAddr::V4(v4) = local {
        if let Ok(net) = Ipv4Net::new(v4, 16) {
            let local_net = IpNet::V4(net.trunc());
            if !nets.contains(&local_net) {
                nets.push(local_net);
            }
        }
    }
    nets.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
