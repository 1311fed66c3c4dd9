use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const SEPARATOR: &str = ":=";

const KEY_CMD: &str = "cmd";
const KEY_MAC: &str = "macaddr";
const KEY_VPN_IP: &str = "vpnip";
const KEY_VPN_NETMASK: &str = "vpnnetmask";
const KEY_PUBLIC_KEY: &str = "publickey";
const KEY_EP_IP: &str = "epip";
const KEY_EP_PORT: &str = "epport";
const KEY_ALLOWED_IPS: &str = "allowedips";

/// Command carried in the `cmd` line of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Command {
    Hello,
    Ping,
    Pong,
    Bye,
    Ok,
    Nok,
    #[default]
    Unknown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Hello => "HELLO",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Bye => "BYE",
            Command::Ok => "OK",
            Command::Nok => "NOK",
            Command::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "HELLO" => Command::Hello,
            "PING" => Command::Ping,
            "PONG" => Command::Pong,
            "BYE" => Command::Bye,
            "OK" => Command::Ok,
            "NOK" => Command::Nok,
            _ => Command::Unknown,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message is empty")]
    Empty,
    #[error("line without ':=' separator: {0:?}")]
    MissingSeparator(String),
    #[error("message has no cmd line")]
    MissingCommand,
}

/// One auto-configure protocol message.
///
/// On the wire a message is a block of `key:=value` lines, each terminated by
/// `\n`, always in the same order: cmd, macaddr, vpnip, vpnnetmask, publickey,
/// epip, epport, allowedips. Fields hold the bare values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub cmd: Command,
    pub mac_addr: String,
    pub vpn_ip: String,
    pub vpn_netmask: String,
    pub public_key: String,
    pub ep_ip: String,
    pub ep_port: String,
    pub allowed_ips: String,
}

impl Message {
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> String {
        let fields = [
            (KEY_CMD, self.cmd.as_str()),
            (KEY_MAC, self.mac_addr.as_str()),
            (KEY_VPN_IP, self.vpn_ip.as_str()),
            (KEY_VPN_NETMASK, self.vpn_netmask.as_str()),
            (KEY_PUBLIC_KEY, self.public_key.as_str()),
            (KEY_EP_IP, self.ep_ip.as_str()),
            (KEY_EP_PORT, self.ep_port.as_str()),
            (KEY_ALLOWED_IPS, self.allowed_ips.as_str()),
        ];

        let mut out = String::new();
        for (key, value) in fields {
            out.push_str(key);
            out.push_str(SEPARATOR);
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Decode a message read from the wire.
    ///
    /// Readers use a fixed-size buffer, so trailing NUL padding is ignored.
    /// Unknown keys are skipped; a repeated key keeps its last value.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let text = String::from_utf8_lossy(data);
        let text = text.trim_end_matches('\0');

        let mut message = Message::default();
        let mut seen_cmd = false;
        let mut seen_any = false;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            seen_any = true;

            let (key, value) = line
                .split_once(SEPARATOR)
                .ok_or_else(|| DecodeError::MissingSeparator(line.to_string()))?;
            let value = value.trim().to_string();

            match key.trim() {
                KEY_CMD => {
                    message.cmd = Command::parse(&value);
                    seen_cmd = true;
                }
                KEY_MAC => message.mac_addr = value,
                KEY_VPN_IP => message.vpn_ip = value,
                KEY_VPN_NETMASK => message.vpn_netmask = value,
                KEY_PUBLIC_KEY => message.public_key = value,
                KEY_EP_IP => message.ep_ip = value,
                KEY_EP_PORT => message.ep_port = value,
                KEY_ALLOWED_IPS => message.allowed_ips = value,
                _ => {}
            }
        }

        if !seen_any {
            return Err(DecodeError::Empty);
        }
        if !seen_cmd {
            return Err(DecodeError::MissingCommand);
        }
        Ok(message)
    }
}
