pub mod message;

pub use message::{Command, DecodeError, Message};

/// Upper bound of a single protocol message on the wire.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Listen port advertised by clients and written into synthesized configs.
pub const DEFAULT_WG_PORT: u16 = 51820;

/// Hardware address sent when the host has none to offer.
pub const FALLBACK_MAC: &str = "11-11-11-22-22-22";
