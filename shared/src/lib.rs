//! Types shared between the auto-connect client and an auto-configure server.

pub mod ac;
