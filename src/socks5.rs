//! SOCKS5 listener.
//!
//! - Method negotiation: no-auth (`0x00`) or username/password (`0x02`),
//!   whichever the listener requires
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//! - CONNECT only, to IPv4 or domain-name targets
//! - Handshake violations feed scan detection
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)

pub mod address;
pub mod auth;
pub mod commands;
pub mod protocol;
pub mod server;

pub use address::{TargetAddr, TargetHost};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::Socks5Server;
