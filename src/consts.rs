// src/consts.rs
use std::time::Duration;

/// Default unix socket path of the mux daemon.
pub const MUX_SOCKET_PATH: &str = "/var/run/usbmuxd";
/// TCP port the mux daemon listens on when reached over the network.
pub const MUX_TCP_PORT: u16 = 27015;

/// Protocol version carried in the extended first-message header.
pub const PROTOCOL_VERSION: u32 = 1;
/// Message type marking a plist-encoded payload.
pub const MESSAGE_TYPE_PLIST: u32 = 8;

/// Extended header on the first message of a session.
pub const FIRST_HEADER_SIZE: usize = 16;
/// Bare length prefix on every later message.
pub const HEADER_SIZE: usize = 4;

/// Bound on a single send; reads have no deadline.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// SNI name presented during the TLS upgrade handshake. The peer never
/// checks it, but the handshake needs one.
pub const TLS_SERVER_NAME: &str = "iphone.localhost";
