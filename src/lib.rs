//! Blocking client socket core for usbmuxd-style plist services.
//!
//! [`StreamSocket`] manages one transport (unix domain socket or TCP, with
//! an in-place TLS upgrade mid-session); [`PlistSocket`] layers the
//! length-prefixed plist framing on top; [`ServiceChannel`] is the surface
//! higher-level service clients hold.

pub mod consts;
pub mod error;
pub mod plist_socket;
pub mod service;
pub mod stream_socket;

pub use error::{ProtocolError, Result, TransportError};
pub use plist_socket::{Packet, PlistSocket};
pub use service::ServiceChannel;
pub use stream_socket::{Address, StreamSocket, next_socket_id};
