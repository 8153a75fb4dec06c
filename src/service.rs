use plist::Dictionary;

use crate::error::Result;
use crate::plist_socket::{Packet, PlistSocket};

/// Owns a [`PlistSocket`] on behalf of a higher-level service client,
/// exposing only the packet-level surface. The channel and its connection
/// are released when the facade goes out of scope.
pub struct ServiceChannel {
    socket: PlistSocket,
}

impl ServiceChannel {
    pub fn new(socket: PlistSocket) -> Self {
        Self { socket }
    }

    pub fn send(&mut self, packet: &Packet) -> Result<()> {
        self.socket.send(packet)
    }

    pub fn send_payload(&mut self, payload: Dictionary) -> Result<()> {
        self.socket.send_payload(payload)
    }

    pub fn recv(&mut self) -> Result<Packet> {
        self.socket.recv()
    }

    pub fn recv_with_header(&mut self, force_first_header: bool) -> Result<Packet> {
        self.socket.recv_with_header(force_first_header)
    }

    pub fn send_recv(&mut self, packet: &Packet) -> Result<Packet> {
        self.socket.send_recv(packet)
    }

    pub fn close(&mut self) {
        self.socket.close();
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }
}
