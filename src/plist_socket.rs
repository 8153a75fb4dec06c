use std::io::Cursor;
use std::path::Path;

use log::debug;
use plist::{Dictionary, Value};

use crate::consts::{FIRST_HEADER_SIZE, HEADER_SIZE, MESSAGE_TYPE_PLIST, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result, TransportError};
use crate::stream_socket::StreamSocket;

/// One request or response frame on a plist channel. Packets are transient;
/// they live for a single send or receive.
#[derive(Debug, Clone)]
pub struct Packet {
    pub message_type: u32,
    pub tag: u32,
    pub payload: Dictionary,
}

impl Packet {
    /// Plist-typed packet with tag 0; see [`with_tag`](Self::with_tag).
    pub fn new(payload: Dictionary) -> Self {
        Self {
            message_type: MESSAGE_TYPE_PLIST,
            tag: 0,
            payload,
        }
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }
}

/// Framed plist request/response channel over a [`StreamSocket`].
///
/// The first message in each direction carries a 16-byte little-endian
/// header `[total_length, version, message_type, tag]`; every later message
/// carries a bare 4-byte big-endian payload length. The byte-order mismatch
/// between the two header forms is part of the wire protocol, not an
/// accident.
pub struct PlistSocket {
    socket: StreamSocket,
    tag: u32,
    first_send: bool,
    first_recv: bool,
}

impl PlistSocket {
    pub fn new(socket: StreamSocket, tag: u32) -> Self {
        Self {
            socket,
            tag,
            first_send: true,
            first_recv: true,
        }
    }

    /// Connect and wrap in one step.
    pub fn connect(addr: &str, tag: u32) -> Result<Self, TransportError> {
        Ok(Self::new(StreamSocket::connect(addr)?, tag))
    }

    pub fn send(&mut self, packet: &Packet) -> Result<()> {
        debug!("SEND({}): {:?}", self.socket.label(), packet.payload);
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &packet.payload)?;

        let mut frame = Vec::with_capacity(FIRST_HEADER_SIZE + body.len());
        if self.first_send {
            let total = (FIRST_HEADER_SIZE + body.len()) as u32;
            frame.extend_from_slice(&total.to_le_bytes());
            frame.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
            frame.extend_from_slice(&packet.message_type.to_le_bytes());
            frame.extend_from_slice(&packet.tag.to_le_bytes());
            self.first_send = false;
        } else {
            frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        }
        frame.extend_from_slice(&body);
        self.socket.write_all(&frame)?;
        Ok(())
    }

    /// Send `payload` as a plist packet stamped with the channel's own tag.
    pub fn send_payload(&mut self, payload: Dictionary) -> Result<()> {
        let packet = Packet {
            message_type: MESSAGE_TYPE_PLIST,
            tag: self.tag,
            payload,
        };
        self.send(&packet)
    }

    pub fn recv(&mut self) -> Result<Packet> {
        self.recv_with_header(false)
    }

    /// `force_first_header` reads the extended 16-byte header even after the
    /// first message, for peers that repeat it.
    pub fn recv_with_header(&mut self, force_first_header: bool) -> Result<Packet> {
        let (len, message_type, tag) = if self.first_recv || force_first_header {
            let header = self.socket.read_exact(FIRST_HEADER_SIZE)?;
            let total = read_u32_le(&header[0..4]);
            let _version = read_u32_le(&header[4..8]);
            let message_type = read_u32_le(&header[8..12]);
            let tag = read_u32_le(&header[12..16]);
            self.first_recv = false;
            (
                (total as usize).saturating_sub(FIRST_HEADER_SIZE),
                message_type,
                tag,
            )
        } else {
            let header = self.socket.read_exact(HEADER_SIZE)?;
            (read_u32_be(&header) as usize, MESSAGE_TYPE_PLIST, self.tag)
        };

        let body = self.socket.read_exact(len)?;
        let value = Value::from_reader(Cursor::new(&body))?;
        let payload = value
            .into_dictionary()
            .ok_or(ProtocolError::UnexpectedPayload)?;

        // Pair records are large binary blobs; keep them out of the logs.
        if payload.get("PairRecordData").is_some() {
            debug!(
                "RECV({}): pair record data ({} bytes)",
                self.socket.label(),
                body.len()
            );
        } else {
            debug!("RECV({}): {:?}", self.socket.label(), payload);
        }
        Ok(Packet {
            message_type,
            tag,
            payload,
        })
    }

    /// Send then receive. No atomicity guarantee against concurrent use of
    /// the same channel.
    pub fn send_recv(&mut self, packet: &Packet) -> Result<Packet> {
        self.send(packet)?;
        self.recv()
    }

    pub fn id(&self) -> u64 {
        self.socket.id()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.socket.set_name(name);
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn is_encrypted(&self) -> bool {
        self.socket.is_encrypted()
    }

    pub fn upgrade_to_tls(&mut self, identity: &Path) -> Result<(), TransportError> {
        self.socket.upgrade_to_tls(identity)
    }

    /// Raw socket access for services that switch to a byte-oriented phase
    /// after the plist handshake.
    pub fn socket_mut(&mut self) -> &mut StreamSocket {
        &mut self.socket
    }

    pub fn close(&mut self) {
        self.socket.close();
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }
}

fn read_u32_le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u32_be(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}
