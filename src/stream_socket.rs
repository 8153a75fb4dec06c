use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::debug;
use native_tls::{Identity, Protocol, TlsConnector, TlsStream};

use crate::consts::{MUX_SOCKET_PATH, MUX_TCP_PORT, SEND_TIMEOUT, TLS_SERVER_NAME};
use crate::error::{ProtocolError, TransportError};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique socket id for log correlation. Strictly increasing,
/// never reused, safe to call from any thread.
pub fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Resolved connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Local(PathBuf),
}

impl Address {
    /// `"host:port"` is TCP, an existing filesystem path is a unix domain
    /// socket, and a bare host name is TCP on the default mux port. A
    /// path-like string naming nothing on disk is rejected outright rather
    /// than left to fail as a hostname lookup.
    pub fn parse(addr: &str) -> Result<Self, TransportError> {
        if let Some((host, port)) = addr.split_once(':') {
            let port = port
                .parse()
                .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
            return Ok(Address::Tcp {
                host: host.to_string(),
                port,
            });
        }
        if Path::new(addr).exists() {
            return Ok(Address::Local(PathBuf::from(addr)));
        }
        if addr.contains('/') {
            return Err(TransportError::InvalidAddress(addr.to_string()));
        }
        Ok(Address::Tcp {
            host: addr.to_string(),
            port: MUX_TCP_PORT,
        })
    }
}

impl Default for Address {
    /// The mux daemon's local socket.
    fn default() -> Self {
        Address::Local(PathBuf::from(MUX_SOCKET_PATH))
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

#[derive(Debug)]
enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    TlsTcp(TlsStream<TcpStream>),
    TlsUnix(TlsStream<UnixStream>),
}

impl Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
            Transport::TlsTcp(s) => s.read(buf),
            Transport::TlsUnix(s) => s.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(buf),
            Transport::Unix(s) => s.write_all(buf),
            Transport::TlsTcp(s) => s.write_all(buf).and_then(|_| s.flush()),
            Transport::TlsUnix(s) => s.write_all(buf).and_then(|_| s.flush()),
        }
    }

    fn write_timeout(&self) -> std::io::Result<Option<Duration>> {
        match self {
            Transport::Tcp(s) => s.write_timeout(),
            Transport::Unix(s) => s.write_timeout(),
            Transport::TlsTcp(s) => s.get_ref().write_timeout(),
            Transport::TlsUnix(s) => s.get_ref().write_timeout(),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.set_write_timeout(timeout),
            Transport::Unix(s) => s.set_write_timeout(timeout),
            Transport::TlsTcp(s) => s.get_ref().set_write_timeout(timeout),
            Transport::TlsUnix(s) => s.get_ref().set_write_timeout(timeout),
        }
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.shutdown(Shutdown::Both),
            Transport::Unix(s) => s.shutdown(Shutdown::Both),
            Transport::TlsTcp(s) => s.shutdown(),
            Transport::TlsUnix(s) => s.shutdown(),
        }
    }
}

/// One managed client connection to the mux daemon or a service behind it.
///
/// The transport is owned exclusively and torn down exactly once, either by
/// an explicit [`close`](Self::close) or when the socket is dropped.
#[derive(Debug)]
pub struct StreamSocket {
    id: u64,
    name: Option<String>,
    transport: Option<Transport>,
}

impl StreamSocket {
    pub fn connect(addr: &str) -> Result<Self, TransportError> {
        Self::connect_to(Address::parse(addr)?)
    }

    pub fn connect_to(addr: Address) -> Result<Self, TransportError> {
        let transport = match &addr {
            Address::Tcp { host, port } => {
                Transport::Tcp(TcpStream::connect((host.as_str(), *port))?)
            }
            Address::Local(path) => Transport::Unix(UnixStream::connect(path)?),
        };
        let socket = Self::adopt(transport);
        debug!("CONNECT({}): {:?}", socket.id, addr);
        Ok(socket)
    }

    /// Adopt an already-connected TCP stream; no connect is performed.
    pub fn from_tcp(stream: TcpStream) -> Self {
        Self::adopt(Transport::Tcp(stream))
    }

    /// Adopt an already-connected unix stream; no connect is performed.
    pub fn from_unix(stream: UnixStream) -> Self {
        Self::adopt(Transport::Unix(stream))
    }

    fn adopt(transport: Transport) -> Self {
        Self {
            id: next_socket_id(),
            name: None,
            transport: Some(transport),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// `name:id` when a display name is set, bare id otherwise.
    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{name}:{}", self.id),
            None => self.id.to_string(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(
            self.transport,
            Some(Transport::TlsTcp(_) | Transport::TlsUnix(_))
        )
    }

    /// Read exactly `size` bytes, looping over partial reads. A peer close
    /// before `size` bytes arrive is [`ProtocolError::ConnectionBroken`].
    /// There is no read deadline.
    pub fn read_exact(&mut self, size: usize) -> Result<Vec<u8>, ProtocolError> {
        let transport = self.transport.as_mut().ok_or(TransportError::Closed)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match transport.read(&mut buf[filled..]) {
                Ok(0) => return Err(ProtocolError::ConnectionBroken),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e).into()),
            }
        }
        Ok(buf)
    }

    /// Single read of whatever is available, at most `max_size` bytes.
    /// Returns empty on peer close.
    pub fn read_some(&mut self, max_size: usize) -> Result<Vec<u8>, TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::Closed)?;
        let mut buf = vec![0u8; max_size];
        let n = transport.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write the whole buffer under a bounded send timeout. The prior
    /// timeout setting is restored on every exit path.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::Closed)?;
        let prior = transport.write_timeout()?;
        transport.set_write_timeout(Some(SEND_TIMEOUT))?;
        let mut transport = scopeguard::guard(transport, move |t| {
            let _ = t.set_write_timeout(prior);
        });
        match transport.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(TransportError::SendTimeout)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Upgrade the established connection to TLS in place, using the PEM
    /// file at `identity` as both client certificate and private key.
    ///
    /// Old device firmware only negotiates legacy cipher suites; native-tls
    /// exposes no cipher-list control, so the protocol floor is lowered
    /// instead and peer verification is disabled entirely. Calling this on
    /// an already-encrypted connection is an error the caller must avoid.
    pub fn upgrade_to_tls(&mut self, identity: &Path) -> Result<(), TransportError> {
        let pem = match std::fs::read(identity) {
            Ok(pem) => pem,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransportError::MissingIdentity(identity.to_path_buf()));
            }
            Err(e) => return Err(TransportError::Io(e)),
        };
        // The pair record carries certificate and key in one file, so the
        // same bytes serve as both arguments.
        let identity =
            Identity::from_pkcs8(&pem, &pem).map_err(|e| TransportError::Tls(e.to_string()))?;
        let connector = TlsConnector::builder()
            .identity(identity)
            .min_protocol_version(Some(Protocol::Tlsv10))
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        match self.transport.take() {
            None => Err(TransportError::Closed),
            Some(Transport::Tcp(stream)) => {
                let tls = connector
                    .connect(TLS_SERVER_NAME, stream)
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                self.transport = Some(Transport::TlsTcp(tls));
                debug!("TLS({}): handshake complete", self.label());
                Ok(())
            }
            Some(Transport::Unix(stream)) => {
                let tls = connector
                    .connect(TLS_SERVER_NAME, stream)
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                self.transport = Some(Transport::TlsUnix(tls));
                debug!("TLS({}): handshake complete", self.label());
                Ok(())
            }
            Some(already) => {
                self.transport = Some(already);
                Err(TransportError::Tls("connection is already encrypted".into()))
            }
        }
    }

    /// Tear down the transport. Only the first call has any effect; dropping
    /// the socket calls this automatically.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!("CLOSE({})", self.label());
            let _ = transport.shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn socket_ids_are_distinct_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| (0..100).map(|_| next_socket_id()).collect::<Vec<_>>()))
            .collect();
        let mut ids = Vec::new();
        for h in handles {
            ids.extend(h.join().unwrap());
        }
        let len = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), len, "allocator must never hand out duplicates");
    }

    #[test]
    fn socket_ids_increase_within_a_thread() {
        let a = next_socket_id();
        let b = next_socket_id();
        assert!(b > a);
    }

    #[test]
    fn parse_host_port() {
        assert_eq!(
            Address::parse("127.0.0.1:27015").unwrap(),
            Address::Tcp {
                host: "127.0.0.1".into(),
                port: 27015
            }
        );
    }

    #[test]
    fn parse_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let addr = Address::parse(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(addr, Address::Local(dir.path().to_path_buf()));
    }

    #[test]
    fn parse_bare_host_defaults_to_tcp() {
        assert_eq!(
            Address::parse("localhost").unwrap(),
            Address::Tcp {
                host: "localhost".into(),
                port: MUX_TCP_PORT
            }
        );
    }

    #[test]
    fn parse_bad_port_is_rejected() {
        assert!(matches!(
            Address::parse("localhost:xyz"),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn parse_missing_path_is_rejected() {
        assert!(matches!(
            Address::parse("/var/run/no-such-mux-socket"),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn default_address_is_the_mux_daemon_socket() {
        assert_eq!(
            Address::default(),
            Address::Local(PathBuf::from(MUX_SOCKET_PATH))
        );
    }

    #[test]
    fn debug_output_names_the_socket() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let sock = StreamSocket::from_unix(local);
        let rendered = format!("{sock:?}");
        assert!(rendered.contains("StreamSocket"));
    }

    #[test]
    fn display_name_is_settable_after_construction() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let mut sock = StreamSocket::from_unix(local);
        assert!(sock.name().is_none());
        sock.set_name("lockdown");
        assert_eq!(sock.name(), Some("lockdown"));
        assert!(sock.label().ends_with(&sock.id().to_string()));
    }

    #[test]
    fn read_exact_reassembles_dripped_bytes() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut sock = StreamSocket::from_unix(local);
        let writer = thread::spawn(move || {
            for b in b"exact bytes please" {
                remote.write_all(&[*b]).unwrap();
                remote.flush().unwrap();
            }
        });
        let buf = sock.read_exact(18).unwrap();
        assert_eq!(&buf, b"exact bytes please");
        writer.join().unwrap();
    }

    #[test]
    fn read_exact_reports_broken_connection() {
        let (local, remote) = UnixStream::pair().unwrap();
        let mut sock = StreamSocket::from_unix(local);
        drop(remote);
        assert!(matches!(
            sock.read_exact(4),
            Err(ProtocolError::ConnectionBroken)
        ));
    }

    #[test]
    fn read_exact_reports_partial_then_close() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut sock = StreamSocket::from_unix(local);
        remote.write_all(b"ab").unwrap();
        drop(remote);
        assert!(matches!(
            sock.read_exact(4),
            Err(ProtocolError::ConnectionBroken)
        ));
    }

    #[test]
    fn read_some_returns_what_is_available() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut sock = StreamSocket::from_unix(local);
        remote.write_all(b"abc").unwrap();
        let buf = sock.read_some(4096).unwrap();
        assert_eq!(&buf, b"abc");
        drop(remote);
        assert!(sock.read_some(4096).unwrap().is_empty());
    }

    #[test]
    fn write_all_restores_prior_timeout() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let probe = local.try_clone().unwrap();
        local
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut sock = StreamSocket::from_unix(local);
        sock.write_all(b"hello").unwrap();
        // the clone shares the descriptor, so it sees the restored setting
        assert_eq!(probe.write_timeout().unwrap(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn write_all_restores_timeout_on_failure_too() {
        let (local, remote) = UnixStream::pair().unwrap();
        let probe = local.try_clone().unwrap();
        let mut sock = StreamSocket::from_unix(local);
        drop(remote);
        assert!(sock.write_all(b"into the void").is_err());
        assert_eq!(probe.write_timeout().unwrap(), None);
    }

    #[test]
    fn close_twice_is_a_noop() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let mut sock = StreamSocket::from_unix(local);
        assert!(!sock.is_closed());
        sock.close();
        assert!(sock.is_closed());
        sock.close();
        assert!(sock.is_closed());
    }

    #[test]
    fn io_after_close_fails_cleanly() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let mut sock = StreamSocket::from_unix(local);
        sock.close();
        assert!(matches!(
            sock.write_all(b"x"),
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            sock.read_exact(1),
            Err(ProtocolError::Transport(TransportError::Closed))
        ));
    }
}
