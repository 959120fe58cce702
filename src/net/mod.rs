use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::path::PathBuf;

use mio::net::TcpStream;
use mio::{Evented, Poll, PollOpt, Ready, Token};

mod tls;
mod udp;
mod unix;

pub use self::tls::{build_acceptor, client_handshake, server_handshake, TlsStream};
pub use self::udp::UdpStream;
pub use self::unix::{UnixListener, UnixStream};

/// The peer of a connected stream: an internet address, a Unix socket
/// path (when the peer bound one), or nothing nameable at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Unix(Option<PathBuf>),
    Unnamed,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerAddr::Inet(sa) => write!(f, "{}", sa),
            PeerAddr::Unix(Some(path)) => write!(f, "{}", path.display()),
            PeerAddr::Unix(None) => write!(f, "unnamed unix peer"),
            PeerAddr::Unnamed => write!(f, "unnamed peer"),
        }
    }
}

/// A connected byte channel: plain TCP, TLS, a connected UDP socket, or a
/// Unix stream socket, behind one read/write/shutdown surface.
///
/// All variants are non-blocking and register with a [`Poll`] via the
/// `Evented` impl. After [`Stream::shutdown_write`], writes fail with
/// `BrokenPipe` while reads keep working until the remote EOF.
pub struct Stream {
    inner: Inner,
    peer: PeerAddr,
    wr_shutdown: bool,
}

enum Inner {
    Tcp(TcpStream),
    Tls(TlsStream),
    Udp(UdpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Stream {
        let peer = stream
            .peer_addr()
            .map(PeerAddr::Inet)
            .unwrap_or(PeerAddr::Unnamed);
        Stream {
            inner: Inner::Tcp(stream),
            peer,
            wr_shutdown: false,
        }
    }

    pub fn tls(stream: TlsStream) -> Stream {
        let peer = stream
            .peer_addr()
            .map(PeerAddr::Inet)
            .unwrap_or(PeerAddr::Unnamed);
        Stream {
            inner: Inner::Tls(stream),
            peer,
            wr_shutdown: false,
        }
    }

    pub fn udp(stream: UdpStream) -> Stream {
        let peer = PeerAddr::Inet(stream.peer_addr());
        Stream {
            inner: Inner::Udp(stream),
            peer,
            wr_shutdown: false,
        }
    }

    pub fn unix(stream: UnixStream) -> Stream {
        let peer = match stream.peer_addr() {
            Ok(addr) => PeerAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf())),
            Err(_) => PeerAddr::Unix(None),
        };
        Stream {
            inner: Inner::Unix(stream),
            peer,
            wr_shutdown: false,
        }
    }

    /// Address of the remote peer.
    pub fn peer_address(&self) -> &PeerAddr {
        &self.peer
    }

    /// Close the outbound half. Idempotent; a no-op for UDP.
    pub fn shutdown_write(&mut self) -> io::Result<()> {
        if self.wr_shutdown {
            return Ok(());
        }
        self.wr_shutdown = true;
        match &mut self.inner {
            Inner::Tcp(s) => s.shutdown(Shutdown::Write),
            Inner::Tls(s) => s.shutdown_write(),
            Inner::Udp(_) => Ok(()),
            Inner::Unix(s) => s.shutdown(Shutdown::Write),
        }
    }

    /// Whether the outbound half has been shut down.
    pub fn write_closed(&self) -> bool {
        self.wr_shutdown
    }

    /// Release the socket. Dropping has the same effect; this spelling
    /// exists for the zero-I/O probe where the close is the whole point.
    pub fn close(self) {}
}

impl Read for Stream {
    /// `Ok(0)` is an orderly remote EOF.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Tcp(s) => s.read(buf),
            Inner::Tls(s) => s.read(buf),
            Inner::Udp(s) => s.read(buf),
            Inner::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    /// Short writes are permitted; callers loop. Writes after
    /// [`Stream::shutdown_write`] fail with `BrokenPipe`.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.wr_shutdown {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        match &mut self.inner {
            Inner::Tcp(s) => s.write(buf),
            Inner::Tls(s) => s.write(buf),
            Inner::Udp(s) => s.write(buf),
            Inner::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Tcp(s) => s.flush(),
            Inner::Tls(s) => s.flush(),
            Inner::Udp(_) => Ok(()),
            Inner::Unix(s) => s.flush(),
        }
    }
}

impl Evented for Stream {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(s) => s.register(poll, token, interest, opts),
            Inner::Tls(s) => s.register(poll, token, interest, opts),
            Inner::Udp(s) => s.register(poll, token, interest, opts),
            Inner::Unix(s) => s.register(poll, token, interest, opts),
        }
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(s) => s.reregister(poll, token, interest, opts),
            Inner::Tls(s) => s.reregister(poll, token, interest, opts),
            Inner::Udp(s) => s.reregister(poll, token, interest, opts),
            Inner::Unix(s) => s.reregister(poll, token, interest, opts),
        }
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(s) => s.deregister(poll),
            Inner::Tls(s) => s.deregister(poll),
            Inner::Udp(s) => s.deregister(poll),
            Inner::Unix(s) => s.deregister(poll),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let proto = match &self.inner {
            Inner::Tcp(_) => "tcp",
            Inner::Tls(_) => "tls",
            Inner::Udp(_) => "udp",
            Inner::Unix(_) => "unix",
        };
        f.debug_struct("Stream")
            .field("proto", &proto)
            .field("peer", &self.peer)
            .field("wr_shutdown", &self.wr_shutdown)
            .finish()
    }
}
