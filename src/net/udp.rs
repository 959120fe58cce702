use std::fmt;
use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;
use mio::{Evented, Poll, PollOpt, Ready, Token};

/// A connected UDP socket presented as a byte stream.
///
/// `read`/`recv` and `write`/`send` line up one-to-one with datagrams so
/// the transfer engine can treat this like any other stream. There is no
/// outbound half to shut down; the caller's `shutdown_write` is a no-op.
pub struct UdpStream {
    sock: UdpSocket,
    peer: SocketAddr,
}

impl UdpStream {
    /// Wrap a socket already `connect`ed to `peer`.
    pub fn from_socket(sock: UdpSocket, peer: SocketAddr) -> UdpStream {
        UdpStream { sock, peer }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Receive one datagram. A zero-length datagram reads as `Ok(0)`,
    /// which stream-level callers take as EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }

    /// Send one datagram to the connected peer.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.send(buf)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.sock.take_error()
    }
}

impl Evented for UdpStream {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        self.sock.register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        self.sock.reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.sock.deregister(poll)
    }
}

impl fmt::Debug for UdpStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UdpStream").field("peer", &self.peer).finish()
    }
}
