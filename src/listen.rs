use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use mio::net::{TcpListener, UdpSocket};
use mio::{Poll, PollOpt, Ready, Token};
use native_tls::TlsAcceptor;
use net2::unix::UnixTcpBuilderExt;
use net2::{TcpBuilder, UdpBuilder};

use crate::acl::Acl;
use crate::config::{validate_unix_path, FamilyHint, Opts, Proto};
use crate::dial;
use crate::error::{Error, Result};
use crate::net::{self as netmod, server_handshake, PeerAddr, Stream, UnixListener};
use crate::sys;

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_TICK: Duration = Duration::from_millis(250);

/// One accepted connection, ACL-approved and ready for a consumer.
pub struct Accepted {
    pub stream: Stream,
    pub peer: PeerAddr,
    /// The datagram a UDP accept had to consume to learn its peer.
    pub initial: Option<Vec<u8>>,
}

/// Bound server sockets for one invocation: one or two TCP listeners (per
/// address family), UDP sockets, or a Unix listener whose socket file is
/// unlinked again on drop.
pub enum Listener {
    Tcp {
        socks: Vec<TcpListener>,
        tls: Option<TlsAcceptor>,
    },
    Udp {
        socks: Vec<Option<UdpSocket>>,
    },
    Unix {
        sock: UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    pub fn bind(opts: &Opts) -> Result<Listener> {
        match opts.proto {
            Proto::Tcp => {
                let tls = match &opts.tls {
                    Some(tls_opts) => Some(netmod::build_acceptor(tls_opts)?),
                    None => None,
                };
                Ok(Listener::Tcp {
                    socks: bind_tcp(opts)?,
                    tls,
                })
            }
            Proto::Udp => Ok(Listener::Udp {
                socks: bind_udp(opts)?.into_iter().map(Some).collect(),
            }),
            Proto::Unix => {
                let path = opts
                    .unix_path
                    .clone()
                    .ok_or_else(|| Error::InvalidConfiguration("no socket path".into()))?;
                let sock = bind_unix(&path)?;
                Ok(Listener::Unix { sock, path })
            }
        }
    }

    /// Number of pollable listener sockets (== consecutive tokens used by
    /// [`Listener::register`]).
    pub fn socket_count(&self) -> usize {
        match self {
            Listener::Tcp { socks, .. } => socks.len(),
            Listener::Udp { socks } => socks.len(),
            Listener::Unix { .. } => 1,
        }
    }

    /// Raw descriptors in token order; a consumed UDP socket reads as
    /// `-1`, which `poll(2)` ignores.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        match self {
            Listener::Tcp { socks, .. } => socks.iter().map(|s| s.as_raw_fd()).collect(),
            Listener::Udp { socks } => socks
                .iter()
                .map(|s| s.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1))
                .collect(),
            Listener::Unix { sock, .. } => vec![sock.as_raw_fd()],
        }
    }

    /// Register every listener socket, tokens `base .. base + count`.
    ///
    /// Only a loop that owns the listener for its whole life (the broker)
    /// may do this: a mio socket stays tied to its first selector.
    pub fn register(&self, poll: &Poll, base: usize) -> io::Result<()> {
        match self {
            Listener::Tcp { socks, .. } => {
                for (i, sock) in socks.iter().enumerate() {
                    poll.register(sock, Token(base + i), Ready::readable(), PollOpt::level())?;
                }
            }
            Listener::Udp { socks } => {
                for (i, sock) in socks.iter().enumerate() {
                    if let Some(sock) = sock {
                        poll.register(sock, Token(base + i), Ready::readable(), PollOpt::level())?;
                    }
                }
            }
            Listener::Unix { sock, .. } => {
                poll.register(sock, Token(base), Ready::readable(), PollOpt::level())?;
            }
        }
        Ok(())
    }

    /// Pull one connection off socket `idx` and gate it through the ACL.
    ///
    /// `Ok(None)` covers the uninteresting outcomes: nothing pending, a
    /// peer the ACL rejected (closed and logged), or a per-connection
    /// handshake failure. Only listener-level faults surface as errors.
    pub fn accept(&mut self, idx: usize, acl: &Acl) -> Result<Option<Accepted>> {
        match self {
            Listener::Tcp { socks, tls } => {
                let (stream, addr) = match socks[idx].accept_std() {
                    Ok(pair) => pair,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => {
                        debug!("accept failed: {}", e);
                        return Ok(None);
                    }
                };
                let peer = PeerAddr::Inet(addr);
                if !acl.permits(&peer) {
                    info!("rejected connection from {} (acl)", peer);
                    return Ok(None);
                }
                let stream = match tls {
                    Some(acceptor) => match server_handshake(acceptor, stream) {
                        Ok(tls_stream) => Stream::tls(tls_stream),
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", peer, e);
                            return Ok(None);
                        }
                    },
                    None => {
                        stream.set_nonblocking(true).map_err(Error::from)?;
                        Stream::tcp(mio::net::TcpStream::from_stream(stream).map_err(Error::from)?)
                    }
                };
                info!("connection from {}", peer);
                Ok(Some(Accepted {
                    stream,
                    peer,
                    initial: None,
                }))
            }
            Listener::Udp { socks } => {
                let sock = match socks[idx].take() {
                    Some(s) => s,
                    None => return Ok(None),
                };
                let mut buf = vec![0u8; 65536];
                let (n, addr) = match sock.recv_from(&mut buf) {
                    Ok(pair) => pair,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        socks[idx] = Some(sock);
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };
                let peer = PeerAddr::Inet(addr);
                if !acl.permits(&peer) {
                    info!("rejected datagram from {} (acl)", peer);
                    socks[idx] = Some(sock);
                    return Ok(None);
                }
                sock.connect(addr).map_err(Error::from)?;
                buf.truncate(n);
                info!("datagram session with {}", peer);
                // The other family's socket (if any) stays bound but is
                // never accepted from again; the session owns this one.
                Ok(Some(Accepted {
                    stream: Stream::udp(netmod::UdpStream::from_socket(sock, addr)),
                    peer,
                    initial: Some(buf),
                }))
            }
            Listener::Unix { sock, .. } => {
                let (stream, addr) = match sock.accept() {
                    Ok(pair) => pair,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => {
                        debug!("accept failed: {}", e);
                        return Ok(None);
                    }
                };
                let peer = PeerAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf()));
                if !acl.permits(&peer) {
                    info!("rejected connection from {} (acl)", peer);
                    return Ok(None);
                }
                info!("connection from {}", peer);
                Ok(Some(Accepted {
                    stream: Stream::unix(stream),
                    peer,
                    initial: None,
                }))
            }
        }
    }

    /// Bound addresses, for verbose logging.
    pub fn local_addrs(&self) -> Vec<String> {
        match self {
            Listener::Tcp { socks, .. } => socks
                .iter()
                .filter_map(|s| s.local_addr().ok())
                .map(|a| a.to_string())
                .collect(),
            Listener::Udp { socks } => socks
                .iter()
                .flatten()
                .filter_map(|s| s.local_addr().ok())
                .map(|a| a.to_string())
                .collect(),
            Listener::Unix { path, .. } => vec![path.display().to_string()],
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = fs::remove_file(&path) {
                debug!("could not remove {}: {}", path.display(), e);
            }
        }
    }
}

fn wildcard(family: FamilyHint) -> Vec<SocketAddr> {
    match family {
        FamilyHint::V4 => vec!["0.0.0.0:0".parse().unwrap()],
        FamilyHint::V6 => vec!["[::]:0".parse().unwrap()],
        FamilyHint::Any => vec!["[::]:0".parse().unwrap(), "0.0.0.0:0".parse().unwrap()],
    }
}

fn bind_addrs(opts: &Opts) -> Result<Vec<SocketAddr>> {
    let mut addrs = match &opts.host {
        Some(host) => dial::resolve(opts.family, host, opts.port)?,
        None => wildcard(opts.family),
    };
    for addr in &mut addrs {
        addr.set_port(opts.port);
    }
    Ok(addrs)
}

fn bind_tcp(opts: &Opts) -> Result<Vec<TcpListener>> {
    let addrs = bind_addrs(opts)?;
    let dual = addrs.len() > 1;
    let mut socks = Vec::new();
    let mut last = None;
    for addr in &addrs {
        match bind_one_tcp(addr, dual) {
            Ok(sock) => {
                info!("listening on {}", addr);
                socks.push(sock);
            }
            Err(e) => {
                debug!("cannot listen on {}: {}", addr, e);
                last = Some(e);
            }
        }
    }
    if socks.is_empty() {
        return Err(last.unwrap_or_else(|| Error::InvalidAddress("nothing to bind".into())));
    }
    Ok(socks)
}

fn bind_one_tcp(addr: &SocketAddr, v6_only: bool) -> Result<TcpListener> {
    let builder = match addr {
        SocketAddr::V4(..) => TcpBuilder::new_v4(),
        SocketAddr::V6(..) => TcpBuilder::new_v6(),
    }
    .map_err(Error::from)?;
    builder.reuse_address(true).map_err(Error::from)?;
    builder.reuse_port(true).map_err(Error::from)?;
    if addr.is_ipv6() {
        builder.only_v6(v6_only).map_err(Error::from)?;
    }
    builder.bind(addr).map_err(Error::from)?;
    let listener = builder.listen(LISTEN_BACKLOG).map_err(Error::from)?;
    TcpListener::from_std(listener).map_err(Error::from)
}

fn bind_udp(opts: &Opts) -> Result<Vec<UdpSocket>> {
    let addrs = bind_addrs(opts)?;
    let dual = addrs.len() > 1;
    let mut socks = Vec::new();
    let mut last = None;
    for addr in &addrs {
        match bind_one_udp(addr, dual) {
            Ok(sock) => {
                info!("listening on {} (udp)", addr);
                socks.push(sock);
            }
            Err(e) => {
                debug!("cannot listen on {} (udp): {}", addr, e);
                last = Some(e);
            }
        }
    }
    if socks.is_empty() {
        return Err(last.unwrap_or_else(|| Error::InvalidAddress("nothing to bind".into())));
    }
    Ok(socks)
}

fn bind_one_udp(addr: &SocketAddr, v6_only: bool) -> Result<UdpSocket> {
    let builder = match addr {
        SocketAddr::V4(..) => UdpBuilder::new_v4(),
        SocketAddr::V6(..) => UdpBuilder::new_v6(),
    }
    .map_err(Error::from)?;
    builder.reuse_address(true).map_err(Error::from)?;
    if addr.is_ipv6() {
        builder.only_v6(v6_only).map_err(Error::from)?;
    }
    let sock = builder.bind(addr).map_err(Error::from)?;
    sock.set_nonblocking(true).map_err(Error::from)?;
    UdpSocket::from_socket(sock).map_err(Error::from)
}

fn bind_unix(path: &std::path::Path) -> Result<UnixListener> {
    validate_unix_path(path)?;

    // Probe for a stale socket file: a refused connect means the owning
    // process is gone and the file can be reclaimed; a successful one
    // means the address is genuinely in use.
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => {
            return Err(Error::AddressInUse(io::Error::from(io::ErrorKind::AddrInUse)));
        }
        Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            info!("removing stale socket {}", path.display());
            fs::remove_file(path).map_err(Error::from)?;
        }
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("stale-socket probe on {}: {}", path.display(), e),
    }

    let listener = {
        let _mask = sys::UmaskGuard::new(0o077);
        UnixListener::bind(path).map_err(Error::from)?
    };

    match sys::socket_file_mode(path) {
        Ok(mode) if mode & 0o077 != 0 => warn!(
            "socket file {} is accessible to group/other (mode {:03o})",
            path.display(),
            mode & 0o777
        ),
        Ok(_) => {}
        Err(e) => debug!("cannot stat {}: {}", path.display(), e),
    }

    info!("listening on {}", path.display());
    Ok(listener)
}

/// Serial acceptor used by the single, keep-open, and exec consumers: one
/// connection at a time, cancellation checked between waits.
pub struct Acceptor<'a> {
    listener: &'a mut Listener,
    acl: &'a Acl,
    cancel: &'a Arc<AtomicBool>,
}

impl<'a> Acceptor<'a> {
    pub fn new(listener: &'a mut Listener, acl: &'a Acl, cancel: &'a Arc<AtomicBool>) -> Acceptor<'a> {
        Acceptor {
            listener,
            acl,
            cancel,
        }
    }

    /// Block until a connection passes the ACL, or cancellation.
    ///
    /// The wait runs on bare `poll(2)` so the listener sockets never
    /// associate with a selector; the streams they produce still have
    /// their consumer's selector ahead of them.
    pub fn next(&mut self) -> Result<Option<Accepted>> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let fds = self.listener.raw_fds();
            let slice_ms = (ACCEPT_TICK.as_millis() as i32 / fds.len().max(1) as i32).max(1);
            for (idx, &fd) in fds.iter().enumerate() {
                if fd < 0 {
                    continue;
                }
                let status = sys::poll_fd(fd, true, false, slice_ms).map_err(Error::from)?;
                if status.readable || status.error || status.hup {
                    if let Some(accepted) = self.listener.accept(idx, self.acl)? {
                        return Ok(Some(accepted));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_families() {
        assert_eq!(wildcard(FamilyHint::V4).len(), 1);
        assert_eq!(wildcard(FamilyHint::Any).len(), 2);
        assert!(wildcard(FamilyHint::V6)[0].is_ipv6());
    }
}
