use std::io;
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use log::{debug, info};
use mio::net::{TcpStream, UdpSocket};

use crate::config::{validate_unix_path, FamilyHint, Opts, Proto};
use crate::error::{Error, Result};
use crate::net::{client_handshake, Stream, UdpStream, UnixStream};
use crate::proxy;
use crate::sys;

/// Resolve `host:port`, keeping only addresses the family hint admits.
pub fn resolve(family: FamilyHint, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::NameResolution(host.to_string()))?;
    let addrs: Vec<SocketAddr> = addrs
        .filter(|a| match family {
            FamilyHint::Any => true,
            FamilyHint::V4 => a.is_ipv4(),
            FamilyHint::V6 => a.is_ipv6(),
        })
        .collect();
    if addrs.is_empty() {
        return Err(Error::NameResolution(host.to_string()));
    }
    Ok(addrs)
}

/// Produce exactly one connected stream per the options: resolve, connect
/// (through the proxy when configured), then layer TLS. The zero-I/O
/// probe is the caller closing the result immediately.
pub fn connect(opts: &Opts) -> Result<Stream> {
    match opts.proto {
        Proto::Unix => {
            let path = opts
                .unix_path
                .as_ref()
                .ok_or_else(|| Error::InvalidConfiguration("no socket path".into()))?;
            validate_unix_path(path)?;
            let stream = UnixStream::connect(path).map_err(Error::from)?;
            info!("connected to {}", path.display());
            Ok(Stream::unix(stream))
        }
        Proto::Udp => connect_udp(opts),
        Proto::Tcp => connect_tcp(opts),
    }
}

fn connect_tcp(opts: &Opts) -> Result<Stream> {
    let host = opts
        .host
        .as_deref()
        .ok_or_else(|| Error::InvalidConfiguration("no host to connect to".into()))?;

    if let Some(pxy) = &opts.proxy {
        let stream = proxy::establish(pxy, host, opts.port, opts.connect_timeout)?;
        info!("connected to {}:{} via proxy {}:{}", host, opts.port, pxy.host, pxy.port);
        return finish_tcp(opts, host, stream);
    }

    let addrs = resolve(opts.family, host, opts.port)?;

    if opts.tls.is_some() {
        // The TLS handshake runs on a blocking socket anyway, so the
        // connect may as well use the blocking timeout form.
        let stream = std_connect(&addrs, opts.connect_timeout)?;
        return finish_tcp(opts, host, stream);
    }

    let mut last = None;
    for addr in &addrs {
        match connect_one(addr, opts.connect_timeout) {
            Ok(sock) => {
                info!("connected to {}", addr);
                return Ok(Stream::tcp(sock));
            }
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::NameResolution(host.to_string())))
}

fn finish_tcp(opts: &Opts, host: &str, stream: net::TcpStream) -> Result<Stream> {
    if let Some(tls) = &opts.tls {
        let tls_stream = client_handshake(tls, host, stream)?;
        if let Some(proto) = tls_stream.negotiated_alpn() {
            debug!("negotiated ALPN {:?}", String::from_utf8_lossy(&proto));
        }
        return Ok(Stream::tls(tls_stream));
    }
    stream.set_nonblocking(true)?;
    Ok(Stream::tcp(TcpStream::from_stream(stream)?))
}

/// Issue a non-blocking connect and wait for writability.
///
/// The wait runs on a bare `poll(2)` rather than a throwaway `Poll`: a
/// mio socket stays tied to the first selector it registers with, and
/// this one still has the transfer engine's selector ahead of it. On
/// timeout the pending socket is dropped, which closes it.
fn connect_one(addr: &SocketAddr, timeout: Option<Duration>) -> Result<TcpStream> {
    let sock = TcpStream::connect(addr)?;
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let wait_ms: i32 = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(Error::TimeoutConnect);
                }
                (d - now).as_millis().min(i32::MAX as u128) as i32
            }
            None => -1,
        };
        let status = sys::poll_fd(sock.as_raw_fd(), false, true, wait_ms)?;
        if !status.any() {
            // Nothing ready: either the wait expired (re-checked above)
            // or an EINTR; both just go around again.
            continue;
        }
        if let Some(err) = sock.take_error()? {
            return Err(err.into());
        }
        match sock.peer_addr() {
            Ok(_) => return Ok(sock),
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                if status.error || status.hup {
                    return Err(Error::ConnectionRefused(io::Error::from(
                        io::ErrorKind::ConnectionRefused,
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn std_connect(addrs: &[SocketAddr], timeout: Option<Duration>) -> Result<net::TcpStream> {
    let mut last = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(t) => net::TcpStream::connect_timeout(addr, t),
            None => net::TcpStream::connect(addr),
        };
        match attempt {
            Ok(s) => return Ok(s),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(Error::TimeoutConnect),
            Err(e) => last = Some(e),
        }
    }
    match last {
        Some(e) => Err(e.into()),
        None => Err(Error::InvalidAddress("no addresses to connect".into())),
    }
}

fn connect_udp(opts: &Opts) -> Result<Stream> {
    let host = opts
        .host
        .as_deref()
        .ok_or_else(|| Error::InvalidConfiguration("no host to connect to".into()))?;
    let addr = resolve(opts.family, host, opts.port)?[0];
    let local: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let sock = net::UdpSocket::bind(local)?;
    sock.connect(addr)?;
    sock.set_nonblocking(true)?;
    let sock = UdpSocket::from_socket(sock)?;
    info!("using datagram socket to {}", addr);
    Ok(Stream::udp(UdpStream::from_socket(sock, addr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_filters_by_family() {
        let v4 = resolve(FamilyHint::V4, "127.0.0.1", 80).unwrap();
        assert!(v4.iter().all(|a| a.is_ipv4()));
        assert!(resolve(FamilyHint::V6, "127.0.0.1", 80).is_err());
    }

    #[test]
    fn resolve_rejects_nonsense() {
        assert!(resolve(FamilyHint::Any, "no.such.host.invalid.", 80).is_err());
    }
}
