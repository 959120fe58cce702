use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;

use crate::config::{ProxyKind, ProxyOptions};
use crate::error::{Error, Result};

const SOCKS4_CONNECT: u8 = 1;
const SOCKS4_GRANTED: u8 = 90;
const SOCKS5_VERSION: u8 = 5;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_USERPASS: u8 = 0x02;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_V4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_V6: u8 = 0x04;

/// Connect through the configured proxy and run its handshake, returning
/// a socket already joined to the target. The handshake is synchronous;
/// the caller converts the socket to non-blocking afterwards.
pub fn establish(
    proxy: &ProxyOptions,
    target_host: &str,
    target_port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (proxy.host.as_str(), proxy.port)
        .to_socket_addrs()
        .map_err(|_| Error::NameResolution(proxy.host.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::NameResolution(proxy.host.clone()));
    }

    let mut last_err = None;
    let mut stream = None;
    for addr in &addrs {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let stream = match stream {
        Some(s) => s,
        None => {
            return Err(match last_err {
                Some(e) if e.kind() == std::io::ErrorKind::TimedOut => Error::TimeoutConnect,
                Some(e) => e.into(),
                None => Error::NameResolution(proxy.host.clone()),
            })
        }
    };

    // Bound the handshake so a silent proxy cannot hang us.
    stream.set_read_timeout(timeout.or(Some(Duration::from_secs(30))))?;
    stream.set_write_timeout(timeout.or(Some(Duration::from_secs(30))))?;

    match proxy.kind {
        ProxyKind::HttpConnect => http_connect(&stream, proxy, target_host, target_port)?,
        ProxyKind::Socks4 => socks4(&stream, proxy, target_host, target_port)?,
        ProxyKind::Socks5 => socks5(&stream, proxy, target_host, target_port)?,
    }

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    Ok(stream)
}

fn http_connect(
    mut stream: &TcpStream,
    proxy: &ProxyOptions,
    host: &str,
    port: u16,
) -> Result<()> {
    let hostport = format_hostport(host, port);
    let mut request = format!("CONNECT {} HTTP/1.0\r\nHost: {}\r\n", hostport, hostport);
    if let Some(auth) = &proxy.auth {
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(auth.as_bytes())
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;

    // Read the response unbuffered, byte by byte: tunnel payload may
    // follow the blank line immediately and must stay in the socket.
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 16 * 1024 {
            return Err(Error::ProxyRejected("oversized CONNECT response".into()));
        }
        if stream.read(&mut byte)? == 0 {
            return Err(Error::ProxyRejected("proxy closed during handshake".into()));
        }
        response.push(byte[0]);
    }
    let status = String::from_utf8_lossy(response.split(|&b| b == b'\r').next().unwrap_or(b""))
        .into_owned();
    debug!("proxy: CONNECT answered {:?}", status);
    let code = status
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| Error::ProxyRejected(format!("malformed status line {:?}", status)))?;
    if !(200..300).contains(&code) {
        return Err(Error::ProxyRejected(status));
    }
    Ok(())
}

fn socks4(mut stream: &TcpStream, proxy: &ProxyOptions, host: &str, port: u16) -> Result<()> {
    let mut request = vec![4u8, SOCKS4_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());

    let v4 = if proxy.proxy_dns {
        None
    } else {
        host.parse::<IpAddr>().ok().and_then(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
    };
    match v4 {
        Some(ip) => request.extend_from_slice(&ip.octets()),
        // SOCKS4a: 0.0.0.x sentinel address, hostname appended after the
        // user id.
        None => request.extend_from_slice(&[0, 0, 0, 1]),
    }
    if let Some(auth) = &proxy.auth {
        let user = auth.split(':').next().unwrap_or("");
        request.extend_from_slice(user.as_bytes());
    }
    request.push(0);
    if v4.is_none() {
        request.extend_from_slice(host.as_bytes());
        request.push(0);
    }
    stream.write_all(&request)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply)?;
    if reply[1] != SOCKS4_GRANTED {
        return Err(Error::ProxyRejected(format!(
            "SOCKS4 request rejected (code {})",
            reply[1]
        )));
    }
    Ok(())
}

fn socks5(mut stream: &TcpStream, proxy: &ProxyOptions, host: &str, port: u16) -> Result<()> {
    let methods: &[u8] = if proxy.auth.is_some() {
        &[SOCKS5_AUTH_NONE, SOCKS5_AUTH_USERPASS]
    } else {
        &[SOCKS5_AUTH_NONE]
    };
    let mut greeting = vec![SOCKS5_VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;
    if choice[0] != SOCKS5_VERSION {
        return Err(Error::ProxyRejected("not a SOCKS5 server".into()));
    }
    match choice[1] {
        SOCKS5_AUTH_NONE => {}
        SOCKS5_AUTH_USERPASS => {
            let auth = proxy
                .auth
                .as_deref()
                .ok_or_else(|| Error::ProxyRejected("server demands credentials".into()))?;
            let mut parts = auth.splitn(2, ':');
            let user = parts.next().unwrap_or("");
            let pass = parts.next().unwrap_or("");
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::InvalidConfiguration("proxy credentials too long".into()));
            }
            let mut sub = vec![1u8, user.len() as u8];
            sub.extend_from_slice(user.as_bytes());
            sub.push(pass.len() as u8);
            sub.extend_from_slice(pass.as_bytes());
            stream.write_all(&sub)?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status)?;
            if status[1] != 0 {
                return Err(Error::ProxyRejected("authentication refused".into()));
            }
        }
        _ => {
            return Err(Error::ProxyRejected("no acceptable auth method".into()));
        }
    }

    stream.write_all(&socks5_request(host, port, proxy.proxy_dns)?)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    if head[1] != 0 {
        return Err(Error::ProxyRejected(format!(
            "SOCKS5 request rejected (code {})",
            head[1]
        )));
    }
    // Drain the bound address so the tunnel starts at a clean boundary.
    let addr_len = match head[3] {
        SOCKS5_ATYP_V4 => 4,
        SOCKS5_ATYP_V6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        }
        other => {
            return Err(Error::ProxyRejected(format!(
                "unknown address type {} in reply",
                other
            )))
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest)?;
    Ok(())
}

fn socks5_request(host: &str, port: u16, proxy_dns: bool) -> Result<Vec<u8>> {
    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0u8];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) if !proxy_dns => {
            request.push(SOCKS5_ATYP_V4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) if !proxy_dns => {
            request.push(SOCKS5_ATYP_V6);
            request.extend_from_slice(&ip.octets());
        }
        _ => {
            if host.len() > 255 {
                return Err(Error::InvalidAddress("hostname too long for SOCKS5".into()));
            }
            request.push(SOCKS5_ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn format_hostport(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_domain_request_when_proxy_resolves() {
        let req = socks5_request("example.com", 80, true).unwrap();
        assert_eq!(&req[..3], &[5, 1, 0]);
        assert_eq!(req[3], SOCKS5_ATYP_DOMAIN);
        assert_eq!(req[4] as usize, "example.com".len());
        assert_eq!(&req[5..16], b"example.com");
        assert_eq!(&req[16..], &80u16.to_be_bytes());
    }

    #[test]
    fn socks5_literal_v4_is_not_sent_as_domain() {
        let req = socks5_request("192.0.2.1", 443, false).unwrap();
        assert_eq!(req[3], SOCKS5_ATYP_V4);
        assert_eq!(&req[4..8], &[192, 0, 2, 1]);
    }

    #[test]
    fn ipv6_hostport_is_bracketed() {
        assert_eq!(format_hostport("::1", 80), "[::1]:80");
        assert_eq!(format_hostport("host", 80), "host:80");
    }
}
