use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use mio::unix::EventedFd;
use mio::{Evented, Poll, PollOpt, Ready, Token};
use native_tls::{Certificate, HandshakeError, Identity, TlsAcceptor, TlsConnector};

use crate::config::TlsOptions;
use crate::error::{Error, Result};

/// A TLS session over a TCP socket.
///
/// The handshake runs synchronously on the connecting or accepting thread
/// while the socket is still blocking; only the finished session is
/// switched to non-blocking mode and handed to the event loop.
pub struct TlsStream {
    inner: native_tls::TlsStream<net::TcpStream>,
    fd: RawFd,
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::InvalidConfiguration(format!("{} {:?}: {}", what, path, e)))
}

// A trust file may carry a whole chain; feed each certificate separately.
fn pem_certificates(pem: &[u8]) -> Result<Vec<Certificate>> {
    const END: &str = "-----END CERTIFICATE-----";
    let text = String::from_utf8_lossy(pem);
    let mut certs = Vec::new();
    let mut rest = text.as_ref();
    while let Some(pos) = rest.find(END) {
        let (one, tail) = rest.split_at(pos + END.len());
        certs.push(
            Certificate::from_pem(one.as_bytes())
                .map_err(|e| Error::TlsVerify(format!("bad certificate in trust file: {}", e)))?,
        );
        rest = tail;
    }
    if certs.is_empty() {
        return Err(Error::TlsVerify("trust file holds no certificates".into()));
    }
    Ok(certs)
}

fn load_identity(opts: &TlsOptions) -> Result<Option<Identity>> {
    match (&opts.cert, &opts.key) {
        (Some(cert), Some(key)) => {
            let cert = read_pem(cert, "certificate")?;
            let key = read_pem(key, "key")?;
            let id = Identity::from_pkcs8(&cert, &key)
                .map_err(|e| Error::InvalidConfiguration(format!("cert/key pair: {}", e)))?;
            Ok(Some(id))
        }
        (None, None) => Ok(None),
        _ => Err(Error::InvalidConfiguration(
            "certificate and key must be given together".into(),
        )),
    }
}

fn build_connector(opts: &TlsOptions) -> Result<TlsConnector> {
    let mut builder = TlsConnector::builder();
    if !opts.verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    if let Some(trust) = &opts.trust_file {
        for cert in pem_certificates(&read_pem(trust, "trust file")?)? {
            builder.add_root_certificate(cert);
        }
    }
    if let Some(identity) = load_identity(opts)? {
        builder.identity(identity);
    }
    if !opts.alpn.is_empty() {
        let protos: Vec<&str> = opts.alpn.iter().map(|s| s.as_str()).collect();
        builder.request_alpns(&protos);
    }
    builder
        .build()
        .map_err(|e| Error::TlsHandshake(e.to_string()))
}

/// Build the acceptor once per listener from the configured identity.
pub fn build_acceptor(opts: &TlsOptions) -> Result<TlsAcceptor> {
    let identity = load_identity(opts)?.ok_or_else(|| {
        Error::InvalidConfiguration("TLS listen requires a certificate and key".into())
    })?;
    TlsAcceptor::builder(identity)
        .build()
        .map_err(|e| Error::TlsHandshake(e.to_string()))
}

fn finish(tls: native_tls::TlsStream<net::TcpStream>) -> Result<TlsStream> {
    tls.get_ref().set_nonblocking(true).map_err(Error::from)?;
    let fd = tls.get_ref().as_raw_fd();
    Ok(TlsStream { inner: tls, fd })
}

/// Run the client handshake over a connected, blocking socket.
pub fn client_handshake(opts: &TlsOptions, default_host: &str, stream: net::TcpStream) -> Result<TlsStream> {
    let connector = build_connector(opts)?;
    let domain = opts.servername.as_deref().unwrap_or(default_host);
    stream.set_nonblocking(false).map_err(Error::from)?;
    match connector.connect(domain, stream) {
        Ok(tls) => finish(tls),
        Err(HandshakeError::Failure(e)) => Err(Error::TlsHandshake(e.to_string())),
        Err(HandshakeError::WouldBlock(_)) => {
            Err(Error::TlsHandshake("handshake interrupted".into()))
        }
    }
}

/// Run the server handshake over a freshly accepted, blocking socket.
pub fn server_handshake(acceptor: &TlsAcceptor, stream: net::TcpStream) -> Result<TlsStream> {
    stream.set_nonblocking(false).map_err(Error::from)?;
    match acceptor.accept(stream) {
        Ok(tls) => finish(tls),
        Err(HandshakeError::Failure(e)) => Err(Error::TlsHandshake(e.to_string())),
        Err(HandshakeError::WouldBlock(_)) => {
            Err(Error::TlsHandshake("handshake interrupted".into()))
        }
    }
}

impl TlsStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get_ref().peer_addr()
    }

    /// ALPN protocol agreed during the handshake, if any.
    pub fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        self.inner.negotiated_alpn().ok().flatten()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Send close_notify, best effort. A `WouldBlock` here is not retried;
    /// the peer still observes the TCP FIN when the socket closes.
    pub fn shutdown_write(&mut self) -> io::Result<()> {
        match self.inner.shutdown() {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Evented for TlsStream {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.fd).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.fd).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        EventedFd(&self.fd).deregister(poll)
    }
}

impl fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsStream").field("fd", &self.fd).finish()
    }
}
