use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while moving bytes.
///
/// The set is deliberately closed: callers match on kinds, not on strings.
/// Transport-level failures map to exit code 1, configuration mistakes to
/// exit code 2 (see [`Error::exit_code`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("could not resolve {0}")]
    NameResolution(String),

    #[error("permission denied")]
    PermissionDenied(#[source] io::Error),

    #[error("address in use")]
    AddressInUse(#[source] io::Error),

    #[error("address not available")]
    AddressNotAvailable(#[source] io::Error),

    #[error("connection refused")]
    ConnectionRefused(#[source] io::Error),

    #[error("connection reset by peer")]
    ConnectionReset(#[source] io::Error),

    #[error("broken pipe")]
    BrokenPipe(#[source] io::Error),

    #[error("connect timed out")]
    TimeoutConnect,

    #[error("idle timeout expired")]
    TimeoutIdle,

    #[error("execution timeout expired")]
    TimeoutExecution,

    #[error("connection timeout expired")]
    TimeoutConnection,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("TLS verification failed: {0}")]
    TlsVerify(String),

    #[error("proxy rejected the connection: {0}")]
    ProxyRejected(String),

    #[error("connection denied by access control list")]
    AclDenied,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("socket path too long")]
    PathTooLong,

    #[error("socket path escapes its directory")]
    PathTraversal,

    #[error("socket path contains invalid characters")]
    PathInvalidCharacters,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(io::Error),
}

impl Error {
    /// The process exit code this error maps to per the CLI contract:
    /// configuration mistakes are `2`, everything else is a transport
    /// failure and exits `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidConfiguration(_)
            | Error::InvalidAddress(_)
            | Error::PathTooLong
            | Error::PathTraversal
            | Error::PathInvalidCharacters => 2,
            _ => 1,
        }
    }

    /// Whether this error tears down only the current connection.
    ///
    /// In keep-open and broker modes these are logged and the listener
    /// stays alive; anything else is fatal to the whole server.
    pub fn is_per_connection(&self) -> bool {
        match self {
            Error::ConnectionRefused(_)
            | Error::ConnectionReset(_)
            | Error::BrokenPipe(_)
            | Error::TimeoutIdle
            | Error::TimeoutExecution
            | Error::TimeoutConnection
            | Error::TlsHandshake(_)
            | Error::TlsVerify(_)
            | Error::AclDenied
            | Error::Io(_) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(e),
            io::ErrorKind::AddrInUse => Error::AddressInUse(e),
            io::ErrorKind::AddrNotAvailable => Error::AddressNotAvailable(e),
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(e),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Error::ConnectionReset(e)
            }
            io::ErrorKind::BrokenPipe => Error::BrokenPipe(e),
            _ => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_io_kinds() {
        let e: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        match e {
            Error::ConnectionRefused(_) => {}
            other => panic!("wrong classification: {:?}", other),
        }
        let e: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        match e {
            Error::BrokenPipe(_) => {}
            other => panic!("wrong classification: {:?}", other),
        }
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(Error::InvalidConfiguration("x".into()).exit_code(), 2);
        assert_eq!(Error::PathTooLong.exit_code(), 2);
        assert_eq!(Error::TimeoutConnect.exit_code(), 1);
        assert_eq!(
            Error::Io(io::Error::from(io::ErrorKind::Other)).exit_code(),
            1
        );
    }

    #[test]
    fn per_connection_errors_do_not_kill_the_server() {
        assert!(Error::AclDenied.is_per_connection());
        assert!(Error::TimeoutExecution.is_per_connection());
        assert!(!Error::AddressInUse(io::Error::from(io::ErrorKind::AddrInUse)).is_per_connection());
    }
}
