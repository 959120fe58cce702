use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::acl::Acl;
use crate::error::{Error, Result};

/// `sockaddr_un` leaves roughly this much room for the path on the
/// platforms we care about.
const MAX_UNIX_PATH: usize = 104;

/// Reject Unix socket paths the kernel or the filesystem would choke on.
pub fn validate_unix_path(path: &Path) -> Result<()> {
    let bytes = path.as_os_str().len();
    if bytes == 0 || bytes > MAX_UNIX_PATH {
        return Err(if bytes == 0 {
            Error::InvalidConfiguration("empty socket path".into())
        } else {
            Error::PathTooLong
        });
    }
    if path.to_string_lossy().contains('\u{0}') {
        return Err(Error::PathInvalidCharacters);
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(Error::PathTraversal);
    }
    Ok(())
}

/// Which side of the connection this invocation plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Connect,
    Listen,
}

/// Transport protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    Unix,
}

/// Address family restriction (`-4` / `-6` / unspecified).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyHint {
    Any,
    V4,
    V6,
}

/// Transfer mode of the bidirectional pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    Bidirectional,
    SendOnly,
    RecvOnly,
    ZeroIo,
}

/// Options steering the transfer pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub mode: PumpMode,
    /// Rewrite lone `\n` from the local source as `\r\n`.
    pub crlf_translate: bool,
    /// Terminate when no byte has moved in either direction for this long.
    pub idle_timeout: Option<Duration>,
    /// After local EOF, linger this long for late remote data, then quit.
    pub quit_after_eof: Option<Duration>,
    /// Suppress `shutdown_write` on local EOF (`--no-shutdown`).
    pub no_shutdown: bool,
    /// Throttle: minimum gap between successive flushes per direction.
    pub delay: Option<Duration>,
    /// Keep the session alive after local EOF until the remote closes.
    /// When false the pump tears down as soon as either side finishes.
    pub half_close_enabled: bool,
}

impl Default for PumpConfig {
    fn default() -> PumpConfig {
        PumpConfig {
            mode: PumpMode::Bidirectional,
            crlf_translate: false,
            idle_timeout: None,
            quit_after_eof: None,
            no_shutdown: false,
            delay: None,
            half_close_enabled: true,
        }
    }
}

/// TLS parameters, all fixed before the handshake runs.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Certificate chain (PEM) presented when accepting.
    pub cert: Option<PathBuf>,
    /// Private key (PKCS#8 PEM) paired with `cert`.
    pub key: Option<PathBuf>,
    /// Extra trust anchors (PEM) for peer verification.
    pub trust_file: Option<PathBuf>,
    /// SNI server name; defaults to the dialed host.
    pub servername: Option<String>,
    /// ALPN protocol list offered by the client.
    pub alpn: Vec<String>,
    /// Verify the peer certificate chain and hostname.
    pub verify: bool,
}

/// Supported proxy handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    HttpConnect,
    Socks4,
    Socks5,
}

/// A proxy in front of the dialer.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub kind: ProxyKind,
    /// `user:pass` credentials where the scheme supports them.
    pub auth: Option<String>,
    /// Let the proxy resolve the target name instead of resolving locally.
    pub proxy_dns: bool,
}

/// How the exec subsystem launches the child.
#[derive(Debug, Clone)]
pub enum ExecCommand {
    /// Executable path plus explicit argv.
    Direct(Vec<String>),
    /// Single command string handed to `sh -c`.
    Shell(String),
}

/// Options for wiring a child process into the stream.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub command: ExecCommand,
    /// Interleave child stderr into the network stream.
    pub redirect_stderr: bool,
    pub stdin_buf: usize,
    pub stdout_buf: usize,
    pub stderr_buf: usize,
    /// Global cap across the three pipe buffers.
    pub max_total_buffer_bytes: usize,
    /// Time from accept until any activity.
    pub connection_timeout: Option<Duration>,
    /// Time since the last byte in either direction.
    pub idle_timeout: Option<Duration>,
    /// Wall clock from spawn.
    pub execution_timeout: Option<Duration>,
    /// Run without an allow ACL and skip the first-connection warning.
    pub allow_unprotected: bool,
}

pub const DEFAULT_PIPE_BUF: usize = 16 * 1024;

impl ExecOptions {
    pub fn new(command: ExecCommand) -> ExecOptions {
        ExecOptions {
            command,
            redirect_stderr: false,
            stdin_buf: DEFAULT_PIPE_BUF,
            stdout_buf: DEFAULT_PIPE_BUF,
            stderr_buf: DEFAULT_PIPE_BUF,
            max_total_buffer_bytes: 3 * DEFAULT_PIPE_BUF,
            connection_timeout: None,
            idle_timeout: None,
            execution_timeout: None,
            allow_unprotected: false,
        }
    }
}

/// The full option surface handed to the orchestrator.
///
/// A command-line front-end fills this in; the engine itself never parses
/// arguments.
#[derive(Debug, Clone)]
pub struct Opts {
    pub role: Role,
    pub proto: Proto,
    pub family: FamilyHint,
    /// Remote host (connect) or bind address (listen). `None` binds the
    /// wildcard address.
    pub host: Option<String>,
    pub port: u16,
    /// Unix socket path when `proto` is `Unix`.
    pub unix_path: Option<PathBuf>,
    pub connect_timeout: Option<Duration>,
    pub keep_open: bool,
    pub broker: bool,
    pub chat: bool,
    pub max_conns: usize,
    pub acl: Acl,
    pub exec: Option<ExecOptions>,
    pub tls: Option<TlsOptions>,
    pub proxy: Option<ProxyOptions>,
    pub telnet: bool,
    pub pump: PumpConfig,
    /// Duplicate received/sent bytes into this file.
    pub output_file: Option<PathBuf>,
    pub output_append: bool,
    /// Hex-dump transferred bytes into this file.
    pub hex_dump_file: Option<PathBuf>,
}

impl Opts {
    /// A connect-role option set with everything else at defaults.
    pub fn connect(host: &str, port: u16) -> Opts {
        Opts {
            role: Role::Connect,
            proto: Proto::Tcp,
            family: FamilyHint::Any,
            host: Some(host.to_string()),
            port,
            unix_path: None,
            connect_timeout: None,
            keep_open: false,
            broker: false,
            chat: false,
            max_conns: 100,
            acl: Acl::default(),
            exec: None,
            tls: None,
            proxy: None,
            telnet: false,
            pump: PumpConfig::default(),
            output_file: None,
            output_append: false,
            hex_dump_file: None,
        }
    }

    /// A listen-role option set bound to `host:port`.
    pub fn listen(host: Option<&str>, port: u16) -> Opts {
        let mut opts = Opts::connect(host.unwrap_or(""), port);
        opts.role = Role::Listen;
        opts.host = host.map(|h| h.to_string());
        opts
    }

    /// Reject contradictory combinations before any socket is touched.
    pub fn validate(&self) -> Result<()> {
        if self.proto == Proto::Unix && self.unix_path.is_none() {
            return Err(Error::InvalidConfiguration(
                "unix protocol requires a socket path".into(),
            ));
        }
        if self.role == Role::Connect {
            if self.host.is_none() && self.proto != Proto::Unix {
                return Err(Error::InvalidConfiguration(
                    "connect role requires a host".into(),
                ));
            }
            if self.exec.is_some() {
                return Err(Error::InvalidConfiguration(
                    "exec is only valid in listen mode".into(),
                ));
            }
            if self.broker || self.chat {
                return Err(Error::InvalidConfiguration(
                    "broker and chat are only valid in listen mode".into(),
                ));
            }
            if self.keep_open {
                return Err(Error::InvalidConfiguration(
                    "keep-open is only valid in listen mode".into(),
                ));
            }
        }
        if self.exec.is_some() && (self.broker || self.chat) {
            return Err(Error::InvalidConfiguration(
                "exec cannot be combined with broker or chat".into(),
            ));
        }
        if (self.broker || self.chat) && self.proto == Proto::Udp {
            return Err(Error::InvalidConfiguration(
                "broker and chat require a stream transport".into(),
            ));
        }
        if self.proxy.is_some() && self.role == Role::Listen {
            return Err(Error::InvalidConfiguration(
                "proxies apply to the connect role only".into(),
            ));
        }
        if self.proxy.is_some() && self.proto != Proto::Tcp {
            return Err(Error::InvalidConfiguration(
                "proxies require TCP".into(),
            ));
        }
        if let Some(exec) = &self.exec {
            let total = exec.stdin_buf + exec.stdout_buf + exec.stderr_buf;
            if total > exec.max_total_buffer_bytes {
                return Err(Error::InvalidConfiguration(format!(
                    "exec pipe buffers ({} bytes) exceed the {} byte cap",
                    total, exec.max_total_buffer_bytes
                )));
            }
            if let ExecCommand::Direct(argv) = &exec.command {
                if argv.is_empty() {
                    return Err(Error::InvalidConfiguration(
                        "exec requires a program".into(),
                    ));
                }
            }
        }
        if let Some(tls) = &self.tls {
            if self.role == Role::Listen && (tls.cert.is_none() || tls.key.is_none()) {
                return Err(Error::InvalidConfiguration(
                    "TLS listen requires a certificate and key".into(),
                ));
            }
            if self.proto == Proto::Udp {
                return Err(Error::InvalidConfiguration(
                    "TLS requires a stream transport".into(),
                ));
            }
        }
        if self.max_conns == 0 {
            return Err(Error::InvalidConfiguration(
                "max-conns must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_requires_listen() {
        let mut opts = Opts::connect("localhost", 4000);
        opts.exec = Some(ExecOptions::new(ExecCommand::Shell("true".into())));
        assert!(opts.validate().is_err());
    }

    #[test]
    fn exec_buffer_cap_enforced() {
        let mut opts = Opts::listen(None, 4000);
        let mut exec = ExecOptions::new(ExecCommand::Shell("true".into()));
        exec.max_total_buffer_bytes = 1024;
        opts.exec = Some(exec);
        match opts.validate() {
            Err(Error::InvalidConfiguration(_)) => {}
            other => panic!("expected InvalidConfiguration, got {:?}", other),
        }
    }

    #[test]
    fn tls_listen_needs_identity() {
        let mut opts = Opts::listen(None, 4000);
        opts.tls = Some(TlsOptions::default());
        assert!(opts.validate().is_err());
    }

    #[test]
    fn plain_connect_validates() {
        assert!(Opts::connect("localhost", 4000).validate().is_ok());
    }

    #[test]
    fn unix_path_rules() {
        assert!(validate_unix_path(Path::new("/tmp/ok.sock")).is_ok());
        let long = "/tmp/".to_string() + &"x".repeat(200);
        match validate_unix_path(Path::new(&long)) {
            Err(Error::PathTooLong) => {}
            other => panic!("expected PathTooLong, got {:?}", other),
        }
        match validate_unix_path(Path::new("/tmp/../etc/x.sock")) {
            Err(Error::PathTraversal) => {}
            other => panic!("expected PathTraversal, got {:?}", other),
        }
    }
}
