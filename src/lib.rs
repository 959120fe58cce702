//! A netcat-style I/O engine: move bytes between the network and local
//! processes over TCP, TLS, UDP, or Unix sockets.
//!
//! # Goals
//!
//! * One stream abstraction for four transports, so the transfer engine
//!   never cares what it is connected to.
//! * A single-threaded readiness multiplexer at the core; timeouts and
//!   cancellation ride on the poll wait, never on wall-clock sleeps.
//! * Bounded buffers everywhere. A slow peer can only ever hurt itself.
//! * No persistent state: the Unix socket file is the only artifact the
//!   engine creates, and it is removed on clean shutdown.
//!
//! # Usage
//!
//! The engine is steered by [`Opts`], the typed mirror of a netcat-style
//! command line; a front-end fills it in and calls [`app::run`]. The
//! pieces compose individually as well:
//!
//! ```no_run
//! use ncrs::{app, Opts};
//!
//! // The equivalent of `ncrs -l 127.0.0.1 4100`: accept one connection
//! // and splice it to stdin/stdout.
//! let opts = Opts::listen(Some("127.0.0.1"), 4100);
//! let code = app::run(&opts);
//! std::process::exit(code);
//! ```
//!
//! Roles map onto four consumers: a connected [`pump::Pump`] between the
//! remote stream and stdio, the serial keep-open acceptor, the
//! [`broker::Broker`] fan-out relay (with chat mode on top), and the
//! [`exec`] subsystem that wires a child process into the stream.

pub mod acl;
pub mod app;
pub mod broker;
pub mod buffer;
pub mod config;
pub mod dial;
pub mod error;
pub mod exec;
pub mod listen;
pub mod net;
pub mod proxy;
pub mod pump;
mod sys;
pub mod tap;
pub mod telnet;

pub use crate::acl::{Acl, AclRule};
pub use crate::config::{
    ExecCommand, ExecOptions, FamilyHint, Opts, Proto, ProxyKind, ProxyOptions, PumpConfig,
    PumpMode, Role, TlsOptions,
};
pub use crate::error::{Error, Result};
pub use crate::net::{PeerAddr, Stream};
pub use crate::pump::{LocalEndpoint, Pump, PumpStats};
