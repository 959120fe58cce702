use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{error, info, warn};

use crate::broker::Broker;
use crate::config::{Opts, PumpMode, Role};
use crate::dial;
use crate::error::{Error, Result};
use crate::exec;
use crate::listen::{Acceptor, Listener};
use crate::pump::{LocalEndpoint, Pump};
use crate::sys;
use crate::tap::Taps;
use crate::telnet::Telnet;

/// Run one invocation to completion and map the outcome to the exit-code
/// contract: 0 for normal completion (zero-I/O success included), 1 for
/// transport failures, 2 for configuration mistakes.
pub fn run(opts: &Opts) -> i32 {
    match try_run(opts) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

/// Like [`run`], but hands the error back instead of logging it.
pub fn try_run(opts: &Opts) -> Result<i32> {
    opts.validate()?;
    sys::ignore_sigpipe();
    let cancel = Arc::new(AtomicBool::new(false));
    let winch = Arc::new(AtomicBool::new(false));
    sys::install_signal_flags(&cancel, &winch).map_err(Error::from)?;

    match opts.role {
        Role::Connect => run_connect(opts, &cancel, &winch),
        Role::Listen => run_listen(opts, &cancel, &winch),
    }
}

fn taps_for(opts: &Opts, append: bool) -> Result<Taps> {
    Taps::new(
        opts.output_file.as_deref(),
        append,
        opts.hex_dump_file.as_deref(),
    )
}

fn run_connect(opts: &Opts, cancel: &Arc<AtomicBool>, winch: &Arc<AtomicBool>) -> Result<i32> {
    let mut stream = dial::connect(opts)?;

    if opts.pump.mode == PumpMode::ZeroIo {
        info!("connection to {} succeeded", stream.peer_address());
        stream.close();
        return Ok(0);
    }

    let mut pump = Pump::new(opts.pump.clone())
        .taps(taps_for(opts, opts.output_append)?)
        .signals(Arc::clone(cancel), Arc::clone(winch));
    if opts.telnet {
        pump = pump.telnet(Telnet::new());
    }
    let mut local = LocalEndpoint::stdio().map_err(Error::from)?;
    let stats = pump.run(&mut local, &mut stream, None)?;
    info!(
        "{} bytes sent, {} bytes received",
        stats.to_remote, stats.to_local
    );
    Ok(0)
}

fn run_listen(opts: &Opts, cancel: &Arc<AtomicBool>, winch: &Arc<AtomicBool>) -> Result<i32> {
    let mut listener = Listener::bind(opts)?;

    if opts.broker || opts.chat {
        let mut broker = Broker::new(
            opts.chat,
            opts.max_conns,
            opts.acl.clone(),
            Arc::clone(cancel),
        );
        broker.run(&mut listener)?;
        return Ok(0);
    }

    if let Some(exec_opts) = &opts.exec {
        let unprotected = !opts.acl.has_allow_rules() && !exec_opts.allow_unprotected;
        let mut warned = false;
        loop {
            let accepted = match Acceptor::new(&mut listener, &opts.acl, cancel).next()? {
                Some(a) => a,
                None => return Ok(0),
            };
            if unprotected && !warned {
                warn!(
                    "EXECUTING COMMANDS FOR UNRESTRICTED PEERS; use an allow list to constrain who connects"
                );
                warned = true;
            }
            let peer = accepted.peer.clone();
            let result = exec::run_session(exec_opts, accepted.stream, &peer, cancel);
            match result {
                Ok(()) => {}
                Err(e) if opts.keep_open && e.is_per_connection() => {
                    warn!("session with {} failed: {}", peer, e);
                }
                Err(e) => return Err(e),
            }
            if !opts.keep_open {
                return Ok(0);
            }
        }
    }

    // Plain pump consumers: single-shot or keep-open serial.
    let mut first = true;
    loop {
        let accepted = match Acceptor::new(&mut listener, &opts.acl, cancel).next()? {
            Some(a) => a,
            None => return Ok(0),
        };
        let peer = accepted.peer.clone();
        // Later keep-open sessions append to the output tap rather than
        // truncating the earlier ones away.
        let append = opts.output_append || !first;
        first = false;

        let mut pump = Pump::new(opts.pump.clone())
            .taps(taps_for(opts, append)?)
            .signals(Arc::clone(cancel), Arc::clone(winch));
        if opts.telnet {
            pump = pump.telnet(Telnet::new());
        }
        let mut local = LocalEndpoint::stdio().map_err(Error::from)?;
        let mut stream = accepted.stream;
        let result = pump.run(&mut local, &mut stream, accepted.initial.as_deref());
        match result {
            Ok(stats) => info!(
                "{}: {} bytes sent, {} bytes received",
                peer, stats.to_remote, stats.to_local
            ),
            Err(e) if opts.keep_open && e.is_per_connection() => {
                warn!("session with {} failed: {}", peer, e);
            }
            Err(e) => return Err(e),
        }
        if !opts.keep_open {
            return Ok(0);
        }
    }
}
