use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::buffer::RingBuffer;
use crate::config::{ExecCommand, ExecOptions};
use crate::error::{Error, Result};
use crate::net::{PeerAddr, Stream};
use crate::sys;

const NET: Token = Token(0);
const CHILD_OUT: Token = Token(1);
const CHILD_ERR: Token = Token(2);

const CHUNK: usize = 4096;
// Splice threads wake at least this often to observe the stop flag.
const SPLICE_TICK_MS: i32 = 100;
const REAP_GRACE: Duration = Duration::from_millis(500);
const REAP_POLL: Duration = Duration::from_millis(20);

fn channel_slots(bytes: usize) -> usize {
    (bytes / CHUNK).max(1)
}

/// Wire a spawned child into the remote stream for one session.
///
/// The child's stdout (and optionally stderr) is spliced to the network,
/// the network to its stdin. Teardown follows a strict order: stop and
/// close the parent-owned pipe ends, join the splice threads, reap the
/// child (escalating TERM then KILL), and only then release the stream.
/// Reaping before joining would leave a splicer parked on a pipe whose
/// other end nobody holds.
pub fn run_session(
    opts: &ExecOptions,
    mut stream: Stream,
    peer: &PeerAddr,
    cancel: &Arc<AtomicBool>,
) -> Result<()> {
    let total = opts.stdin_buf + opts.stdout_buf + opts.stderr_buf;
    if total > opts.max_total_buffer_bytes {
        return Err(Error::InvalidConfiguration(format!(
            "exec pipe buffers ({} bytes) exceed the {} byte cap",
            total, opts.max_total_buffer_bytes
        )));
    }

    let mut command = match &opts.command {
        ExecCommand::Direct(argv) => {
            let mut c = Command::new(&argv[0]);
            c.args(&argv[1..]);
            info!("executing {:?} for {}", argv[0], peer);
            c
        }
        ExecCommand::Shell(line) => {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(line);
            info!("executing shell command {:?} for {}", line, peer);
            c
        }
    };
    command.stdin(Stdio::piped()).stdout(Stdio::piped());
    command.stderr(if opts.redirect_stderr {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });

    let mut child = command.spawn().map_err(Error::from)?;
    let spawned_at = Instant::now();
    let accepted_at = spawned_at;

    let stop = Arc::new(AtomicBool::new(false));
    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    let stdin_handle = take_pipe(child.stdin.take(), "stdin")?;
    let (stdin_tx, stdin_rx) = mpsc::sync_channel::<Vec<u8>>(channel_slots(opts.stdin_buf));
    threads.push(spawn_pipe_writer(stdin_handle, Arc::clone(&stop), stdin_rx));

    let stdout_handle = take_pipe(child.stdout.take(), "stdout")?;
    let (out_reg, out_ready) = Registration::new2();
    let (out_tx, out_rx) = mpsc::sync_channel::<Vec<u8>>(channel_slots(opts.stdout_buf));
    threads.push(spawn_pipe_reader(
        stdout_handle.as_raw_fd(),
        Arc::clone(&stop),
        out_tx,
        out_ready.clone(),
    ));

    let mut stderr_handle: Option<ChildStderr> = None;
    let mut err_rx: Option<Receiver<Vec<u8>>> = None;
    let mut err_reg: Option<Registration> = None;
    let mut err_ready: Option<SetReadiness> = None;
    if opts.redirect_stderr {
        let handle = take_pipe(child.stderr.take(), "stderr")?;
        let (reg, ready) = Registration::new2();
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(channel_slots(opts.stderr_buf));
        threads.push(spawn_pipe_reader(
            handle.as_raw_fd(),
            Arc::clone(&stop),
            tx,
            ready.clone(),
        ));
        stderr_handle = Some(handle);
        err_rx = Some(rx);
        err_reg = Some(reg);
        err_ready = Some(ready);
    }

    let poll = Poll::new().map_err(Error::from)?;
    poll.register(&stream, NET, Ready::readable(), PollOpt::level())?;
    poll.register(&out_reg, CHILD_OUT, Ready::readable(), PollOpt::level())?;
    if let Some(reg) = &err_reg {
        poll.register(reg, CHILD_ERR, Ready::readable(), PollOpt::level())?;
    }

    let mut events = Events::with_capacity(16);
    let mut net_out = RingBuffer::with_capacity(opts.stdout_buf.max(2 * CHUNK));
    let mut scratch = [0u8; CHUNK];
    let mut stdin_tx = Some(stdin_tx);
    let mut pending_stdin: Option<Vec<u8>> = None;
    let mut out_eof = false;
    let mut err_eof = !opts.redirect_stderr;
    let mut remote_eof = false;
    let mut saw_activity = false;
    let mut last_activity = Instant::now();

    // Every exit path funnels through the break value so the ordered
    // shutdown below runs exactly once.
    let outcome: Result<()> = loop {
        if cancel.load(Ordering::Relaxed) {
            debug!("exec session cancelled");
            break Ok(());
        }

        let mut net_interest = Ready::empty();
        if !remote_eof && pending_stdin.is_none() {
            net_interest |= Ready::readable();
        }
        if !net_out.is_empty() {
            net_interest |= Ready::writable();
        }
        if let Err(e) = poll.reregister(&stream, NET, net_interest, PollOpt::level()) {
            break Err(e.into());
        }

        let now = Instant::now();
        let mut timeout = Duration::from_millis(SPLICE_TICK_MS as u64);
        if let (Some(t), false) = (opts.connection_timeout, saw_activity) {
            timeout = timeout.min((accepted_at + t).saturating_duration_since(now));
        }
        if let Some(t) = opts.idle_timeout {
            timeout = timeout.min((last_activity + t).saturating_duration_since(now));
        }
        if let Some(t) = opts.execution_timeout {
            timeout = timeout.min((spawned_at + t).saturating_duration_since(now));
        }
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            break Err(e.into());
        }

        // Pull child output. Readiness is cleared before draining; the
        // threads send first and set readiness second, so nothing is lost.
        let _ = out_ready.set_readiness(Ready::empty());
        if let Some(ready) = &err_ready {
            let _ = ready.set_readiness(Ready::empty());
        }
        while net_out.free() >= CHUNK {
            match out_rx.try_recv() {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        out_eof = true;
                    } else {
                        net_out.push_slice(&chunk);
                        saw_activity = true;
                        last_activity = Instant::now();
                    }
                }
                Err(_) => break,
            }
        }
        if let Some(rx) = &err_rx {
            while net_out.free() >= CHUNK {
                match rx.try_recv() {
                    Ok(chunk) => {
                        if chunk.is_empty() {
                            err_eof = true;
                        } else {
                            net_out.push_slice(&chunk);
                            saw_activity = true;
                            last_activity = Instant::now();
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        if !net_out.is_empty() {
            match net_out.write_to(&mut stream) {
                Ok(0) => {}
                Ok(_) => {
                    saw_activity = true;
                    last_activity = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => break Err(e.into()),
            }
        }

        if let Some(chunk) = pending_stdin.take() {
            match forward_stdin(&stdin_tx, chunk) {
                Some(chunk) => pending_stdin = Some(chunk),
                None => {}
            }
        }
        if !remote_eof && pending_stdin.is_none() {
            match stream.read(&mut scratch) {
                Ok(0) => {
                    debug!("remote EOF; closing child stdin");
                    remote_eof = true;
                    stdin_tx = None;
                }
                Ok(n) => {
                    saw_activity = true;
                    last_activity = Instant::now();
                    pending_stdin = forward_stdin(&stdin_tx, scratch[..n].to_vec());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => break Err(e.into()),
            }
        }

        if let Ok(Some(status)) = child.try_wait() {
            debug!("child exited with {}", status);
        }

        if out_eof && err_eof && net_out.is_empty() {
            debug!("child output fully relayed");
            break Ok(());
        }

        let now = Instant::now();
        if let (Some(t), false) = (opts.connection_timeout, saw_activity) {
            if now >= accepted_at + t {
                break Err(Error::TimeoutConnection);
            }
        }
        if let Some(t) = opts.idle_timeout {
            if now >= last_activity + t {
                break Err(Error::TimeoutIdle);
            }
        }
        if let Some(t) = opts.execution_timeout {
            if now >= spawned_at + t {
                break Err(Error::TimeoutExecution);
            }
        }
    };

    ordered_shutdown(
        &stop,
        stdin_tx,
        stdout_handle,
        stderr_handle,
        out_rx,
        err_rx,
        threads,
        &mut child,
    );
    drop(stream);

    if let Err(e) = &outcome {
        warn!("exec session with {} ended: {}", peer, e);
    }
    outcome
}

fn take_pipe<T>(pipe: Option<T>, what: &str) -> Result<T> {
    pipe.ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("child {} pipe missing", what),
        ))
    })
}

// Hand a chunk to the stdin splicer; a full queue returns it for retry.
fn forward_stdin(tx: &Option<SyncSender<Vec<u8>>>, chunk: Vec<u8>) -> Option<Vec<u8>> {
    match tx {
        Some(tx) => match tx.try_send(chunk) {
            Ok(()) => None,
            Err(TrySendError::Full(chunk)) => Some(chunk),
            // The writer is gone (child closed its stdin); drop the data
            // the way a closed pipe would.
            Err(TrySendError::Disconnected(_)) => None,
        },
        None => None,
    }
}

/// child pipe → channel. The thread never owns the pipe handle: it polls
/// the raw descriptor with a short tick, so closing the handle from the
/// harness (POLLNVAL) or the stop flag both end it promptly.
fn spawn_pipe_reader(
    fd: RawFd,
    stop: Arc<AtomicBool>,
    tx: SyncSender<Vec<u8>>,
    ready: SetReadiness,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; CHUNK];
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let status = match sys::poll_fd(fd, true, false, SPLICE_TICK_MS) {
                Ok(s) => s,
                Err(_) => break,
            };
            if status.invalid {
                break;
            }
            if !status.readable && !status.hup && !status.error {
                continue;
            }
            match sys::read_fd(fd, &mut buf) {
                Ok(0) => {
                    let _ = tx.send(Vec::new());
                    let _ = ready.set_readiness(Ready::readable());
                    break;
                }
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                    let _ = ready.set_readiness(Ready::readable());
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    let _ = tx.send(Vec::new());
                    let _ = ready.set_readiness(Ready::readable());
                    break;
                }
            }
        }
    })
}

/// channel → child stdin. Owns the handle so its drop is what delivers
/// EOF to the child once the queue drains or the harness disconnects.
fn spawn_pipe_writer(
    stdin: ChildStdin,
    stop: Arc<AtomicBool>,
    rx: Receiver<Vec<u8>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let fd = stdin.as_raw_fd();
        'outer: loop {
            let chunk = match rx.recv_timeout(Duration::from_millis(SPLICE_TICK_MS as u64)) {
                Ok(c) => c,
                Err(RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let mut offset = 0;
            while offset < chunk.len() {
                if stop.load(Ordering::Relaxed) {
                    break 'outer;
                }
                let status = match sys::poll_fd(fd, false, true, SPLICE_TICK_MS) {
                    Ok(s) => s,
                    Err(_) => break 'outer,
                };
                if status.invalid || status.error || status.hup {
                    break 'outer;
                }
                if !status.writable {
                    continue;
                }
                match sys::write_fd(fd, &chunk[offset..]) {
                    Ok(n) => offset += n,
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break 'outer,
                }
            }
        }
        // stdin drops here, closing the child's input.
    })
}

/// The shutdown order that keeps this subsystem deadlock- and
/// zombie-free: parent pipe ends first, then joins, then the reap.
fn ordered_shutdown(
    stop: &Arc<AtomicBool>,
    stdin_tx: Option<SyncSender<Vec<u8>>>,
    stdout_handle: ChildStdout,
    stderr_handle: Option<ChildStderr>,
    out_rx: Receiver<Vec<u8>>,
    err_rx: Option<Receiver<Vec<u8>>>,
    threads: Vec<JoinHandle<()>>,
    child: &mut Child,
) {
    stop.store(true, Ordering::Relaxed);
    drop(stdin_tx);
    drop(stdout_handle);
    drop(stderr_handle);
    drop(out_rx);
    drop(err_rx);

    for t in threads {
        let _ = t.join();
    }

    if !wait_with_grace(child, REAP_GRACE) {
        debug!("child ignored pipe closure; sending SIGTERM");
        sys::kill_process(child.id(), libc::SIGTERM);
        if !wait_with_grace(child, REAP_GRACE) {
            warn!("child ignored SIGTERM; sending SIGKILL");
            sys::kill_process(child.id(), libc::SIGKILL);
            let _ = child.wait();
        }
    }
}

fn wait_with_grace(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(REAP_POLL);
    }
}
