use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::buffer::{CrlfTranslator, RingBuffer, DEFAULT_BUF_SIZE};
use crate::config::{PumpConfig, PumpMode};
use crate::error::{Error, Result};
use crate::net::Stream;
use crate::sys;
use crate::tap::{Dir, Taps};
use crate::telnet::Telnet;

const REMOTE: Token = Token(0);
const LOCAL_IN: Token = Token(1);
const LOCAL_OUT: Token = Token(2);

// Upper bound on one staged read. Filters expand in place, so reads are
// clamped to a fraction of the ring's free space instead.
const SCRATCH: usize = 4096;

// How long the loop may sleep before it re-checks the cancellation flag.
const CANCEL_TICK: Duration = Duration::from_millis(250);

/// The near side of a pump: the process's stdio, or another stream when
/// the engine splices two sockets together.
pub enum LocalEndpoint {
    Stdio(StdioEndpoint),
    Stream(Stream),
}

/// Stdin/stdout in non-blocking mode behind restore-on-drop guards.
///
/// When a descriptor is a regular file the readiness multiplexer cannot
/// take it; that side downgrades to always-ready blocking I/O, which for
/// files does not meaningfully block.
pub struct StdioEndpoint {
    in_fd: RawFd,
    out_fd: RawFd,
    in_always_ready: bool,
    out_always_ready: bool,
    _in_guard: Option<sys::NonblockGuard>,
    _out_guard: Option<sys::NonblockGuard>,
}

impl StdioEndpoint {
    pub fn new() -> io::Result<StdioEndpoint> {
        let in_fd = libc::STDIN_FILENO;
        let out_fd = libc::STDOUT_FILENO;
        let in_always_ready = sys::is_regular_file(in_fd);
        let out_always_ready = sys::is_regular_file(out_fd);
        let _in_guard = if in_always_ready {
            None
        } else {
            Some(sys::NonblockGuard::new(in_fd)?)
        };
        let _out_guard = if out_always_ready {
            None
        } else {
            Some(sys::NonblockGuard::new(out_fd)?)
        };
        Ok(StdioEndpoint {
            in_fd,
            out_fd,
            in_always_ready,
            out_always_ready,
            _in_guard,
            _out_guard,
        })
    }
}

impl LocalEndpoint {
    pub fn stdio() -> io::Result<LocalEndpoint> {
        Ok(LocalEndpoint::Stdio(StdioEndpoint::new()?))
    }

    pub fn stream(stream: Stream) -> LocalEndpoint {
        LocalEndpoint::Stream(stream)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        match self {
            // Stdout stays open; the invoking shell owns it.
            LocalEndpoint::Stdio(_) => Ok(()),
            LocalEndpoint::Stream(s) => s.shutdown_write(),
        }
    }
}

impl Read for LocalEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LocalEndpoint::Stdio(e) => sys::read_fd(e.in_fd, buf),
            LocalEndpoint::Stream(s) => s.read(buf),
        }
    }
}

impl Write for LocalEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LocalEndpoint::Stdio(e) => sys::write_fd(e.out_fd, buf),
            LocalEndpoint::Stream(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LocalEndpoint::Stdio(_) => Ok(()),
            LocalEndpoint::Stream(s) => s.flush(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirState {
    Open,
    SourceEof,
    Draining,
    Closed,
}

struct Direction {
    state: DirState,
    buf: RingBuffer,
    moved: u64,
    eof_at: Option<Instant>,
    next_flush: Option<Instant>,
}

impl Direction {
    fn new(cap: usize) -> Direction {
        Direction {
            state: DirState::Open,
            buf: RingBuffer::with_capacity(cap),
            moved: 0,
            eof_at: None,
            next_flush: None,
        }
    }

    fn source_eof(&mut self) {
        if self.state == DirState::Open {
            self.state = DirState::SourceEof;
            self.eof_at = Some(Instant::now());
        }
    }

    fn flush_allowed(&self, now: Instant) -> bool {
        match self.next_flush {
            Some(t) => now >= t,
            None => true,
        }
    }
}

/// Byte totals a finished pump reports back for verbose accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct PumpStats {
    pub to_remote: u64,
    pub to_local: u64,
    pub cancelled: bool,
}

/// The bidirectional transfer engine.
///
/// A single `Poll` owns both endpoints; each direction runs the
/// Open → SourceEof → Draining → Closed state machine over its own fixed
/// ring. Timeouts and cancellation ride on the multiplexer's wait, never
/// on wall-clock sleeps.
pub struct Pump {
    config: PumpConfig,
    taps: Taps,
    telnet: Option<Telnet>,
    cancel: Arc<AtomicBool>,
    winch: Arc<AtomicBool>,
}

impl Pump {
    pub fn new(config: PumpConfig) -> Pump {
        Pump {
            config,
            taps: Taps::none(),
            telnet: None,
            cancel: Arc::new(AtomicBool::new(false)),
            winch: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn taps(mut self, taps: Taps) -> Pump {
        self.taps = taps;
        self
    }

    /// Interpose the telnet filter on the remote side.
    pub fn telnet(mut self, telnet: Telnet) -> Pump {
        self.telnet = Some(telnet);
        self
    }

    /// Share the process-wide cancellation and window-change flags.
    pub fn signals(mut self, cancel: Arc<AtomicBool>, winch: Arc<AtomicBool>) -> Pump {
        self.cancel = cancel;
        self.winch = winch;
        self
    }

    /// Shuttle bytes between `local` and `remote` until a termination
    /// rule fires. `initial` primes the remote→local direction (the first
    /// datagram a UDP accept consumed to learn its peer).
    pub fn run(
        &mut self,
        local: &mut LocalEndpoint,
        remote: &mut Stream,
        initial: Option<&[u8]>,
    ) -> Result<PumpStats> {
        let poll = Poll::new().map_err(Error::from)?;
        let mut events = Events::with_capacity(16);

        let mut l2r = Direction::new(DEFAULT_BUF_SIZE);
        let mut r2l = Direction::new(DEFAULT_BUF_SIZE);
        match self.config.mode {
            PumpMode::SendOnly => r2l.source_eof(),
            PumpMode::RecvOnly => l2r.source_eof(),
            PumpMode::ZeroIo => {
                // Zero-I/O never reaches the pump; the dialer handles it.
                return Ok(PumpStats::default());
            }
            PumpMode::Bidirectional => {}
        }

        if let Some(init) = initial {
            let n = r2l.buf.push_slice(init);
            if n < init.len() {
                debug!("dropping {} bytes of oversized first datagram", init.len() - n);
            }
            self.taps.observe(Dir::Rcvd, &init[..n]);
            r2l.moved += n as u64;
        }

        let mut crlf = if self.config.crlf_translate {
            Some(CrlfTranslator::new())
        } else {
            None
        };
        let mut telnet_out: Vec<u8> = Vec::new();
        if let Some(t) = &mut self.telnet {
            t.start(&mut telnet_out);
        }
        let mut staged: Vec<u8> = Vec::new();
        let mut scratch = [0u8; SCRATCH];
        let mut last_activity = Instant::now();
        // Send-only still drains the remote socket (and discards) so a
        // chatty peer cannot fill the window or force an RST at close.
        let mut remote_drained = false;

        poll.register(remote, REMOTE, Ready::empty(), PollOpt::level())
            .map_err(Error::from)?;
        match local {
            LocalEndpoint::Stream(s) => {
                poll.register(s, LOCAL_IN, Ready::empty(), PollOpt::level())?;
            }
            LocalEndpoint::Stdio(e) => {
                if !e.in_always_ready {
                    poll.register(&EventedFd(&e.in_fd), LOCAL_IN, Ready::empty(), PollOpt::level())?;
                }
                if !e.out_always_ready {
                    poll.register(&EventedFd(&e.out_fd), LOCAL_OUT, Ready::empty(), PollOpt::level())?;
                }
            }
        }

        let stats = loop {
            if self.cancel.load(Ordering::Relaxed) {
                debug!("pump cancelled");
                break PumpStats {
                    to_remote: l2r.moved,
                    to_local: r2l.moved,
                    cancelled: true,
                };
            }
            if self.winch.swap(false, Ordering::Relaxed) {
                if let Some(t) = &mut self.telnet {
                    t.window_changed(&mut telnet_out);
                }
            }

            let now = Instant::now();
            let want_remote_read = (r2l.state == DirState::Open && !r2l.buf.is_full())
                || (self.config.mode == PumpMode::SendOnly && !remote_drained);
            let want_remote_write =
                (!l2r.buf.is_empty() || !telnet_out.is_empty()) && l2r.flush_allowed(now);
            let want_local_read = l2r.state == DirState::Open && read_budget(&l2r, &crlf, &self.telnet) > 0;
            let want_local_write = !r2l.buf.is_empty() && r2l.flush_allowed(now);

            let mut remote_interest = Ready::empty();
            if want_remote_read {
                remote_interest |= Ready::readable();
            }
            if want_remote_write {
                remote_interest |= Ready::writable();
            }
            poll.reregister(remote, REMOTE, remote_interest, PollOpt::level())?;

            let mut immediate = false;
            match local {
                LocalEndpoint::Stream(s) => {
                    let mut li = Ready::empty();
                    if want_local_read {
                        li |= Ready::readable();
                    }
                    if want_local_write {
                        li |= Ready::writable();
                    }
                    poll.reregister(s, LOCAL_IN, li, PollOpt::level())?;
                }
                LocalEndpoint::Stdio(e) => {
                    if e.in_always_ready {
                        immediate |= want_local_read;
                    } else {
                        let li = if want_local_read { Ready::readable() } else { Ready::empty() };
                        poll.reregister(&EventedFd(&e.in_fd), LOCAL_IN, li, PollOpt::level())?;
                    }
                    if e.out_always_ready {
                        immediate |= want_local_write;
                    } else {
                        let lo = if want_local_write { Ready::writable() } else { Ready::empty() };
                        poll.reregister(&EventedFd(&e.out_fd), LOCAL_OUT, lo, PollOpt::level())?;
                    }
                }
            }

            let timeout = if immediate {
                Duration::from_millis(0)
            } else {
                self.next_wake(now, &l2r, &r2l, last_activity)
            };
            poll.poll(&mut events, Some(timeout))?;

            // Level-triggered service pass: attempt whatever the state
            // machines admit; WouldBlock is the common, cheap answer.
            let mut l2r_progress = false;
            if want_local_read {
                let budget = read_budget(&l2r, &crlf, &self.telnet);
                match local.read(&mut scratch[..budget.min(SCRATCH)]) {
                    Ok(0) => l2r.source_eof(),
                    Ok(n) => {
                        self.taps.observe(Dir::Sent, &scratch[..n]);
                        staged.clear();
                        stage_outbound(&scratch[..n], &mut crlf, &self.telnet, &mut staged);
                        l2r.buf.push_slice(&staged);
                        l2r.moved += n as u64;
                        l2r_progress = true;
                        last_activity = Instant::now();
                    }
                    Err(ref e) if would_block(e) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if !telnet_out.is_empty() {
                match remote.write(&telnet_out) {
                    Ok(n) => {
                        telnet_out.drain(..n);
                        l2r_progress |= n > 0;
                    }
                    Err(ref e) if would_block(e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if !l2r.buf.is_empty() && l2r.flush_allowed(now) {
                match l2r.buf.write_to(remote) {
                    Ok(0) => {}
                    Ok(_) => {
                        l2r_progress = true;
                        last_activity = Instant::now();
                        if let Some(delay) = self.config.delay {
                            l2r.next_flush = Some(Instant::now() + delay);
                        }
                    }
                    Err(ref e) if would_block(e) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if r2l.state == DirState::Open && !r2l.buf.is_full() {
                let budget = r2l.buf.free().min(SCRATCH);
                match remote.read(&mut scratch[..budget]) {
                    Ok(0) => r2l.source_eof(),
                    Ok(n) => {
                        let chunk: &[u8] = if let Some(t) = &mut self.telnet {
                            staged.clear();
                            t.feed(&scratch[..n], &mut staged, &mut telnet_out);
                            &staged
                        } else {
                            &scratch[..n]
                        };
                        self.taps.observe(Dir::Rcvd, chunk);
                        r2l.buf.push_slice(chunk);
                        r2l.moved += chunk.len() as u64;
                        last_activity = Instant::now();
                    }
                    Err(ref e) if would_block(e) => {}
                    Err(e) => return Err(e.into()),
                }
            } else if self.config.mode == PumpMode::SendOnly && !remote_drained {
                match remote.read(&mut scratch) {
                    Ok(0) => remote_drained = true,
                    Ok(_) => {}
                    Err(ref e) if would_block(e) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if !r2l.buf.is_empty() && r2l.flush_allowed(now) {
                match r2l.buf.write_to(local) {
                    Ok(0) => {}
                    Ok(_) => {
                        last_activity = Instant::now();
                        if let Some(delay) = self.config.delay {
                            r2l.next_flush = Some(Instant::now() + delay);
                        }
                    }
                    Err(ref e) if would_block(e) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            // State transitions: a drained direction half-closes its sink
            // (unless suppressed) and finishes.
            if l2r.state == DirState::SourceEof && l2r.buf.is_empty() && telnet_out.is_empty() {
                l2r.state = DirState::Draining;
                if !self.config.no_shutdown {
                    if let Err(e) = remote.shutdown_write() {
                        trace!("shutdown_write on remote: {}", e);
                    }
                }
            }
            if l2r.state == DirState::Draining {
                l2r.state = DirState::Closed;
            }
            if r2l.state == DirState::SourceEof && r2l.buf.is_empty() {
                r2l.state = DirState::Draining;
                if let Err(e) = local.shutdown_write() {
                    trace!("shutdown_write on local: {}", e);
                }
            }
            if r2l.state == DirState::Draining {
                r2l.state = DirState::Closed;
            }

            // Termination rules.
            if l2r.state == DirState::Closed && r2l.state == DirState::Closed {
                break PumpStats {
                    to_remote: l2r.moved,
                    to_local: r2l.moved,
                    cancelled: false,
                };
            }
            if r2l.state == DirState::Closed
                && self.config.mode != PumpMode::SendOnly
                && (!self.config.half_close_enabled
                    || (l2r.buf.is_empty() && !l2r_progress))
            {
                // The remote finished sending; netcat semantics end the
                // session once local input goes quiet. A half-close-
                // enabled session keeps draining toward the remote for
                // as long as bytes are queued or still arriving, so
                // nothing accepted from the local source is discarded.
                break PumpStats {
                    to_remote: l2r.moved,
                    to_local: r2l.moved,
                    cancelled: false,
                };
            }
            if l2r.state == DirState::Closed && !self.config.half_close_enabled {
                break PumpStats {
                    to_remote: l2r.moved,
                    to_local: r2l.moved,
                    cancelled: false,
                };
            }
            if let (Some(quit), Some(eof_at)) = (self.config.quit_after_eof, l2r.eof_at) {
                if eof_at.elapsed() >= quit && r2l.buf.is_empty() {
                    debug!("quit-after-eof expired");
                    break PumpStats {
                        to_remote: l2r.moved,
                        to_local: r2l.moved,
                        cancelled: false,
                    };
                }
            }
            if let Some(idle) = self.config.idle_timeout {
                if last_activity.elapsed() >= idle {
                    return Err(Error::TimeoutIdle);
                }
            }
        };

        Ok(stats)
    }

    fn next_wake(
        &self,
        now: Instant,
        l2r: &Direction,
        r2l: &Direction,
        last_activity: Instant,
    ) -> Duration {
        let mut timeout = CANCEL_TICK;
        if let Some(idle) = self.config.idle_timeout {
            let deadline = last_activity + idle;
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        if let (Some(quit), Some(eof_at)) = (self.config.quit_after_eof, l2r.eof_at) {
            let deadline = eof_at + quit;
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        for dir in &[l2r, r2l] {
            if let Some(next) = dir.next_flush {
                if !dir.buf.is_empty() {
                    timeout = timeout.min(next.saturating_duration_since(now));
                }
            }
        }
        timeout
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted
}

// How much may be read from the local source right now so that the
// staged bytes still fit in the ring after filters expand them: CRLF can
// double, telnet escaping can double again.
fn read_budget(l2r: &Direction, crlf: &Option<CrlfTranslator>, telnet: &Option<Telnet>) -> usize {
    let mut divisor = 1;
    if crlf.is_some() {
        divisor *= 2;
    }
    if telnet.is_some() {
        divisor *= 2;
    }
    l2r.buf.free() / divisor
}

fn stage_outbound(
    input: &[u8],
    crlf: &mut Option<CrlfTranslator>,
    telnet: &Option<Telnet>,
    staged: &mut Vec<u8>,
) {
    match (crlf, telnet.is_some()) {
        (Some(translator), true) => {
            let mut translated = Vec::with_capacity(input.len() * 2);
            translator.translate(input, &mut translated);
            Telnet::escape(&translated, staged);
        }
        (Some(translator), false) => translator.translate(input, staged),
        (None, true) => Telnet::escape(input, staged),
        (None, false) => staged.extend_from_slice(input),
    }
}
