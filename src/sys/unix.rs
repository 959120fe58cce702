use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Outcome of a single `poll(2)` on one descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollStatus {
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub error: bool,
    /// The descriptor was closed out from under us (POLLNVAL). Splice
    /// threads treat this as their shutdown signal.
    pub invalid: bool,
}

impl PollStatus {
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.hup || self.error || self.invalid
    }
}

/// Wait for readiness on a single raw descriptor.
///
/// `timeout_ms < 0` blocks indefinitely. EINTR reads as "nothing ready" so
/// callers re-check their stop flags instead of erroring out.
pub fn poll_fd(fd: RawFd, want_read: bool, want_write: bool, timeout_ms: i32) -> io::Result<PollStatus> {
    let mut events: libc::c_short = 0;
    if want_read {
        events |= libc::POLLIN;
    }
    if want_write {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(PollStatus::default());
        }
        return Err(err);
    }
    Ok(PollStatus {
        readable: pfd.revents & libc::POLLIN != 0,
        writable: pfd.revents & libc::POLLOUT != 0,
        hup: pfd.revents & libc::POLLHUP != 0,
        error: pfd.revents & libc::POLLERR != 0,
        invalid: pfd.revents & libc::POLLNVAL != 0,
    })
}

pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn fcntl_get(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(flags)
    }
}

fn fcntl_set(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Puts a descriptor into non-blocking mode and restores the original
/// flags on drop. Stdio descriptors are shared with the invoking shell, so
/// the original state must survive every exit path.
#[derive(Debug)]
pub struct NonblockGuard {
    fd: RawFd,
    orig: libc::c_int,
}

impl NonblockGuard {
    pub fn new(fd: RawFd) -> io::Result<NonblockGuard> {
        let orig = fcntl_get(fd)?;
        fcntl_set(fd, orig | libc::O_NONBLOCK)?;
        Ok(NonblockGuard { fd, orig })
    }
}

impl Drop for NonblockGuard {
    fn drop(&mut self) {
        let _ = fcntl_set(self.fd, self.orig);
    }
}

/// Applies a restrictive umask for the duration of a Unix-socket bind.
pub struct UmaskGuard {
    prev: libc::mode_t,
}

impl UmaskGuard {
    pub fn new(mask: libc::mode_t) -> UmaskGuard {
        let prev = unsafe { libc::umask(mask) };
        UmaskGuard { prev }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::umask(self.prev);
        }
    }
}

/// Permission bits of a freshly bound socket file.
pub fn socket_file_mode(path: &Path) -> io::Result<u32> {
    Ok(fs::metadata(path)?.permissions().mode())
}

/// True when the descriptor refers to a regular file. epoll refuses
/// regular files, so the pump downgrades such endpoints to always-ready.
pub fn is_regular_file(fd: RawFd) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return false;
    }
    (st.st_mode & libc::S_IFMT) == libc::S_IFREG
}

/// Clears the terminal ECHO flag, restoring the original termios on drop.
#[derive(Debug)]
pub struct TermiosGuard {
    fd: RawFd,
    orig: libc::termios,
}

impl TermiosGuard {
    /// Turn off local echo on `fd` (the controlling terminal).
    pub fn echo_off(fd: RawFd) -> io::Result<TermiosGuard> {
        let mut orig: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut orig) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut raw = orig;
        raw.c_lflag &= !libc::ECHO;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TermiosGuard { fd, orig })
    }
}

impl Drop for TermiosGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
        }
    }
}

/// Current terminal dimensions as (columns, rows).
///
/// Falls back to the COLUMNS/LINES environment when there is no tty.
pub fn winsize() -> Option<(u16, u16)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        return Some((ws.ws_col, ws.ws_row));
    }
    let cols = std::env::var("COLUMNS").ok()?.parse().ok()?;
    let rows = std::env::var("LINES").ok()?.parse().ok()?;
    Some((cols, rows))
}

// RFC 1184 SLC function numbers backed by the local tty's control chars.
const SLC_FROM_CC: &[(u8, usize)] = &[
    (3, libc::VINTR as usize),    // SLC_IP
    (7, libc::VQUIT as usize),    // SLC_ABORT
    (8, libc::VEOF as usize),     // SLC_EOF
    (9, libc::VSUSP as usize),    // SLC_SUSP
    (10, libc::VERASE as usize),  // SLC_EC
    (11, libc::VKILL as usize),   // SLC_EL
    (12, libc::VWERASE as usize), // SLC_EW
    (13, libc::VREPRINT as usize), // SLC_RP
    (14, libc::VLNEXT as usize),  // SLC_LNEXT
    (15, libc::VSTART as usize),  // SLC_XON
    (16, libc::VSTOP as usize),   // SLC_XOFF
];

/// The local tty's special-character table as (SLC function, value) pairs,
/// used to answer telnet LINEMODE SLC requests. Empty when stdin is not a
/// terminal.
pub fn slc_table() -> Vec<(u8, u8)> {
    let mut t: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut t) } != 0 {
        return Vec::new();
    }
    SLC_FROM_CC
        .iter()
        .map(|&(func, idx)| (func, t.c_cc[idx]))
        .collect()
}

/// SIGPIPE is ignored process-wide; writes observe `BrokenPipe` instead.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Route SIGINT/SIGTERM into the cancellation flag and SIGWINCH into the
/// window-change flag. Handlers do nothing beyond setting the atomics.
pub fn install_signal_flags(cancel: &Arc<AtomicBool>, winch: &Arc<AtomicBool>) -> io::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(cancel))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(cancel))?;
    signal_hook::flag::register(signal_hook::consts::SIGWINCH, Arc::clone(winch))?;
    Ok(())
}

/// Deliver `signal` to a child process by pid.
pub fn kill_process(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}
