#[cfg(unix)]
pub use self::unix::{
    NonblockGuard,
    PollStatus,
    TermiosGuard,
    UmaskGuard,
    ignore_sigpipe,
    install_signal_flags,
    is_regular_file,
    kill_process,
    poll_fd,
    read_fd,
    slc_table,
    socket_file_mode,
    winsize,
    write_fd,
};

#[cfg(unix)]
mod unix;
