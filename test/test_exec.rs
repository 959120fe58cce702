use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ncrs::exec;
use ncrs::net::UnixStream;
use ncrs::{Error, ExecCommand, ExecOptions, PeerAddr, Stream};

use crate::init;

fn session_pair() -> (Stream, StdUnixStream) {
    let (a, b) = StdUnixStream::pair().unwrap();
    (Stream::unix(UnixStream::from_stream(a).unwrap()), b)
}

fn run(opts: &ExecOptions, stream: Stream) -> ncrs::Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    exec::run_session(opts, stream, &PeerAddr::Unnamed, &cancel)
}

#[test]
fn cat_echoes_and_exits_on_half_close() {
    init();
    let (stream, driver) = session_pair();

    let mut driver_write = driver.try_clone().unwrap();
    let reader = thread::spawn(move || {
        let mut driver = driver;
        let mut collected = Vec::new();
        driver.read_to_end(&mut collected).unwrap();
        collected
    });

    let writer = thread::spawn(move || {
        driver_write.write_all(b"echo test\n").unwrap();
        driver_write.shutdown(Shutdown::Write).unwrap();
    });

    let opts = ExecOptions::new(ExecCommand::Direct(vec!["/bin/cat".into()]));
    run(&opts, stream).unwrap();

    assert_eq!(reader.join().unwrap(), b"echo test\n");
    writer.join().unwrap();
}

#[test]
fn shell_command_output_reaches_the_stream() {
    init();
    let (stream, driver) = session_pair();

    let reader = thread::spawn(move || {
        let mut driver = driver;
        let mut collected = Vec::new();
        driver.read_to_end(&mut collected).unwrap();
        collected
    });

    let opts = ExecOptions::new(ExecCommand::Shell("printf 'from the shell\\n'".into()));
    run(&opts, stream).unwrap();

    assert_eq!(reader.join().unwrap(), b"from the shell\n");
}

#[test]
fn execution_timeout_kills_the_child() {
    init();
    let (stream, _driver) = session_pair();

    let mut opts = ExecOptions::new(ExecCommand::Direct(vec![
        "/bin/sleep".into(),
        "5".into(),
    ]));
    opts.execution_timeout = Some(Duration::from_millis(200));

    let started = Instant::now();
    match run(&opts, stream) {
        Err(Error::TimeoutExecution) => {}
        other => panic!("expected TimeoutExecution, got {:?}", other),
    }
    // Includes the TERM grace windows, but nowhere near the sleep's 5s.
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "shutdown dragged on for {:?}",
        started.elapsed()
    );
}

#[test]
fn idle_timeout_fires_when_the_child_stays_silent() {
    init();
    let (stream, _driver) = session_pair();

    let mut opts = ExecOptions::new(ExecCommand::Direct(vec![
        "/bin/sleep".into(),
        "5".into(),
    ]));
    opts.idle_timeout = Some(Duration::from_millis(200));

    match run(&opts, stream) {
        Err(Error::TimeoutIdle) => {}
        other => panic!("expected TimeoutIdle, got {:?}", other),
    }
}

#[test]
fn oversized_pipe_buffers_are_rejected_before_spawn() {
    init();
    let (stream, _driver) = session_pair();

    let mut opts = ExecOptions::new(ExecCommand::Direct(vec!["/bin/cat".into()]));
    opts.max_total_buffer_bytes = 1;
    match run(&opts, stream) {
        Err(Error::InvalidConfiguration(_)) => {}
        other => panic!("expected InvalidConfiguration, got {:?}", other),
    }
}

#[test]
fn stderr_interleaves_when_requested() {
    init();
    let (stream, driver) = session_pair();

    let reader = thread::spawn(move || {
        let mut driver = driver;
        let mut collected = Vec::new();
        driver.read_to_end(&mut collected).unwrap();
        collected
    });

    let mut opts = ExecOptions::new(ExecCommand::Shell(
        "printf 'out\\n'; printf 'err\\n' >&2".into(),
    ));
    opts.redirect_stderr = true;
    run(&opts, stream).unwrap();

    let collected = reader.join().unwrap();
    assert!(crate::contains(&collected, b"out\n"));
    assert!(crate::contains(&collected, b"err\n"));
}

#[test]
fn repeated_sessions_leak_nothing() {
    init();
    // A leak of pipes or zombies shows up quickly over sequential runs.
    for _ in 0..15 {
        let (stream, driver) = session_pair();
        let reader = thread::spawn(move || {
            let mut driver = driver;
            let mut collected = Vec::new();
            driver.read_to_end(&mut collected).unwrap();
            collected
        });
        let opts = ExecOptions::new(ExecCommand::Shell("printf 'tick\\n'".into()));
        run(&opts, stream).unwrap();
        assert_eq!(reader.join().unwrap(), b"tick\n");
    }
}
