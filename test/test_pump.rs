use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use ncrs::{dial, Error, Opts, Pump, PumpMode};

use crate::{init, pair_local, reserve_port};

fn echo_server(port: u16) -> thread::JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match sock.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sock.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn capture_server(port: u16) -> thread::JoinHandle<Vec<u8>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut collected = Vec::new();
        let _ = sock.read_to_end(&mut collected);
        collected
    })
}

#[test]
fn loopback_echo_round_trip() {
    init();
    let port = reserve_port();
    let server = echo_server(port);

    let opts = Opts::connect("127.0.0.1", port);
    let mut remote = dial::connect(&opts).unwrap();
    let (mut local, driver) = pair_local();

    let mut driver_write = driver.try_clone().unwrap();
    let writer = thread::spawn(move || {
        driver_write.write_all(b"Hello, World!\n").unwrap();
        driver_write.shutdown(Shutdown::Write).unwrap();
    });

    let stats = Pump::new(opts.pump.clone())
        .run(&mut local, &mut remote, None)
        .unwrap();
    assert_eq!(stats.to_remote, 14);
    assert_eq!(stats.to_local, 14);

    let mut driver = driver;
    let mut echoed = Vec::new();
    driver.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"Hello, World!\n");

    writer.join().unwrap();
    server.join().unwrap();
}

#[test]
fn crlf_translation_on_the_wire() {
    init();
    let port = reserve_port();
    let server = capture_server(port);

    let mut opts = Opts::connect("127.0.0.1", port);
    opts.pump.crlf_translate = true;
    let mut remote = dial::connect(&opts).unwrap();
    let (mut local, driver) = pair_local();

    let mut driver_write = driver.try_clone().unwrap();
    let writer = thread::spawn(move || {
        // A lone \n is expanded; an existing \r\n passes through.
        driver_write.write_all(b"one\ntwo\r\nthree\n").unwrap();
        driver_write.shutdown(Shutdown::Write).unwrap();
    });

    Pump::new(opts.pump.clone())
        .run(&mut local, &mut remote, None)
        .unwrap();
    drop(remote);

    assert_eq!(server.join().unwrap(), b"one\r\ntwo\r\nthree\r\n");
    writer.join().unwrap();
}

#[test]
fn send_only_discards_remote_data() {
    init();
    let port = reserve_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        // Talk at a peer that is not listening.
        sock.write_all(b"ignored chatter\n").unwrap();
        let mut collected = Vec::new();
        sock.read_to_end(&mut collected).unwrap();
        collected
    });

    let mut opts = Opts::connect("127.0.0.1", port);
    opts.pump.mode = PumpMode::SendOnly;
    let mut remote = dial::connect(&opts).unwrap();
    let (mut local, driver) = pair_local();

    let mut driver_write = driver.try_clone().unwrap();
    let writer = thread::spawn(move || {
        driver_write.write_all(b"payload\n").unwrap();
        driver_write.shutdown(Shutdown::Write).unwrap();
    });

    let stats = Pump::new(opts.pump.clone())
        .run(&mut local, &mut remote, None)
        .unwrap();
    assert_eq!(stats.to_remote, 8);
    assert_eq!(stats.to_local, 0, "send-only must not relay remote bytes");

    assert_eq!(server.join().unwrap(), b"payload\n");
    writer.join().unwrap();
}

#[test]
fn quit_after_eof_expires() {
    init();
    let port = reserve_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    // The server accepts and then goes quiet without closing.
    let server = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_secs(5));
        drop(sock);
    });

    let mut opts = Opts::connect("127.0.0.1", port);
    opts.pump.quit_after_eof = Some(Duration::from_millis(300));
    let mut remote = dial::connect(&opts).unwrap();
    let (mut local, driver) = pair_local();
    driver.shutdown(Shutdown::Write).unwrap();

    let started = Instant::now();
    Pump::new(opts.pump.clone())
        .run(&mut local, &mut remote, None)
        .unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(250) && elapsed < Duration::from_secs(3),
        "quit-after-eof fired after {:?}",
        elapsed
    );
    drop(driver);
    drop(server);
}

#[test]
fn idle_timeout_fires_when_nothing_moves() {
    init();
    let port = reserve_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let server = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_secs(5));
        drop(sock);
    });

    let mut opts = Opts::connect("127.0.0.1", port);
    opts.pump.idle_timeout = Some(Duration::from_millis(300));
    let mut remote = dial::connect(&opts).unwrap();
    let (mut local, driver) = pair_local();

    let started = Instant::now();
    match Pump::new(opts.pump.clone()).run(&mut local, &mut remote, None) {
        Err(Error::TimeoutIdle) => {}
        other => panic!("expected TimeoutIdle, got {:?}", other.map(|s| s.to_local)),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    drop(driver);
    drop(server);
}

#[test]
fn half_close_keeps_download_running() {
    init();
    let port = reserve_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    // The server waits for client EOF, then sends its payload: only a
    // half-closing client ever sees the reply.
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = Vec::new();
        sock.read_to_end(&mut buf).unwrap();
        sock.write_all(b"late reply\n").unwrap();
    });

    let opts = Opts::connect("127.0.0.1", port);
    let mut remote = dial::connect(&opts).unwrap();
    let (mut local, driver) = pair_local();
    driver.shutdown(Shutdown::Write).unwrap();

    let stats = Pump::new(opts.pump.clone())
        .run(&mut local, &mut remote, None)
        .unwrap();
    assert_eq!(stats.to_local, 11);

    let mut driver = driver;
    let mut got = Vec::new();
    driver.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"late reply\n");
    server.join().unwrap();
}

#[test]
fn remote_eof_does_not_discard_queued_upload() {
    init();
    let port = reserve_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    // The server lets the upload get in flight, half-closes, and then
    // dawdles before draining: the pump observes remote EOF while most
    // of the upload is still queued behind write backpressure.
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(50));
        sock.shutdown(Shutdown::Write).unwrap();
        thread::sleep(Duration::from_millis(400));
        let mut collected = Vec::new();
        sock.read_to_end(&mut collected).unwrap();
        collected
    });

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    let opts = Opts::connect("127.0.0.1", port);
    let mut remote = dial::connect(&opts).unwrap();
    let (mut local, driver) = pair_local();

    let mut driver_write = driver.try_clone().unwrap();
    let to_send = payload.clone();
    let writer = thread::spawn(move || {
        driver_write.write_all(&to_send).unwrap();
        driver_write.shutdown(Shutdown::Write).unwrap();
    });

    let stats = Pump::new(opts.pump.clone())
        .run(&mut local, &mut remote, None)
        .unwrap();

    // Every byte the pump accepted from the local source reaches the
    // remote: bytes in equals bytes out for the direction, and the whole
    // upload survives the early remote EOF.
    assert_eq!(stats.to_remote, payload.len() as u64);
    assert_eq!(server.join().unwrap(), payload);
    writer.join().unwrap();
    drop(driver);
}

#[test]
fn stream_write_after_shutdown_is_broken_pipe() {
    init();
    let port = reserve_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let server = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        let mut sock = sock;
        sock.write_all(b"parting gift").unwrap();
        sock
    });

    let opts = Opts::connect("127.0.0.1", port);
    let mut remote = dial::connect(&opts).unwrap();
    remote.shutdown_write().unwrap();
    // Idempotent.
    remote.shutdown_write().unwrap();

    use std::io::Write as _;
    match remote.write(b"nope") {
        Err(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
        other => panic!("expected BrokenPipe, got {:?}", other),
    }

    // Reads still work until the peer is done.
    let _keep = server.join().unwrap();
    let mut got = [0u8; 32];
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut n = 0;
    use std::io::Read as _;
    while n == 0 && Instant::now() < deadline {
        match remote.read(&mut got) {
            Ok(read) => n = read,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10))
            }
            Err(e) => panic!("read failed: {}", e),
        }
    }
    assert_eq!(&got[..n], b"parting gift");
}

#[test]
fn connect_timeout_is_prompt() {
    init();
    // TEST-NET-1 traffic goes nowhere; depending on the sandbox the
    // connect either times out or fails fast. Both are non-success.
    let mut opts = Opts::connect("192.0.2.1", 80);
    opts.connect_timeout = Some(Duration::from_millis(900));
    let started = Instant::now();
    assert!(dial::connect(&opts).is_err());
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "dialer hung for {:?}",
        started.elapsed()
    );
}
