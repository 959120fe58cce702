use std::io::{Read, Write};
use std::net::{Shutdown, UdpSocket};
use std::thread;
use std::time::Duration;

use ncrs::{dial, Opts, Proto, Pump};

use crate::{init, pair_local, reserve_port};

#[test]
fn datagram_round_trip() {
    init();
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    // One-shot UDP echo peer.
    let echo = thread::spawn(move || {
        let mut buf = [0u8; 2048];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        server.send_to(b"pong\n", from).unwrap();
        buf[..n].to_vec()
    });

    let mut opts = Opts::connect("127.0.0.1", port);
    opts.proto = Proto::Udp;
    // A datagram peer never sends EOF; the quit timer ends the session.
    opts.pump.quit_after_eof = Some(Duration::from_millis(500));
    let mut remote = dial::connect(&opts).unwrap();
    let (mut local, driver) = pair_local();

    let mut driver_write = driver.try_clone().unwrap();
    let writer = thread::spawn(move || {
        driver_write.write_all(b"ping\n").unwrap();
        driver_write.shutdown(Shutdown::Write).unwrap();
    });

    let stats = Pump::new(opts.pump.clone())
        .run(&mut local, &mut remote, None)
        .unwrap();
    assert_eq!(stats.to_remote, 5);
    assert_eq!(stats.to_local, 5);

    // The local pair end only reaches EOF once the endpoint is gone.
    drop(local);
    let mut driver = driver;
    let mut got = Vec::new();
    driver.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"pong\n");

    assert_eq!(echo.join().unwrap(), b"ping\n");
    writer.join().unwrap();
}

#[test]
fn listener_accept_primes_the_first_datagram() {
    init();
    let port = reserve_port();
    let mut opts = Opts::listen(Some("127.0.0.1"), port);
    opts.proto = Proto::Udp;
    opts.pump.quit_after_eof = Some(Duration::from_millis(400));

    let mut listener = ncrs::listen::Listener::bind(&opts).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.connect(("127.0.0.1", port)).unwrap();
    client.send(b"first datagram\n").unwrap();

    // The accept consumes that datagram to learn the peer; it must not
    // be lost.
    thread::sleep(Duration::from_millis(100));
    let acl = ncrs::Acl::default();
    let accepted = listener.accept(0, &acl).unwrap().expect("datagram pending");
    assert_eq!(accepted.initial.as_deref(), Some(&b"first datagram\n"[..]));

    // And the connected session answers back to the right peer.
    let (mut local, driver) = pair_local();
    let mut driver_write = driver.try_clone().unwrap();
    driver_write.write_all(b"reply\n").unwrap();
    driver_write.shutdown(Shutdown::Write).unwrap();

    let mut stream = accepted.stream;
    let stats = Pump::new(opts.pump.clone())
        .run(&mut local, &mut stream, accepted.initial.as_deref())
        .unwrap();
    assert_eq!(stats.to_remote, 6);

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 64];
    let n = client.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"reply\n");

    // The primed bytes came through to the local side.
    drop(local);
    let mut driver = driver;
    let mut got = Vec::new();
    driver.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"first datagram\n");
}
