use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use ncrs::listen::Listener;
use ncrs::{app, dial, Acl, AclRule, Opts, PumpMode};

use crate::{init, reserve_port};

#[test]
fn zero_io_probe_exit_codes() {
    init();
    let open_port = reserve_port();
    let _server = TcpListener::bind(("127.0.0.1", open_port)).unwrap();
    let closed_port = reserve_port();

    let mut opts = Opts::connect("127.0.0.1", open_port);
    opts.pump.mode = PumpMode::ZeroIo;
    assert_eq!(app::try_run(&opts).unwrap(), 0);

    let mut opts = Opts::connect("127.0.0.1", closed_port);
    opts.pump.mode = PumpMode::ZeroIo;
    let err = app::try_run(&opts).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn configuration_errors_exit_2() {
    init();
    let mut opts = Opts::connect("127.0.0.1", 1);
    opts.broker = true; // broker without listen
    let err = app::try_run(&opts).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn acl_deny_closes_the_connection() {
    init();
    let port = reserve_port();
    let opts = Opts::listen(Some("127.0.0.1"), port);
    let mut listener = Listener::bind(&opts).unwrap();
    let deny: Acl = Acl::parse(&[], &["127.0.0.1"]).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    thread::sleep(Duration::from_millis(100));

    // The acceptor rejects and closes; nothing is handed out.
    assert!(listener.accept(0, &deny).unwrap().is_none());

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0, "expected a prompt close");
}

#[test]
fn acl_allow_admits_loopback() {
    init();
    let port = reserve_port();
    let opts = Opts::listen(Some("127.0.0.1"), port);
    let mut listener = Listener::bind(&opts).unwrap();
    let allow: Acl = Acl::parse(&["127.0.0.1"], &[]).unwrap();

    let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    thread::sleep(Duration::from_millis(100));

    let accepted = listener.accept(0, &allow).unwrap();
    assert!(accepted.is_some());
}

#[test]
fn allow_list_is_exhaustive_for_other_peers() {
    init();
    let port = reserve_port();
    let opts = Opts::listen(Some("127.0.0.1"), port);
    let mut listener = Listener::bind(&opts).unwrap();
    // Loopback is not covered by this allow list.
    let allow = Acl::new(vec!["203.0.113.0/24".parse::<AclRule>().unwrap()], vec![]);

    let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    thread::sleep(Duration::from_millis(100));

    assert!(listener.accept(0, &allow).unwrap().is_none());
}

#[test]
fn resolution_failure_is_a_transport_error() {
    init();
    let opts = Opts::connect("no.such.host.invalid.", 80);
    let err = dial::connect(&opts).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}
