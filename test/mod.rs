extern crate env_logger;
extern crate ncrs;
extern crate tempdir;

use std::io::Read;
use std::net::TcpListener;
use std::time::{Duration, Instant};

mod test_exec;
mod test_probe;
mod test_pump;
mod test_udp;

pub fn init() {
    let _ = env_logger::init();
}

/// Grab an ephemeral port that was free a moment ago.
pub fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// A socketpair where one end is a pump-ready local endpoint and the
/// other is the test driver's plain blocking socket.
pub fn pair_local() -> (ncrs::LocalEndpoint, std::os::unix::net::UnixStream) {
    let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
    let wrapped = ncrs::net::UnixStream::from_stream(a).unwrap();
    (
        ncrs::LocalEndpoint::stream(ncrs::Stream::unix(wrapped)),
        b,
    )
}

/// Read from `r` until the collected bytes contain `needle`. The reader
/// must already have a short read timeout set; this loops on timeouts
/// until the deadline and panics if the pattern never shows up.
pub fn read_until<R: Read>(r: &mut R, needle: &[u8], timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    while !contains(&collected, needle) {
        if Instant::now() >= deadline {
            panic!(
                "timed out waiting for {:?}; got {:?}",
                String::from_utf8_lossy(needle),
                String::from_utf8_lossy(&collected)
            );
        }
        match r.read(&mut buf) {
            Ok(0) => panic!(
                "peer closed while waiting for {:?}; got {:?}",
                String::from_utf8_lossy(needle),
                String::from_utf8_lossy(&collected)
            ),
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("read failed: {}", e),
        }
    }
    collected
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
