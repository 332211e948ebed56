//! Shared helpers for integration tests.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();
static INIT_ENV: Once = Once::new();

/// Initialize test logging; safe to call from every test, first call wins.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Points both session launch variables at `/bin/true` so sessions spawn
/// harmless children; the actual back-end is the in-process echo server.
pub fn init_session_programs() {
    INIT_ENV.call_once(|| {
        std::env::set_var("VNCD_SERVER", "/bin/true");
        std::env::set_var("VNCD_SESSION", "/bin/true");
    });
}

/// Runs a TCP echo server on `127.0.0.1:port`, standing in for the
/// per-user back-end VNC server. Accepts any number of connections.
pub fn spawn_echo_backend(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).expect("echo backend bind");
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { return };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
}

/// Connects to the daemon, retrying while it comes up.
pub fn connect_with_retry(port: u16, deadline: Duration) -> TcpStream {
    let start = Instant::now();
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(e) if start.elapsed() < deadline => {
                let _ = e;
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("could not connect to 127.0.0.1:{port}: {e}"),
        }
    }
}

/// Writes `line` and reads until the same bytes come back.
pub fn expect_echo(stream: &mut TcpStream, line: &[u8], timeout: Duration) {
    stream.set_read_timeout(Some(timeout)).unwrap();
    stream.write_all(line).unwrap();
    let mut got = Vec::new();
    let mut buf = [0u8; 256];
    let start = Instant::now();
    while got.len() < line.len() {
        match stream.read(&mut buf) {
            Ok(0) => panic!("relay closed before echoing {line:?}"),
            Ok(n) => got.extend_from_slice(&buf[..n]),
            Err(e) if start.elapsed() < timeout => {
                let _ = e;
            }
            Err(e) => panic!("no echo for {line:?} within {timeout:?}: {e}"),
        }
    }
    assert_eq!(got, line);
}
