//! End-to-end transfers: both personalities in one process over loopback.
//!
//! Each test reserves a loopback port, runs the receiver and transmitter
//! bring-up on separate threads, and checks the exit codes the
//! personalities would return. A watchdog cancels a wedged run so the test
//! fails instead of hanging.

use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use transfer::personality::{run_get, run_put, setup, Options, Personality};
use transfer::signal::CancelToken;
use transfer::terminal::TXBUF;

fn reserve_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait until something is bound to the port (the listener is up).
fn await_listener(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        match UdpSocket::bind(("127.0.0.1", port)) {
            Ok(probe) => drop(probe),
            Err(_) => return,
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("receiver never bound its port");
}

struct PairOutcome {
    get_code: i32,
    put_code: i32,
}

fn run_pair(
    reregister: bool,
    contiguous: bool,
    repeats: usize,
    cancel_after: Option<Duration>,
) -> PairOutcome {
    let port = reserve_port();
    let cancel = CancelToken::new();

    // Unstick a wedged run; the affected test then fails on its asserts.
    let watchdog_cancel = cancel.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(120));
        watchdog_cancel.set();
    });

    let get_cancel = cancel.clone();
    let get_handle = thread::spawn(move || {
        let opts = Options {
            bind: Some("127.0.0.1".to_string()),
            service: port.to_string(),
            reregister,
            repeats,
            echo: false,
            handshake_timeout: Some(Duration::from_secs(5)),
            cancel: get_cancel,
            ..Options::default()
        };
        let rt = setup(Personality::Get, opts).expect("get setup failed");
        run_get(&rt)
    });

    await_listener(port);

    let put_cancel = cancel.clone();
    let put_handle = thread::spawn(move || {
        let opts = Options {
            peer: Some("127.0.0.1".to_string()),
            service: port.to_string(),
            reregister,
            contiguous,
            repeats,
            echo: false,
            handshake_timeout: Some(Duration::from_secs(5)),
            cancel: put_cancel,
            ..Options::default()
        };
        let rt = setup(Personality::Put, opts).expect("put setup failed");
        run_put(&rt)
    });

    if let Some(delay) = cancel_after {
        thread::sleep(delay);
        cancel.set();
    }

    let get_code = match get_handle.join().expect("get thread panicked") {
        Ok(code) => code,
        Err(_) => 1,
    };
    let put_code = match put_handle.join().expect("put thread panicked") {
        Ok(code) => code,
        Err(_) => 1,
    };
    PairOutcome { get_code, put_code }
}

#[test]
fn test_happy_path_static_mr() {
    let out = run_pair(false, false, 150, None);
    assert_eq!(out.get_code, 0, "receiver failed");
    assert_eq!(out.put_code, 0, "transmitter failed");
}

#[test]
fn test_happy_path_reregister() {
    // Per-transfer registration must be observationally identical.
    let out = run_pair(true, false, 150, None);
    assert_eq!(out.get_code, 0, "receiver failed");
    assert_eq!(out.put_code, 0, "transmitter failed");
}

#[test]
fn test_contiguous_mode() {
    // One remote segment per write forces the fragmentation path.
    let out = run_pair(false, true, 150, None);
    assert_eq!(out.get_code, 0, "receiver failed");
    assert_eq!(out.put_code, 0, "transmitter failed");
}

#[test]
fn test_single_repeat() {
    let out = run_pair(false, false, 1, None);
    assert_eq!(out.get_code, 0, "receiver failed");
    assert_eq!(out.put_code, 0, "transmitter failed");
}

#[test]
fn test_cancel_mid_transfer() {
    // Enough bytes that the cancel lands in steady state.
    let repeats = 2_000_000_000 / TXBUF.len();
    let out = run_pair(false, false, repeats, Some(Duration::from_millis(500)));
    assert_ne!(out.get_code, 0, "cancelled receiver exited cleanly");
    assert_ne!(out.put_code, 0, "cancelled transmitter exited cleanly");
}

#[test]
fn test_peer_absent_times_out() {
    // A transmitter with no receiver must eventually fail.
    let port = reserve_port();
    let opts = Options {
        peer: Some("127.0.0.1".to_string()),
        service: port.to_string(),
        repeats: 1,
        echo: false,
        handshake_timeout: Some(Duration::from_millis(500)),
        ..Options::default()
    };
    let rt = setup(Personality::Put, opts).expect("put setup failed");
    let code = run_put(&rt).unwrap_or(1);
    assert_ne!(code, 0, "transmitter succeeded with no peer");
}
