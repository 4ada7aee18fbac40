use rand::{Rng, SeedableRng, rngs::StdRng};
use splice_relay::{Relay, RelayOutcome, Side, Termination, relay};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use test_log::test;

const MIB: usize = 1 << 20;

// returns (outer, inner): the test drives `outer`, the relay owns `inner`
fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let outer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (inner, _) = listener.accept().unwrap();
    (outer, inner)
}

fn random_payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

struct Harness {
    a: TcpStream,
    b: TcpStream,
    // clones of the relay's endpoints, for external shutdown
    a_inner: TcpStream,
    b_inner: TcpStream,
    relay: JoinHandle<RelayOutcome>,
}

fn start(buffer_size: usize, use_splice: bool, nonblocking: bool) -> Harness {
    let (a, a_relay) = socket_pair();
    let (b, b_relay) = socket_pair();
    if nonblocking {
        a_relay.set_nonblocking(true).unwrap();
        b_relay.set_nonblocking(true).unwrap();
    }
    let a_inner = a_relay.try_clone().unwrap();
    let b_inner = b_relay.try_clone().unwrap();
    let relay = thread::spawn(move || {
        let mut relay = Relay::new(&a_relay, &b_relay).buffer_size(buffer_size);
        if !use_splice {
            relay = relay.disable_splice();
        }
        relay.run()
    });
    Harness {
        a,
        b,
        a_inner,
        b_inner,
        relay,
    }
}

fn spawn_writer(mut stream: TcpStream, data: Vec<u8>) -> JoinHandle<()> {
    thread::spawn(move || stream.write_all(&data).unwrap())
}

fn spawn_reader(mut stream: TcpStream, len: usize, delay: Duration) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        thread::sleep(delay);
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    })
}

fn reset(stream: TcpStream) {
    use nix::sys::socket::{setsockopt, sockopt::Linger};
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    setsockopt(&stream, Linger, &linger).unwrap();
    drop(stream);
}

/// Sends `payload_a` from A and `payload_b` from B at the same time, then
/// closes A. Returns what B and A received and the relay outcome.
fn exchange(
    h: Harness,
    payload_a: &[u8],
    payload_b: &[u8],
) -> (Vec<u8>, Vec<u8>, RelayOutcome) {
    let writers = [
        spawn_writer(h.a.try_clone().unwrap(), payload_a.to_vec()),
        spawn_writer(h.b.try_clone().unwrap(), payload_b.to_vec()),
    ];
    let at_b = spawn_reader(h.b.try_clone().unwrap(), payload_a.len(), Duration::ZERO);
    let at_a = spawn_reader(h.a.try_clone().unwrap(), payload_b.len(), Duration::ZERO);
    for w in writers {
        w.join().unwrap();
    }
    let at_b = at_b.join().unwrap();
    let at_a = at_a.join().unwrap();

    h.a.shutdown(Shutdown::Write).unwrap();
    let outcome = h.relay.join().unwrap();
    (at_b, at_a, outcome)
}

#[test]
fn ping_is_forwarded_then_close_ends_the_session() {
    let mut h = start(4096, true, false);
    h.a.write_all(b"ping").unwrap();
    h.a.shutdown(Shutdown::Write).unwrap();

    let outcome = h.relay.join().unwrap();
    assert!(
        matches!(outcome.termination, Termination::Closed { side: Side::A }),
        "unexpected termination: {:?}",
        outcome.termination
    );
    assert!(outcome.is_graceful());
    assert_eq!(outcome.stats.a_to_b, 4);
    assert_eq!(outcome.stats.b_to_a, 0);

    // once the relay's sockets and their clones are gone, B sees EOF after the data
    drop(h.a_inner);
    drop(h.b_inner);
    let mut got = Vec::new();
    h.b.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"ping");
}

#[test]
fn close_without_data_returns_promptly() {
    let h = start(4096, true, false);
    h.b.shutdown(Shutdown::Write).unwrap();

    let outcome = h.relay.join().unwrap();
    assert!(matches!(
        outcome.termination,
        Termination::Closed { side: Side::B }
    ));
    assert_eq!(outcome.stats.total(), 0);
}

#[test]
fn one_mib_each_way_with_small_buffer() {
    let payload_a = random_payload(MIB, 1);
    let payload_b = random_payload(MIB, 2);

    let (at_b, at_a, outcome) = exchange(start(4096, true, false), &payload_a, &payload_b);

    assert!(at_b == payload_a, "A->B stream corrupted");
    assert!(at_a == payload_b, "B->A stream corrupted");
    assert!(outcome.is_graceful(), "{:?}", outcome.termination);
    assert_eq!(outcome.stats.a_to_b, MIB as u64);
    assert_eq!(outcome.stats.b_to_a, MIB as u64);
}

#[test]
fn splice_and_copy_paths_deliver_identical_bytes() {
    let payload_a = random_payload(256 * 1024, 3);
    let payload_b = random_payload(64 * 1024, 4);

    let (spliced_b, spliced_a, spliced) =
        exchange(start(8192, true, false), &payload_a, &payload_b);
    let (copied_b, copied_a, copied) =
        exchange(start(8192, false, false), &payload_a, &payload_b);

    assert!(spliced_b == copied_b && copied_b == payload_a);
    assert!(spliced_a == copied_a && copied_a == payload_b);
    assert_eq!(copied.stats.spliced, 0);
    #[cfg(target_os = "linux")]
    assert!(spliced.stats.spliced > 0);
    assert_eq!(spliced.stats.total(), copied.stats.total());
}

#[test]
fn non_blocking_endpoints_with_slow_reader() {
    for use_splice in [true, false] {
        let payload = random_payload(512 * 1024, 5);
        let mut h = start(4096, use_splice, true);

        let writer = spawn_writer(h.a.try_clone().unwrap(), payload.clone());
        let reader = spawn_reader(
            h.b.try_clone().unwrap(),
            payload.len(),
            Duration::from_millis(200),
        );
        writer.join().unwrap();
        let got = reader.join().unwrap();
        assert!(got == payload, "splice={} corrupted stream", use_splice);

        h.a.shutdown(Shutdown::Write).unwrap();
        let outcome = h.relay.join().unwrap();
        assert!(matches!(
            outcome.termination,
            Termination::Closed { side: Side::A }
        ));
        drop(h.a_inner);
        drop(h.b_inner);
        let mut rest = Vec::new();
        h.b.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}

#[test]
fn peer_reset_ends_the_session_despite_pending_data() {
    let mut h = start(4096, true, false);
    reset(h.a);
    thread::sleep(Duration::from_millis(50));
    h.b.write_all(b"pending").unwrap();

    let outcome = h.relay.join().unwrap();
    assert!(
        matches!(
            outcome.termination,
            Termination::EndpointError { side: Side::A }
        ),
        "unexpected termination: {:?}",
        outcome.termination
    );
    assert!(!outcome.is_graceful());
}

#[test]
fn reset_on_b_is_attributed_to_b() {
    let mut h = start(4096, false, false);
    h.a.write_all(b"to b").unwrap();
    thread::sleep(Duration::from_millis(50));
    reset(h.b);

    let outcome = h.relay.join().unwrap();
    assert!(
        matches!(
            outcome.termination,
            Termination::EndpointError { side: Side::B }
        ),
        "unexpected termination: {:?}",
        outcome.termination
    );
}

#[test]
fn external_shutdown_stops_a_running_session() {
    let mut h = start(4096, true, false);
    h.a.write_all(b"before").unwrap();
    let mut got = [0u8; 6];
    h.b.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"before");

    h.b_inner.shutdown(Shutdown::Both).unwrap();
    let outcome = h.relay.join().unwrap();
    assert!(
        matches!(outcome.termination, Termination::Hangup { side: Side::B }),
        "unexpected termination: {:?}",
        outcome.termination
    );
    assert_eq!(outcome.stats.a_to_b, 6);
    drop(h.a_inner);
}

#[test]
fn zero_buffer_size_is_rejected_without_touching_endpoints() {
    let (mut a, a_relay) = socket_pair();
    let (_b, b_relay) = socket_pair();

    let outcome = relay(&a_relay, &b_relay, 0);
    assert!(matches!(outcome.termination, Termination::InvalidBufferSize));
    assert!(outcome.termination.is_setup_failure());

    // endpoints are untouched and still usable by the caller
    a.write_all(b"x").unwrap();
    let mut buf = [0u8; 1];
    (&a_relay).read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"x");
}

#[test]
fn stats_callbacks_see_every_chunk() {
    let (mut a, a_relay) = socket_pair();
    let (mut b, b_relay) = socket_pair();
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let relay = {
        let a_to_b = a_to_b.clone();
        let b_to_a = b_to_a.clone();
        thread::spawn(move || {
            Relay::new(&a_relay, &b_relay)
                .buffer_size(1024)
                .with_stats(
                    move |n| {
                        a_to_b.fetch_add(n as u64, Ordering::Relaxed);
                    },
                    move |n| {
                        b_to_a.fetch_add(n as u64, Ordering::Relaxed);
                    },
                )
                .run()
        })
    };

    let payload = random_payload(10_000, 6);
    a.write_all(&payload).unwrap();
    let mut got = vec![0u8; payload.len()];
    b.read_exact(&mut got).unwrap();
    b.write_all(b"ack").unwrap();
    let mut ack = [0u8; 3];
    a.read_exact(&mut ack).unwrap();
    a.shutdown(Shutdown::Write).unwrap();

    let outcome = relay.join().unwrap();
    assert!(got == payload);
    assert_eq!(a_to_b.load(Ordering::Relaxed), 10_000);
    assert_eq!(b_to_a.load(Ordering::Relaxed), 3);
    assert_eq!(outcome.stats.a_to_b, 10_000);
    assert_eq!(outcome.stats.b_to_a, 3);
}

#[test]
fn concurrent_sessions_do_not_interfere() {
    let sessions: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let payload_a = random_payload(128 * 1024, 10 + i);
                let payload_b = random_payload(128 * 1024, 20 + i);
                let (at_b, at_a, outcome) =
                    exchange(start(4096, true, false), &payload_a, &payload_b);
                assert!(at_b == payload_a);
                assert!(at_a == payload_b);
                assert!(outcome.is_graceful());
            })
        })
        .collect();
    for s in sessions {
        s.join().unwrap();
    }
}
