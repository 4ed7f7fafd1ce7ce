//! End-to-end engine scenarios against real loopback sockets.

use bytes::Bytes;
use querymux::{Config, Engine, Error, ExchangeRequest, Transport};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();

/// Installs a `RUST_LOG`-controlled subscriber once per test binary.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Short timeouts so the expiry scenarios finish quickly.
fn fast_config() -> Config {
    init_tracing();
    let mut config = Config::new();
    config.set_read_timeout(Duration::from_millis(80));
    config.set_read_retry_timeout(Duration::from_millis(60));
    config.set_read_got_timeout(Duration::from_millis(50));
    config
}

fn udp_request(addr: &SocketAddr, payload: &[u8]) -> ExchangeRequest {
    let mut request = ExchangeRequest::new(Transport::Udp);
    request.set_address(addr.ip().to_string());
    request.set_port(addr.port());
    request.add_packet(Bytes::copy_from_slice(payload));
    request
}

/// An echo peer that answers `count` datagrams with their own payload.
fn echo_server(count: usize) -> (SocketAddr, thread::JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 2048];
        for _ in 0..count {
            match socket.recv_from(&mut buf) {
                Ok((len, sender)) => {
                    socket.send_to(&buf[..len], sender).unwrap();
                }
                Err(_) => return,
            }
        }
    });
    (addr, handle)
}

#[test]
fn unanswered_udp_slot_expires_with_empty_result() {
    // Grab a loopback port with no listener behind it.
    let addr = {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };

    let mut config = fast_config();
    config.set_send_retry(1);
    let mut engine = Engine::new(config).unwrap();
    let slot = engine
        .allocate("lonely", "status", udp_request(&addr, b"anyone?"))
        .unwrap();

    let started = Instant::now();
    let results = engine.run().unwrap();
    // One main timeout plus one retry timeout, with plenty of slack.
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(results.len(), 1);
    let result = &results[&slot];
    assert_eq!(result.response_count(), 0);
    assert!(result.first_response_latency.is_none());
    engine.shutdown();
}

#[test]
fn udp_echo_round_trip_records_latency() {
    let (addr, server) = echo_server(1);

    let mut engine = Engine::new(fast_config()).unwrap();
    let mut request = udp_request(&addr, b"marco");
    request.set_response_count(1);
    let slot = engine.allocate("echo", "status", request).unwrap();

    let results = engine.run().unwrap();
    server.join().unwrap();

    let result = &results[&slot];
    assert_eq!(result.responses, vec![Bytes::from_static(b"marco")]);
    assert!(result.first_response_latency.is_some());
    assert!(!result.recreated);
    engine.shutdown();
}

#[test]
fn slots_to_one_endpoint_receive_their_own_replies() {
    let (addr, server) = echo_server(2);

    let mut engine = Engine::new(fast_config()).unwrap();
    let mut alpha = udp_request(&addr, b"alpha");
    alpha.set_response_count(1);
    let mut beta = udp_request(&addr, b"beta");
    beta.set_response_count(1);

    let slot_a = engine.allocate("server-a", "status", alpha).unwrap();
    let slot_b = engine.allocate("server-b", "status", beta).unwrap();
    assert_ne!(slot_a, slot_b);

    let results = engine.run().unwrap();
    server.join().unwrap();

    // Each slot saw only the reply to its own probe even though both
    // targeted the same endpoint.
    assert_eq!(
        results[&slot_a].responses,
        vec![Bytes::from_static(b"alpha")]
    );
    assert_eq!(
        results[&slot_b].responses,
        vec![Bytes::from_static(b"beta")]
    );
    engine.shutdown();
}

#[test]
fn bounded_slot_stops_at_expected_count() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let server = thread::spawn(move || {
        let mut buf = [0u8; 2048];
        if let Ok((_, sender)) = socket.recv_from(&mut buf) {
            for reply in [&b"r1"[..], b"r2", b"r3"] {
                socket.send_to(reply, sender).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        }
    });

    let mut engine = Engine::new(fast_config()).unwrap();
    let mut request = udp_request(&addr, b"give me three");
    request.set_response_count(2);
    let slot = engine.allocate("chatty", "status", request).unwrap();

    let results = engine.run().unwrap();
    server.join().unwrap();

    assert_eq!(
        results[&slot].responses,
        vec![Bytes::from_static(b"r1"), Bytes::from_static(b"r2")]
    );
    engine.shutdown();
}

/// Counts probes arriving at a silent target until it stays quiet.
fn count_probes(socket: UdpSocket) -> usize {
    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 2048];
    let mut count = 0;
    while socket.recv_from(&mut buf).is_ok() {
        count += 1;
    }
    count
}

#[test]
fn no_retry_sends_exactly_once() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();

    let mut config = fast_config();
    config.set_send_retry(3);
    let mut engine = Engine::new(config).unwrap();
    let mut request = udp_request(&addr, b"once");
    request.set_no_retry(true);
    engine.allocate("shy", "status", request).unwrap();

    engine.run().unwrap();
    assert_eq!(count_probes(socket), 1);
    engine.shutdown();
}

#[test]
fn retries_stay_within_the_send_retry_budget() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();

    let mut config = fast_config();
    config.set_send_retry(2);
    let mut engine = Engine::new(config).unwrap();
    engine
        .allocate("silent", "status", udp_request(&addr, b"hello?"))
        .unwrap();

    engine.run().unwrap();
    // Initial send plus at most send_retry retransmissions.
    assert_eq!(count_probes(socket), 3);
    engine.shutdown();
}

#[test]
fn tcp_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 2048];
        let len = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        conn.write_all(b"pong").unwrap();
        // Keep the connection up until the engine is done with it.
        thread::sleep(Duration::from_millis(200));
    });

    let mut engine = Engine::new(fast_config()).unwrap();
    let mut request = ExchangeRequest::new(Transport::Tcp);
    request.set_address(addr.ip().to_string());
    request.set_port(addr.port());
    request.add_packet(&b"ping"[..]);
    request.set_response_count(1);
    let slot = engine.allocate("tcp-peer", "status", request).unwrap();

    let results = engine.run().unwrap();
    server.join().unwrap();

    let result = &results[&slot];
    assert_eq!(result.responses, vec![Bytes::from_static(b"pong")]);
    assert!(!result.recreated);
    engine.shutdown();
}

#[test]
fn tcp_peer_close_is_recovered_without_touching_other_slots() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    // First connection is dropped on the floor; the engine recreates its
    // socket and redials, which the second accept picks up. Left detached
    // in case the redial never comes, so a failure shows up as an
    // assertion rather than a hang.
    thread::spawn(move || {
        let first = listener.accept();
        drop(first);
        if let Ok((conn, _)) = listener.accept() {
            thread::sleep(Duration::from_millis(500));
            drop(conn);
        }
    });
    let (echo_addr, echo) = echo_server(1);

    let mut config = fast_config();
    config.set_send_retry(1);
    let mut engine = Engine::new(config).unwrap();

    let mut stream_req = ExchangeRequest::new(Transport::Tcp);
    stream_req.set_address(addr.ip().to_string());
    stream_req.set_port(addr.port());
    stream_req.add_packet(&b"ping"[..]);
    stream_req.set_no_retry(true);
    let stream_slot = engine
        .allocate("flaky-tcp", "status", stream_req)
        .unwrap();

    let mut udp_req = udp_request(&echo_addr, b"fine");
    udp_req.set_response_count(1);
    let udp_slot = engine.allocate("fine-udp", "status", udp_req).unwrap();

    let results = engine.run().unwrap();
    echo.join().unwrap();

    // The broken stream was recreated and produced no data.
    let stream_result = &results[&stream_slot];
    assert!(stream_result.recreated);
    assert_eq!(stream_result.response_count(), 0);

    // The unrelated UDP slot is untouched.
    let udp_result = &results[&udp_slot];
    assert_eq!(udp_result.responses, vec![Bytes::from_static(b"fine")]);
    assert!(!udp_result.recreated);
    engine.shutdown();
}

#[test]
fn stream_write_failure_redials_and_resends_the_remainder() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    // The first connection is closed after one packet. The next packet
    // lands on the closed socket and triggers a reset, so a later write
    // in the same batch fails mid-stream. The second connection echoes
    // back what it receives, which must be only the tail of the batch.
    // Detached so a missing redial fails an assertion instead of
    // hanging a join.
    thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut first, _) = listener.accept().unwrap();
        let mut buf = [0u8; 2048];
        let _ = first.read(&mut buf);
        drop(first);
        if let Ok((mut second, _)) = listener.accept() {
            if let Ok(len) = second.read(&mut buf) {
                let _ = second.write_all(&buf[..len]);
            }
            thread::sleep(Duration::from_millis(200));
        }
    });
    let (echo_addr, echo) = echo_server(1);

    let mut config = fast_config();
    // Pacing wide enough for the peer's close and the reset to land
    // between consecutive writes.
    config.set_send_delay_stream(Duration::from_millis(10));
    let mut engine = Engine::new(config).unwrap();

    let mut stream_req = ExchangeRequest::new(Transport::Tcp);
    stream_req.set_address(addr.ip().to_string());
    stream_req.set_port(addr.port());
    stream_req.set_packets(vec![
        Bytes::from_static(b"part-1"),
        Bytes::from_static(b"part-2"),
        Bytes::from_static(b"part-3"),
    ]);
    stream_req.set_response_count(1);
    let stream_slot = engine
        .allocate("resetting-tcp", "status", stream_req)
        .unwrap();

    let mut udp_req = udp_request(&echo_addr, b"fine");
    udp_req.set_response_count(1);
    let udp_slot = engine.allocate("fine-udp", "status", udp_req).unwrap();

    let results = engine.run().unwrap();
    echo.join().unwrap();

    // The redialed connection saw only the packets from the failure
    // onward, and the slot carries the recreated flag.
    let stream_result = &results[&stream_slot];
    assert_eq!(
        stream_result.responses,
        vec![Bytes::from_static(b"part-3")]
    );
    assert!(stream_result.recreated);

    // An unrelated slot in the same run is untouched.
    let udp_result = &results[&udp_slot];
    assert_eq!(udp_result.responses, vec![Bytes::from_static(b"fine")]);
    assert!(!udp_result.recreated);
    engine.shutdown();
}

#[cfg(unix)]
#[test]
fn unix_stream_round_trip() {
    use std::os::unix::net::UnixListener;

    let path = std::env::temp_dir().join(format!(
        "querymux-test-{}.sock",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    let server = thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 2048];
        let len = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        conn.write_all(b"pong").unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let mut engine = Engine::new(fast_config()).unwrap();
    let mut request = ExchangeRequest::new(Transport::Unix);
    request.set_path(&path);
    request.add_packet(&b"ping"[..]);
    request.set_response_count(1);
    let slot = engine.allocate("local-peer", "status", request).unwrap();

    let results = engine.run().unwrap();
    server.join().unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(
        results[&slot].responses,
        vec![Bytes::from_static(b"pong")]
    );
    engine.shutdown();
}

#[test]
fn allocation_validates_required_fields() {
    init_tracing();
    let mut engine = Engine::new(Config::new()).unwrap();

    // No packets.
    let mut request = ExchangeRequest::new(Transport::Udp);
    request.set_address("127.0.0.1");
    request.set_port(4000);
    assert!(matches!(
        engine.allocate("t", "q", request),
        Err(Error::MissingField("packets"))
    ));

    // No port.
    let mut request = ExchangeRequest::new(Transport::Udp);
    request.set_address("127.0.0.1");
    request.add_packet(&b"x"[..]);
    assert!(matches!(
        engine.allocate("t", "q", request),
        Err(Error::MissingField("port"))
    ));

    // Port zero counts as missing.
    let mut request = ExchangeRequest::new(Transport::Udp);
    request.set_address("127.0.0.1");
    request.set_port(0);
    request.add_packet(&b"x"[..]);
    assert!(matches!(
        engine.allocate("t", "q", request),
        Err(Error::MissingField("port"))
    ));

    // No address.
    let mut request = ExchangeRequest::new(Transport::Tcp);
    request.set_port(4000);
    request.add_packet(&b"x"[..]);
    assert!(matches!(
        engine.allocate("t", "q", request),
        Err(Error::MissingField("address"))
    ));

    // No path.
    let mut request = ExchangeRequest::new(Transport::Unix);
    request.add_packet(&b"x"[..]);
    assert!(matches!(
        engine.allocate("t", "q", request),
        Err(Error::MissingField("path"))
    ));

    // A failed allocation leaves the engine usable.
    assert!(engine.run().unwrap().is_empty());
}

#[test]
fn shutdown_is_idempotent_and_runs_stay_empty() {
    init_tracing();
    let mut engine = Engine::new(Config::new()).unwrap();
    engine.shutdown();
    engine.shutdown();
    assert!(engine.run().unwrap().is_empty());

    // Same after actual traffic.
    let (addr, server) = echo_server(1);
    let mut request = udp_request(&addr, b"hi");
    request.set_response_count(1);
    engine.allocate("echo", "status", request).unwrap();
    let results = engine.run().unwrap();
    assert_eq!(results.len(), 1);
    server.join().unwrap();

    engine.shutdown();
    engine.shutdown();
    assert!(engine.run().unwrap().is_empty());
}
