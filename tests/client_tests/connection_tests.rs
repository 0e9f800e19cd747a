//! Connection Tests
//!
//! End-to-end tests of `Connection` against scripted fake servers:
//! - Basic call / response
//! - Remote failures returned as data
//! - Out-of-order routing across concurrent callers
//! - Timeouts, late responses, and isolation between calls
//! - Malformed frames and lost sockets

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use seqmux::protocol::{encode_frame, encode_varint_field, FrameBuffer, RequestHeader, ResponseHeader};
use seqmux::{Config, Connection, MuxError};

// =============================================================================
// Helper Functions
// =============================================================================

/// Accept one connection on an ephemeral port and hand it to `script`
fn spawn_server<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(stream);
    });
    (port, handle)
}

/// Read exactly `count` request frames; extra frames stay buffered
fn read_requests(
    stream: &mut TcpStream,
    frames: &mut FrameBuffer,
    count: usize,
) -> Vec<(RequestHeader, Bytes)> {
    let mut requests = Vec::new();
    let mut chunk = [0u8; 4096];

    while requests.len() < count {
        match frames.next_frame().unwrap() {
            Some(frame) => {
                let header = RequestHeader::decode(&frame.header).unwrap();
                requests.push((header, frame.body));
            }
            None => {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "client closed early");
                frames.extend(&chunk[..n]);
            }
        }
    }
    requests
}

fn request_buffer() -> FrameBuffer {
    FrameBuffer::new(1024 * 1024)
}

fn respond(stream: &mut TcpStream, sequence: u64, status: u32, description: &str, body: &[u8]) {
    let header = ResponseHeader::new(sequence, status, description).encode();
    stream.write_all(&encode_frame(&header, body).unwrap()).unwrap();
    stream.flush().unwrap();
}

/// Block until the server side sees the client hang up
fn wait_for_eof(stream: &mut TcpStream) {
    let mut sink = [0u8; 256];
    while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
}

fn connect(port: u16) -> Connection {
    Connection::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap()
}

fn wait_until_closed(conn: &Connection) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !conn.is_closed() {
        assert!(Instant::now() < deadline, "connection never closed");
        thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// Basic Call Tests
// =============================================================================

#[test]
fn test_call_success() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        let requests = read_requests(&mut stream, &mut frames, 1);
        let (header, body) = &requests[0];
        assert_eq!(header.command, 2);
        assert_eq!(header.operation_type, 3);
        assert!(body.is_empty());
        respond(&mut stream, header.sequence, 200, "", &[0x08, 0x01]);
        wait_for_eof(&mut stream);
    });

    let conn = connect(port);
    let result = conn.call(2, 3, b"", Duration::from_secs(1)).unwrap();

    assert!(result.success);
    assert_eq!(result.status_code, 200);
    assert_eq!(result.status_description, "");
    assert_eq!(&result.body[..], &[0x08, 0x01]);
    assert_eq!(conn.pending_count(), 0);

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_call_remote_failure_is_data() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        let requests = read_requests(&mut stream, &mut frames, 1);
        respond(&mut stream, requests[0].0.sequence, 500, "backend unavailable", b"");
        wait_for_eof(&mut stream);
    });

    let conn = connect(port);
    let result = conn.call(1, 1, b"req", Duration::from_secs(1)).unwrap();

    assert!(!result.success);
    assert_eq!(result.status_code, 500);
    assert_eq!(result.status_description, "backend unavailable");

    match result.into_result() {
        Err(MuxError::Remote {
            status_code,
            description,
        }) => {
            assert_eq!(status_code, 500);
            assert_eq!(description, "backend unavailable");
        }
        other => panic!("Expected remote error, got {:?}", other),
    }

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_sequential_calls_use_new_sequences() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let requests = read_requests(&mut stream, &mut frames, 1);
            let seq = requests[0].0.sequence;
            seen.push(seq);
            respond(&mut stream, seq, 200, "", &requests[0].1);
        }
        seen.dedup();
        assert_eq!(seen.len(), 3);
        wait_for_eof(&mut stream);
    });

    let conn = connect(port);
    for i in 0..3u8 {
        let result = conn.call(1, 0, &[i], Duration::from_secs(1)).unwrap();
        assert_eq!(&result.body[..], &[i]);
    }

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_response_written_byte_by_byte() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        let requests = read_requests(&mut stream, &mut frames, 1);
        let header = ResponseHeader::new(requests[0].0.sequence, 200, "slow").encode();
        let bytes = encode_frame(&header, b"dribbled").unwrap();
        for byte in bytes {
            stream.write_all(&[byte]).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        wait_for_eof(&mut stream);
    });

    let conn = connect(port);
    let result = conn.call(1, 0, b"x", Duration::from_secs(5)).unwrap();
    assert_eq!(result.status_description, "slow");
    assert_eq!(&result.body[..], b"dribbled");

    drop(conn);
    server.join().unwrap();
}

// =============================================================================
// Routing Tests
// =============================================================================

#[test]
fn test_concurrent_calls_answered_in_reverse() {
    const CALLERS: usize = 8;

    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        let requests = read_requests(&mut stream, &mut frames, CALLERS);
        // Echo each body back, last request first
        for (header, body) in requests.iter().rev() {
            respond(&mut stream, header.sequence, 200, "", body);
        }
        wait_for_eof(&mut stream);
    });

    let conn = Arc::new(connect(port));
    let mut handles = vec![];

    for i in 0..CALLERS {
        let c = Arc::clone(&conn);
        handles.push(thread::spawn(move || {
            let body = format!("caller-{}", i).into_bytes();
            let result = c.call(10, i as u32, &body, Duration::from_secs(5)).unwrap();
            assert!(result.success);
            assert_eq!(result.body, body);
            result.sequence
        }));
    }

    let mut sequences: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    sequences.sort_unstable();
    sequences.dedup();
    assert_eq!(sequences.len(), CALLERS);
    assert_eq!(conn.pending_count(), 0);

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_many_concurrent_calls_interleaved_frames() {
    const CALLERS: usize = 16;
    const CALLS_EACH: usize = 20;

    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        for _ in 0..CALLERS * CALLS_EACH {
            let requests = read_requests(&mut stream, &mut frames, 1);
            let (header, body) = &requests[0];
            respond(&mut stream, header.sequence, 200, "", body);
        }
        wait_for_eof(&mut stream);
    });

    let conn = Arc::new(connect(port));
    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let c = Arc::clone(&conn);
            thread::spawn(move || {
                for j in 0..CALLS_EACH {
                    // Bodies large enough to span several socket reads
                    let body = vec![(i * CALLS_EACH + j) as u8; 3000];
                    let result = c.call(1, 0, &body, Duration::from_secs(10)).unwrap();
                    assert_eq!(result.body, body);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    drop(conn);
    server.join().unwrap();
}

// =============================================================================
// Timeout Tests
// =============================================================================

#[test]
fn test_call_times_out_and_evicts() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        read_requests(&mut stream, &mut frames, 1);
        // Never answer
        wait_for_eof(&mut stream);
    });

    let conn = connect(port);
    let started = Instant::now();
    let err = conn.call(1, 0, b"", Duration::from_millis(500)).unwrap_err();
    let elapsed = started.elapsed();

    let sequence = match err {
        MuxError::Timeout { sequence, timeout } => {
            assert_eq!(timeout, Duration::from_millis(500));
            sequence
        }
        other => panic!("Expected timeout, got {:?}", other),
    };
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(3));
    assert!(!conn.is_pending(sequence));
    assert_eq!(conn.pending_count(), 0);
    assert!(!conn.is_closed());

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_timeout_isolation_and_late_response() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        let requests = read_requests(&mut stream, &mut frames, 2);
        let fast = requests.iter().find(|(_, b)| &b[..] == b"fast").unwrap().0.sequence;
        let patient = requests.iter().find(|(_, b)| &b[..] == b"patient").unwrap().0.sequence;

        // Let the short call give up, then answer it anyway
        thread::sleep(Duration::from_millis(500));
        respond(&mut stream, fast, 200, "", b"too late");
        respond(&mut stream, patient, 200, "", b"on time");
        wait_for_eof(&mut stream);
    });

    let conn = Arc::new(connect(port));

    let c = Arc::clone(&conn);
    let short = thread::spawn(move || c.call(1, 0, b"fast", Duration::from_millis(150)));

    let patient = conn.call(1, 0, b"patient", Duration::from_secs(5)).unwrap();
    assert_eq!(&patient.body[..], b"on time");

    let short = short.join().unwrap();
    assert!(short.unwrap_err().is_timeout());

    // The late response was dropped and the connection is still usable
    assert!(!conn.is_closed());
    assert_eq!(conn.pending_count(), 0);

    drop(conn);
    server.join().unwrap();
}

// =============================================================================
// Protocol Error Tests
// =============================================================================

#[test]
fn test_malformed_frame_dropped_connection_survives() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        let requests = read_requests(&mut stream, &mut frames, 1);

        // Header without a sequence number
        let bad = encode_frame(&encode_varint_field(4, 200), b"junk").unwrap();
        stream.write_all(&bad).unwrap();
        // Envelope whose inner lengths disagree
        let mut broken = Vec::new();
        broken.extend_from_slice(&12u32.to_le_bytes());
        broken.extend_from_slice(&0u32.to_le_bytes());
        broken.extend_from_slice(&9u32.to_le_bytes());
        broken.extend_from_slice(&[0u8; 4]);
        stream.write_all(&broken).unwrap();

        respond(&mut stream, requests[0].0.sequence, 200, "", b"good");
        wait_for_eof(&mut stream);
    });

    let conn = connect(port);
    let result = conn.call(1, 0, b"", Duration::from_secs(2)).unwrap();
    assert_eq!(&result.body[..], b"good");
    assert!(!conn.is_closed());

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_repeated_malformed_frames_close_connection() {
    let (port, server) = spawn_server(|mut stream| {
        for _ in 0..3 {
            let bad = encode_frame(&encode_varint_field(4, 200), b"").unwrap();
            stream.write_all(&bad).unwrap();
        }
        stream.flush().unwrap();
        wait_for_eof(&mut stream);
    });

    let config = Config::builder().max_consecutive_protocol_errors(3).build();
    let conn = Connection::connect_with("127.0.0.1", port, config).unwrap();
    wait_until_closed(&conn);

    let err = conn.call(1, 0, b"", Duration::from_secs(1)).unwrap_err();
    assert!(err.is_connection());

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_response_without_status_is_protocol_error() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        let requests = read_requests(&mut stream, &mut frames, 1);
        let header = encode_varint_field(2, requests[0].0.sequence);
        stream.write_all(&encode_frame(&header, b"").unwrap()).unwrap();
        wait_for_eof(&mut stream);
    });

    let conn = connect(port);
    let err = conn.call(1, 0, b"", Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err, MuxError::Protocol(_)));

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_oversized_response_closes_connection() {
    let (port, server) = spawn_server(|mut stream| {
        let mut frames = request_buffer();
        read_requests(&mut stream, &mut frames, 1);
        stream.write_all(&10_000u32.to_le_bytes()).unwrap();
        wait_for_eof(&mut stream);
    });

    let config = Config::builder().max_frame_size(1024).build();
    let conn = Connection::connect_with("127.0.0.1", port, config).unwrap();
    let err = conn.call(1, 0, b"", Duration::from_millis(300)).unwrap_err();
    assert!(err.is_timeout());
    wait_until_closed(&conn);

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_oversized_request_rejected_before_write() {
    let (port, server) = spawn_server(|mut stream| {
        wait_for_eof(&mut stream);
    });

    let config = Config::builder().max_frame_size(64).build();
    let conn = Connection::connect_with("127.0.0.1", port, config).unwrap();

    let err = conn.call(1, 0, &[0u8; 100], Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, MuxError::FrameTooLarge { .. }));
    assert_eq!(conn.pending_count(), 0);
    assert!(!conn.is_closed());

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_stalled_writer_does_not_outlive_call_timeouts() {
    let (release, hold) = mpsc::channel::<()>();
    let (port, server) = spawn_server(move |stream| {
        // Accept but never read, so the client's send buffer fills up
        let _ = hold.recv();
        drop(stream);
    });

    let conn = Arc::new(connect(port));

    let bulk = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            let body = vec![0u8; 15 * 1024 * 1024];
            let started = Instant::now();
            let result = conn.call(1, 0, &body, Duration::from_millis(200));
            (result, started.elapsed())
        })
    };

    // Let the bulk call take the writer first
    thread::sleep(Duration::from_millis(30));
    let started = Instant::now();
    let small = conn.call(2, 0, b"x", Duration::from_millis(100));
    let small_elapsed = started.elapsed();

    let (bulk, bulk_elapsed) = bulk.join().unwrap();

    assert!(matches!(small, Err(MuxError::Timeout { .. })), "small call: {:?}", small);
    assert!(small_elapsed < Duration::from_secs(1), "small call took {:?}", small_elapsed);
    assert!(matches!(bulk, Err(MuxError::Timeout { .. })), "bulk call: {:?}", bulk);
    assert!(bulk_elapsed < Duration::from_secs(2), "bulk call took {:?}", bulk_elapsed);

    // The bulk frame went out only in part
    assert!(conn.is_closed());
    assert_eq!(conn.pending_count(), 0);

    release.send(()).unwrap();
    drop(conn);
    server.join().unwrap();
}

// =============================================================================
// Connection Lifecycle Tests
// =============================================================================

#[test]
fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = Connection::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap_err();
    assert!(err.is_connection());
}

#[test]
fn test_connect_rejects_invalid_config() {
    let config = Config::builder().read_buffer_size(0).build();
    let err = Connection::connect_with("127.0.0.1", 1, config).unwrap_err();
    assert!(matches!(err, MuxError::Config(_)));
}

#[test]
fn test_connect_rejects_zero_timeouts_and_error_budget() {
    let err = Connection::connect("127.0.0.1", 1, Duration::ZERO).unwrap_err();
    assert!(matches!(err, MuxError::Config(_)));

    let config = Config::builder().max_consecutive_protocol_errors(0).build();
    let err = Connection::connect_with("127.0.0.1", 1, config).unwrap_err();
    assert!(matches!(err, MuxError::Config(_)));
}

#[test]
fn test_connect_with_sub_millisecond_timeout() {
    let (port, server) = spawn_server(|mut stream| {
        wait_for_eof(&mut stream);
    });

    let conn = Connection::connect("127.0.0.1", port, Duration::from_micros(500)).unwrap();
    assert_eq!(conn.config().connect_timeout_ms, 1);

    drop(conn);
    server.join().unwrap();
}

#[test]
fn test_write_failure_evicts_and_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    // Read half stays open, so the reader thread keeps running
    stream.shutdown(Shutdown::Write).unwrap();
    let conn = Connection::from_stream(stream, Config::default()).unwrap();
    assert!(!conn.is_closed());

    let started = Instant::now();
    let err = conn.call(1, 0, b"lost", Duration::from_secs(10)).unwrap_err();
    assert!(err.is_connection(), "Expected connection error, got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(conn.pending_count(), 0);
    assert!(conn.is_closed());

    drop(conn);
    wait_for_eof(&mut peer);
}

#[test]
fn test_server_hangup_fails_later_calls_fast() {
    let (port, server) = spawn_server(|stream| {
        drop(stream);
    });

    let conn = connect(port);
    server.join().unwrap();
    wait_until_closed(&conn);

    let started = Instant::now();
    let err = conn.call(1, 0, b"", Duration::from_secs(10)).unwrap_err();
    assert!(err.is_connection());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_close_is_idempotent() {
    let (port, server) = spawn_server(|mut stream| {
        wait_for_eof(&mut stream);
    });

    let conn = connect(port);
    assert!(!conn.is_closed());
    assert!(!conn.peer_addr().is_empty());

    conn.close();
    conn.close();
    assert!(conn.is_closed());

    let err = conn.call(1, 0, b"", Duration::from_secs(1)).unwrap_err();
    assert!(err.is_connection());

    drop(conn);
    server.join().unwrap();
}
