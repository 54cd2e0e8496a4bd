//! End-to-end behaviour of `DrainListener` and `SplicedConn` over loopback.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use proxy_drain::proxy::Family;
use proxy_drain::{DrainListener, Header, ListenerOptions, SplicedConn};

const PREAMBLE: &[u8] = b"PROXY TCP4 10.0.0.1 10.0.0.2 1111 2222\r\n";

fn listener(proxy_protocol: bool) -> DrainListener {
    DrainListener::bind("127.0.0.1:0".parse().unwrap(), proxy_protocol).unwrap()
}

/// Read until EOF using a rotating list of chunk sizes.
fn read_chunked(conn: &mut SplicedConn, sizes: &[usize]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; sizes.iter().copied().max().unwrap_or(1)];
    for size in sizes.iter().copied().cycle() {
        let n = conn.read(&mut buf[..size])?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

/// Connect, send `first`, pause, send `second`, then hang up.
fn send_in_two_parts(addr: SocketAddr, first: Vec<u8>, second: Vec<u8>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&first).unwrap();
        thread::sleep(Duration::from_millis(5));
        client.write_all(&second).unwrap();
    })
}

#[test]
fn proxied_request_is_spliced() {
    let ln = listener(true);
    let mut client = TcpStream::connect(ln.local_addr()).unwrap();
    let mut request = PREAMBLE.to_vec();
    request.extend_from_slice(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    client.write_all(&request).unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    let mut conn = ln.accept().unwrap();
    assert_eq!(conn.remote_addr(), "10.0.0.1:1111".parse().unwrap());
    assert_eq!(conn.peer_addr(), client.local_addr().unwrap());

    let body = read_chunked(&mut conn, &[4096]).unwrap();
    assert_eq!(body, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert!(!conn.is_buffered());
}

#[test]
fn disabled_parsing_passes_everything_through() {
    let ln = listener(false);
    let mut client = TcpStream::connect(ln.local_addr()).unwrap();
    client.write_all(PREAMBLE).unwrap();
    client.write_all(b"payload").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    let mut conn = ln.accept().unwrap();
    assert!(conn.header().is_none());
    assert!(!conn.is_buffered());
    assert_eq!(conn.remote_addr(), client.local_addr().unwrap());

    let mut expected = PREAMBLE.to_vec();
    expected.extend_from_slice(b"payload");
    assert_eq!(read_chunked(&mut conn, &[7, 3]).unwrap(), expected);
}

#[test]
fn failed_parse_uses_socket_address() {
    let ln = listener(true);
    let mut client = TcpStream::connect(ln.local_addr()).unwrap();
    client.write_all(b"PROXY BOGUS\r\nrest").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    let mut conn = ln.accept().unwrap();
    assert!(conn.header().is_none());
    assert_eq!(conn.remote_addr(), client.local_addr().unwrap());
    assert_eq!(read_chunked(&mut conn, &[2]).unwrap(), b"PROXY BOGUS\r\nrest");
}

#[test]
fn counter_returns_to_zero() {
    let ln = Arc::new(listener(true));
    let addr = ln.local_addr();
    let clients: Vec<_> = (0..16)
        .map(|i| {
            thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                let header = Header {
                    family: Family::Tcp4,
                    src: SocketAddr::from(([192, 0, 2, i as u8], 5000 + i as u16)),
                    dst: "192.0.2.254:80".parse().unwrap(),
                };
                client.write_all(header.to_v1_line().as_bytes()).unwrap();
                client
            })
        })
        .collect();

    let conns: Vec<_> = (0..16).map(|_| ln.accept().unwrap()).collect();
    assert_eq!(ln.drain_group().count(), 16);

    let closers: Vec<_> = conns
        .into_iter()
        .map(|conn| {
            thread::spawn(move || {
                conn.close().unwrap();
                assert_eq!(
                    conn.close().unwrap_err().kind(),
                    io::ErrorKind::NotConnected
                );
            })
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }

    assert_eq!(ln.drain_group().count(), 0);
    assert!(ln.drain_group().wait_timeout(Duration::from_millis(10)));
    for client in clients {
        client.join().unwrap();
    }
}

#[test]
fn supervisor_waits_for_drain() {
    let ln = Arc::new(listener(false));
    let _client = TcpStream::connect(ln.local_addr()).unwrap();
    let conn = ln.accept().unwrap();
    ln.close().unwrap();
    assert_eq!(ln.close().unwrap_err().kind(), io::ErrorKind::InvalidInput);

    let waiter = {
        let drain = ln.drain_group().clone();
        thread::spawn(move || drain.wait())
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!waiter.is_finished());

    conn.close().unwrap();
    waiter.join().unwrap();
}

#[test]
fn shared_pool_recycles_across_connections() {
    let ln = DrainListener::new(
        std::net::TcpListener::bind("127.0.0.1:0").unwrap(),
        ListenerOptions {
            proxy_protocol: true,
            max_idle_buffers: 4,
            ..Default::default()
        },
    )
    .unwrap();

    for _ in 0..3 {
        let mut client = TcpStream::connect(ln.local_addr()).unwrap();
        client.write_all(PREAMBLE).unwrap();
        client.write_all(b"x").unwrap();
        let mut conn = ln.accept().unwrap();
        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");
        conn.close().unwrap();
    }
    assert_eq!(ln.pool().idle(), 1);
}

#[test]
fn concurrent_readers_share_bytes_exactly_once() {
    let ln = listener(true);
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let mut head = PREAMBLE.to_vec();
    head.extend_from_slice(&body[..1000]);
    let client = send_in_two_parts(ln.local_addr(), head, body[1000..].to_vec());

    let conn = Arc::new(ln.accept().unwrap());
    assert!(conn.is_buffered());

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                let mut seen = [0usize; 256];
                let mut out = [0u8; 37];
                loop {
                    let n = (&*conn).read(&mut out).unwrap();
                    if n == 0 {
                        return seen;
                    }
                    for &b in &out[..n] {
                        seen[b as usize] += 1;
                    }
                }
            })
        })
        .collect();

    let mut received = [0usize; 256];
    for reader in readers {
        for (total, count) in received.iter_mut().zip(reader.join().unwrap()) {
            *total += count;
        }
    }
    client.join().unwrap();

    let mut expected = [0usize; 256];
    for &b in &body {
        expected[b as usize] += 1;
    }
    assert_eq!(received.iter().sum::<usize>(), body.len());
    assert_eq!(received, expected);
    assert!(!conn.is_buffered());
    assert_eq!(ln.pool().idle(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn no_bytes_lost_or_repeated(
        proxied in any::<bool>(),
        first in proptest::collection::vec(any::<u8>(), 0..2048),
        second in proptest::collection::vec(any::<u8>(), 0..2048),
        split in 0usize..64,
        sizes in proptest::collection::vec(1usize..300, 1..8),
    ) {
        let ln = listener(proxied);

        let mut sent = first.clone();
        sent.extend_from_slice(&second);

        let mut head = if proxied { PREAMBLE.to_vec() } else { Vec::new() };
        let split = split.min(first.len());
        head.extend_from_slice(&first[..split]);
        let mut tail = first[split..].to_vec();
        tail.extend_from_slice(&second);

        let client = send_in_two_parts(ln.local_addr(), head, tail);
        let mut conn = ln.accept().unwrap();
        let received = read_chunked(&mut conn, &sizes).unwrap();
        client.join().unwrap();

        if proxied {
            prop_assert_eq!(conn.remote_addr(), "10.0.0.1:1111".parse::<SocketAddr>().unwrap());
        }
        prop_assert_eq!(received, sent);
        prop_assert!(!conn.is_buffered());
    }
}
