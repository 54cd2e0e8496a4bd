//! Accepted connection with a spliced read path.
//!
//! When the listener peeks at a connection to look for a PROXY header it
//! usually pulls more bytes off the socket than the header itself. Those
//! bytes sit in a `PeekBuffer` and must reach the application before anything
//! else the socket delivers. `SplicedConn` serves reads from that buffer until
//! it is exhausted and then switches to the socket for good.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::net::drain::DrainGroup;
use crate::net::pool::{PeekBuffer, PeekBufferPool};
use crate::proxy::Header;

/// Where the next read comes from.
///
/// Only ever moves from `Buffered` to `Direct`.
#[derive(Debug)]
enum ReadState {
    /// Bytes pulled during header detection are still pending.
    Buffered(PeekBuffer),
    /// Reads go straight to the socket.
    Direct,
}

/// A TCP connection handed out by [`DrainListener`](crate::DrainListener).
///
/// Reading, writing and closing work through `&self`, so one thread can block
/// in `read` while another closes the connection.
#[derive(Debug)]
pub struct SplicedConn {
    stream: TcpStream,
    /// Peer address reported by the socket at accept time.
    peer: SocketAddr,
    header: Option<Header>,
    state: Mutex<ReadState>,
    pool: Arc<PeekBufferPool>,
    drain: DrainGroup,
    closed: AtomicBool,
}

impl SplicedConn {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        header: Option<Header>,
        buffer: Option<PeekBuffer>,
        pool: Arc<PeekBufferPool>,
        drain: DrainGroup,
    ) -> Self {
        let state = match buffer {
            Some(buf) => ReadState::Buffered(buf),
            None => ReadState::Direct,
        };
        Self {
            stream,
            peer,
            header,
            state: Mutex::new(state),
            pool,
            drain,
            closed: AtomicBool::new(false),
        }
    }

    /// Client address: the PROXY source if a header was parsed, otherwise
    /// the socket peer.
    pub fn remote_addr(&self) -> SocketAddr {
        match &self.header {
            Some(header) => header.src,
            None => self.peer,
        }
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Whether reads are still being served from the peek buffer.
    pub fn is_buffered(&self) -> bool {
        matches!(*self.lock_state(), ReadState::Buffered(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, ReadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detach the peek buffer, leaving the connection in direct mode.
    fn take_buffer(state: &mut ReadState) -> Option<PeekBuffer> {
        match std::mem::replace(state, ReadState::Direct) {
            ReadState::Buffered(buf) => Some(buf),
            ReadState::Direct => None,
        }
    }

    fn read_spliced(&self, out: &mut [u8]) -> io::Result<usize> {
        let drained = {
            let mut state = self.lock_state();
            match &mut *state {
                ReadState::Direct => None,
                ReadState::Buffered(buf) => {
                    let available = buf.buffered();
                    if out.len() < available {
                        // More than the caller wants; stay buffered.
                        return Ok(buf.read_buffered(out));
                    }
                    // Short read of exactly what is left, or nothing if the
                    // buffer was already empty. Either way this is the last
                    // read served from the buffer.
                    let n = buf.read_buffered(out);
                    Self::take_buffer(&mut state).map(|buf| (buf, n))
                }
            }
        };

        if let Some((buf, n)) = drained {
            self.pool.release(buf);
            if n > 0 {
                return Ok(n);
            }
        }

        (&self.stream).read(out)
    }

    /// Release the peek buffer, shut the socket down and mark the connection
    /// as finished in the listener's drain group.
    ///
    /// A blocked reader on another thread wakes up with end of stream. The
    /// second call fails with `NotConnected` and leaves the drain group alone.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }

        let buf = Self::take_buffer(&mut self.lock_state());
        if let Some(buf) = buf {
            self.pool.release(buf);
        }

        let result = match self.stream.shutdown(Shutdown::Both) {
            // Peer already tore the connection down.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        };

        self.drain.done();
        debug!(remote = %self.remote_addr(), "Connection closed");
        result
    }

    // Pass-through to the raw socket.

    /// Address reported by the socket, ignoring any PROXY header.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(dur)
    }

    pub fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(dur)
    }

    pub fn read_timeout(&self) -> io::Result<Option<Duration>> {
        self.stream.read_timeout()
    }

    pub fn write_timeout(&self) -> io::Result<Option<Duration>> {
        self.stream.write_timeout()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.stream.nodelay()
    }

    /// Half-close the socket without touching drain accounting.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    /// Raw socket. Reading from it directly bypasses any pending buffered bytes.
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

impl Read for SplicedConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_spliced(buf)
    }
}

impl Read for &SplicedConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_spliced(buf)
    }
}

impl Write for SplicedConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.stream).flush()
    }
}

impl Write for &SplicedConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.stream).flush()
    }
}

impl Drop for SplicedConn {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Family;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    /// Connected (client, server) pair over loopback.
    fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, server, peer)
    }

    fn buffer_with(pool: &PeekBufferPool, data: &[u8]) -> PeekBuffer {
        let mut buf = pool.acquire();
        buf.bind(Cursor::new(data.to_vec())).fill_more().unwrap();
        buf
    }

    type Fixture = (TcpStream, SplicedConn, Arc<PeekBufferPool>, DrainGroup);

    fn spliced(buffered: Option<&[u8]>) -> Fixture {
        let (client, server, peer) = socket_pair();
        let pool = Arc::new(PeekBufferPool::new(512, 8));
        let drain = DrainGroup::new();
        drain.add();
        let buffer = buffered.map(|data| buffer_with(&pool, data));
        let conn = SplicedConn::new(
            server,
            peer,
            None,
            buffer,
            Arc::clone(&pool),
            drain.clone(),
        );
        (client, conn, pool, drain)
    }

    #[test]
    fn test_buffered_bytes_come_first() {
        let (mut client, mut conn, pool, _drain) = spliced(Some(b"buffered"));
        client.write_all(b"-socket").unwrap();

        let mut out = [0u8; 3];
        assert_eq!(conn.read(&mut out).unwrap(), 3);
        assert_eq!(&out, b"buf");
        assert!(conn.is_buffered());

        // Request covers the rest of the buffer: short read, then direct.
        let mut out = [0u8; 64];
        assert_eq!(conn.read(&mut out).unwrap(), 5);
        assert_eq!(&out[..5], b"fered");
        assert!(!conn.is_buffered());
        assert_eq!(pool.idle(), 1);

        let mut rest = [0u8; 7];
        conn.read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"-socket");
    }

    #[test]
    fn test_exact_length_read_switches_to_direct() {
        let (_client, mut conn, pool, _drain) = spliced(Some(b"abcd"));
        let mut out = [0u8; 4];
        assert_eq!(conn.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"abcd");
        assert!(!conn.is_buffered());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_empty_buffer_falls_through_to_socket() {
        let (mut client, mut conn, pool, _drain) = spliced(Some(b""));
        assert!(conn.is_buffered());
        client.write_all(b"raw").unwrap();

        let mut out = [0u8; 3];
        conn.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"raw");
        assert!(!conn.is_buffered());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_empty_read_does_not_drain() {
        let (_client, mut conn, _pool, _drain) = spliced(Some(b"xy"));
        assert_eq!(conn.read(&mut []).unwrap(), 0);
        assert!(conn.is_buffered());
    }

    #[test]
    fn test_never_returns_to_buffered() {
        let (mut client, mut conn, pool, _drain) = spliced(Some(b"ab"));
        let mut out = [0u8; 2];
        conn.read_exact(&mut out).unwrap();
        assert!(!conn.is_buffered());

        // Recycled buffer goes to someone else and gets filled.
        let reused = buffer_with(&pool, b"foreign");
        client.write_all(b"cd").unwrap();
        conn.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"cd");
        assert!(!conn.is_buffered());
        assert_eq!(reused.data(), b"foreign");
    }

    #[test]
    fn test_close_releases_buffer_and_counts_once() {
        let (_client, conn, pool, drain) = spliced(Some(b"unread"));
        assert_eq!(pool.idle(), 0);

        conn.close().unwrap();
        assert_eq!(pool.idle(), 1);
        assert_eq!(drain.count(), 0);

        let err = conn.close().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(drain.count(), 0);

        drop(conn);
        assert_eq!(drain.count(), 0);
    }

    #[test]
    fn test_drop_closes() {
        let (_client, conn, _pool, drain) = spliced(None);
        assert_eq!(drain.count(), 1);
        drop(conn);
        assert_eq!(drain.count(), 0);
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (_client, conn, _pool, _drain) = spliced(None);
        let conn = Arc::new(conn);

        let reader = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                let mut out = [0u8; 16];
                (&*conn).read(&mut out)
            })
        };

        thread::sleep(Duration::from_millis(50));
        conn.close().unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_remote_addr_prefers_header() {
        let (client, server, peer) = socket_pair();
        let pool = Arc::new(PeekBufferPool::default());
        let drain = DrainGroup::new();
        drain.add();
        drain.add();

        let plain =
            SplicedConn::new(server, peer, None, None, Arc::clone(&pool), drain.clone());
        assert_eq!(plain.remote_addr(), client.local_addr().unwrap());
        assert_eq!(plain.remote_addr(), plain.peer_addr());

        let (_client, server, peer) = socket_pair();
        let header = Header {
            family: Family::Tcp4,
            src: "10.0.0.1:1111".parse().unwrap(),
            dst: "10.0.0.2:2222".parse().unwrap(),
        };
        let proxied = SplicedConn::new(server, peer, Some(header), None, pool, drain);
        assert_eq!(proxied.remote_addr(), "10.0.0.1:1111".parse().unwrap());
        assert_eq!(proxied.peer_addr(), peer);
    }

    #[test]
    fn test_write_passes_through() {
        let (mut client, conn, _pool, _drain) = spliced(None);
        (&conn).write_all(b"pong").unwrap();
        let mut out = [0u8; 4];
        client.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"pong");
    }
}
