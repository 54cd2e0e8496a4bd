//! Listener wrapper that tracks connections for draining.
//!
//! `DrainListener` owns a bound `TcpListener`. Every connection it hands out
//! is counted in a [`DrainGroup`] until the connection is closed or dropped,
//! and, when PROXY parsing is enabled, has its preamble stripped and decoded
//! before the application sees it.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, warn};

use crate::net::conn::SplicedConn;
use crate::net::drain::DrainGroup;
use crate::net::pool::{PeekBuffer, PeekBufferPool, DEFAULT_PEEK_BUFFER_SIZE};
use crate::proxy::{Header, HeaderError, HeaderParser, V1Parser};

/// Keep-alive period applied to accepted sockets.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(3 * 60);

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Construction-time settings for a [`DrainListener`].
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Parse a PROXY header at the start of every accepted connection.
    pub proxy_protocol: bool,
    /// TCP keep-alive period, or `None` to leave the socket default.
    pub keepalive: Option<Duration>,
    /// Read timeout while waiting for the header, or `None` to wait forever.
    pub header_timeout: Option<Duration>,
    /// Capacity of each peek buffer.
    pub peek_buffer_size: usize,
    /// Idle peek buffers kept for reuse.
    pub max_idle_buffers: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            proxy_protocol: false,
            keepalive: Some(DEFAULT_KEEPALIVE),
            header_timeout: None,
            peek_buffer_size: DEFAULT_PEEK_BUFFER_SIZE,
            max_idle_buffers: 1024,
        }
    }
}

struct Poller {
    poll: Poll,
    events: Events,
}

/// TCP listener that counts outstanding connections and optionally strips
/// PROXY headers.
///
/// The listening socket is non-blocking underneath; `accept` blocks on a mio
/// poll instead, so that [`close`](Self::close) can wake it without tearing
/// down a socket that a child process may have inherited via
/// [`file`](Self::file).
pub struct DrainListener {
    /// `None` once closed.
    inner: RwLock<Option<mio::net::TcpListener>>,
    local_addr: SocketAddr,
    registry: Registry,
    poller: Mutex<Poller>,
    waker: Waker,
    closed: AtomicBool,
    drain: DrainGroup,
    pool: Arc<PeekBufferPool>,
    parser: Option<Arc<dyn HeaderParser>>,
    keepalive: Option<Duration>,
    header_timeout: Option<Duration>,
}

impl DrainListener {
    /// Wrap an already bound listener.
    pub fn new(listener: TcpListener, options: ListenerOptions) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let mut listener = mio::net::TcpListener::from_std(listener);

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        registry.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(&registry, WAKER_TOKEN)?;

        let pool = Arc::new(PeekBufferPool::new(
            options.peek_buffer_size,
            options.max_idle_buffers,
        ));
        let parser: Option<Arc<dyn HeaderParser>> = if options.proxy_protocol {
            Some(Arc::new(V1Parser))
        } else {
            None
        };

        Ok(Self {
            inner: RwLock::new(Some(listener)),
            local_addr,
            registry,
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(8),
            }),
            waker,
            closed: AtomicBool::new(false),
            drain: DrainGroup::new(),
            pool,
            parser,
            keepalive: options.keepalive,
            header_timeout: options.header_timeout,
        })
    }

    /// Bind to `addr` with default options plus the given PROXY setting.
    pub fn bind(addr: SocketAddr, proxy_protocol: bool) -> io::Result<Self> {
        let options = ListenerOptions {
            proxy_protocol,
            ..Default::default()
        };
        Self::new(TcpListener::bind(addr)?, options)
    }

    /// Rebuild a listener from a descriptor inherited across `exec`.
    ///
    /// # Safety
    /// `fd` must be an open, listening TCP socket owned by nobody else.
    pub unsafe fn from_raw_fd(fd: RawFd, options: ListenerOptions) -> io::Result<Self> {
        Self::new(TcpListener::from_raw_fd(fd), options)
    }

    /// Share a drain group with other listeners, so one wait covers all of
    /// them.
    pub fn with_drain_group(mut self, drain: DrainGroup) -> Self {
        self.drain = drain;
        self
    }

    /// Share a peek buffer pool with other listeners.
    pub fn with_pool(mut self, pool: Arc<PeekBufferPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the header parser. Implies PROXY parsing is enabled.
    pub fn with_parser(mut self, parser: Arc<dyn HeaderParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Wait for the next connection.
    ///
    /// Errors from the underlying listener are returned unchanged; once the
    /// listener is closed every call fails with `InvalidInput`. A failed
    /// header parse is not an error: the connection is returned without a
    /// header and reports its socket address.
    pub fn accept(&self) -> io::Result<SplicedConn> {
        let (stream, peer) = loop {
            match self.try_accept() {
                Ok(Some(accepted)) => break accepted,
                Ok(None) => self.wait_readable()?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if let Some(period) = self.keepalive {
            if let Err(e) = set_keepalive(&stream, period) {
                warn!(peer = %peer, error = %e, "Failed to enable TCP keep-alive");
            }
        }

        let (header, buffer) = match &self.parser {
            Some(parser) => {
                let mut buf = self.pool.acquire();
                let header = match self.read_header(parser.as_ref(), &stream, &mut buf) {
                    Ok(header) => Some(header),
                    Err(HeaderError::NotProxy) => {
                        debug!(peer = %peer, "Connection has no PROXY header");
                        None
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Error reading PROXY protocol header");
                        None
                    }
                };
                // Keep the buffer either way: it may hold application bytes.
                (header, Some(buf))
            }
            None => (None, None),
        };

        self.drain.add();
        let conn = SplicedConn::new(
            stream,
            peer,
            header,
            buffer,
            Arc::clone(&self.pool),
            self.drain.clone(),
        );
        debug!(peer = %peer, remote = %conn.remote_addr(), "Connection accepted");
        Ok(conn)
    }

    /// One non-blocking accept. `Ok(None)` means nothing is pending.
    fn try_accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let listener = inner
            .as_ref()
            .ok_or_else(|| closed_error("listener closed"))?;

        match listener.accept() {
            Ok((stream, peer)) => {
                // SAFETY: ownership of the descriptor moves from the mio
                // stream to the std stream.
                let stream = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
                stream.set_nonblocking(false)?;
                Ok(Some((stream, peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Block until the listener is readable or [`close`](Self::close) wakes us.
    fn wait_readable(&self) -> io::Result<()> {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        let Poller { poll, events } = &mut *poller;
        match poll.poll(events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        if self.is_closed() {
            // Pass the wake-up on to the next blocked acceptor, if any.
            let _ = self.waker.wake();
        }
        Ok(())
    }

    fn read_header(
        &self,
        parser: &dyn HeaderParser,
        stream: &TcpStream,
        buf: &mut PeekBuffer,
    ) -> Result<Header, HeaderError> {
        if self.header_timeout.is_some() {
            stream.set_read_timeout(self.header_timeout)?;
        }
        let result = parser.parse(&mut buf.bind(stream));
        if self.header_timeout.is_some() {
            stream.set_read_timeout(None)?;
        }
        result
    }

    /// Stop accepting and close the listening socket. A thread blocked in
    /// [`accept`](Self::accept) wakes up with an error.
    ///
    /// Outstanding connections are not affected; wait on the drain group to
    /// see them finish. Closing twice fails with `InvalidInput`.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(closed_error("listener already closed"));
        }
        debug!(addr = %self.local_addr, "Closing listener");

        let listener = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut listener) = listener {
            if let Err(e) = self.registry.deregister(&mut listener) {
                warn!(addr = %self.local_addr, error = %e, "Failed to deregister listener");
            }
        }
        // Blocked acceptors must see `closed` even if deregistering failed.
        self.waker.wake()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Duplicate the listening descriptor for a child process.
    ///
    /// The copy does not carry `FD_CLOEXEC`, so it survives `exec`. It shares
    /// the socket's non-blocking mode; [`from_raw_fd`](Self::from_raw_fd)
    /// expects exactly that.
    pub fn file(&self) -> io::Result<OwnedFd> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let listener = inner
            .as_ref()
            .ok_or_else(|| closed_error("listener closed"))?;

        // SAFETY: dup on a descriptor we own; the result is checked below.
        let fd = unsafe { libc::dup(listener.as_raw_fd()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a fresh descriptor owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Counter of connections accepted but not yet closed.
    pub fn drain_group(&self) -> &DrainGroup {
        &self.drain
    }

    pub fn pool(&self) -> &Arc<PeekBufferPool> {
        &self.pool
    }

    pub fn parses_proxy_protocol(&self) -> bool {
        self.parser.is_some()
    }
}

impl std::fmt::Debug for DrainListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainListener")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .field("outstanding", &self.drain.count())
            .field("proxy_protocol", &self.parser.is_some())
            .finish()
    }
}

fn closed_error(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_interval(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
