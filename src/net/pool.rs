//! Reusable peek buffers for header detection.
//!
//! Detecting a PROXY preamble means reading from the socket before the
//! application does. Those bytes land in a `PeekBuffer`, which the connection
//! keeps until the application has read every one of them.
//!
//! Buffers are recycled through a `PeekBufferPool` so that high connection
//! churn does not turn into allocator churn. Pooling is an optimisation only:
//! a fresh buffer and a recycled one behave identically.

use std::io::{self, BufRead, Read};
use std::sync::{Mutex, PoisonError};

/// Smallest buffer the pool will hand out. A v1 header is at most 107 bytes.
pub const MIN_PEEK_BUFFER_SIZE: usize = 256;

/// Default buffer size, matching a typical buffered reader.
pub const DEFAULT_PEEK_BUFFER_SIZE: usize = 4096;

/// Fixed-capacity byte buffer with a read cursor.
///
/// The buffer never owns its source. A source is attached for the duration of
/// a borrow via [`PeekBuffer::bind`], so one buffer cannot be reading from two
/// sockets at once.
#[derive(Debug)]
pub struct PeekBuffer {
    buf: Box<[u8]>,
    /// Offset of the next unread byte.
    pos: usize,
    /// End of valid data.
    filled: usize,
}

impl PeekBuffer {
    /// Allocate an empty buffer with the given capacity.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }

    /// Bytes readable without touching the source.
    pub fn buffered(&self) -> usize {
        self.filled - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.filled
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unread bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.pos..self.filled]
    }

    /// Mark `n` unread bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.filled);
    }

    /// Copy buffered bytes into `out` without reading from any source.
    ///
    /// Returns the number of bytes copied, which is `min(out.len(), buffered())`.
    pub fn read_buffered(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffered());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Drop all buffered bytes.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.filled = 0;
    }

    /// Attach a source for the lifetime of the returned reader.
    pub fn bind<R: Read>(&mut self, source: R) -> PeekReader<'_, R> {
        PeekReader { buf: self, source }
    }

    /// Pull more bytes from `source`, appending after the existing data.
    ///
    /// Returns `Ok(0)` on end of stream.
    fn fill_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        if self.pos == self.filled {
            self.reset();
        } else if self.filled == self.buf.len() && self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }

        if self.filled == self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "peek buffer is full",
            ));
        }

        loop {
            match source.read(&mut self.buf[self.filled..]) {
                Ok(n) => {
                    self.filled += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// A `PeekBuffer` bound to a byte source.
///
/// This is what a header parser sees. It can look at buffered bytes, pull
/// more on demand, and consume only what it recognises; anything left stays
/// in the buffer for the connection to hand back to the application.
pub struct PeekReader<'a, R> {
    buf: &'a mut PeekBuffer,
    source: R,
}

impl<R: Read> PeekReader<'_, R> {
    /// Unread bytes currently held.
    pub fn peeked(&self) -> &[u8] {
        self.buf.data()
    }

    /// Read once from the source into the free space of the buffer.
    pub fn fill_more(&mut self) -> io::Result<usize> {
        self.buf.fill_from(&mut self.source)
    }

    /// Remaining room before the buffer is full.
    pub fn remaining_capacity(&self) -> usize {
        self.buf.capacity() - self.buf.buffered()
    }
}

impl<R: Read> Read for PeekReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf.is_empty() && self.fill_more()? == 0 {
            return Ok(0);
        }
        Ok(self.buf.read_buffered(out))
    }
}

impl<R: Read> BufRead for PeekReader<'_, R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.buf.is_empty() {
            self.fill_more()?;
        }
        Ok(self.buf.data())
    }

    fn consume(&mut self, amt: usize) {
        self.buf.consume(amt);
    }
}

/// Shared pool of idle peek buffers.
///
/// Safe to use from any number of threads; the lock is held only for a
/// single push or pop.
#[derive(Debug)]
pub struct PeekBufferPool {
    /// Idle buffers (LIFO for cache locality).
    idle: Mutex<Vec<PeekBuffer>>,
    buffer_size: usize,
    max_idle: usize,
}

impl PeekBufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes and keeping
    /// at most `max_idle` of them around between uses.
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            buffer_size: buffer_size.max(MIN_PEEK_BUFFER_SIZE),
            max_idle,
        }
    }

    /// Take an empty buffer, recycling an idle one when available.
    pub fn acquire(&self) -> PeekBuffer {
        let recycled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        recycled.unwrap_or_else(|| PeekBuffer::with_capacity(self.buffer_size))
    }

    /// Clear a buffer and return it to the pool.
    pub fn release(&self, mut buf: PeekBuffer) {
        buf.reset();
        if buf.capacity() != self.buffer_size {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    /// Number of buffers currently idle.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for PeekBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_PEEK_BUFFER_SIZE, 1024)
    }
}
