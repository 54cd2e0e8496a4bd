//! Types shared by PROXY header parsers and the listener.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::net::PeekReader;

/// Transport family announced by the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Tcp4,
    Tcp6,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Tcp4 => "TCP4",
            Family::Tcp6 => "TCP6",
        }
    }
}

/// Addresses carried by a PROXY preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub family: Family,
    /// Original client address.
    pub src: SocketAddr,
    /// Address the client connected to on the balancer.
    pub dst: SocketAddr,
}

impl Header {
    /// Render as a v1 text preamble, CRLF included.
    pub fn to_v1_line(&self) -> String {
        format!(
            "PROXY {} {} {} {} {}\r\n",
            self.family.as_str(),
            self.src.ip(),
            self.dst.ip(),
            self.src.port(),
            self.dst.port()
        )
    }
}

/// Reasons a connection ends up without a parsed header.
///
/// None of these are fatal: the listener logs them and hands the
/// connection out with its socket address.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("stream does not start with a PROXY header")]
    NotProxy,
    #[error("PROXY header exceeds {0} bytes")]
    TooLong(usize),
    #[error("malformed PROXY header: {0}")]
    Malformed(String),
    #[error("PROXY header carries the UNKNOWN address family")]
    UnknownFamily,
    #[error("failed to read PROXY header: {0}")]
    Io(#[from] io::Error),
}

/// Byte source a header parser works against.
///
/// Parsers look at what has been peeked so far, ask for more when needed and
/// consume only the preamble. Whatever is not consumed is later replayed to
/// the application.
pub trait Peek {
    /// Unread bytes pulled so far.
    fn peeked(&self) -> &[u8];
    /// Pull more bytes from the socket. `Ok(0)` means end of stream.
    fn fill_more(&mut self) -> io::Result<usize>;
    /// Drop `n` bytes from the front of the peeked data.
    fn consume(&mut self, n: usize);
}

impl<R: io::Read> Peek for PeekReader<'_, R> {
    fn peeked(&self) -> &[u8] {
        PeekReader::peeked(self)
    }

    fn fill_more(&mut self) -> io::Result<usize> {
        PeekReader::fill_more(self)
    }

    fn consume(&mut self, n: usize) {
        io::BufRead::consume(self, n)
    }
}

/// Decodes a PROXY preamble from the start of a connection.
pub trait HeaderParser: Send + Sync {
    fn parse(&self, rd: &mut dyn Peek) -> Result<Header, HeaderError>;
}
