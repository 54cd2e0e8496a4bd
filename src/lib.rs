//! proxy-drain: a TCP listener wrapper for zero-downtime servers
//!
//! Wrap a bound `TcpListener` in a [`DrainListener`] and accept
//! [`SplicedConn`]s from it instead of raw streams. Two things happen
//! transparently:
//!
//! - PROXY protocol (v1) preambles sent by a load balancer are stripped and
//!   decoded, so [`SplicedConn::remote_addr`] reports the original client.
//!   Bytes read while looking for the preamble are replayed to the
//!   application before anything else.
//! - Every accepted connection is counted in a [`DrainGroup`] until it is
//!   closed, so a supervisor can stop accepting, wait for in-flight
//!   connections and only then exit or hand the socket to a new process.
//!
//! ```no_run
//! use proxy_drain::DrainListener;
//! use std::io::Read;
//!
//! let listener = DrainListener::bind("127.0.0.1:7000".parse()?, true)?;
//! let mut conn = listener.accept()?;
//! println!("client {}", conn.remote_addr());
//! let mut buf = [0u8; 4096];
//! let n = conn.read(&mut buf)?;
//! conn.close()?;
//!
//! listener.close()?;
//! listener.drain_group().wait();
//! # let _ = n;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod net;
pub mod proxy;

pub use net::{
    DrainGroup, DrainListener, ListenerOptions, PeekBuffer, PeekBufferPool, PeekReader,
    SplicedConn, DEFAULT_KEEPALIVE, DEFAULT_PEEK_BUFFER_SIZE,
};
pub use proxy::{Header, HeaderError, HeaderParser, V1Parser};
