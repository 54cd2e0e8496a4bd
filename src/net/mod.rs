//! Listener and connection wrappers.
//!
//! - `DrainListener`: accepts connections, strips PROXY headers, counts
//!   outstanding connections
//! - `SplicedConn`: replays peeked bytes before reading from the socket
//! - `PeekBufferPool`: recycles the buffers used for peeking
//! - `DrainGroup`: wait-group style counter for graceful shutdown

mod conn;
mod drain;
mod listener;
mod pool;

pub use conn::SplicedConn;
pub use drain::DrainGroup;
pub use listener::{DrainListener, ListenerOptions, DEFAULT_KEEPALIVE};
pub use pool::{
    PeekBuffer, PeekBufferPool, PeekReader, DEFAULT_PEEK_BUFFER_SIZE, MIN_PEEK_BUFFER_SIZE,
};
