//! Echo protocol served by the demo binary.
//!
//! Length-prefixed binary protocol for predictable framing:
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//! ```
//!
//! Special commands (line-based):
//! - `ADDR\r\n` - Reply with the client address as seen through any PROXY header
//! - `QUIT\r\n` - Close connection gracefully

pub mod handler;
pub mod parser;

pub use handler::handle_connection;
