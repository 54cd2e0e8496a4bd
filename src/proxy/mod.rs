//! PROXY protocol header detection.
//!
//! The listener only needs something implementing [`HeaderParser`]. The
//! bundled [`V1Parser`] understands the text format; the binary v2 format is
//! not supported.

mod header;
mod v1;

pub use header::{Family, Header, HeaderError, HeaderParser, Peek};
pub use v1::{V1Parser, V1_MAX_LENGTH};
