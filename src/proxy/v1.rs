//! PROXY protocol version 1 (text) parser.
//!
//! Format: `PROXY <TCP4|TCP6|UNKNOWN> <src ip> <dst ip> <src port> <dst port>\r\n`
//!
//! Example: `PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\n`

use std::net::{IpAddr, SocketAddr};

use tracing::trace;

use super::header::{Family, Header, HeaderError, HeaderParser, Peek};

/// Longest legal v1 line, CRLF included.
pub const V1_MAX_LENGTH: usize = 107;

const PREFIX: &[u8] = b"PROXY ";

/// Parser for the v1 text preamble.
#[derive(Debug, Clone, Copy, Default)]
pub struct V1Parser;

impl HeaderParser for V1Parser {
    fn parse(&self, rd: &mut dyn Peek) -> Result<Header, HeaderError> {
        loop {
            let data = rd.peeked();

            // Bail out as soon as the bytes cannot be a preamble, so the
            // application gets them back untouched.
            let n = data.len().min(PREFIX.len());
            if data[..n] != PREFIX[..n] {
                return Err(HeaderError::NotProxy);
            }

            let window = &data[..data.len().min(V1_MAX_LENGTH)];
            if let Some(end) = find_crlf(window) {
                let result = parse_line(&window[..end]);
                // UNKNOWN is still a complete preamble and must not leak
                // into the application stream.
                if matches!(result, Ok(_) | Err(HeaderError::UnknownFamily)) {
                    rd.consume(end + 2);
                }
                return result;
            }

            if data.len() >= V1_MAX_LENGTH {
                return Err(HeaderError::TooLong(V1_MAX_LENGTH));
            }

            if rd.fill_more()? == 0 {
                return Err(HeaderError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }
}

/// Parse a single header line (without CRLF).
fn parse_line(line: &[u8]) -> Result<Header, HeaderError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| HeaderError::Malformed("invalid UTF-8".into()))?;
    let parts: Vec<&str> = line.split(' ').collect();

    match parts.get(1).copied() {
        Some("UNKNOWN") => return Err(HeaderError::UnknownFamily),
        Some("TCP4") | Some("TCP6") => {}
        Some(proto) => {
            return Err(HeaderError::Malformed(format!(
                "unsupported protocol {proto:?}"
            )))
        }
        None => return Err(HeaderError::Malformed("missing protocol".into())),
    }

    if parts.len() != 6 {
        return Err(HeaderError::Malformed(format!(
            "expected 6 fields, got {}",
            parts.len()
        )));
    }

    let family = if parts[1] == "TCP4" {
        Family::Tcp4
    } else {
        Family::Tcp6
    };

    let src_ip = parse_ip(parts[2], family)?;
    let dst_ip = parse_ip(parts[3], family)?;
    let src_port = parse_port(parts[4])?;
    let dst_port = parse_port(parts[5])?;

    let header = Header {
        family,
        src: SocketAddr::new(src_ip, src_port),
        dst: SocketAddr::new(dst_ip, dst_port),
    };
    trace!(src = %header.src, dst = %header.dst, "Parsed PROXY v1 header");
    Ok(header)
}

fn parse_ip(s: &str, family: Family) -> Result<IpAddr, HeaderError> {
    let ip: IpAddr = s
        .parse()
        .map_err(|_| HeaderError::Malformed(format!("invalid address {s:?}")))?;
    match (family, ip) {
        (Family::Tcp4, IpAddr::V4(_)) | (Family::Tcp6, IpAddr::V6(_)) => Ok(ip),
        _ => Err(HeaderError::Malformed(format!(
            "address {s} does not match {}",
            family.as_str()
        ))),
    }
}

fn parse_port(s: &str) -> Result<u16, HeaderError> {
    // Leading zeros and signs are not allowed by the format.
    let digits = !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits || (s.len() > 1 && s.starts_with('0')) {
        return Err(HeaderError::Malformed(format!("invalid port {s:?}")));
    }
    s.parse()
        .map_err(|_| HeaderError::Malformed(format!("invalid port {s:?}")))
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
