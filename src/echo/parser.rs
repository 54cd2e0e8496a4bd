//! Request line parsing for the echo protocol.

/// One request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `<len>`: `len` payload bytes follow the line and are sent back.
    Echo(usize),
    /// `ADDR`: reply with the client address.
    Addr,
    /// `QUIT`: acknowledge and hang up.
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    Complete(Command),
    /// The line did not end in CRLF (bare LF, or the peer hung up mid-line).
    Unterminated,
    InvalidLength,
}

/// Parse one line as returned by `read_until(b'\n')`, terminator included.
pub fn parse_line(line: &[u8]) -> ParseResult {
    let Some(line) = line.strip_suffix(b"\r\n") else {
        return ParseResult::Unterminated;
    };

    if line.eq_ignore_ascii_case(b"QUIT") {
        return ParseResult::Complete(Command::Quit);
    }
    if line.eq_ignore_ascii_case(b"ADDR") {
        return ParseResult::Complete(Command::Addr);
    }

    // Lengths are plain decimal; `usize::from_str` would also take a sign.
    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return ParseResult::InvalidLength;
    }
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(ParseResult::InvalidLength, |n| {
            ParseResult::Complete(Command::Echo(n))
        })
}

/// Length line preceding an echoed payload.
pub fn response_header(length: usize) -> Vec<u8> {
    format!("{length}\r\n").into_bytes()
}

pub fn response_error(msg: &str) -> Vec<u8> {
    format!("ERROR {msg}\r\n").into_bytes()
}
