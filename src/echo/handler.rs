//! Echo protocol handler running on a connection thread.

use std::io::{self, BufRead, BufReader, Read, Write};

use proxy_drain::SplicedConn;
use tracing::trace;

use super::parser::{self, Command, ParseResult};

const MAX_ECHO_SIZE: usize = 16 * 1024 * 1024; // 16MB max echo size

/// Handle an echo protocol connection until the client quits or hangs up.
///
/// Reads go through the connection's spliced path, so bytes that arrived
/// together with a PROXY header are answered like any others.
pub fn handle_connection(conn: &SplicedConn) -> io::Result<()> {
    let mut reader = BufReader::new(conn);
    let mut writer = conn;
    let mut line = Vec::with_capacity(32);
    let mut payload = Vec::with_capacity(4096);

    loop {
        line.clear();

        // Read the command line
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            // EOF
            return Ok(());
        }

        match parser::parse_line(&line) {
            ParseResult::Complete(Command::Quit) => {
                writer.write_all(b"OK\r\n")?;
                return Ok(());
            }
            ParseResult::Complete(Command::Addr) => {
                write!(writer, "{}\r\n", conn.remote_addr())?;
            }
            ParseResult::Complete(Command::Echo(length)) if length > MAX_ECHO_SIZE => {
                writer.write_all(&parser::response_error("payload too large"))?;
            }
            ParseResult::Complete(Command::Echo(length)) => {
                payload.clear();
                payload.resize(length, 0);
                reader.read_exact(&mut payload)?;
                trace!(length, "Echoing payload");

                // Echo back: length + data
                writer.write_all(&parser::response_header(length))?;
                writer.write_all(&payload)?;
            }
            // Bare LF or EOF mid-line; not a command, hang up.
            ParseResult::Unterminated => return Ok(()),
            ParseResult::InvalidLength => {
                writer.write_all(&parser::response_error("invalid length"))?;
            }
        }
    }
}
