//! Demo TCP server built on `DrainListener`.
//!
//! Accepts connections on one thread, serves each on its own thread and, on
//! shutdown, stops accepting and waits for open connections to finish.

use crate::config::Config;
use crate::echo;
use proxy_drain::{DrainListener, SplicedConn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    listener: Arc<DrainListener>,
}

impl Server {
    /// Bind the configured address.
    pub fn bind(config: Config) -> io::Result<Self> {
        let socket = create_listener(config.listen)?;
        let listener = DrainListener::new(socket, config.listener_options())?;
        info!(
            address = %listener.local_addr(),
            proxy_protocol = config.proxy_protocol,
            "Server listening"
        );

        Ok(Server {
            config,
            listener: Arc::new(listener),
        })
    }

    /// Shared handle to the listener, e.g. for a signal handler.
    pub fn listener(&self) -> &Arc<DrainListener> {
        &self.listener
    }

    /// Close the listener on SIGINT/SIGTERM.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let listener = Arc::clone(&self.listener);
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            if let Err(e) = listener.close() {
                debug!(error = %e, "Listener already closed");
            }
        })
    }

    /// Accept and serve connections until the listener is closed, then drain.
    ///
    /// Returns `false` if connections were still open when the drain timeout
    /// expired.
    pub fn run(&self) -> io::Result<bool> {
        serve(&self.listener)?;

        let outstanding = self.listener.drain_group().count();
        info!(outstanding, "Stopped accepting, draining connections");

        let drained = match self.config.drain_timeout {
            Some(timeout) => self.listener.drain_group().wait_timeout(timeout),
            None => {
                self.listener.drain_group().wait();
                true
            }
        };

        if drained {
            info!("All connections closed");
        } else {
            warn!(
                outstanding = self.listener.drain_group().count(),
                "Drain timeout expired with connections still open"
            );
        }
        Ok(drained)
    }
}

/// Accept loop. Returns `Ok` once the listener has been closed; any other
/// accept error ends the loop and is returned.
pub fn serve(listener: &DrainListener) -> io::Result<()> {
    loop {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(_) if listener.is_closed() => return Ok(()),
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                return Err(e);
            }
        };

        let remote = conn.remote_addr();
        let spawned = thread::Builder::new()
            .name(format!("conn-{remote}"))
            .spawn(move || serve_connection(conn));
        if let Err(e) = spawned {
            // The closure (and the connection with it) was dropped, which
            // closes it.
            warn!(remote = %remote, error = %e, "Failed to spawn connection thread");
        }
    }
}

fn serve_connection(conn: SplicedConn) {
    let remote = conn.remote_addr();
    debug!(remote = %remote, peer = %conn.peer_addr(), "New connection");

    if let Err(e) = echo::handle_connection(&conn) {
        debug!(remote = %remote, error = %e, "Connection error");
    }
    if let Err(e) = conn.close() {
        debug!(remote = %remote, error = %e, "Close failed");
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
