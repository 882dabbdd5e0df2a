//! Port reservations
//!
//! A reservation holds a bound listener on 127.0.0.1 from the moment a port
//! is chosen until immediately before the child process binds it. Holding
//! the socket open is what closes the check-then-use gap; the remaining
//! window between `release()` and the child's own bind is irreducible and
//! the spawner retries on bind failure to cover it.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use parking_lot::Mutex;
use tracing::debug;

/// A held port: bound listener kept open until released
pub struct Reservation {
    port: u16,
    listener: Mutex<Option<TcpListener>>,
}

impl Reservation {
    /// Bind 127.0.0.1:port and hold it
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let listener = TcpListener::bind(addr)?;
        debug!("Reserved port {}", port);

        Ok(Self {
            port,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// The reserved port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Drop the listener, freeing the port for the child's bind.
    ///
    /// Idempotent: releasing an already-released reservation is a no-op.
    pub fn release(&self) {
        if self.listener.lock().take().is_some() {
            debug!("Released port {}", self.port);
        }
    }

    /// Whether the listener is still held
    pub fn is_held(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bind-and-close probe: whether 127.0.0.1:port is currently free
pub fn is_available(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}
