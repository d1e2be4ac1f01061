// src/ports.rs
// Local TCP port selection for new tunnels.
//
// A port found free here is released before ssh binds it, so another process
// can take it in between. ssh then fails with a bind error, which surfaces as
// a launch failure.

use std::net::{Ipv4Addr, TcpListener};
use tracing::trace;

pub const MIN_PORT: u16 = 1024;

/// Probes a single port by binding and immediately releasing it.
pub fn is_available(port: u16) -> bool {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            trace!("Port {} not available: {}", port, e);
            false
        }
    }
}

/// Returns the first bindable port in the inclusive range `start..=end`.
pub fn find_available(start: u16, end: u16) -> Option<u16> {
    (start..=end).find(|port| is_available(*port))
}

pub fn is_valid_user_port(port: u16) -> bool {
    port >= MIN_PORT
}
