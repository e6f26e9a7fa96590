//! Per-process client state threaded through every component at construction.

use std::sync::atomic::{AtomicU16, Ordering};

use parley_core::{PeerDirectory, UserId};

#[derive(Debug)]
pub struct ClientContext {
    pub local_user: UserId,
    pub peers: PeerDirectory,
    local_port: AtomicU16,
}

impl ClientContext {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            peers: PeerDirectory::new(),
            local_port: AtomicU16::new(0),
        }
    }

    /// Called once the transport server has bound; outbound messages stamp this as their return port.
    pub fn publish_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Release);
    }

    /// Listening port, or None before the server has started.
    pub fn local_port(&self) -> Option<u16> {
        match self.local_port.load(Ordering::Acquire) {
            0 => None,
            p => Some(p),
        }
    }
}
