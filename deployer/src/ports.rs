use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{Error, Result};

const MAX_ATTEMPTS: usize = 16;

/// Hands out currently-unbound TCP ports, never the same port twice while a
/// reservation is live.
///
/// There is a benign race between probing a port and the child binding it;
/// serializing reservations here keeps concurrent deployments from racing
/// each other for the same port, which is the race that matters.
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut reserved = self.reserved.lock().unwrap();
        for _ in 0..MAX_ATTEMPTS {
            let Some(port) = portpicker::pick_unused_port() else {
                break;
            };
            if reserved.insert(port) {
                return Ok(port);
            }
        }

        Err(Error::PortExhausted)
    }

    /// Return a port to the pool once the reservation it backed is gone.
    pub fn release(&self, port: u16) {
        self.reserved.lock().unwrap().remove(&port);
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
