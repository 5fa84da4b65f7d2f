use std::{
    collections::HashSet,
    io::ErrorKind,
    net::TcpListener,
    ops::Range,
    sync::{Arc, Mutex},
};

use rand::Rng;

/// Ports handed to spawned nodes.
pub const NODE_PORT_RANGE: Range<u16> = 30000..60000;

pub const MAX_ATTEMPTS: usize = 32;

fn port_is_free(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            l.set_nonblocking(true).ok();
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::debug!(port, %e, "port probe failed");
            false
        }
    }
}

/// Process-wide set of ports promised to launching or live nodes.
///
/// A bind probe alone cannot stop two concurrent launches from picking the same
/// port before either child has bound it, so every pick is also recorded here.
#[derive(Clone, Debug, Default)]
pub struct PortReservations {
    taken: Arc<Mutex<HashSet<u16>>>,
}

impl PortReservations {
    pub fn reserve(&self, range: Range<u16>) -> Option<PortLease> {
        if range.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ATTEMPTS {
            let port = rng.gen_range(range.clone());
            if !self.try_claim(port) {
                continue;
            }
            if port_is_free(port) {
                return Some(PortLease {
                    port,
                    owner: self.clone(),
                });
            }
            self.release(port);
        }
        None
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.taken
            .lock()
            .map(|set| set.contains(&port))
            .unwrap_or(false)
    }

    fn try_claim(&self, port: u16) -> bool {
        match self.taken.lock() {
            Ok(mut set) => set.insert(port),
            Err(_) => false,
        }
    }

    fn release(&self, port: u16) {
        if let Ok(mut set) = self.taken.lock() {
            set.remove(&port);
        }
    }
}

/// A reserved port. Dropping the lease gives the port back.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    owner: PortReservations,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.owner.release(self.port);
    }
}
