//! Port broker
//!
//! Allocator over the configured reverse-forward port range. Allocation picks
//! the lowest free port so operators see deterministic assignments. One mutex
//! guards the in-use set; it is never held across I/O.

use edgetainer_protocol::{Error, Result};
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug)]
pub struct PortBroker {
    range_lo: u16,
    range_hi: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortBroker {
    /// Create a broker over the inclusive range `[range_lo, range_hi]`.
    pub fn new(range_lo: u16, range_hi: u16) -> Self {
        Self {
            range_lo,
            range_hi,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate the lowest free port in the range.
    pub fn allocate(&self) -> Result<u16> {
        let mut in_use = self.in_use.lock().expect("port broker mutex poisoned");
        for port in self.range_lo..=self.range_hi {
            if in_use.insert(port) {
                return Ok(port);
            }
        }
        Err(Error::Resource(format!(
            "no port available in [{}, {}]",
            self.range_lo, self.range_hi
        )))
    }

    /// Claim a specific port.
    ///
    /// Used to honor a device's previously assigned shell port across
    /// reconnects.
    pub fn reserve(&self, port: u16) -> Result<()> {
        if port < self.range_lo || port > self.range_hi {
            return Err(Error::Resource(format!(
                "port {port} outside range [{}, {}]",
                self.range_lo, self.range_hi
            )));
        }
        let mut in_use = self.in_use.lock().expect("port broker mutex poisoned");
        if !in_use.insert(port) {
            return Err(Error::Resource(format!("port {port} already in use")));
        }
        Ok(())
    }

    /// Return a port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        let mut in_use = self.in_use.lock().expect("port broker mutex poisoned");
        in_use.remove(&port);
    }

    /// Number of ports currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use.lock().expect("port broker mutex poisoned").len()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.in_use
            .lock()
            .expect("port broker mutex poisoned")
            .contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lowest_free_port_first() {
        let broker = PortBroker::new(10000, 10002);
        assert_eq!(broker.allocate().unwrap(), 10000);
        assert_eq!(broker.allocate().unwrap(), 10001);
        assert_eq!(broker.allocate().unwrap(), 10002);
    }

    #[test]
    fn test_exhaustion_is_distinct_error() {
        let broker = PortBroker::new(10000, 10001);
        broker.allocate().unwrap();
        broker.allocate().unwrap();
        let err = broker.allocate().unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        // No partial allocation happened.
        assert_eq!(broker.in_use(), 2);
    }

    #[test]
    fn test_allocate_release_roundtrip() {
        let broker = PortBroker::new(10000, 10002);
        let port = broker.allocate().unwrap();
        broker.release(port);
        assert_eq!(broker.in_use(), 0);
        // The same port comes back: state is equivalent to pre-allocation.
        assert_eq!(broker.allocate().unwrap(), port);
    }

    #[test]
    fn test_release_fills_hole() {
        let broker = PortBroker::new(10000, 10002);
        broker.allocate().unwrap();
        broker.allocate().unwrap();
        broker.release(10000);
        assert_eq!(broker.allocate().unwrap(), 10000);
    }

    #[test]
    fn test_reserve_specific_port() {
        let broker = PortBroker::new(10000, 10002);
        broker.reserve(10001).unwrap();
        assert!(broker.reserve(10001).is_err());
        assert_eq!(broker.allocate().unwrap(), 10000);
        assert_eq!(broker.allocate().unwrap(), 10002);
    }

    #[test]
    fn test_reserve_out_of_range() {
        let broker = PortBroker::new(10000, 10002);
        assert!(broker.reserve(9999).is_err());
        assert!(broker.reserve(10003).is_err());
        assert_eq!(broker.in_use(), 0);
    }

    #[test]
    fn test_release_unallocated_is_noop() {
        let broker = PortBroker::new(10000, 10002);
        broker.release(10001);
        assert_eq!(broker.in_use(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_allocation_never_doubles() {
        let broker = Arc::new(PortBroker::new(10000, 10063));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let broker = Arc::clone(&broker);
            handles.push(tokio::spawn(async move { broker.allocate() }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let port = handle.await.unwrap().unwrap();
            assert!((10000..=10063).contains(&port));
            assert!(seen.insert(port), "port {port} allocated twice");
        }
        assert!(broker.allocate().is_err());
    }
}
