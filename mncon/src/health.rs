//! Readiness aggregation for the health endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared readiness state: ready iff bootstrap completed and both port
/// monitors currently report healthy. Cloneable handle, updated by the
/// orchestrator and read by the health endpoint.
#[derive(Clone, Debug, Default)]
pub struct Health {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    bootstrapped: AtomicBool,
    mongo_healthy: AtomicBool,
    nats_healthy: AtomicBool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            bootstrapped: AtomicBool::new(false),
            mongo_healthy: AtomicBool::new(true),
            nats_healthy: AtomicBool::new(true),
        }
    }
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bootstrapped(&self, value: bool) {
        self.inner.bootstrapped.store(value, Ordering::Relaxed);
    }

    pub fn set_mongo_healthy(&self, value: bool) {
        self.inner.mongo_healthy.store(value, Ordering::Relaxed);
    }

    pub fn set_nats_healthy(&self, value: bool) {
        self.inner.nats_healthy.store(value, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.bootstrapped.load(Ordering::Relaxed)
            && self.inner.mongo_healthy.load(Ordering::Relaxed)
            && self.inner.nats_healthy.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_before_bootstrap() {
        let health = Health::new();
        assert!(!health.is_ready());
    }

    #[test]
    fn ready_after_bootstrap() {
        let health = Health::new();
        health.set_bootstrapped(true);
        assert!(health.is_ready());
    }

    #[test]
    fn unhealthy_port_flips_readiness() {
        let health = Health::new();
        health.set_bootstrapped(true);

        health.set_mongo_healthy(false);
        assert!(!health.is_ready());
        health.set_mongo_healthy(true);
        assert!(health.is_ready());

        health.set_nats_healthy(false);
        assert!(!health.is_ready());
    }

    #[test]
    fn clones_share_state() {
        let health = Health::new();
        let clone = health.clone();
        health.set_bootstrapped(true);
        assert!(clone.is_ready());
    }
}
