use rand::Rng;
use reproxy_core::config::LbType;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses an index in `[0, n)` among `n` alive candidate destinations sharing one source
/// regex. `n` is always the post-health-filter count; failover relies on that filtering having
/// already dropped the dead ones.
pub struct LoadBalancer {
    lb_type: LbType,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(lb_type: LbType) -> Self {
        Self { lb_type, round_robin_counter: AtomicUsize::new(0) }
    }

    /// Panics if `n == 0`; callers must filter to alive routes first and bail out on an empty
    /// group before calling this.
    pub fn select(&self, n: usize) -> usize {
        assert!(n > 0, "load balancer selection requires at least one candidate");
        match self.lb_type {
            LbType::RoundRobin => self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % n,
            LbType::Random => rand::thread_rng().gen_range(0..n),
            LbType::Failover => 0,
        }
    }
}
