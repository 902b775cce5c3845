//! Per-IP rate limiting for dashboard authentication.
//!
//! Five failed token comparisons put an IP on a 60 second block; a
//! successful comparison clears its slate. Entries are garbage-collected
//! when cleared or on the first probe after a block expires, so the map
//! stays bounded by the set of currently-misbehaving IPs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_FAILURES: u32 = 5;
const BLOCK_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    failures: u32,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    entries: Mutex<HashMap<IpAddr, Entry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether requests from `ip` are currently rejected. Expired blocks are
    /// collected here.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(&ip) {
            Some(entry) => match entry.blocked_until {
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    entries.remove(&ip);
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    /// Record a failed token comparison; the fifth failure starts the block.
    pub fn record_failure(&self, ip: IpAddr) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let entry = entries.entry(ip).or_insert(Entry {
            failures: 0,
            blocked_until: None,
        });
        entry.failures += 1;
        if entry.failures >= MAX_FAILURES {
            entry.blocked_until = Some(Instant::now() + BLOCK_DURATION);
            tracing::warn!("rate limiting {} after {} failed attempts", ip, entry.failures);
        }
    }

    /// A successful comparison clears the IP entirely.
    pub fn clear(&self, ip: IpAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn five_failures_trigger_a_block() {
        let limiter = RateLimiter::new();
        for _ in 0..4 {
            limiter.record_failure(ip(2));
            assert!(!limiter.is_blocked(ip(2)));
        }
        limiter.record_failure(ip(2));
        assert!(limiter.is_blocked(ip(2)));
    }

    #[test]
    fn other_ips_are_unaffected() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.record_failure(ip(2));
        }
        assert!(limiter.is_blocked(ip(2)));
        assert!(!limiter.is_blocked(ip(3)));
    }

    #[test]
    fn success_clears_the_counter() {
        let limiter = RateLimiter::new();
        for _ in 0..4 {
            limiter.record_failure(ip(4));
        }
        limiter.clear(ip(4));
        // Four more failures should still not block.
        for _ in 0..4 {
            limiter.record_failure(ip(4));
            assert!(!limiter.is_blocked(ip(4)));
        }
    }

    #[test]
    fn block_expires_and_entry_is_collected() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.record_failure(ip(5));
        }
        // Rewind the block deadline instead of sleeping a minute.
        {
            let mut entries = limiter.entries.lock().unwrap();
            let entry = entries.get_mut(&ip(5)).unwrap();
            entry.blocked_until = Some(Instant::now());
        }
        assert!(!limiter.is_blocked(ip(5)));
        // The expired entry is gone, counter included.
        assert!(limiter.entries.lock().unwrap().get(&ip(5)).is_none());
    }
}
