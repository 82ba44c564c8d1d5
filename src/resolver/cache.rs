//! The resolver's hostname→address cache.
//!
//! Grounded on `resolver/manager.py`'s `cached` dict plus insertion-order
//! bookkeeping. REDESIGN FLAGS calls the original's exponential back-off
//! expiry probe (scan position divided by 1.3 until a non-expired entry or
//! index <= 10) unnecessary complexity; this implementation does the
//! simple thing instead: a forward linear scan from the oldest entry,
//! bounded by `expire` entries per sweep.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    hostname: String,
    addresses: Vec<IpAddr>,
    inserted_at: Instant,
}

/// A TTL-based cache of resolved hostnames, swept in insertion order.
#[derive(Debug, Default)]
pub struct Cache {
    by_hostname: HashMap<String, Vec<IpAddr>>,
    order: VecDeque<Entry>,
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            by_hostname: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Looks up a hostname without triggering any expiry.
    pub fn get(&self, hostname: &str) -> Option<&[IpAddr]> {
        self.by_hostname.get(hostname).map(|v| v.as_slice())
    }

    /// Inserts (or refreshes) a resolved answer.
    pub fn insert(&mut self, hostname: String, addresses: Vec<IpAddr>) {
        self.by_hostname.insert(hostname.clone(), addresses.clone());
        self.order.push_back(Entry {
            hostname,
            addresses,
            inserted_at: Instant::now(),
        });
    }

    /// Sweeps at most `limit` entries from the oldest end, evicting any
    /// older than `ttl`. Stops at the first still-valid entry, since
    /// `order` is maintained in (non-strictly) increasing insertion-time
    /// order — a stale refresh can leave an older duplicate behind, which
    /// this sweep will happily skip past on a later pass once it expires
    /// naturally.
    pub fn expire(&mut self, ttl: Duration, limit: usize) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for _ in 0..limit {
            match self.order.front() {
                Some(entry) if now.duration_since(entry.inserted_at) >= ttl => {
                    let entry = self.order.pop_front().expect("checked Some above");
                    // Only remove from the hostname index if the cached
                    // value hasn't since been refreshed to a newer entry.
                    if self
                        .by_hostname
                        .get(&entry.hostname)
                        .map(|v| v == &entry.addresses)
                        .unwrap_or(false)
                    {
                        self.by_hostname.remove(&entry.hostname);
                    }
                    evicted += 1;
                }
                _ => break,
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.by_hostname.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hostname.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fresh_entry_is_not_expired() {
        let mut cache = Cache::new();
        cache.insert("example.com".to_owned(), vec!["1.2.3.4".parse().unwrap()]);
        assert_eq!(cache.expire(Duration::from_secs(300), 100), 0);
        assert!(cache.get("example.com").is_some());
    }

    #[test]
    fn expired_entry_is_evicted() {
        let mut cache = Cache::new();
        cache.insert("example.com".to_owned(), vec!["1.2.3.4".parse().unwrap()]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.expire(Duration::from_millis(1), 100), 1);
        assert!(cache.get("example.com").is_none());
    }

    #[test]
    fn sweep_is_bounded_by_limit() {
        let mut cache = Cache::new();
        for i in 0..10 {
            cache.insert(format!("host{i}.example.com"), vec!["1.2.3.4".parse().unwrap()]);
        }
        std::thread::sleep(Duration::from_millis(5));
        let evicted = cache.expire(Duration::from_millis(1), 3);
        assert_eq!(evicted, 3);
        assert_eq!(cache.len(), 7);
    }
}
