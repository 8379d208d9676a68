// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client-IP to worker affinity.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Maximum number of live entries.
pub const MAX_ENTRIES: usize = 100;

/// How long an assignment sticks.
pub const TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct AffinityEntry {
    worker: usize,
    expires_at: Instant,
}

/// Bounded TTL map from client IP to assigned worker index.
///
/// Only the master reads and writes this cache; there is no cross-process
/// sharing.
#[derive(Debug)]
pub struct AffinityCache {
    entries: HashMap<IpAddr, AffinityEntry>,
    capacity: usize,
    ttl: Duration,
}

impl AffinityCache {
    /// Creates a cache with the default capacity and TTL.
    pub fn new() -> Self {
        Self::with_settings(MAX_ENTRIES, TTL)
    }

    fn with_settings(capacity: usize, ttl: Duration) -> Self {
        AffinityCache {
            entries: HashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Looks up the worker assigned to `ip`. Expired entries are absent.
    pub fn get(&mut self, ip: IpAddr) -> Option<usize> {
        self.get_at(ip, Instant::now())
    }

    /// Assigns `worker` to `ip` for the next TTL window.
    pub fn put(&mut self, ip: IpAddr, worker: usize) {
        self.put_at(ip, worker, Instant::now());
    }

    /// Number of stored entries, counting not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_at(&mut self, ip: IpAddr, now: Instant) -> Option<usize> {
        match self.entries.get(&ip) {
            Some(entry) if now <= entry.expires_at => Some(entry.worker),
            Some(_) => {
                self.entries.remove(&ip);
                None
            }
            None => None,
        }
    }

    fn put_at(&mut self, ip: IpAddr, worker: usize, now: Instant) {
        if !self.entries.contains_key(&ip) && self.entries.len() >= self.capacity {
            self.evict_soonest();
        }
        self.entries.insert(
            ip,
            AffinityEntry {
                worker,
                expires_at: now + self.ttl,
            },
        );
    }

    // The entry closest to expiry is the oldest insertion, since every
    // insert uses the same TTL.
    fn evict_soonest(&mut self) {
        if let Some(ip) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(ip, _)| *ip)
        {
            self.entries.remove(&ip);
        }
    }
}

impl Default for AffinityCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::AffinityCache;
    use std::net::IpAddr;
    use std::time::{Duration, Instant};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn hit_within_ttl_returns_assignment() {
        let mut cache = AffinityCache::new();
        let t0 = Instant::now();
        cache.put_at(ip("10.0.0.1"), 1, t0);
        assert_eq!(
            Some(1),
            cache.get_at(ip("10.0.0.1"), t0 + Duration::from_secs(29))
        );
    }

    #[test]
    fn expired_entry_is_absent_and_removed() {
        let mut cache = AffinityCache::new();
        let t0 = Instant::now();
        cache.put_at(ip("10.0.0.1"), 1, t0);
        assert_eq!(
            None,
            cache.get_at(ip("10.0.0.1"), t0 + Duration::from_secs(31))
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_refreshes_expiry() {
        let mut cache = AffinityCache::new();
        let t0 = Instant::now();
        cache.put_at(ip("10.0.0.1"), 0, t0);
        cache.put_at(ip("10.0.0.1"), 0, t0 + Duration::from_secs(20));
        assert_eq!(
            Some(0),
            cache.get_at(ip("10.0.0.1"), t0 + Duration::from_secs(45))
        );
    }

    #[test]
    fn full_cache_evicts_entry_closest_to_expiry() {
        let mut cache = AffinityCache::with_settings(2, Duration::from_secs(30));
        let t0 = Instant::now();
        cache.put_at(ip("10.0.0.1"), 0, t0);
        cache.put_at(ip("10.0.0.2"), 1, t0 + Duration::from_secs(1));
        cache.put_at(ip("10.0.0.3"), 0, t0 + Duration::from_secs(2));

        assert_eq!(2, cache.len());
        assert_eq!(None, cache.get_at(ip("10.0.0.1"), t0 + Duration::from_secs(2)));
        assert_eq!(
            Some(1),
            cache.get_at(ip("10.0.0.2"), t0 + Duration::from_secs(2))
        );
        assert_eq!(
            Some(0),
            cache.get_at(ip("10.0.0.3"), t0 + Duration::from_secs(2))
        );
    }

    #[test]
    fn rewriting_existing_key_does_not_evict() {
        let mut cache = AffinityCache::with_settings(2, Duration::from_secs(30));
        let t0 = Instant::now();
        cache.put_at(ip("10.0.0.1"), 0, t0);
        cache.put_at(ip("10.0.0.2"), 1, t0);
        cache.put_at(ip("10.0.0.1"), 0, t0 + Duration::from_secs(5));

        assert_eq!(2, cache.len());
        assert_eq!(Some(1), cache.get_at(ip("10.0.0.2"), t0 + Duration::from_secs(6)));
    }
}
