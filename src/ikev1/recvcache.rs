use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use log::debug;

use super::crypto;

struct Entry {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    reply: Vec<u8>,
    retries_left: usize,
    created: Instant,
}

/// Remembers replies to recently processed messages, so that a retransmitted
/// request is answered with the same bytes instead of being processed again.
pub struct ReceivedCache {
    entries: HashMap<[u8; 20], Entry>,
    retry_count: usize,
    lifetime: Duration,
}

impl ReceivedCache {
    pub fn new(retry_count: usize, retry_interval: Duration) -> ReceivedCache {
        ReceivedCache {
            entries: HashMap::new(),
            retry_count,
            lifetime: retry_interval * retry_count.max(1) as u32,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Returns the stored reply if this message was already answered.
    pub fn check(
        &mut self,
        message: &[u8],
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Option<Vec<u8>> {
        let hash = crypto::hash_sha1(&[message]);
        let entry = self.entries.get_mut(&hash)?;
        if entry.remote_addr != remote_addr || entry.local_addr != local_addr {
            debug!(
                "Received message hash matches a message from {}, treating message from {} as new",
                entry.remote_addr, remote_addr
            );
            return None;
        }
        let reply = entry.reply.clone();
        entry.retries_left = entry.retries_left.saturating_sub(1);
        if entry.retries_left == 0 {
            debug!("Retransmission budget for {} exhausted", remote_addr);
            self.entries.remove(&hash);
        }
        Some(reply)
    }

    pub fn add(
        &mut self,
        message: &[u8],
        reply: &[u8],
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) {
        let hash = crypto::hash_sha1(&[message]);
        self.entries.insert(
            hash,
            Entry {
                remote_addr,
                local_addr,
                reply: reply.to_vec(),
                retries_left: self.retry_count,
                created: now,
            },
        );
    }

    /// Drops entries older than the cache lifetime, returning how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let lifetime = self.lifetime;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.created) <= lifetime);
        before - self.entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn duplicate_returns_stored_reply() {
        let now = Instant::now();
        let mut cache = ReceivedCache::new(2, Duration::from_secs(10));
        let remote = addr("192.0.2.1:500");
        let local = addr("192.0.2.2:500");
        assert!(cache.check(b"request", remote, local).is_none());
        cache.add(b"request", b"reply", remote, local, now);
        assert_eq!(cache.check(b"request", remote, local), Some(b"reply".to_vec()));
        assert_eq!(cache.check(b"request", remote, local), Some(b"reply".to_vec()));
        // Budget exhausted, entry is gone.
        assert!(cache.check(b"request", remote, local).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn different_address_is_first_sighting() {
        let now = Instant::now();
        let mut cache = ReceivedCache::new(5, Duration::from_secs(10));
        let local = addr("192.0.2.2:500");
        cache.add(b"request", b"reply", addr("192.0.2.1:500"), local, now);
        assert!(cache
            .check(b"request", addr("198.51.100.7:500"), local)
            .is_none());
        assert_eq!(cache.len(), 1);
        assert!(cache
            .check(b"other request", addr("192.0.2.1:500"), local)
            .is_none());
    }

    #[test]
    fn sweep_removes_old_entries() {
        let now = Instant::now();
        let mut cache = ReceivedCache::new(5, Duration::from_secs(10));
        assert_eq!(cache.lifetime(), Duration::from_secs(50));
        let remote = addr("192.0.2.1:500");
        let local = addr("192.0.2.2:500");
        cache.add(b"old", b"reply", remote, local, now);
        cache.add(b"new", b"reply", remote, local, now + Duration::from_secs(30));
        assert_eq!(cache.sweep(now + Duration::from_secs(40)), 0);
        assert_eq!(cache.sweep(now + Duration::from_secs(51)), 1);
        assert!(cache.check(b"new", remote, local).is_some());
    }
}
