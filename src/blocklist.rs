use std::net::IpAddr;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use tracing::debug;

use crate::config::MAX_DURATION;

pub const DEFAULT_BLOCKLIST_TTL: Duration = Duration::from_secs(2);
pub const DEFAULT_BLOCKLIST_CAPACITY: u64 = 128;

/// Short-lived negative cache of clients that failed verification.
///
/// Backed by `moka::sync::Cache` storing each entry's expiry. The cache's own
/// time-to-live evicts entries in the background; lookups also compare the
/// stored expiry so an entry is never honored past its TTL.
#[derive(Debug, Clone)]
pub struct Blocklist {
    inner: Cache<IpAddr, Instant>,
    ttl: Duration,
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKLIST_CAPACITY, DEFAULT_BLOCKLIST_TTL)
    }
}

impl Blocklist {
    /// `ttl` is clamped to [`MAX_DURATION`].
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let ttl = ttl.min(MAX_DURATION);
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_blocked(&self, identity: IpAddr) -> bool {
        let identity = identity.to_canonical();
        match self.inner.get(&identity) {
            Some(expiry) if expiry > Instant::now() => true,
            Some(_) => {
                self.inner.invalidate(&identity);
                false
            }
            None => false,
        }
    }

    /// Insert or refresh `identity` for one TTL from now.
    pub fn block(&self, identity: IpAddr) {
        let identity = identity.to_canonical();
        debug!(%identity, ttl_ms = self.ttl.as_millis() as u64, "blocking client");
        self.inner.insert(identity, Instant::now() + self.ttl);
    }
}
