//! Scan cache: bounded, TTL-indexed advertisement history per device.
//!
//! The cache has one writer (the scanner's ingest path) and many readers
//! (cache-lookup requests, the handler's device resolution). Entries whose
//! newest record is older than the TTL are pruned on access and by the
//! periodic sweep on the scanner tick.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use orchestrator_types::{MAX_HISTORY_PER_DEVICE, ScanRecord};

#[derive(Debug, Clone)]
struct CachedRecord {
    record: ScanRecord,
    observed: Instant,
}

/// Ordered, bounded advertisement history for one device. Newest last.
#[derive(Debug, Default)]
struct DeviceHistory {
    records: VecDeque<CachedRecord>,
}

impl DeviceHistory {
    fn push(&mut self, record: ScanRecord, observed: Instant) {
        if self.records.len() >= MAX_HISTORY_PER_DEVICE {
            self.records.pop_front();
        }
        self.records.push_back(CachedRecord { record, observed });
    }

    fn newest(&self) -> Option<&CachedRecord> {
        self.records.back()
    }
}

/// Mapping from canonical MAC to recent advertisement records.
#[derive(Debug)]
pub struct ScanCache {
    ttl: Duration,
    inner: RwLock<HashMap<String, DeviceHistory>>,
}

impl ScanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Append an observation to its device's history. O(1).
    ///
    /// Within one device's history, observation instants are
    /// non-decreasing because this is the only mutation path and it
    /// stamps the record on entry.
    pub async fn ingest(&self, record: ScanRecord) {
        let observed = Instant::now();
        let mut inner = self.inner.write().await;
        debug!(
            address = %record.address,
            rssi = ?record.rssi,
            "cache ingest"
        );
        inner
            .entry(record.address.clone())
            .or_default()
            .push(record, observed);
    }

    /// Newest record for `mac` if its age is within the TTL.
    ///
    /// An expired entry is pruned as a side effect.
    pub async fn lookup(&self, mac: &str) -> Option<ScanRecord> {
        {
            let inner = self.inner.read().await;
            let newest = inner.get(mac)?.newest()?;
            if newest.observed.elapsed() <= self.ttl {
                return Some(newest.record.clone());
            }
        }
        // Expired: upgrade to a write lock and prune, re-checking in case
        // a fresh record arrived between the locks.
        let mut inner = self.inner.write().await;
        if let Some(history) = inner.get(mac) {
            match history.newest() {
                Some(newest) if newest.observed.elapsed() <= self.ttl => {
                    return Some(newest.record.clone());
                }
                _ => {
                    debug!(address = %mac, "cache entry expired, pruning");
                    inner.remove(mac);
                }
            }
        }
        None
    }

    /// Snapshot of (mac, newest record) for every unexpired entry.
    pub async fn list(&self) -> Vec<(String, ScanRecord)> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .filter_map(|(mac, history)| {
                let newest = history.newest()?;
                (newest.observed.elapsed() <= self.ttl)
                    .then(|| (mac.clone(), newest.record.clone()))
            })
            .collect()
    }

    /// Number of unexpired entries.
    pub async fn active_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .values()
            .filter(|history| {
                history
                    .newest()
                    .is_some_and(|newest| newest.observed.elapsed() <= self.ttl)
            })
            .count()
    }

    /// Drop every entry whose newest record is older than the TTL.
    pub async fn sweep(&self) {
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|_, history| {
            history
                .newest()
                .is_some_and(|newest| newest.observed.elapsed() <= self.ttl)
        });
        let removed = before - inner.len();
        if removed > 0 {
            debug!(removed, "cache sweep pruned expired entries");
        }
    }

    /// History length for one device, newest included. Test aid.
    pub async fn history_len(&self, mac: &str) -> usize {
        let inner = self.inner.read().await;
        inner.get(mac).map(|h| h.records.len()).unwrap_or(0)
    }
}
