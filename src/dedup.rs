// src/dedup.rs
//! Fingerprint dedup store with reserve-then-confirm semantics.
//!
//! `check_and_reserve` atomically checks for an existing record and, if
//! absent, inserts a provisional one — exactly one caller wins per
//! fingerprint per TTL window, which keeps overlapping manual and
//! scheduled cycles from emitting the same article twice. Expiry is lazy:
//! checked on lookup, no sweeper thread.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::article::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub first_seen_unix: u64,
    pub expires_at_unix: u64,
}

#[derive(Debug)]
pub struct DedupStore {
    inner: Mutex<HashMap<Fingerprint, DedupRecord>>,
    ttl: Duration,
}

impl DedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` exactly once per fingerprint per TTL window; every
    /// other caller observes `false` until the record expires.
    pub fn check_and_reserve(&self, fp: &Fingerprint) -> bool {
        self.check_and_reserve_at(fp, now_unix())
    }

    /// `now`-parameterized variant used by tests and by callers that
    /// already hold a timestamp.
    pub fn check_and_reserve_at(&self, fp: &Fingerprint, now: u64) -> bool {
        let mut map = self.inner.lock().expect("dedup store mutex poisoned");
        if let Some(rec) = map.get(fp) {
            if rec.expires_at_unix > now {
                return false;
            }
            // Expired: the key may be re-reserved for the same content.
            map.remove(fp);
        }
        map.insert(
            fp.clone(),
            DedupRecord {
                first_seen_unix: now,
                expires_at_unix: now.saturating_add(self.ttl.as_secs()),
            },
        );
        true
    }

    /// Drop a reservation whose cycle failed to persist, so the article is
    /// retried when it is next extracted instead of being silently lost.
    pub fn release(&self, fp: &Fingerprint) {
        let mut map = self.inner.lock().expect("dedup store mutex poisoned");
        map.remove(fp);
    }

    /// Restore a record from persistence (startup warm-up).
    pub fn restore(&self, fp: Fingerprint, rec: DedupRecord) {
        let mut map = self.inner.lock().expect("dedup store mutex poisoned");
        map.insert(fp, rec);
    }

    pub fn record(&self, fp: &Fingerprint) -> Option<DedupRecord> {
        let map = self.inner.lock().expect("dedup store mutex poisoned");
        map.get(fp).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint(s.to_string())
    }

    #[test]
    fn first_reservation_wins_then_false() {
        let store = DedupStore::new(Duration::from_secs(600));
        assert!(store.check_and_reserve_at(&fp("a"), 1000));
        assert!(!store.check_and_reserve_at(&fp("a"), 1001));
        assert!(!store.check_and_reserve_at(&fp("a"), 1500));
    }

    #[test]
    fn expired_record_can_be_reserved_again() {
        let store = DedupStore::new(Duration::from_secs(600));
        assert!(store.check_and_reserve_at(&fp("a"), 1000));
        // Not yet expired at exactly ttl - 1.
        assert!(!store.check_and_reserve_at(&fp("a"), 1599));
        // expires_at = 1600; a lookup at that instant re-admits.
        assert!(store.check_and_reserve_at(&fp("a"), 1600));
    }

    #[test]
    fn release_reopens_the_slot() {
        let store = DedupStore::new(Duration::from_secs(600));
        assert!(store.check_and_reserve_at(&fp("a"), 1000));
        store.release(&fp("a"));
        assert!(store.check_and_reserve_at(&fp("a"), 1001));
    }

    #[test]
    fn concurrent_reservations_return_true_exactly_once() {
        let store = Arc::new(DedupStore::new(Duration::from_secs(600)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.check_and_reserve(&fp("contested"))
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn distinct_fingerprints_do_not_contend() {
        let store = DedupStore::new(Duration::from_secs(600));
        assert!(store.check_and_reserve_at(&fp("a"), 1000));
        assert!(store.check_and_reserve_at(&fp("b"), 1000));
        assert_eq!(store.len(), 2);
    }
}
