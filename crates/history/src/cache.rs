//! Cache of decoded file segments.
//!
//! Keys are `(parent id, segment pointer, type tag)`; values are a
//! tagged sum over the decodable types, shared out as `Arc`s. Entries
//! expire a fixed time after their last access and the cache keeps an
//! approximate byte budget, evicting least-recently-used entries when
//! it overflows. An optional janitor thread sweeps expired entries in
//! the background.
//!
//! Decoding runs outside the cache lock; concurrent lookups of the
//! same key wait for the first decode instead of repeating it. A
//! failed decode inserts nothing, so the next lookup retries from
//! scratch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use monsoon_model::MetricMap;

use crate::dictionary::DictionaryDelta;
use crate::record::ListRecord;
use crate::segment::FileSegmentPtr;
use crate::tables::{GroupTable, MetricTable, Tables};
use crate::Result;

/// Identifies the object a cached segment hangs off. Every owner
/// (open file, block, table) draws one from [`next_parent_id`].
pub type ParentId = u64;

static PARENT_IDS: AtomicU64 = AtomicU64::new(1);

pub fn next_parent_id() -> ParentId {
    PARENT_IDS.fetch_add(1, Ordering::Relaxed)
}

/// The type a cached segment decodes to; part of the key, so one
/// extent can never be resolved as two different types.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CacheTag {
    Dictionary,
    ListRecord,
    RecordMetrics,
    Tables,
    GroupTable,
    MetricTable,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    pub parent: ParentId,
    pub ptr: FileSegmentPtr,
    pub tag: CacheTag,
}

/// A decoded segment.
#[derive(Clone, Debug)]
pub enum CachedValue {
    Dictionary(Arc<DictionaryDelta>),
    ListRecord(Arc<ListRecord>),
    RecordMetrics(Arc<MetricMap>),
    Tables(Arc<Tables>),
    GroupTable(Arc<GroupTable>),
    MetricTable(Arc<MetricTable>),
}

impl CachedValue {
    fn tag(&self) -> CacheTag {
        match self {
            CachedValue::Dictionary(_) => CacheTag::Dictionary,
            CachedValue::ListRecord(_) => CacheTag::ListRecord,
            CachedValue::RecordMetrics(_) => CacheTag::RecordMetrics,
            CachedValue::Tables(_) => CacheTag::Tables,
            CachedValue::GroupTable(_) => CacheTag::GroupTable,
            CachedValue::MetricTable(_) => CacheTag::MetricTable,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    /// Approximate byte budget. Default ≈ 256 MiB.
    pub max_bytes: usize,
    /// Entries unused for this long are dropped. Default 15 minutes.
    pub access_expire: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            max_bytes: 256 << 20,
            access_expire: Duration::from_secs(15 * 60),
        }
    }
}

struct Entry {
    value: CachedValue,
    bytes: usize,
    last_access: Instant,
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    used_bytes: usize,
}

#[derive(Default)]
struct PendingDecode {
    done: Mutex<bool>,
    cond: Condvar,
}

pub struct DecodeCache {
    opts: CacheOptions,
    inner: Mutex<Inner>,
    pending: Mutex<HashMap<CacheKey, Arc<PendingDecode>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    janitor_stop: Arc<AtomicBool>,
    janitor: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DecodeCache {
    pub fn new(opts: CacheOptions) -> Arc<Self> {
        Arc::new(DecodeCache {
            opts,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
            }),
            pending: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            janitor_stop: Arc::new(AtomicBool::new(false)),
            janitor: Mutex::new(None),
        })
    }

    /// A cache with a background sweeper for expired entries.
    pub fn with_janitor(opts: CacheOptions) -> Arc<Self> {
        let cache = Self::new(opts);
        let sweep_target = Arc::downgrade(&cache);
        let stop = Arc::clone(&cache.janitor_stop);
        let interval = opts.access_expire.min(Duration::from_secs(60));
        let handle = std::thread::Builder::new()
            .name("history-cache-janitor".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::park_timeout(interval);
                    let Some(cache) = sweep_target.upgrade() else {
                        return;
                    };
                    cache.purge_expired();
                }
            });
        match handle {
            Ok(h) => *cache.janitor.lock() = Some(h),
            Err(err) => warn!("failed to spawn cache janitor: {err}"),
        }
        cache
    }

    /// Look up `key`, decoding (and inserting) through `decode` on a
    /// miss. `decode` also reports the entry's approximate size; it
    /// may run again if a concurrent decode of the same key failed.
    pub fn get_or_decode(
        &self,
        key: CacheKey,
        mut decode: impl FnMut() -> Result<(CachedValue, usize)>,
    ) -> Result<CachedValue> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.entries.get_mut(&key) {
                    if entry.last_access.elapsed() < self.opts.access_expire {
                        entry.last_access = Instant::now();
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(entry.value.clone());
                    }
                    // Expired in place; treat as a miss.
                    let bytes = entry.bytes;
                    inner.entries.pop(&key);
                    inner.used_bytes -= bytes;
                }
            }

            // Miss. Either claim the decode or wait for whoever is
            // already doing it.
            let wait_for = {
                let mut pending = self.pending.lock();
                if let Some(p) = pending.get(&key) {
                    Some(Arc::clone(p))
                } else {
                    pending.insert(key.clone(), Arc::new(PendingDecode::default()));
                    None
                }
            };
            if let Some(p) = wait_for {
                let mut done = p.done.lock();
                while !*done {
                    p.cond.wait(&mut done);
                }
                // Retry the lookup; if the decode failed the entry is
                // absent and we take over.
                continue;
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let result = decode();

            let claimed = self
                .pending
                .lock()
                .remove(&key)
                .expect("claimed decodes stay pending until here");

            let outcome = match result {
                Ok((value, bytes)) => {
                    debug_assert_eq!(value.tag(), key.tag);
                    trace!(
                        "decoded {:?} at {}+{} in {:?} ({} bytes)",
                        key.tag,
                        key.ptr.offset(),
                        key.ptr.len(),
                        started.elapsed(),
                        bytes,
                    );
                    let mut inner = self.inner.lock();
                    inner.entries.put(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            bytes,
                            last_access: Instant::now(),
                        },
                    );
                    inner.used_bytes += bytes;
                    self.evict_overflow(&mut inner);
                    Ok(value)
                }
                Err(err) => Err(err),
            };

            *claimed.done.lock() = true;
            claimed.cond.notify_all();
            return outcome;
        }
    }

    fn evict_overflow(&self, inner: &mut Inner) {
        while inner.used_bytes > self.opts.max_bytes {
            let Some((key, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.used_bytes -= entry.bytes;
            debug!(
                "cache evicted {:?} at {}+{} ({} bytes, {} in use)",
                key.tag,
                key.ptr.offset(),
                key.ptr.len(),
                entry.bytes,
                inner.used_bytes,
            );
        }
    }

    /// Drop all entries of `parent` at `offset`, regardless of length
    /// or type.
    pub fn invalidate(&self, parent: ParentId, offset: u64) {
        let mut inner = self.inner.lock();
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.parent == parent && k.ptr.offset() == offset)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(entry) = inner.entries.pop(&key) {
                inner.used_bytes -= entry.bytes;
            }
        }
    }

    /// Sweep entries past their access expiry.
    pub fn purge_expired(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_access) >= self.opts.access_expire)
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            if let Some(entry) = inner.entries.pop(&key) {
                inner.used_bytes -= entry.bytes;
            }
        }
        if count > 0 {
            debug!("cache purged {count} expired entries");
        }
    }

    pub fn stats(&self) -> (u64, u64, usize) {
        let used = self.inner.lock().used_bytes;
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            used,
        )
    }

    /// A tiny bounded cache for tests.
    #[cfg(test)]
    fn tiny(max_bytes: usize) -> Arc<Self> {
        Self::new(CacheOptions {
            max_bytes,
            access_expire: Duration::from_secs(3600),
        })
    }
}

impl Drop for DecodeCache {
    fn drop(&mut self) {
        self.janitor_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.janitor.lock().take() {
            handle.thread().unpark();
            // The sweep may hold the last reference, making this drop
            // run on the janitor itself; it must not join then.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parent: u64, off: u64) -> CacheKey {
        CacheKey {
            parent,
            ptr: FileSegmentPtr::new(off, 8),
            tag: CacheTag::MetricTable,
        }
    }

    fn value() -> (CachedValue, usize) {
        (
            CachedValue::MetricTable(Arc::new(MetricTable::default())),
            64,
        )
    }

    #[test]
    fn second_lookup_hits() {
        let cache = DecodeCache::tiny(1 << 20);
        cache.get_or_decode(key(1, 100), || Ok(value())).unwrap();
        cache
            .get_or_decode(key(1, 100), || panic!("decode must not rerun"))
            .unwrap();
        let (hits, misses, _) = cache.stats();
        assert_eq!((hits, misses), (1, 1));
    }

    #[test]
    fn byte_budget_evicts_lru() {
        let cache = DecodeCache::tiny(128);
        cache.get_or_decode(key(1, 100), || Ok(value())).unwrap();
        cache.get_or_decode(key(1, 200), || Ok(value())).unwrap();
        // Third entry pushes out the least recently used (offset 100).
        cache.get_or_decode(key(1, 300), || Ok(value())).unwrap();

        let mut redecoded = false;
        cache
            .get_or_decode(key(1, 100), || {
                redecoded = true;
                Ok(value())
            })
            .unwrap();
        assert!(redecoded);
    }

    #[test]
    fn failed_decode_is_not_cached() {
        let cache = DecodeCache::tiny(1 << 20);
        let err = cache
            .get_or_decode(key(1, 100), || Err(crate::Error::CrcMismatch))
            .unwrap_err();
        assert!(matches!(err, crate::Error::CrcMismatch));

        // The next lookup retries from scratch.
        let mut reran = false;
        cache
            .get_or_decode(key(1, 100), || {
                reran = true;
                Ok(value())
            })
            .unwrap();
        assert!(reran);
    }

    #[test]
    fn invalidate_by_parent_and_offset() {
        let cache = DecodeCache::tiny(1 << 20);
        cache.get_or_decode(key(1, 100), || Ok(value())).unwrap();
        cache.get_or_decode(key(2, 100), || Ok(value())).unwrap();

        cache.invalidate(1, 100);

        let mut redecoded = false;
        cache
            .get_or_decode(key(1, 100), || {
                redecoded = true;
                Ok(value())
            })
            .unwrap();
        assert!(redecoded);

        // Other parent untouched.
        cache
            .get_or_decode(key(2, 100), || panic!("decode must not rerun"))
            .unwrap();
    }

    #[test]
    fn expired_entries_are_redecoded() {
        let cache = DecodeCache::new(CacheOptions {
            max_bytes: 1 << 20,
            access_expire: Duration::from_millis(0),
        });
        cache.get_or_decode(key(1, 100), || Ok(value())).unwrap();

        let mut redecoded = false;
        cache
            .get_or_decode(key(1, 100), || {
                redecoded = true;
                Ok(value())
            })
            .unwrap();
        assert!(redecoded);
    }
}
