//! LRU tile cache with single-flight loads
//!
//! Decoded tiles are cached process-wide, keyed by data file and frame
//! offset, with byte-budget eviction. Concurrent requests for the same tile
//! coalesce: one caller performs the read, the rest wait for it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::Result;

/// Default cache capacity when no storage manager configured one
const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

static TILE_CACHE: Lazy<TileCache> = Lazy::new(|| TileCache::new(DEFAULT_CAPACITY));

/// The process-wide tile cache.
pub fn tile_cache() -> &'static TileCache {
    &TILE_CACHE
}

/// Cache key: one frame of one data file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    path: PathBuf,
    offset: u64,
}

impl TileKey {
    pub fn new(path: &Path, offset: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            offset,
        }
    }
}

struct Entry {
    key: TileKey,
    value: Bytes,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Index-based doubly-linked LRU list with byte accounting
struct CacheInner {
    capacity: u64,
    bytes: u64,
    map: AHashMap<TileKey, usize>,
    entries: Vec<Option<Entry>>,
    free_list: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl CacheInner {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            bytes: 0,
            map: AHashMap::new(),
            entries: Vec::new(),
            free_list: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn get(&mut self, key: &TileKey) -> Option<Bytes> {
        let index = *self.map.get(key)?;
        self.move_to_front(index);
        self.entries[index].as_ref().map(|e| e.value.clone())
    }

    fn put(&mut self, key: TileKey, value: Bytes) {
        if let Some(&index) = self.map.get(&key) {
            if let Some(entry) = &mut self.entries[index] {
                self.bytes -= entry.value.len() as u64;
                self.bytes += value.len() as u64;
                entry.value = value;
            }
            self.move_to_front(index);
        } else {
            self.bytes += value.len() as u64;
            let index = self.allocate_entry(key.clone(), value);
            self.map.insert(key, index);
            self.push_front(index);
        }
        while self.bytes > self.capacity && self.map.len() > 1 {
            self.evict();
        }
    }

    fn allocate_entry(&mut self, key: TileKey, value: Bytes) -> usize {
        let entry = Entry {
            key,
            value,
            prev: None,
            next: None,
        };
        if let Some(index) = self.free_list.pop() {
            self.entries[index] = Some(entry);
            index
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        }
    }

    fn push_front(&mut self, index: usize) {
        if let Some(entry) = &mut self.entries[index] {
            entry.prev = None;
            entry.next = self.head;
        }
        if let Some(old_head) = self.head {
            if let Some(entry) = &mut self.entries[old_head] {
                entry.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match &self.entries[index] {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(entry) = &mut self.entries[p] {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(entry) = &mut self.entries[n] {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }

    fn evict(&mut self) {
        let Some(tail_index) = self.tail else { return };
        self.unlink(tail_index);
        if let Some(entry) = self.entries[tail_index].take() {
            self.bytes -= entry.value.len() as u64;
            self.map.remove(&entry.key);
        }
        self.free_list.push(tail_index);
    }
}

/// In-flight load marker; followers block on the condvar
struct Flight {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    fn finish(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }
}

/// Shared tile cache
pub struct TileCache {
    inner: Mutex<CacheInner>,
    inflight: Mutex<AHashMap<TileKey, Arc<Flight>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TileCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::new(capacity)),
            inflight: Mutex::new(AHashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn set_capacity(&self, capacity: u64) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        while inner.bytes > inner.capacity && inner.map.len() > 1 {
            inner.evict();
        }
    }

    /// Fetch a tile, loading it with `load` on a miss. Exactly one caller
    /// runs `load` per key at a time; a failed load is not cached and the
    /// next waiter retries it.
    pub fn get_or_load(
        &self,
        key: &TileKey,
        load: impl FnOnce() -> Result<Bytes>,
    ) -> Result<Bytes> {
        let mut load = Some(load);
        loop {
            if let Some(bytes) = self.inner.lock().get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(bytes);
            }

            let existing = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(flight) => Some(flight.clone()),
                    None => {
                        inflight.insert(key.clone(), Arc::new(Flight::new()));
                        None
                    }
                }
            };

            match existing {
                Some(flight) => {
                    // Another thread is reading this tile; wait and re-check.
                    flight.wait();
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let result = match load.take() {
                        Some(f) => f(),
                        None => unreachable!("leader role acquired twice"),
                    };
                    if let Ok(bytes) = &result {
                        self.inner.lock().put(key.clone(), bytes.clone());
                    }
                    let flight = self.inflight.lock().remove(key);
                    if let Some(flight) = flight {
                        flight.finish();
                    }
                    return result;
                }
            }
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn bytes_used(&self) -> u64 {
        self.inner.lock().bytes
    }
}
