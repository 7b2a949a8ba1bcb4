//! Bounded, keyed buffer of not-yet-sent beacon fragments.
//!
//! The [`EventCache`] maps a [`SessionKey`] to two ordered record lists
//! (event-class and action-class) and maintains one process-wide running
//! byte total. Producers append on application threads; the sender extracts
//! chunks and the evictor removes records by age and by size, all
//! concurrently.
//!
//! # Locking
//!
//! The key map is behind an `RwLock`; each entry is behind its own `Mutex`
//! so that same-session chunk extraction serializes against same-session
//! appends while cross-session producers never contend. The global size
//! total is an atomic, adjusted only while the owning entry's lock is held.
//!
//! # Invariants
//!
//! - The global size total equals the sum of stored record lengths.
//! - `extract_chunk` never splits a record across chunk boundaries. A
//!   single record larger than the chunk bound forms its own chunk, so an
//!   oversized record can never wedge the pipeline.
//! - Space eviction removes the globally oldest record first, across all
//!   keys, not per-key round robin.

pub mod evictor;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

/// Identifies one underlying session instance.
///
/// The sequence number increments each time a logical session is split, so
/// every split produces a distinct cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Session number assigned at session creation.
    pub session_number: i32,
    /// Sequence number within the logical session, starting at 0.
    pub sequence_number: i32,
}

impl SessionKey {
    /// Creates a key for the first instance of a logical session.
    #[must_use]
    pub const fn new(session_number: i32) -> Self {
        Self {
            session_number,
            sequence_number: 0,
        }
    }

    /// Returns the key of the next split instance.
    #[must_use]
    pub const fn next_split(self) -> Self {
        Self {
            session_number: self.session_number,
            sequence_number: self.sequence_number + 1,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session_number, self.sequence_number)
    }
}

/// Which record list a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// Events, values, errors, crashes, session markers.
    Event,
    /// Completed actions.
    Action,
}

/// One serialized beacon fragment. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    /// Creation timestamp in epoch milliseconds.
    pub timestamp_ms: i64,
    /// Raw wire-format fragment.
    pub data: String,
}

impl CacheRecord {
    /// Returns the size this record contributes to the cache total.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Default)]
struct CacheEntry {
    events: VecDeque<CacheRecord>,
    actions: VecDeque<CacheRecord>,
}

impl CacheEntry {
    fn is_empty(&self) -> bool {
        self.events.is_empty() && self.actions.is_empty()
    }

    fn size_bytes(&self) -> u64 {
        self.events
            .iter()
            .chain(self.actions.iter())
            .map(CacheRecord::size_bytes)
            .sum()
    }

    /// Timestamp of the oldest record in either list, if any.
    fn oldest_timestamp(&self) -> Option<i64> {
        let event_ts = self.events.front().map(|r| r.timestamp_ms);
        let action_ts = self.actions.front().map(|r| r.timestamp_ms);
        match (event_ts, action_ts) {
            (Some(e), Some(a)) => Some(e.min(a)),
            (ts, None) | (None, ts) => ts,
        }
    }

    /// Removes the oldest record in either list.
    fn pop_oldest(&mut self) -> Option<CacheRecord> {
        let event_ts = self.events.front().map(|r| r.timestamp_ms);
        let action_ts = self.actions.front().map(|r| r.timestamp_ms);
        match (event_ts, action_ts) {
            (Some(e), Some(a)) if a < e => self.actions.pop_front(),
            (Some(_), _) => self.events.pop_front(),
            (None, Some(_)) => self.actions.pop_front(),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Default)]
struct ChangeSignal {
    generation: Mutex<u64>,
    condvar: Condvar,
}

/// Bounded buffer of serialized beacon fragments, keyed by session.
#[derive(Debug, Default)]
pub struct EventCache {
    entries: RwLock<HashMap<SessionKey, Arc<Mutex<CacheEntry>>>>,
    total_size: AtomicU64,
    change: ChangeSignal,
}

impl EventCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one serialized fragment for the given session.
    ///
    /// Amortized O(1); increases the global size total by the fragment
    /// length and wakes the evictor.
    pub fn append(&self, key: SessionKey, class: RecordClass, timestamp_ms: i64, data: String) {
        if data.is_empty() {
            return;
        }
        let entry = self.entry_for(key);
        let record = CacheRecord { timestamp_ms, data };
        let size = record.size_bytes();
        {
            let mut guard = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match class {
                RecordClass::Event => guard.events.push_back(record),
                RecordClass::Action => guard.actions.push_back(record),
            }
            self.total_size.fetch_add(size, Ordering::SeqCst);
        }
        self.notify_changed();
    }

    /// Extracts the next chunk of pending data for a session, oldest first,
    /// joined with `&`, bounded by `max_bytes`.
    ///
    /// Extracted records are removed from the cache. Returns an empty
    /// string when nothing is pending. Event-class records drain before
    /// action-class records. A record is never split: the first record of a
    /// chunk is always included even if it alone exceeds `max_bytes`.
    #[must_use]
    pub fn extract_chunk(&self, key: SessionKey, max_bytes: usize) -> String {
        let Some(entry) = self.lookup(key) else {
            return String::new();
        };
        let mut guard = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut chunk = String::new();
        let mut removed: u64 = 0;
        loop {
            let next_len = match (guard.events.front(), guard.actions.front()) {
                (Some(r), _) | (None, Some(r)) => r.data.len(),
                (None, None) => break,
            };
            let projected = if chunk.is_empty() {
                next_len
            } else {
                chunk.len() + 1 + next_len
            };
            if !chunk.is_empty() && projected > max_bytes {
                break;
            }
            let record = if guard.events.is_empty() {
                guard.actions.pop_front()
            } else {
                guard.events.pop_front()
            };
            let Some(record) = record else { break };
            removed += record.size_bytes();
            if !chunk.is_empty() {
                chunk.push('&');
            }
            chunk.push_str(&record.data);
        }
        if removed > 0 {
            self.total_size.fetch_sub(removed, Ordering::SeqCst);
        }
        chunk
    }

    /// Removes all records with a creation timestamp strictly before
    /// `min_timestamp_ms`, across all keys. Returns the number evicted.
    pub fn evict_older_than(&self, min_timestamp_ms: i64) -> usize {
        let entries = self.snapshot();
        let mut evicted = 0;
        for (_, entry) in entries {
            let mut guard = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = &mut *guard;
            let mut removed_size: u64 = 0;
            for list in [&mut entry.events, &mut entry.actions] {
                while let Some(front) = list.front() {
                    if front.timestamp_ms >= min_timestamp_ms {
                        break;
                    }
                    if let Some(record) = list.pop_front() {
                        removed_size += record.size_bytes();
                        evicted += 1;
                    }
                }
            }
            if removed_size > 0 {
                self.total_size.fetch_sub(removed_size, Ordering::SeqCst);
            }
        }
        evicted
    }

    /// Removes globally-oldest records until the total size is at or below
    /// `lower_bound_bytes`. Returns the number evicted.
    pub fn evict_to_size(&self, lower_bound_bytes: u64) -> usize {
        let mut evicted = 0;
        while self.total_size() > lower_bound_bytes {
            let entries = self.snapshot();
            // Find the key holding the globally oldest record.
            let mut oldest: Option<(i64, Arc<Mutex<CacheEntry>>)> = None;
            for (_, entry) in entries {
                let guard = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(ts) = guard.oldest_timestamp() {
                    let is_older = oldest.as_ref().is_none_or(|(best, _)| ts < *best);
                    if is_older {
                        drop(guard);
                        oldest = Some((ts, entry));
                    }
                }
            }
            let Some((_, entry)) = oldest else { break };
            let mut guard = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(record) = guard.pop_oldest() {
                self.total_size
                    .fetch_sub(record.size_bytes(), Ordering::SeqCst);
                evicted += 1;
            }
        }
        evicted
    }

    /// Returns whether a session has no pending data.
    #[must_use]
    pub fn is_empty(&self, key: SessionKey) -> bool {
        self.lookup(key).is_none_or(|entry| {
            entry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_empty()
        })
    }

    /// Removes a session's cache slot entirely, e.g. when the session
    /// finally closes.
    pub fn delete_entry(&self, key: SessionKey) {
        let removed = {
            let mut map = self
                .entries
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.remove(&key)
        };
        if let Some(entry) = removed {
            let guard = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let size = guard.size_bytes();
            if size > 0 {
                self.total_size.fetch_sub(size, Ordering::SeqCst);
            }
        }
    }

    /// Current global size total in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// Total number of records currently cached, across all keys.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.snapshot()
            .into_iter()
            .map(|(_, entry)| {
                let guard = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                guard.events.len() + guard.actions.len()
            })
            .sum()
    }

    /// Keys with a cache slot, in unspecified order.
    #[must_use]
    pub fn keys(&self) -> Vec<SessionKey> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Blocks until a record is appended or the timeout elapses.
    ///
    /// Returns `true` when woken by an append, `false` on timeout. Used by
    /// the evictor so it can react promptly to bursts without polling.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        let guard = self
            .change
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = *guard;
        let (guard, result) = self
            .change
            .condvar
            .wait_timeout_while(guard, timeout, |generation| *generation == start)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        drop(guard);
        !result.timed_out()
    }

    /// Wakes any thread blocked in [`wait_for_change`](Self::wait_for_change)
    /// without appending data. Used by the evictor's shutdown path.
    pub(crate) fn wake_waiters(&self) {
        self.notify_changed();
    }

    fn notify_changed(&self) {
        let mut generation = self
            .change
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.change.condvar.notify_all();
    }

    fn lookup(&self, key: SessionKey) -> Option<Arc<Mutex<CacheEntry>>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    fn entry_for(&self, key: SessionKey) -> Arc<Mutex<CacheEntry>> {
        if let Some(entry) = self.lookup(key) {
            return entry;
        }
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(map.entry(key).or_default())
    }

    fn snapshot(&self) -> Vec<(SessionKey, Arc<Mutex<CacheEntry>>)> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect()
    }
}
