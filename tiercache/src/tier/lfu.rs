//! LFU (Least Frequently Used) memory tier
//!
//! Frequency buckets give O(1) touch and eviction. The victim is an arbitrary
//! member of the lowest-frequency bucket; no FIFO/LIFO order is promised
//! among keys that share a frequency.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use super::{CacheLevel, CacheTier, TierResult, TierWrite};
use crate::clock::SharedClock;
use crate::entry::CacheEntry;

struct LfuState {
    entries: HashMap<String, CacheEntry>,
    frequencies: HashMap<String, u64>,
    freq_to_keys: HashMap<u64, HashSet<String>>,
    min_freq: u64,
    max_entries: usize,
    bytes: usize,
    evictions: u64,
}

impl LfuState {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            frequencies: HashMap::new(),
            freq_to_keys: HashMap::new(),
            min_freq: 0,
            max_entries,
            bytes: 0,
            evictions: 0,
        }
    }

    /// Move `key` from its bucket to the next frequency
    fn touch(&mut self, key: &str) {
        let Some(freq) = self.frequencies.get_mut(key) else {
            return;
        };
        let old = *freq;
        *freq += 1;

        if let Some(bucket) = self.freq_to_keys.get_mut(&old) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.freq_to_keys.remove(&old);
                if old == self.min_freq {
                    self.min_freq = old + 1;
                }
            }
        }
        self.freq_to_keys
            .entry(old + 1)
            .or_default()
            .insert(key.to_string());
    }

    fn insert_new(&mut self, entry: CacheEntry) {
        let key = entry.key.clone();
        self.bytes += entry.size;
        self.entries.insert(key.clone(), entry);
        self.frequencies.insert(key.clone(), 1);
        self.freq_to_keys.entry(1).or_default().insert(key);
        self.min_freq = 1;
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size);

        if let Some(freq) = self.frequencies.remove(key) {
            if let Some(bucket) = self.freq_to_keys.get_mut(&freq) {
                bucket.remove(key);
                if bucket.is_empty() {
                    self.freq_to_keys.remove(&freq);
                    if freq == self.min_freq {
                        self.recompute_min_freq();
                    }
                }
            }
        }
        Some(entry)
    }

    fn recompute_min_freq(&mut self) {
        self.min_freq = self.freq_to_keys.keys().copied().min().unwrap_or(0);
    }

    fn evict(&mut self) -> Option<CacheEntry> {
        if !self.freq_to_keys.contains_key(&self.min_freq) {
            self.recompute_min_freq();
        }
        let victim = self
            .freq_to_keys
            .get(&self.min_freq)
            .and_then(|bucket| bucket.iter().next().cloned())?;
        self.remove(&victim)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.frequencies.clear();
        self.freq_to_keys.clear();
        self.min_freq = 0;
        self.bytes = 0;
    }
}

/// In-memory tier evicting the least frequently accessed entry
pub struct LfuTier {
    state: Mutex<LfuState>,
    clock: SharedClock,
}

impl LfuTier {
    pub fn new(max_entries: usize, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(LfuState::new(max_entries.max(1))),
            clock,
        }
    }

    /// Current access frequency of `key`
    pub fn frequency(&self, key: &str) -> Option<u64> {
        self.state.lock().frequencies.get(key).copied()
    }
}

impl CacheTier for LfuTier {
    fn level(&self) -> CacheLevel {
        CacheLevel::Memory
    }

    fn get(&self, key: &str) -> TierResult<CacheEntry> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired_at(now),
            None => return TierResult::Miss,
        };
        if expired {
            state.remove(key);
            debug!("LFU expired on access: {}", key);
            return TierResult::Miss;
        }

        state.touch(key);
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.update_access_at(now);
                TierResult::Hit(entry.clone())
            }
            None => TierResult::Miss,
        }
    }

    fn peek(&self, key: &str) -> TierResult<CacheEntry> {
        match self.state.lock().entries.get(key) {
            Some(entry) => TierResult::Hit(entry.clone()),
            None => TierResult::Miss,
        }
    }

    fn put(&self, entry: &CacheEntry) -> TierWrite {
        let mut state = self.state.lock();

        if let Some(slot) = state.entries.get_mut(&entry.key) {
            let old_size = std::mem::replace(slot, entry.clone()).size;
            // Replacing counts as an access
            state.bytes = state.bytes.saturating_sub(old_size) + entry.size;
            state.touch(&entry.key);
            return TierWrite::Stored;
        }

        if state.entries.len() >= state.max_entries {
            if let Some(evicted) = state.evict() {
                state.evictions += 1;
                debug!("LFU evict: {}", evicted.key);
            }
        }

        state.insert_new(entry.clone());
        TierWrite::Stored
    }

    fn remove(&self, key: &str) -> TierResult<()> {
        match self.state.lock().remove(key) {
            Some(_) => TierResult::Hit(()),
            None => TierResult::Miss,
        }
    }

    fn clear(&self) -> bool {
        self.state.lock().clear();
        true
    }

    fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn byte_size(&self) -> usize {
        self.state.lock().bytes
    }

    fn capacity_evictions(&self) -> u64 {
        self.state.lock().evictions
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    fn remove_tagged(&self, tags: &BTreeSet<String>) -> usize {
        let mut state = self.state.lock();
        let tagged: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.has_any_tag(tags))
            .map(|e| e.key.clone())
            .collect();
        for key in &tagged {
            state.remove(key);
        }
        tagged.len()
    }

    fn compact(&self) {
        let mut state = self.state.lock();
        state.entries.shrink_to_fit();
        state.frequencies.shrink_to_fit();
        state.freq_to_keys.shrink_to_fit();
    }
}
