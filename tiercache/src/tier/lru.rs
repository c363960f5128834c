use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use super::{CacheLevel, CacheTier, TierResult, TierWrite};
use crate::clock::SharedClock;
use crate::entry::CacheEntry;

type SlotId = usize;

/// Recency list node stored in the slot arena
struct Node {
    entry: CacheEntry,
    /// Towards the most recent end
    prev: Option<SlotId>,
    /// Towards the least recent end
    next: Option<SlotId>,
}

/// Index + slot arena + intrusive doubly linked recency list.
///
/// `head` is the most recently used slot, `tail` the least.
struct LruState {
    index: HashMap<String, SlotId>,
    slots: Vec<Option<Node>>,
    free: Vec<SlotId>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    max_entries: usize,
    bytes: usize,
    evictions: u64,
}

impl LruState {
    fn new(max_entries: usize) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            max_entries,
            bytes: 0,
            evictions: 0,
        }
    }

    fn node(&self, id: SlotId) -> Option<&Node> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: SlotId) -> Option<&mut Node> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    fn detach(&mut self, id: SlotId) {
        let (prev, next) = match self.node(id) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(id) {
            node.prev = None;
            node.next = None;
        }
    }

    fn attach_front(&mut self, id: SlotId) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(id) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn move_to_front(&mut self, id: SlotId) {
        if self.head != Some(id) {
            self.detach(id);
            self.attach_front(id);
        }
    }

    fn insert_new(&mut self, entry: CacheEntry) {
        let key = entry.key.clone();
        self.bytes += entry.size;
        let node = Node {
            entry,
            prev: None,
            next: None,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, id);
        self.attach_front(id);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let id = self.index.remove(key)?;
        self.detach(id);
        let node = self.slots.get_mut(id)?.take()?;
        self.free.push(id);
        self.bytes = self.bytes.saturating_sub(node.entry.size);
        Some(node.entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let id = self.tail?;
        let key = self.node(id)?.entry.key.clone();
        self.remove(&key)
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.bytes = 0;
    }

    fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.slots.iter().flatten().map(|node| &node.entry)
    }
}

/// In-memory tier with strict recency eviction
pub struct LruTier {
    state: Mutex<LruState>,
    clock: SharedClock,
}

impl LruTier {
    pub fn new(max_entries: usize, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(LruState::new(max_entries.max(1))),
            clock,
        }
    }

    /// Keys from most to least recently used
    pub fn recency_order(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut keys = Vec::with_capacity(state.index.len());
        let mut cursor = state.head;
        while let Some(id) = cursor {
            match state.node(id) {
                Some(node) => {
                    keys.push(node.entry.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }
}

impl CacheTier for LruTier {
    fn level(&self) -> CacheLevel {
        CacheLevel::Memory
    }

    fn get(&self, key: &str) -> TierResult<CacheEntry> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let Some(&id) = state.index.get(key) else {
            return TierResult::Miss;
        };

        let expired = state
            .node(id)
            .is_some_and(|node| node.entry.is_expired_at(now));
        if expired {
            state.remove(key);
            debug!("LRU expired on access: {}", key);
            return TierResult::Miss;
        }

        state.move_to_front(id);
        match state.node_mut(id) {
            Some(node) => {
                node.entry.update_access_at(now);
                TierResult::Hit(node.entry.clone())
            }
            None => TierResult::Miss,
        }
    }

    fn peek(&self, key: &str) -> TierResult<CacheEntry> {
        let state = self.state.lock();
        match state.index.get(key).and_then(|&id| state.node(id)) {
            Some(node) => TierResult::Hit(node.entry.clone()),
            None => TierResult::Miss,
        }
    }

    fn put(&self, entry: &CacheEntry) -> TierWrite {
        let mut state = self.state.lock();

        if state.index.contains_key(&entry.key) {
            state.remove(&entry.key);
        } else if state.index.len() >= state.max_entries {
            if let Some(evicted) = state.pop_lru() {
                state.evictions += 1;
                debug!("LRU evict: {}", evicted.key);
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
        self.state.lock().index.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.state.lock().index.len()
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
            .entries()
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
            .entries()
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
        // Trailing free slots can be dropped; interior ones stay reusable
        while matches!(state.slots.last(), Some(None)) {
            state.slots.pop();
        }
        let len = state.slots.len();
        state.free.retain(|&id| id < len);
        state.slots.shrink_to_fit();
        state.free.shrink_to_fit();
        state.index.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::compression::Compressor;
    use crate::entry::CacheValue;
    use std::sync::Arc;

    fn entry(key: &str, value: u32, ttl: Option<u64>, clock: &ManualClock) -> CacheEntry {
        let (v, size) = CacheValue::encode(&value, &Compressor::default()).unwrap();
        CacheEntry::new(key, v, size, clock.now()).with_ttl(ttl)
    }

    fn tier(capacity: usize) -> (LruTier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (LruTier::new(capacity, clock.clone()), clock)
    }

    #[test]
    fn test_put_get() {
        let (cache, clock) = tier(10);
        cache.put(&entry("key1", 7, None, &clock));

        let hit = cache.get("key1").hit().unwrap();
        assert_eq!(hit.value.decode::<u32>().unwrap(), 7);
        assert_eq!(hit.access_count, 2);
        assert_eq!(cache.get("missing"), TierResult::Miss);
    }

    #[test]
    fn test_eviction_follows_access_not_insertion() {
        let (cache, clock) = tier(2);
        cache.put(&entry("k1", 1, None, &clock));
        cache.put(&entry("k2", 2, None, &clock));
        assert!(cache.get("k1").is_hit());
        cache.put(&entry("k3", 3, None, &clock));

        assert_eq!(cache.peek("k2"), TierResult::Miss, "k2 should be evicted");
        assert!(cache.peek("k1").is_hit());
        assert!(cache.peek("k3").is_hit());
        assert_eq!(cache.capacity_evictions(), 1);
    }

    #[test]
    fn test_insertion_order_breaks_ties() {
        let (cache, clock) = tier(3);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            cache.put(&entry(key, i as u32, None, &clock));
        }
        cache.put(&entry("d", 4, None, &clock));

        assert_eq!(cache.recency_order(), vec!["d", "c", "b"]);
    }

    #[test]
    fn test_reput_refreshes_recency_without_eviction() {
        let (cache, clock) = tier(2);
        cache.put(&entry("a", 1, None, &clock));
        cache.put(&entry("b", 2, None, &clock));
        cache.put(&entry("a", 10, None, &clock));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.capacity_evictions(), 0);
        assert_eq!(cache.recency_order(), vec!["a", "b"]);
        let a = cache.peek("a").hit().unwrap();
        assert_eq!(a.value.decode::<u32>().unwrap(), 10);
        assert_eq!(a.access_count, 1);
    }

    #[test]
    fn test_expired_entry_removed_on_access() {
        let (cache, clock) = tier(10);
        cache.put(&entry("short", 1, Some(1), &clock));

        clock.advance_millis(1_500);
        assert_eq!(cache.get("short"), TierResult::Miss);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.byte_size(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let (cache, clock) = tier(10);
        cache.put(&entry("ttl", 1, Some(5), &clock));
        cache.put(&entry("forever", 2, None, &clock));

        clock.advance_secs(6);
        assert_eq!(cache.purge_expired(clock.now()), 1);
        assert_eq!(cache.keys(), vec!["forever".to_string()]);
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let (cache, clock) = tier(4);
        for i in 0..4 {
            cache.put(&entry(&format!("k{}", i), i, None, &clock));
        }
        assert!(cache.remove("k1").is_hit());
        assert_eq!(cache.remove("k1"), TierResult::Miss);
        cache.put(&entry("k9", 9, None, &clock));

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.recency_order(), vec!["k9", "k3", "k2", "k0"]);
        cache.compact();
        assert!(cache.get("k0").is_hit());
    }
}
