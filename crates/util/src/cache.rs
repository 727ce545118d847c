//! Time-keyed expiring caches.
//!
//! Entries carry the timestamp at which they were inserted. An entry is
//! expired once `now - timestamp > lifetime` under the injected clock.
//!
//! Expiry is cooperative: nothing happens unless the owner calls
//! - `update()`: full sweep over every entry
//! - `step()`: resumable scan that inspects one entry per call
//!
//! Each entry is flagged at most once and stays stored until removed, so the
//! owner can act on the flag (resolve a timeout, unload a scene) before
//! dropping it. Both scans return what they flagged and also notify the
//! `on_expired` subscribers. Removal hands the entry back to the caller and
//! notifies the `on_removed` subscribers.
//!
//! Iteration order is deterministic: the map variant is keyed by a `BTreeMap`
//! and the list variant keeps insertion order.

use std::collections::{BTreeMap, VecDeque};

use log::trace;

use crate::clock::{Seconds, SharedClock};
use crate::delay::FixedDelay;
use crate::observer::{Observers, SubscriptionId};

/// A cached value with its insertion timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem<V> {
    pub value: V,
    pub timestamp: Seconds,
    /// Set once the expiry has been reported.
    flagged: bool,
}

impl<V> CacheItem<V> {
    pub fn new(value: V, timestamp: Seconds) -> Self {
        Self {
            value,
            timestamp,
            flagged: false,
        }
    }

    /// Whether an expiry has already been reported for this item.
    pub fn is_flagged(&self) -> bool {
        self.flagged
    }
}

fn is_expired_at<V>(item: &CacheItem<V>, lifetime: Seconds, now: Seconds) -> bool {
    FixedDelay::new(item.timestamp, lifetime).has_passed(now)
}

// ============================================================================
// Dictionary Variant
// ============================================================================

/// Keyed expiring cache with registration (not overwrite) semantics.
pub struct ExpiringMap<K, V> {
    items: BTreeMap<K, CacheItem<V>>,
    lifetime: Seconds,
    clock: SharedClock,
    /// Keys still to visit in the current incremental pass.
    scan: VecDeque<K>,
    expired: Observers<K>,
    removed: Observers<K>,
}

impl<K: Ord + Clone, V> ExpiringMap<K, V> {
    pub fn new(clock: SharedClock, lifetime: Seconds) -> Self {
        Self {
            items: BTreeMap::new(),
            lifetime,
            clock,
            scan: VecDeque::new(),
            expired: Observers::new(),
            removed: Observers::new(),
        }
    }

    /// Called with the key of every entry as it is flagged expired.
    pub fn on_expired(&mut self, handler: impl FnMut(&K) + 'static) -> SubscriptionId {
        self.expired.subscribe(handler)
    }

    /// Called with the key of every entry removed through `remove`,
    /// `remove_expired` or `drain`.
    pub fn on_removed(&mut self, handler: impl FnMut(&K) + 'static) -> SubscriptionId {
        self.removed.subscribe(handler)
    }

    pub fn unsubscribe_expired(&mut self, id: SubscriptionId) -> bool {
        self.expired.unsubscribe(id)
    }

    pub fn unsubscribe_removed(&mut self, id: SubscriptionId) -> bool {
        self.removed.unsubscribe(id)
    }

    pub fn lifetime(&self) -> Seconds {
        self.lifetime
    }

    /// Insert `value` stamped with the current time.
    ///
    /// Returns false and leaves the cache untouched if `key` already exists.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let now = self.clock.now();
        self.insert_item(key, CacheItem::new(value, now))
    }

    /// Insert a pre-stamped item. Returns false if `key` already exists.
    pub fn insert_item(&mut self, key: K, item: CacheItem<V>) -> bool {
        if self.items.contains_key(&key) {
            return false;
        }
        self.items.insert(key, item);
        true
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.items.get(key).map(|item| &item.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.items.get_mut(key).map(|item| &mut item.value)
    }

    pub fn get_item(&self, key: &K) -> Option<&CacheItem<V>> {
        self.items.get(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items.iter().map(|(key, item)| (key, &item.value))
    }

    pub fn is_expired(&self, item: &CacheItem<V>) -> bool {
        is_expired_at(item, self.lifetime, self.clock.now())
    }

    /// Keys whose entries are expired right now, flagged or not.
    pub fn expired_keys(&self) -> Vec<K> {
        let now = self.clock.now();
        self.items
            .iter()
            .filter(|(_, item)| is_expired_at(item, self.lifetime, now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Full sweep. Returns the keys newly flagged as expired by this call.
    pub fn update(&mut self) -> Vec<K> {
        let now = self.clock.now();
        let lifetime = self.lifetime;
        let mut expired = Vec::new();

        for (key, item) in self.items.iter_mut() {
            if !item.flagged && is_expired_at(item, lifetime, now) {
                item.flagged = true;
                expired.push(key.clone());
            }
        }

        if !expired.is_empty() {
            trace!("expiring map flagged {} entries", expired.len());
        }
        for key in &expired {
            self.expired.emit(key);
        }
        expired
    }

    /// Inspect one entry. Returns its key if this call flagged it expired.
    ///
    /// A pass visits the keys present when it began; entries removed
    /// mid-pass are skipped and entries added mid-pass wait for the next one.
    pub fn step(&mut self) -> Option<K> {
        if self.scan.is_empty() {
            self.scan.extend(self.items.keys().cloned());
        }

        let key = self.scan.pop_front()?;
        let now = self.clock.now();
        let item = self.items.get_mut(&key)?;
        if item.flagged || !is_expired_at(item, self.lifetime, now) {
            return None;
        }

        item.flagged = true;
        self.expired.emit(&key);
        Some(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<CacheItem<V>> {
        let item = self.items.remove(key)?;
        self.removed.emit(key);
        Some(item)
    }

    /// Remove every currently expired entry and return them.
    pub fn remove_expired(&mut self) -> Vec<(K, CacheItem<V>)> {
        let mut removed = Vec::new();
        for key in self.expired_keys() {
            if let Some(item) = self.remove(&key) {
                removed.push((key, item));
            }
        }
        removed
    }

    /// Drain every entry, expired or not.
    pub fn drain(&mut self) -> Vec<(K, CacheItem<V>)> {
        self.scan.clear();
        let drained: Vec<_> = std::mem::take(&mut self.items).into_iter().collect();
        for (key, _) in &drained {
            self.removed.emit(key);
        }
        drained
    }

    /// Drop every entry without notifying subscribers.
    pub fn clear(&mut self) {
        self.items.clear();
        self.scan.clear();
    }
}

// ============================================================================
// List Variant
// ============================================================================

/// Index-addressed expiring cache.
pub struct ExpiringList<V> {
    items: Vec<CacheItem<V>>,
    lifetime: Seconds,
    clock: SharedClock,
    /// Next index for the incremental scan.
    cursor: usize,
    expired: Observers<usize>,
    removed: Observers<usize>,
}

impl<V> ExpiringList<V> {
    pub fn new(clock: SharedClock, lifetime: Seconds) -> Self {
        Self {
            items: Vec::new(),
            lifetime,
            clock,
            cursor: 0,
            expired: Observers::new(),
            removed: Observers::new(),
        }
    }

    /// Called with the index of every entry as it is flagged expired.
    pub fn on_expired(&mut self, handler: impl FnMut(&usize) + 'static) -> SubscriptionId {
        self.expired.subscribe(handler)
    }

    /// Called with the index an entry had when it was removed.
    pub fn on_removed(&mut self, handler: impl FnMut(&usize) + 'static) -> SubscriptionId {
        self.removed.subscribe(handler)
    }

    pub fn unsubscribe_expired(&mut self, id: SubscriptionId) -> bool {
        self.expired.unsubscribe(id)
    }

    pub fn unsubscribe_removed(&mut self, id: SubscriptionId) -> bool {
        self.removed.unsubscribe(id)
    }

    pub fn lifetime(&self) -> Seconds {
        self.lifetime
    }

    /// Append `value` stamped with the current time. Returns its index.
    pub fn push(&mut self, value: V) -> usize {
        let now = self.clock.now();
        self.items.push(CacheItem::new(value, now));
        self.items.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&V> {
        self.items.get(index).map(|item| &item.value)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut V> {
        self.items.get_mut(index).map(|item| &mut item.value)
    }

    pub fn find_index(&self, mut predicate: impl FnMut(&V) -> bool) -> Option<usize> {
        self.items.iter().position(|item| predicate(&item.value))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.items.iter().map(|item| &item.value)
    }

    pub fn is_expired(&self, item: &CacheItem<V>) -> bool {
        is_expired_at(item, self.lifetime, self.clock.now())
    }

    /// Full sweep. Returns the indices newly flagged as expired.
    pub fn update(&mut self) -> Vec<usize> {
        let now = self.clock.now();
        let lifetime = self.lifetime;
        let mut expired = Vec::new();

        for (index, item) in self.items.iter_mut().enumerate() {
            if !item.flagged && is_expired_at(item, lifetime, now) {
                item.flagged = true;
                expired.push(index);
            }
        }
        for index in &expired {
            self.expired.emit(index);
        }
        expired
    }

    /// Inspect one entry. Returns its index if this call flagged it expired.
    pub fn step(&mut self) -> Option<usize> {
        if self.cursor >= self.items.len() {
            self.cursor = 0;
        }

        let index = self.cursor;
        let now = self.clock.now();
        let item = self.items.get_mut(index)?;
        self.cursor += 1;
        if item.flagged || !is_expired_at(item, self.lifetime, now) {
            return None;
        }

        item.flagged = true;
        self.expired.emit(&index);
        Some(index)
    }

    /// Remove the entry at `index`, keeping the scan cursor on the same
    /// logical successor.
    pub fn remove_at(&mut self, index: usize) -> Option<CacheItem<V>> {
        if index >= self.items.len() {
            return None;
        }
        if index < self.cursor {
            self.cursor -= 1;
        }
        let item = self.items.remove(index);
        self.removed.emit(&index);
        Some(item)
    }

    /// Remove every currently expired entry, returned in index order.
    pub fn remove_expired(&mut self) -> Vec<CacheItem<V>> {
        let now = self.clock.now();
        let lifetime = self.lifetime;
        let mut removed = Vec::new();
        let mut index = self.items.len();

        while index > 0 {
            index -= 1;
            if is_expired_at(&self.items[index], lifetime, now) {
                if let Some(item) = self.remove_at(index) {
                    removed.push(item);
                }
            }
        }

        removed.reverse();
        removed
    }

    /// Drop every entry without notifying subscribers.
    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================
