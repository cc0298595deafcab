use std::collections::HashMap;

/// Bounded LRU map from exact key to a cached lookup result.
///
/// Entries live in an arena of slots linked through `prev` / `next` indices;
/// `head` is the most recently used entry, `tail` the eviction candidate.
/// An evicted slot is reused in place, so the arena never grows beyond
/// `capacity`.
pub(crate) struct KeyCache<V> {
    capacity: usize,
    slots: Vec<Slot<V>>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

struct Slot<V> {
    key: String,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V: Clone> KeyCache<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity.min(1024)),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    /// Returns the cached value and marks the entry most recently used.
    pub(crate) fn get(
        &mut self,
        key: &str,
    ) -> Option<V> {
        let slot = *self.index.get(key)?;
        self.move_to_front(slot);
        Some(self.slots[slot].value.clone())
    }

    /// Inserts at the front, evicting the least recently used entry when full.
    pub(crate) fn insert(
        &mut self,
        key: String,
        value: V,
    ) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&slot) = self.index.get(&key) {
            self.slots[slot].value = value;
            self.move_to_front(slot);
            return;
        }

        let slot = if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                key: key.clone(),
                value,
                prev: None,
                next: None,
            });
            self.slots.len() - 1
        } else {
            // Reuse the tail slot.
            let Some(lru) = self.tail else {
                return;
            };
            self.unlink(lru);
            let evicted = std::mem::replace(&mut self.slots[lru].key, key.clone());
            self.index.remove(&evicted);
            self.slots[lru].value = value;
            lru
        };

        self.index.insert(key, slot);
        self.push_front(slot);
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(
        &self,
        key: &str,
    ) -> bool {
        self.index.contains_key(key)
    }

    /// Keys from most to least recently used.
    #[cfg(test)]
    pub(crate) fn keys_by_recency(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            keys.push(self.slots[slot].key.clone());
            cursor = self.slots[slot].next;
        }
        keys
    }

    fn move_to_front(
        &mut self,
        slot: usize,
    ) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    fn unlink(
        &mut self,
        slot: usize,
    ) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[slot].prev = None;
        self.slots[slot].next = None;
    }

    fn push_front(
        &mut self,
        slot: usize,
    ) {
        self.slots[slot].prev = None;
        self.slots[slot].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}
