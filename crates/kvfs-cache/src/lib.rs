//! Bounded in-process cache of decoded objects, a read-only shadow of the
//! backend with strict recency ordering.

use kvfs_models::{FileObject, ObjectId};
use lru::LruCache;
use std::num::NonZeroUsize;

/// What the cache remembers about an id: a decoded object, or a tombstone
/// recording a confirmed backend miss.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheSlot {
    Live(FileObject),
    Tombstone,
}

impl CacheSlot {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, CacheSlot::Tombstone)
    }
}

pub struct ObjectCache {
    entries: LruCache<ObjectId, CacheSlot>,
}

impl ObjectCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        ObjectCache {
            entries: LruCache::new(capacity),
        }
    }

    /// Returns the slot for `id` and promotes it to most-recently-used.
    /// Only reads promote; tombstones are returned like live entries and
    /// left to the caller to translate.
    pub fn get(&mut self, id: &ObjectId) -> Option<&CacheSlot> {
        self.entries.get(id)
    }

    /// Inserts or replaces. Replacing an existing entry does not promote it;
    /// writes refresh data without perturbing the eviction queue. Inserting
    /// at capacity evicts the single least-recently-used entry.
    pub fn put(&mut self, id: ObjectId, slot: CacheSlot) {
        if let Some(existing) = self.entries.peek_mut(&id) {
            *existing = slot;
        } else {
            self.entries.push(id, slot);
        }
    }

    /// Removes the entry if present; silent on absence.
    pub fn delete(&mut self, id: &ObjectId) {
        self.entries.pop(id);
    }

    /// Non-promoting lookup, for inspection only.
    pub fn peek(&self, id: &ObjectId) -> Option<&CacheSlot> {
        self.entries.peek(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvfs_models::FileObject;

    fn cache(capacity: usize) -> ObjectCache {
        ObjectCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn live(name: &str) -> (ObjectId, CacheSlot) {
        let mut object = FileObject::new_regular(name, 0o644, 0, 0);
        let id = ObjectId::new_v4();
        object.id = Some(id);
        (id, CacheSlot::Live(object))
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let mut c = cache(3);
        for i in 0..10 {
            let (id, slot) = live(&format!("f{i}"));
            c.put(id, slot);
            assert!(c.len() <= 3);
        }
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn inserting_at_capacity_evicts_the_lru_entry() {
        let mut c = cache(2);
        let (a, slot_a) = live("a");
        let (b, slot_b) = live("b");
        let (x, slot_x) = live("x");
        c.put(a, slot_a);
        c.put(b, slot_b);
        c.put(x, slot_x); // a was least recently used
        assert!(c.peek(&a).is_none());
        assert!(c.peek(&b).is_some());
        assert!(c.peek(&x).is_some());
    }

    #[test]
    fn get_promotes_to_most_recently_used() {
        let mut c = cache(2);
        let (a, slot_a) = live("a");
        let (b, slot_b) = live("b");
        let (x, slot_x) = live("x");
        c.put(a, slot_a);
        c.put(b, slot_b);
        assert!(c.get(&a).is_some()); // a is now MRU, b is LRU
        c.put(x, slot_x);
        assert!(c.peek(&a).is_some());
        assert!(c.peek(&b).is_none());
    }

    #[test]
    fn replace_does_not_promote() {
        let mut c = cache(2);
        let (a, slot_a) = live("a");
        let (b, slot_b) = live("b");
        let (x, slot_x) = live("x");
        c.put(a, slot_a);
        c.put(b, slot_b);
        let (_, replacement) = live("a2");
        c.put(a, replacement.clone()); // refresh, a stays LRU
        assert_eq!(c.peek(&a), Some(&replacement));
        c.put(x, slot_x); // evicts a, not b
        assert!(c.peek(&a).is_none());
        assert!(c.peek(&b).is_some());
    }

    #[test]
    fn after_n_gets_the_most_recent_c_remain() {
        let mut c = cache(4);
        let ids: Vec<ObjectId> = (0..9)
            .map(|i| {
                let (id, slot) = live(&format!("f{i}"));
                c.put(id, slot);
                id
            })
            .collect();
        // touch everything once in order; the last 4 touched survive
        for id in &ids {
            c.get(id);
        }
        for id in &ids[..5] {
            assert!(c.peek(id).is_none());
        }
        for id in &ids[5..] {
            assert!(c.peek(id).is_some());
        }
    }

    #[test]
    fn tombstones_follow_the_same_lru_rules() {
        let mut c = cache(2);
        let gone = ObjectId::new_v4();
        c.put(gone, CacheSlot::Tombstone);
        assert!(c.get(&gone).unwrap().is_tombstone());

        let (b, slot_b) = live("b");
        let (x, slot_x) = live("x");
        c.put(b, slot_b);
        assert!(c.get(&gone).is_some()); // promote the tombstone
        c.put(x, slot_x); // evicts b
        assert!(c.peek(&gone).is_some());
        assert!(c.peek(&b).is_none());
    }

    #[test]
    fn delete_is_silent_on_absent_ids() {
        let mut c = cache(2);
        c.delete(&ObjectId::new_v4());
        let (a, slot_a) = live("a");
        c.put(a, slot_a);
        c.delete(&a);
        c.delete(&a);
        assert!(c.is_empty());
    }
}
