//! The keyspace: main map, TTL heap, and the worker pool that absorbs
//! large deallocations. Everything here runs on the event-loop thread;
//! workers only ever see values that have already been detached from both
//! indexes.

use std::rc::Rc;

use tracing::debug;

use crate::heap::{heap_delete, heap_upsert, HeapItem};
use crate::map::{Entry, HMap, Value};
use crate::pool::ThreadPool;
use crate::{monotonic_ms, K_LARGE_CONTAINER_SIZE, K_MAX_WORKS};

#[derive(Debug)]
pub struct Db {
    pub map: HMap,
    pub heap: Vec<HeapItem>,
    pool: ThreadPool,
}

impl Db {
    pub fn new() -> Self {
        Self {
            map: HMap::default(),
            heap: Vec::new(),
            pool: ThreadPool::new(4),
        }
    }

    /// Delete a key and destroy its value; true when the key existed.
    pub fn del_key(&mut self, key: &[u8]) -> bool {
        match self.map.delete(key) {
            Some(entry) => {
                self.dispose_entry(entry);
                true
            }
            None => false,
        }
    }

    /// Set, rewrite or clear an entry's TTL. Negative `ttl_ms` removes the
    /// deadline and frees the heap slot.
    pub fn set_ttl(&mut self, entry: &Rc<Entry>, ttl_ms: i64) {
        if ttl_ms < 0 {
            if let Some(pos) = entry.heap_idx.get() {
                heap_delete(&mut self.heap, pos);
            }
        } else {
            let expire_at = monotonic_ms() + ttl_ms as u64;
            heap_upsert(&mut self.heap, entry, expire_at);
        }
    }

    /// Remaining TTL in milliseconds: `None` when the key holds no
    /// deadline.
    pub fn ttl_remaining(&self, entry: &Entry, now: u64) -> Option<u64> {
        let pos = entry.heap_idx.get()?;
        let expire_at = self.heap.get(pos)?.expire_at;
        Some(expire_at.saturating_sub(now))
    }

    pub fn next_ttl_deadline(&self) -> Option<u64> {
        self.heap.first().map(|item| item.expire_at)
    }

    /// Expire keys whose deadline passed, at most `K_MAX_WORKS` per call so
    /// one tick cannot stall on a mass expiry.
    pub fn process_expirations(&mut self, now: u64) -> usize {
        let mut nworks = 0;
        while nworks < K_MAX_WORKS {
            let Some(item) = self.heap.first() else {
                break;
            };
            if item.expire_at >= now {
                break;
            }
            let key = item.entry.key.clone();
            debug!("key expired: {:?}", String::from_utf8_lossy(&key));
            if let Some(entry) = self.map.delete(&key) {
                self.dispose_entry(entry);
            }
            nworks += 1;
        }
        nworks
    }

    /// Destroy a detached entry: free its heap slot, then drop the value,
    /// inline for strings and small sets, on the worker pool for large
    /// ones.
    fn dispose_entry(&mut self, entry: Rc<Entry>) {
        if let Some(pos) = entry.heap_idx.get() {
            heap_delete(&mut self.heap, pos);
        }
        // Map and heap both released their references; this is the last.
        let Some(entry) = Rc::into_inner(entry) else {
            return;
        };
        match entry.value.into_inner() {
            Value::ZSet(zset) if zset.len() > K_LARGE_CONTAINER_SIZE => {
                debug!("large zset ({} members), deallocating in background", zset.len());
                self.pool.submit(move || drop(zset));
            }
            value => drop(value),
        }
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zset::ZSet;
    use std::time::Duration;

    fn put_str(db: &mut Db, key: &[u8], value: &[u8]) -> Rc<Entry> {
        let entry = Entry::new(key, Value::Str(value.to_vec()));
        db.map.insert(Rc::clone(&entry));
        entry
    }

    #[test]
    fn ttl_set_rewrite_and_remove() {
        let mut db = Db::new();
        let entry = put_str(&mut db, b"k", b"v");

        db.set_ttl(&entry, 1000);
        assert_eq!(db.heap.len(), 1);
        let first_deadline = db.heap[0].expire_at;

        // Same TTL twice: still one slot, same shape.
        db.set_ttl(&entry, 1000);
        assert_eq!(db.heap.len(), 1);
        assert!(db.heap[0].expire_at >= first_deadline);

        db.set_ttl(&entry, -1);
        assert!(db.heap.is_empty());
        assert_eq!(entry.heap_idx.get(), None);

        // Removing a TTL that does not exist is a no-op.
        db.set_ttl(&entry, -1);
        assert!(db.heap.is_empty());
    }

    #[test]
    fn expiration_deletes_the_key() {
        let mut db = Db::new();
        let entry = put_str(&mut db, b"gone", b"v");
        db.set_ttl(&entry, 10);
        put_str(&mut db, b"stays", b"v");
        drop(entry);

        std::thread::sleep(Duration::from_millis(30));
        let expired = db.process_expirations(monotonic_ms());
        assert_eq!(expired, 1);
        assert!(db.map.lookup(b"gone").is_none());
        assert!(db.map.lookup(b"stays").is_some());
        assert!(db.heap.is_empty());
    }

    #[test]
    fn bounded_expiry_leaves_the_rest_for_next_tick() {
        let mut db = Db::new();
        for i in 0..10 {
            let entry = put_str(&mut db, format!("k{i}").as_bytes(), b"v");
            db.set_ttl(&entry, 5);
        }
        std::thread::sleep(Duration::from_millis(20));
        // The batch cap is far above 10, so one pass clears them all; a
        // second pass has nothing to do.
        assert_eq!(db.process_expirations(monotonic_ms()), 10);
        assert_eq!(db.process_expirations(monotonic_ms()), 0);
        assert_eq!(db.map.len(), 0);
    }

    #[test]
    fn del_key_offloads_large_zsets() {
        let mut db = Db::new();
        let mut zset = ZSet::new();
        for i in 0..(K_LARGE_CONTAINER_SIZE + 1) {
            zset.insert(format!("m{i}").as_bytes(), i as f64);
        }
        db.map.insert(Entry::new(b"big", Value::ZSet(zset)));

        assert!(db.del_key(b"big"));
        assert!(!db.del_key(b"big"));
        assert!(db.map.lookup(b"big").is_none());
        // Dropping the Db joins the pool, so the background teardown has
        // finished by the time this test returns.
    }
}
