//! Allocation index: a resizable open-hashed map from block address to block
//! record.
//!
//! Collision resolution uses separate chaining. The bucket array length is
//! always a prime at or above a configured floor; load-factor thresholds
//! trigger growth and shrink rehashes. The index also owns the sweep limit,
//! the size threshold that makes the next allocation run a collection first.

use std::ptr;

use crate::record::{BlockRecord, Finalizer, tags};

pub(crate) fn is_prime(n: usize) -> bool {
    if n <= 3 {
        return n > 1;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

pub(crate) fn next_prime(mut n: usize) -> usize {
    while !is_prime(n) {
        n += 1;
    }
    n
}

/// The allocation index.
///
/// Contains exactly one record per block the collector has handed out and
/// not yet released; no two records share an address.
pub struct AllocationRegistry {
    buckets: Vec<*mut BlockRecord>,
    capacity: usize,
    min_capacity: usize,
    size: usize,
    sweep_factor: f64,
    sweep_limit: usize,
    downsize_factor: f64,
    upsize_factor: f64,
}

impl AllocationRegistry {
    /// Both requested capacities are promoted to the next prime; the working
    /// capacity is clamped up to the floor.
    pub(crate) fn new(
        min_capacity: usize,
        capacity: usize,
        sweep_factor: f64,
        downsize_factor: f64,
        upsize_factor: f64,
    ) -> Self {
        let min_capacity = next_prime(min_capacity);
        let mut capacity = next_prime(capacity);
        if capacity < min_capacity {
            capacity = min_capacity;
        }
        let sweep_limit = (sweep_factor * capacity as f64) as usize;
        tracing::debug!(
            target: "marmot::gc",
            capacity,
            min_capacity,
            sweep_limit,
            "created allocation index"
        );
        Self {
            buckets: vec![ptr::null_mut(); capacity],
            capacity,
            min_capacity,
            size: 0,
            sweep_factor,
            sweep_limit,
            downsize_factor,
            upsize_factor,
        }
    }

    /// Current bucket-array length. Always prime and at least
    /// [`min_capacity`](Self::min_capacity).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Floor on [`capacity`](Self::capacity).
    pub fn min_capacity(&self) -> usize {
        self.min_capacity
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Size threshold above which the allocator runs a sweep before the next
    /// allocation.
    pub fn sweep_limit(&self) -> usize {
        self.sweep_limit
    }

    /// `len / capacity`.
    pub fn load_factor(&self) -> f64 {
        self.size as f64 / self.capacity as f64
    }

    /// Low malloc bits are aligned out before the prime modulus.
    fn bucket_index(&self, address: *mut u8) -> usize {
        (address as usize >> 3) % self.capacity
    }

    /// Returns the record for `address`, or null.
    pub(crate) fn get(&self, address: *mut u8) -> *mut BlockRecord {
        let mut cur = self.buckets[self.bucket_index(address)];
        while !cur.is_null() {
            // SAFETY: chain pointers stay valid until unlinked by
            // `remove`/`put`, which never runs concurrently with this walk.
            unsafe {
                if (*cur).address == address {
                    return cur;
                }
                cur = (*cur).next;
            }
        }
        ptr::null_mut()
    }

    /// Inserts a record, or replaces the finalizer of an existing record at
    /// the same address (the recorded size is carried over on replacement).
    ///
    /// Returns the inserted record, re-fetched if the insertion triggered a
    /// rehash, or null on metadata allocation failure.
    pub(crate) fn put(
        &mut self,
        address: *mut u8,
        size: usize,
        finalizer: Option<Finalizer>,
    ) -> *mut BlockRecord {
        let index = self.bucket_index(address);
        let mut prev: *mut BlockRecord = ptr::null_mut();
        let mut cur = self.buckets[index];
        while !cur.is_null() {
            // SAFETY: same chain-validity argument as `get`; `cur` is
            // unlinked and destroyed only after its replacement is wired in.
            unsafe {
                if (*cur).address == address {
                    let fresh = BlockRecord::create(address, (*cur).size, finalizer);
                    if fresh.is_null() {
                        return fresh;
                    }
                    (*fresh).next = (*cur).next;
                    if prev.is_null() {
                        self.buckets[index] = fresh;
                    } else {
                        (*prev).next = fresh;
                    }
                    BlockRecord::destroy(cur);
                    return fresh;
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        let fresh = BlockRecord::create(address, size, finalizer);
        if fresh.is_null() {
            return fresh;
        }
        // SAFETY: `fresh` is live and not yet linked anywhere.
        unsafe {
            (*fresh).next = self.buckets[index];
        }
        self.buckets[index] = fresh;
        self.size += 1;
        if self.resize_to_fit() {
            // The rehash moved records between buckets; recompute the
            // inserted record's position instead of returning a stale chain
            // slot.
            return self.get(address);
        }
        fresh
    }

    /// Unlinks and frees the first record matching `address`. Unknown
    /// addresses are ignored.
    pub(crate) fn remove(&mut self, address: *mut u8, allow_resize: bool) {
        let index = self.bucket_index(address);
        let mut prev: *mut BlockRecord = ptr::null_mut();
        let mut cur = self.buckets[index];
        while !cur.is_null() {
            // SAFETY: `cur` is a live chain entry; it is destroyed only
            // after being unlinked.
            unsafe {
                if (*cur).address == address {
                    if prev.is_null() {
                        self.buckets[index] = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    BlockRecord::destroy(cur);
                    self.size -= 1;
                    break;
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        if allow_resize {
            self.resize_to_fit();
        }
    }

    /// Rehashes to bring the load factor back inside the configured band.
    /// Returns true when a threshold was crossed.
    pub(crate) fn resize_to_fit(&mut self) -> bool {
        let load_factor = self.load_factor();
        if load_factor > self.upsize_factor {
            tracing::debug!(
                target: "marmot::gc",
                load_factor,
                threshold = self.upsize_factor,
                "growing allocation index"
            );
            self.rehash(next_prime(self.capacity * 2));
            return true;
        }
        if load_factor < self.downsize_factor {
            tracing::debug!(
                target: "marmot::gc",
                load_factor,
                threshold = self.downsize_factor,
                "shrinking allocation index"
            );
            self.rehash(next_prime(self.capacity / 2));
            return true;
        }
        false
    }

    /// All-or-nothing reinsertion into a fresh bucket array. Chain order is
    /// not preserved. Rehashing below the floor is skipped.
    fn rehash(&mut self, new_capacity: usize) {
        if new_capacity <= self.min_capacity {
            return;
        }
        let mut fresh: Vec<*mut BlockRecord> = vec![ptr::null_mut(); new_capacity];
        for index in 0..self.capacity {
            let mut cur = self.buckets[index];
            while !cur.is_null() {
                // SAFETY: every chain entry is live; each is relinked exactly
                // once into the fresh array.
                unsafe {
                    let next = (*cur).next;
                    let new_index = ((*cur).address as usize >> 3) % new_capacity;
                    (*cur).next = fresh[new_index];
                    fresh[new_index] = cur;
                    cur = next;
                }
            }
        }
        self.buckets = fresh;
        self.capacity = new_capacity;
        self.sweep_limit =
            (self.size as f64 + self.sweep_factor * (self.capacity - self.size) as f64) as usize;
    }

    /// Head of the chain at `index`. Used by the sweep walk.
    pub(crate) fn bucket(&self, index: usize) -> *mut BlockRecord {
        self.buckets[index]
    }

    /// Snapshot of every ROOT-tagged address. Marking mutates tags while it
    /// walks, so the collector traces from a stable copy.
    pub(crate) fn pinned_addresses(&self) -> Vec<*mut u8> {
        let mut pinned = Vec::new();
        for index in 0..self.capacity {
            let mut cur = self.buckets[index];
            while !cur.is_null() {
                // SAFETY: chain entries are live for the duration of the walk.
                unsafe {
                    if (*cur).tag & tags::ROOT != 0 {
                        pinned.push((*cur).address);
                    }
                    cur = (*cur).next;
                }
            }
        }
        pinned
    }

    /// Clears ROOT on every record, so a final sweep can reclaim previously
    /// pinned blocks.
    pub(crate) fn unpin_all(&mut self) {
        for index in 0..self.capacity {
            let mut cur = self.buckets[index];
            while !cur.is_null() {
                // SAFETY: chain entries are live; only the tag is mutated.
                unsafe {
                    (*cur).tag &= !tags::ROOT;
                    cur = (*cur).next;
                }
            }
        }
    }
}

impl Drop for AllocationRegistry {
    fn drop(&mut self) {
        for index in 0..self.capacity {
            let mut cur = self.buckets[index];
            while !cur.is_null() {
                // SAFETY: each record is destroyed exactly once; the managed
                // blocks themselves are the allocator façade's problem.
                unsafe {
                    let next = (*cur).next;
                    BlockRecord::destroy(cur);
                    cur = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    unsafe fn count_finalizer(_ptr: *mut u8) {}

    /// Synthetic word-aligned addresses; the index hashes and compares them
    /// but never dereferences.
    fn fake_address(key: usize) -> *mut u8 {
        ((key + 1) * 8) as *mut u8
    }

    #[test]
    fn prime_test_known_cases() {
        assert!(!is_prime(0));
        assert!(!is_prime(1));
        assert!(is_prime(2));
        assert!(is_prime(3));
        assert!(!is_prime(12742382));
        assert!(is_prime(611953));
        assert!(is_prime(479001599));
    }

    #[test]
    fn construction_promotes_capacities_to_primes() {
        let registry = AllocationRegistry::new(8, 16, 0.5, 0.2, 0.8);
        assert_eq!(registry.min_capacity(), 11);
        assert_eq!(registry.capacity(), 17);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.sweep_limit(), 8);
    }

    #[test]
    fn construction_clamps_capacity_to_floor() {
        let registry = AllocationRegistry::new(8, 4, 0.5, 0.2, 0.8);
        assert_eq!(registry.min_capacity(), 11);
        assert_eq!(registry.capacity(), 11);
        assert_eq!(registry.sweep_limit(), 5);
    }

    #[test]
    fn get_put_remove_round_trip() {
        let mut registry = AllocationRegistry::new(8, 16, 0.5, 0.2, 0.8);
        let address = fake_address(5);

        assert!(registry.get(address).is_null());

        let record = registry.put(address, 4, None);
        assert!(!record.is_null());
        assert_eq!(registry.len(), 1);
        let fetched = registry.get(address);
        assert_eq!(fetched, record);
        // SAFETY: the record is live until removed below.
        unsafe {
            assert_eq!((*fetched).address, address);
        }

        registry.remove(address, true);
        assert_eq!(registry.len(), 0);
        assert!(registry.get(address).is_null());
    }

    #[test]
    fn reinsert_replaces_finalizer_and_keeps_size() {
        let mut registry = AllocationRegistry::new(8, 16, 0.5, 0.2, 0.8);
        let address = fake_address(7);

        registry.put(address, 4, None);
        let replaced = registry.put(address, 4, Some(count_finalizer));
        assert_eq!(registry.len(), 1);
        // SAFETY: the replacement record is live.
        unsafe {
            assert_eq!((*replaced).finalizer, Some(count_finalizer as Finalizer));
            assert_eq!((*replaced).size, 4);
        }
    }

    #[test]
    fn forced_collisions_chain_and_unchain() {
        // Extreme factors disable every rehash, so 64 keys over 37 buckets
        // must produce at least one chain longer than one.
        let mut registry = AllocationRegistry::new(32, 32, f64::MAX, 0.0, f64::MAX);
        assert_eq!(registry.capacity(), 37);

        for key in 0..64 {
            assert!(!registry.put(fake_address(key), 4, None).is_null());
        }
        assert_eq!(registry.len(), 64);
        assert_eq!(registry.capacity(), 37);

        for key in 0..64 {
            let updated = registry.put(fake_address(key), 4, Some(count_finalizer));
            // SAFETY: the updated record is live.
            unsafe {
                assert_eq!((*updated).finalizer, Some(count_finalizer as Finalizer));
            }
        }
        assert_eq!(registry.len(), 64);

        for key in 0..64 {
            registry.remove(fake_address(key), true);
        }
        assert_eq!(registry.len(), 0);
        for index in 0..registry.capacity() {
            assert!(registry.bucket(index).is_null());
        }
    }

    #[test]
    fn load_factor_crossings_rehash_to_primes() {
        let mut registry = AllocationRegistry::new(2, 2, 0.5, 0.2, 0.8);
        assert_eq!(registry.capacity(), 2);

        // Push the load factor through the ceiling repeatedly.
        for key in 0..64 {
            registry.put(fake_address(key), 8, None);
            assert!(is_prime(registry.capacity()));
            assert!(registry.load_factor() <= registry.upsize_factor + f64::EPSILON);
        }
        let grown = registry.capacity();
        assert!(grown > 2);

        // Draining triggers shrink rehashes but never below the floor.
        for key in 0..64 {
            registry.remove(fake_address(key), true);
            assert!(is_prime(registry.capacity()));
            assert!(registry.capacity() >= registry.min_capacity());
        }
        assert!(registry.capacity() < grown);
    }

    #[test]
    fn shrink_to_floor_is_skipped() {
        let mut registry = AllocationRegistry::new(32, 32, 0.5, 0.2, 0.8);
        let at_floor = registry.capacity();
        registry.put(fake_address(1), 8, None);
        registry.remove(fake_address(1), true);
        assert_eq!(registry.capacity(), at_floor);
    }

    #[test]
    fn unpin_all_clears_root_tags() {
        let mut registry = AllocationRegistry::new(8, 16, 0.5, 0.2, 0.8);
        for key in 0..4 {
            let record = registry.put(fake_address(key), 8, None);
            // SAFETY: freshly inserted record.
            unsafe {
                (*record).tag |= tags::ROOT;
            }
        }
        assert_eq!(registry.pinned_addresses().len(), 4);
        registry.unpin_all();
        assert!(registry.pinned_addresses().is_empty());
    }

    proptest! {
        /// Registry coherence: after any sequence of inserts and removals,
        /// every live address resolves to a record bearing that address, the
        /// capacity stays prime and at or above the floor, and the size
        /// matches the number of distinct live keys.
        #[test]
        fn registry_coherence(ops in proptest::collection::vec((0usize..512, any::<bool>()), 0..256)) {
            let mut registry = AllocationRegistry::new(8, 16, 0.5, 0.2, 0.8);
            let mut live: HashSet<usize> = HashSet::new();

            for (key, insert) in ops {
                if insert {
                    prop_assert!(!registry.put(fake_address(key), 8, None).is_null());
                    live.insert(key);
                } else {
                    registry.remove(fake_address(key), true);
                    live.remove(&key);
                }

                prop_assert!(is_prime(registry.capacity()));
                prop_assert!(registry.capacity() >= registry.min_capacity());
                prop_assert_eq!(registry.len(), live.len());
            }

            for &key in &live {
                let record = registry.get(fake_address(key));
                prop_assert!(!record.is_null());
                // SAFETY: the record is live.
                unsafe {
                    prop_assert_eq!((*record).address, fake_address(key));
                }
            }
        }
    }
}
