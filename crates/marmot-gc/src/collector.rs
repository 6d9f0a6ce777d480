//! The collector: allocator façade over the host allocator plus the
//! mark-sweep engine.
//!
//! ## Design
//!
//! - Every block handed to the mutator is tracked in the allocation index
//! - Allocation runs a full collection first once the index outgrows its
//!   sweep limit, and retries once through a forced collection on host OOM
//! - Marking is conservative: pinned records are traced first, then the
//!   native stack, treating every overlapping pointer-sized byte window as a
//!   candidate block address
//! - Sweeping finalizes and releases every record the mark phase did not
//!   reach
//!
//! The mutator must be paused for the entirety of a cycle; the collector is
//! single-threaded and holds raw pointers, so it is neither `Send` nor
//! `Sync`.

use std::fmt;
use std::time::Instant;

use crate::error::GcError;
use crate::host::{self, PTR_SIZE};
use crate::record::{BlockRecord, Finalizer, tags};
use crate::registry::AllocationRegistry;
use crate::stack;

const DEFAULT_INITIAL_CAPACITY: usize = 1024;
const DEFAULT_MIN_CAPACITY: usize = 1024;
const DEFAULT_DOWNSIZE_FACTOR: f64 = 0.2;
const DEFAULT_UPSIZE_FACTOR: f64 = 0.8;
const DEFAULT_SWEEP_FACTOR: f64 = 0.5;

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Target bucket count for the allocation index (promoted to a prime).
    pub initial_capacity: usize,
    /// Floor on the bucket count (promoted to a prime).
    pub min_capacity: usize,
    /// Load factor below which the index shrinks (default: 0.2).
    pub downsize_factor: f64,
    /// Load factor above which the index grows (default: 0.8).
    pub upsize_factor: f64,
    /// Fraction of index headroom that, once consumed, triggers a sweep
    /// (default: 0.5).
    pub sweep_factor: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            min_capacity: DEFAULT_MIN_CAPACITY,
            downsize_factor: DEFAULT_DOWNSIZE_FACTOR,
            upsize_factor: DEFAULT_UPSIZE_FACTOR,
            sweep_factor: DEFAULT_SWEEP_FACTOR,
        }
    }
}

impl GcConfig {
    /// Non-positive knobs fall back to their defaults.
    fn sanitized(mut self) -> Self {
        if self.initial_capacity == 0 {
            self.initial_capacity = DEFAULT_INITIAL_CAPACITY;
        }
        if self.min_capacity == 0 {
            self.min_capacity = DEFAULT_MIN_CAPACITY;
        }
        if self.downsize_factor <= 0.0 {
            self.downsize_factor = DEFAULT_DOWNSIZE_FACTOR;
        }
        if self.upsize_factor <= 0.0 {
            self.upsize_factor = DEFAULT_UPSIZE_FACTOR;
        }
        if self.sweep_factor <= 0.0 {
            self.sweep_factor = DEFAULT_SWEEP_FACTOR;
        }
        self
    }
}

/// Collection statistics.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Number of completed collection cycles.
    pub collections: u64,
    /// Total time spent in collection cycles (nanoseconds).
    pub total_time_ns: u64,
    /// Bytes reclaimed by the last sweep.
    pub last_reclaimed: usize,
    /// Records marked in the last mark phase.
    pub last_marked: usize,
}

/// A conservative mark-and-sweep garbage collector.
///
/// The collector owns every block it hands out: explicit [`free`](Self::free)
/// releases a block early, everything still tracked is finalized and released
/// by [`stop`](Self::stop) or on drop.
pub struct Collector {
    registry: AllocationRegistry,
    stack_base: *const u8,
    enabled: bool,
    /// Scratch worklist for transitive marking; avoids unbounded recursion on
    /// deep object graphs.
    worklist: Vec<*mut BlockRecord>,
    stats: GcStats,
}

impl Collector {
    /// Creates a collector with default configuration. `stack_base` is the
    /// top end of the conservative stack scan range, captured in a frame
    /// above every mutator frame that can hold managed pointers (typically
    /// the top of `main`).
    pub fn new(stack_base: *const u8) -> Self {
        Self::with_config(stack_base, GcConfig::default())
    }

    /// Creates a collector with explicit knobs. The collector is born
    /// enabled.
    pub fn with_config(stack_base: *const u8, config: GcConfig) -> Self {
        let config = config.sanitized();
        let initial_capacity = config.initial_capacity.max(config.min_capacity);
        let registry = AllocationRegistry::new(
            config.min_capacity,
            initial_capacity,
            config.sweep_factor,
            config.downsize_factor,
            config.upsize_factor,
        );
        tracing::debug!(
            target: "marmot::gc",
            capacity = registry.capacity(),
            stack_base = ?stack_base,
            "collector started"
        );
        Self {
            registry,
            stack_base,
            enabled: true,
            worklist: Vec::new(),
            stats: GcStats::default(),
        }
    }

    /// While disabled, neither the sweep-limit trigger nor the OOM retry runs
    /// a collection. Explicit [`collect`](Self::collect) still does.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Re-enables automatic collection.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// True unless [`disable`](Self::disable) was called.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn needs_sweep(&self) -> bool {
        self.registry.len() > self.registry.sweep_limit()
    }

    /// Allocation core generalizing over malloc/calloc: `count == 0` yields
    /// an uninitialised block of `unit` bytes, anything else a zero-filled
    /// block of `count * unit` bytes.
    fn allocate(
        &mut self,
        count: usize,
        unit: usize,
        finalizer: Option<Finalizer>,
    ) -> Option<*mut u8> {
        if self.enabled && self.needs_sweep() {
            let reclaimed = self.collect();
            tracing::debug!(
                target: "marmot::gc",
                reclaimed,
                "sweep limit reached before allocation"
            );
        }
        let (size, zeroed) = if count == 0 {
            (unit, false)
        } else {
            (count.checked_mul(unit)?, true)
        };
        let mut ptr = host::alloc(size, zeroed);
        // A null return is the host's only out-of-memory indication; force an
        // out-of-policy collection and retry once.
        if ptr.is_null() && self.enabled {
            self.collect();
            ptr = host::alloc(size, zeroed);
        }
        if ptr.is_null() {
            return None;
        }
        let record = self.registry.put(ptr, size, finalizer);
        if record.is_null() {
            // Metadata could not be recorded; fail cleanly.
            // SAFETY: `ptr` came from the host shim with this size and was
            // never exposed to the mutator.
            unsafe { host::dealloc(ptr, size) };
            return None;
        }
        // SAFETY: `put` returned a live record.
        Some(unsafe { (*record).address })
    }

    /// Allocates `size` uninitialised managed bytes.
    pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
        self.allocate(0, size, None)
    }

    /// Allocates `size` uninitialised managed bytes with a finalizer.
    pub fn alloc_with_finalizer(&mut self, size: usize, finalizer: Finalizer) -> Option<*mut u8> {
        self.allocate(0, size, Some(finalizer))
    }

    /// Allocates `count * unit` zero-filled managed bytes. A zero `count`
    /// degenerates to [`alloc`](Self::alloc) with `unit` bytes.
    pub fn alloc_zeroed(&mut self, count: usize, unit: usize) -> Option<*mut u8> {
        self.allocate(count, unit, None)
    }

    /// [`alloc_zeroed`](Self::alloc_zeroed) with a finalizer.
    pub fn alloc_zeroed_with_finalizer(
        &mut self,
        count: usize,
        unit: usize,
        finalizer: Finalizer,
    ) -> Option<*mut u8> {
        self.allocate(count, unit, Some(finalizer))
    }

    /// Allocates a pinned block: a root that survives every cycle until
    /// [`unpin_all`](Self::unpin_all) or shutdown.
    pub fn alloc_pinned(&mut self, size: usize, finalizer: Option<Finalizer>) -> Option<*mut u8> {
        let ptr = self.allocate(0, size, finalizer)?;
        Some(self.pin(ptr))
    }

    /// Sets ROOT on the record for `ptr`, making the block a traced root.
    /// Unknown pointers are ignored. Returns `ptr`.
    pub fn pin(&mut self, ptr: *mut u8) -> *mut u8 {
        let record = self.registry.get(ptr);
        if !record.is_null() {
            // SAFETY: the record is live; only the tag is mutated.
            unsafe {
                (*record).tag |= tags::ROOT;
            }
        }
        ptr
    }

    /// Clears ROOT on every record. Runs during shutdown so the final sweep
    /// can reclaim previously pinned blocks.
    pub fn unpin_all(&mut self) {
        self.registry.unpin_all();
    }

    /// Releases a managed block immediately: runs its finalizer, removes its
    /// record and returns the memory to the host. Freeing a pointer the
    /// collector does not know is logged and otherwise ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        let record = self.registry.get(ptr);
        if record.is_null() {
            tracing::warn!(
                target: "marmot::gc",
                address = ?ptr,
                "ignoring request to free unknown pointer"
            );
            return;
        }
        // SAFETY: the record is live; the finalizer contract is documented on
        // `Finalizer`; the block came from the host shim with this size.
        unsafe {
            let size = (*record).size;
            if let Some(finalizer) = (*record).finalizer {
                finalizer(ptr);
            }
            self.registry.remove(ptr, true);
            host::dealloc(ptr, size);
        }
    }

    /// Resizes a managed block.
    ///
    /// A null `ptr` degenerates to a fresh allocation with no finalizer. A
    /// pointer unknown to the index is refused. On host failure the old
    /// block and its record are untouched. When the host moves the block,
    /// the old record's finalizer follows it to the new address.
    pub fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> Result<*mut u8, GcError> {
        if ptr.is_null() {
            let fresh = host::alloc(new_size, false);
            if fresh.is_null() {
                return Err(GcError::OutOfMemory);
            }
            let record = self.registry.put(fresh, new_size, None);
            if record.is_null() {
                // SAFETY: `fresh` came from the host shim with this size.
                unsafe { host::dealloc(fresh, new_size) };
                return Err(GcError::OutOfMemory);
            }
            // SAFETY: `put` returned a live record.
            return Ok(unsafe { (*record).address });
        }

        let record = self.registry.get(ptr);
        if record.is_null() {
            return Err(GcError::UnknownPointer);
        }
        // SAFETY: the record is live until removed below.
        let (old_size, finalizer) = unsafe { ((*record).size, (*record).finalizer) };

        // SAFETY: `ptr` is a managed block of `old_size` bytes.
        let moved = unsafe { host::realloc(ptr, old_size, new_size) };
        if moved.is_null() {
            return Err(GcError::OutOfMemory);
        }
        if moved == ptr {
            // SAFETY: the record was not touched by the host call.
            unsafe {
                (*record).size = new_size;
            }
            return Ok(ptr);
        }

        self.registry.remove(ptr, true);
        let fresh = self.registry.put(moved, new_size, finalizer);
        if fresh.is_null() {
            // SAFETY: `moved` came from the host shim with this size and is
            // no longer tracked.
            unsafe { host::dealloc(moved, new_size) };
            return Err(GcError::OutOfMemory);
        }
        // SAFETY: `put` returned a live record.
        Ok(unsafe { (*fresh).address })
    }

    /// Allocates a managed, NUL-terminated copy of `text` (`len + 1` bytes).
    pub fn strdup(&mut self, text: &str) -> Option<*mut u8> {
        let len = text.len() + 1;
        let copy = self.alloc(len)?;
        // SAFETY: `copy` points to `len` freshly allocated bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(text.as_ptr(), copy, text.len());
            *copy.add(text.len()) = 0;
        }
        Some(copy)
    }

    /// Transitively marks the block at `address`, if it is managed and not
    /// already marked. Every overlapping pointer-sized byte window of a
    /// marked payload is treated as a further candidate address.
    fn mark_block(&mut self, address: *mut u8) {
        let record = self.registry.get(address);
        if record.is_null() {
            return;
        }
        // SAFETY: the record is live; marking never removes records.
        unsafe {
            if (*record).tag & tags::MARK != 0 {
                return;
            }
            (*record).tag |= tags::MARK;
        }
        self.stats.last_marked += 1;
        self.worklist.push(record);
        self.drain_worklist();
    }

    fn drain_worklist(&mut self) {
        while let Some(record) = self.worklist.pop() {
            // SAFETY: worklist entries are live records.
            let (address, size) = unsafe { ((*record).address, (*record).size) };
            if size < PTR_SIZE {
                continue;
            }
            let mut cursor = address as usize;
            let end = cursor + size - PTR_SIZE;
            while cursor <= end {
                // SAFETY: every window lies inside the live payload; the
                // byte-stride read is explicitly unaligned.
                let candidate = unsafe { (cursor as *const *mut u8).read_unaligned() };
                let child = self.registry.get(candidate);
                if !child.is_null() {
                    // SAFETY: `child` is a live record; the MARK test keeps
                    // cycles from re-entering the worklist.
                    unsafe {
                        if (*child).tag & tags::MARK == 0 {
                            (*child).tag |= tags::MARK;
                            self.stats.last_marked += 1;
                            self.worklist.push(child);
                        }
                    }
                }
                cursor += 1;
            }
        }
    }

    /// Scans `[lo, hi]` for candidate block addresses at every byte offset
    /// and transitively marks each hit.
    fn scan_region(&mut self, lo: usize, hi: usize) {
        if hi < lo || hi - lo < PTR_SIZE {
            return;
        }
        let end = hi - PTR_SIZE;
        let mut cursor = lo;
        while cursor <= end {
            // SAFETY: the caller vouches that `[lo, hi]` is readable; the
            // byte-stride read is explicitly unaligned.
            let candidate = unsafe { (cursor as *const *mut u8).read_unaligned() };
            if !self.registry.get(candidate).is_null() {
                self.mark_block(candidate);
            }
            cursor += 1;
        }
    }

    /// Transitively marks from every pinned record.
    pub fn mark_roots(&mut self) {
        tracing::debug!(target: "marmot::gc", "marking pinned roots");
        for address in self.registry.pinned_addresses() {
            self.mark_block(address);
        }
    }

    /// Scans the native stack from the current stack top to the recorded
    /// stack base. Callers that need register state flushed first should go
    /// through [`mark`](Self::mark).
    pub fn mark_stack(&mut self) {
        let top = stack::approximate_stack_pointer() as usize;
        let base = self.stack_base as usize;
        // The stack grows towards smaller addresses, but the scan only needs
        // an ordered range.
        let (lo, hi) = if top <= base { (top, base) } else { (base, top) };
        self.scan_region(lo, hi);
    }

    /// Full mark phase: pinned roots first, then the stack.
    pub fn mark(&mut self) {
        self.stats.last_marked = 0;
        self.mark_roots();
        // Reaching the stack scan through an opaque function pointer keeps
        // the call from being inlined, so callee-saved registers are
        // committed to stack frames the scan can see.
        let mark_stack: fn(&mut Collector) =
            std::hint::black_box(Collector::mark_stack as fn(&mut Collector));
        mark_stack(self);
    }

    /// Sweep phase: walks every bucket chain; marked records survive with
    /// MARK cleared, everything else is finalized, released and removed.
    /// Finalizers run in hash-bucket order; no ordering is guaranteed
    /// between blocks dying in the same cycle. Returns the reclaimed bytes.
    pub fn sweep(&mut self) -> usize {
        let mut reclaimed = 0usize;
        for index in 0..self.registry.capacity() {
            let mut cur = self.registry.bucket(index);
            while !cur.is_null() {
                // SAFETY: `next` is read before `cur` can be unlinked; the
                // removal below never resizes, so the bucket walk stays
                // coherent.
                unsafe {
                    let next = (*cur).next;
                    if (*cur).tag & tags::MARK != 0 {
                        (*cur).tag &= !tags::MARK;
                    } else {
                        let address = (*cur).address;
                        let size = (*cur).size;
                        reclaimed += size;
                        if let Some(finalizer) = (*cur).finalizer {
                            finalizer(address);
                        }
                        host::dealloc(address, size);
                        self.registry.remove(address, false);
                    }
                    cur = next;
                }
            }
        }
        self.registry.resize_to_fit();
        self.stats.last_reclaimed = reclaimed;
        tracing::debug!(
            target: "marmot::gc",
            reclaimed,
            live = self.registry.len(),
            "sweep complete"
        );
        reclaimed
    }

    /// Runs a full collection cycle (mark, then sweep) regardless of the
    /// enabled flag. Returns the reclaimed bytes.
    pub fn collect(&mut self) -> usize {
        let started = Instant::now();
        tracing::debug!(
            target: "marmot::gc",
            live = self.registry.len(),
            "collection cycle starting"
        );
        self.mark();
        let reclaimed = self.sweep();
        self.stats.collections += 1;
        self.stats.total_time_ns += started.elapsed().as_nanos() as u64;
        tracing::debug!(
            target: "marmot::gc",
            reclaimed,
            marked = self.stats.last_marked,
            live = self.registry.len(),
            "collection cycle complete"
        );
        reclaimed
    }

    fn shutdown(&mut self) -> usize {
        self.registry.unpin_all();
        self.sweep()
    }

    /// Stops the collector: unpins every root and runs a final sweep, which
    /// reclaims every remaining block. Returns the total bytes reclaimed.
    pub fn stop(mut self) -> usize {
        self.shutdown()
    }

    /// Recorded size of the managed block at `ptr`, if any.
    pub fn block_size(&self, ptr: *mut u8) -> Option<usize> {
        let record = self.registry.get(ptr);
        if record.is_null() {
            return None;
        }
        // SAFETY: the record is live.
        Some(unsafe { (*record).size })
    }

    /// True when the block at `ptr` carries MARK.
    pub fn is_marked(&self, ptr: *mut u8) -> bool {
        let record = self.registry.get(ptr);
        // SAFETY: a non-null record is live.
        !record.is_null() && unsafe { (*record).tag & tags::MARK != 0 }
    }

    /// True when the block at `ptr` carries ROOT.
    pub fn is_pinned(&self, ptr: *mut u8) -> bool {
        let record = self.registry.get(ptr);
        // SAFETY: a non-null record is live.
        !record.is_null() && unsafe { (*record).tag & tags::ROOT != 0 }
    }

    /// Number of live managed blocks.
    pub fn live_blocks(&self) -> usize {
        self.registry.len()
    }

    /// Read access to the allocation index.
    pub fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    /// Collection statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("live_blocks", &self.registry.len())
            .field("capacity", &self.registry.capacity())
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_collector() -> Collector {
        // The tests below never scan the stack, so a null base is fine.
        Collector::new(std::ptr::null())
    }

    #[test]
    fn config_defaults_survive_sanitizing() {
        let config = GcConfig::default().sanitized();
        assert_eq!(config.initial_capacity, 1024);
        assert_eq!(config.min_capacity, 1024);
        assert_eq!(config.downsize_factor, 0.2);
        assert_eq!(config.upsize_factor, 0.8);
        assert_eq!(config.sweep_factor, 0.5);
    }

    #[test]
    fn non_positive_knobs_fall_back_to_defaults() {
        let config = GcConfig {
            initial_capacity: 0,
            min_capacity: 0,
            downsize_factor: -1.0,
            upsize_factor: 0.0,
            sweep_factor: -0.5,
        }
        .sanitized();
        assert_eq!(config.initial_capacity, 1024);
        assert_eq!(config.min_capacity, 1024);
        assert_eq!(config.downsize_factor, 0.2);
        assert_eq!(config.upsize_factor, 0.8);
        assert_eq!(config.sweep_factor, 0.5);
    }

    #[test]
    fn collector_starts_enabled() {
        let mut gc = test_collector();
        assert!(gc.is_enabled());
        gc.disable();
        assert!(!gc.is_enabled());
        gc.enable();
        assert!(gc.is_enabled());
    }

    #[test]
    fn alloc_registers_and_free_unregisters() {
        let mut gc = test_collector();
        let ptr = gc.alloc(16).expect("allocation failed");
        assert_eq!(gc.live_blocks(), 1);
        assert_eq!(gc.block_size(ptr), Some(16));
        gc.free(ptr);
        assert_eq!(gc.live_blocks(), 0);
        assert_eq!(gc.block_size(ptr), None);
    }

    #[test]
    fn zeroed_allocation_with_zero_count_is_plain_malloc() {
        let mut gc = test_collector();
        let ptr = gc.alloc_zeroed(0, 42).expect("allocation failed");
        assert_eq!(gc.block_size(ptr), Some(42));
        gc.free(ptr);
    }

    #[test]
    fn free_of_unknown_pointer_is_ignored() {
        let mut gc = test_collector();
        let mut local = 0usize;
        gc.free(&mut local as *mut usize as *mut u8);
        gc.free(std::ptr::null_mut());
        assert_eq!(gc.live_blocks(), 0);
    }

    #[test]
    fn drop_releases_everything() {
        let mut gc = test_collector();
        gc.disable();
        for _ in 0..8 {
            gc.alloc(32).expect("allocation failed");
        }
        assert_eq!(gc.live_blocks(), 8);
        // Drop runs the shutdown sweep; nothing to assert beyond not
        // crashing under the allocator.
    }
}
