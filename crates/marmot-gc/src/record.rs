//! Block record layout.

use std::alloc::{self, Layout};
use std::ptr;

/// Finalizer invoked with the block address immediately before the block's
/// raw memory is released. Runs at most once per record.
///
/// # Safety
///
/// Finalizers run during the sweep walk while the allocation index is being
/// iterated and partially mutated. They must not call back into the collector
/// (allocate, free, collect) and must not assume any ordering between blocks
/// reclaimed in the same cycle.
pub type Finalizer = unsafe fn(*mut u8);

/// Record tag bits.
///
/// A record can temporarily be tagged as "marked" as part of the mark-sweep
/// cycle, or as a "root" which is traced on every cycle regardless of stack
/// reachability.
pub mod tags {
    /// Untagged.
    pub const NONE: u8 = 0x0;
    /// Pinned; traced as a root on every cycle.
    pub const ROOT: u8 = 0x1;
    /// Reachable in the current cycle; cleared on records that survive a sweep.
    pub const MARK: u8 = 0x2;
}

/// Metadata for one live managed block.
///
/// Records are chained per hash bucket (separate chaining) and individually
/// heap-allocated so that metadata exhaustion is observable as a failed
/// insert rather than an abort.
pub(crate) struct BlockRecord {
    /// The pointer handed to the mutator. Hash key; immutable for the
    /// record's life.
    pub(crate) address: *mut u8,
    /// Payload length in bytes.
    pub(crate) size: usize,
    /// Bitset over [`tags`].
    pub(crate) tag: u8,
    /// Optional cleanup callback.
    pub(crate) finalizer: Option<Finalizer>,
    /// Next record in the same bucket.
    pub(crate) next: *mut BlockRecord,
}

impl BlockRecord {
    /// Allocates and initialises a record. Returns null on metadata
    /// allocation failure.
    pub(crate) fn create(
        address: *mut u8,
        size: usize,
        finalizer: Option<Finalizer>,
    ) -> *mut BlockRecord {
        let layout = Layout::new::<BlockRecord>();
        // SAFETY: the layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) } as *mut BlockRecord;
        if raw.is_null() {
            return raw;
        }
        // SAFETY: `raw` is non-null, properly aligned and uninitialised.
        unsafe {
            raw.write(BlockRecord {
                address,
                size,
                tag: tags::NONE,
                finalizer,
                next: ptr::null_mut(),
            });
        }
        raw
    }

    /// Releases a record's own memory. Does not touch the managed block the
    /// record describes.
    ///
    /// # Safety
    ///
    /// `record` must have come from [`BlockRecord::create`] and must already
    /// be unlinked from its bucket chain.
    pub(crate) unsafe fn destroy(record: *mut BlockRecord) {
        let layout = Layout::new::<BlockRecord>();
        // All fields are Copy; no drop glue required.
        // SAFETY: `record` was allocated with this exact layout.
        unsafe { alloc::dealloc(record as *mut u8, layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn noop_finalizer(_ptr: *mut u8) {}

    #[test]
    fn record_starts_untagged_and_unlinked() {
        let mut payload = 5i32;
        let address = &mut payload as *mut i32 as *mut u8;
        let record = BlockRecord::create(address, 4, Some(noop_finalizer));
        assert!(!record.is_null());
        // SAFETY: freshly created record.
        unsafe {
            assert_eq!((*record).address, address);
            assert_eq!((*record).size, 4);
            assert_eq!((*record).tag, tags::NONE);
            assert_eq!((*record).finalizer, Some(noop_finalizer as Finalizer));
            assert!((*record).next.is_null());
            BlockRecord::destroy(record);
        }
    }

    #[test]
    fn tag_bits_compose() {
        let record = BlockRecord::create(std::ptr::null_mut(), 0, None);
        // SAFETY: freshly created record.
        unsafe {
            (*record).tag |= tags::ROOT;
            (*record).tag |= tags::MARK;
            assert_eq!((*record).tag, tags::ROOT | tags::MARK);
            (*record).tag &= !tags::MARK;
            assert_eq!((*record).tag, tags::ROOT);
            BlockRecord::destroy(record);
        }
    }
}
