//! Managed buffer and array records.
//!
//! Both wrappers are themselves managed blocks, so conservative tracing
//! reaches the payload through the pointer stored in the wrapper: whoever can
//! reach the wrapper keeps the payload alive. There are no destroy helpers;
//! reclamation is the collector's job.

use std::mem;

use crate::collector::Collector;
use crate::record::Finalizer;

/// A managed buffer of raw bytes.
#[repr(C)]
pub struct GcBuffer {
    /// Address of the buffer's payload, itself a managed allocation.
    pub address: *mut u8,
    /// Payload length in bytes.
    pub length: usize,
}

/// A managed array: a managed buffer plus slot geometry.
#[repr(C)]
pub struct GcArray {
    /// The underlying buffer holding the array's slots.
    pub buffer: *mut GcBuffer,
    /// Number of slots.
    pub slot_count: usize,
    /// Size of a single slot in bytes.
    pub slot_size: usize,
}

impl GcArray {
    /// Address of slot `index`.
    ///
    /// # Safety
    ///
    /// `index` must be below `slot_count` and the array must still be live.
    pub unsafe fn slot_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: the caller keeps the offset inside the payload.
        unsafe { (*self.buffer).address.add(index * self.slot_size) }
    }

    /// Reads slot `index` as a `T`.
    ///
    /// # Safety
    ///
    /// Same as [`slot_ptr`](Self::slot_ptr); additionally `T` must fit a
    /// slot and the slot must hold a valid `T`.
    pub unsafe fn read<T>(&self, index: usize) -> T {
        // SAFETY: forwarded to the caller.
        unsafe { (self.slot_ptr(index) as *const T).read_unaligned() }
    }

    /// Writes `value` into slot `index`.
    ///
    /// # Safety
    ///
    /// Same as [`slot_ptr`](Self::slot_ptr); additionally `T` must fit a
    /// slot.
    pub unsafe fn write<T>(&self, index: usize, value: T) {
        // SAFETY: forwarded to the caller.
        unsafe { (self.slot_ptr(index) as *mut T).write_unaligned(value) }
    }
}

impl Collector {
    /// Creates a managed buffer of `size` bytes.
    pub fn create_buffer(&mut self, size: usize) -> Option<*mut GcBuffer> {
        self.create_buffer_with_finalizer(size, None)
    }

    /// Creates a managed buffer whose payload carries `finalizer`.
    ///
    /// The finalizer attaches to the payload only, and is invoked with the
    /// payload address.
    pub fn create_buffer_with_finalizer(
        &mut self,
        size: usize,
        finalizer: Option<Finalizer>,
    ) -> Option<*mut GcBuffer> {
        // Zero-filled so a collection between the two allocations scans a
        // deterministic wrapper payload.
        let wrapper = self.alloc_zeroed(1, mem::size_of::<GcBuffer>())? as *mut GcBuffer;
        let payload = match finalizer {
            Some(finalizer) => self.alloc_with_finalizer(size, finalizer),
            None => self.alloc(size),
        };
        let Some(payload) = payload else {
            self.free(wrapper as *mut u8);
            return None;
        };
        // SAFETY: the wrapper is a live managed block sized for `GcBuffer`.
        unsafe {
            wrapper.write(GcBuffer {
                address: payload,
                length: size,
            });
        }
        Some(wrapper)
    }

    /// Creates a managed array of `slot_count` slots of `slot_size` bytes.
    pub fn create_array(&mut self, slot_size: usize, slot_count: usize) -> Option<*mut GcArray> {
        self.create_array_with_finalizer(slot_size, slot_count, None)
    }

    /// Creates a managed array whose payload carries `finalizer` (invoked
    /// with the payload address).
    pub fn create_array_with_finalizer(
        &mut self,
        slot_size: usize,
        slot_count: usize,
        finalizer: Option<Finalizer>,
    ) -> Option<*mut GcArray> {
        let bytes = slot_count.checked_mul(slot_size)?;
        let wrapper = self.alloc_zeroed(1, mem::size_of::<GcArray>())? as *mut GcArray;
        let Some(buffer) = self.create_buffer_with_finalizer(bytes, finalizer) else {
            self.free(wrapper as *mut u8);
            return None;
        };
        // SAFETY: the wrapper is a live managed block sized for `GcArray`.
        unsafe {
            wrapper.write(GcArray {
                buffer,
                slot_count,
                slot_size,
            });
        }
        Some(wrapper)
    }
}
