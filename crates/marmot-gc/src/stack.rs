//! Conservative stack-scan support.
//!
//! The collector scans the native stack between a base captured at startup
//! and the current stack top. Neither bound needs to be exact: the base only
//! has to sit above every mutator frame that can hold a managed pointer, and
//! the top below them. Before the scan runs, callee-saved register state must
//! be committed to the stack; [`Collector::mark`](crate::Collector::mark)
//! achieves that by reaching the scan through an opaque function pointer the
//! optimizer cannot inline through.

/// Returns an address inside the current stack frame.
///
/// The result is a scan bound, never dereferenced as a typed pointer. Marked
/// `inline(always)` so the frame it reports belongs to the caller.
#[inline(always)]
pub fn approximate_stack_pointer() -> *const u8 {
    let slot: usize = 0;
    std::hint::black_box(std::ptr::addr_of!(slot)) as *const u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deeper_frames_sit_below_shallower_ones() {
        #[inline(never)]
        fn deeper() -> usize {
            approximate_stack_pointer() as usize
        }

        let here = approximate_stack_pointer() as usize;
        let below = deeper();
        // The stack grows towards smaller addresses on every supported
        // target.
        assert!(below < here);
    }
}
