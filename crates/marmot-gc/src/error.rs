//! Error surface.
//!
//! Allocation entry points report failure through absent return values; only
//! reallocation needs to distinguish a refused argument from host exhaustion.

use thiserror::Error;

/// Failure reported by [`Collector::realloc`](crate::Collector::realloc).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// The pointer was never handed out by this collector, or has already
    /// been released. The original block, if any, is untouched.
    #[error("pointer is not managed by this collector")]
    UnknownPointer,
    /// The host allocator could not satisfy the request. The original block
    /// and its record remain valid.
    #[error("host allocator out of memory")]
    OutOfMemory,
}
