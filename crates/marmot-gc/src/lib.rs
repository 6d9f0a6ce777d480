//! # marmot-gc
//!
//! Conservative mark-and-sweep garbage collector for manually managed heaps.
//!
//! ## Design
//!
//! - **Allocation index**: a prime-sized, separate-chaining hash table keyed
//!   on block address tracks every block the collector hands out
//! - **Allocator façade**: wraps the host allocator; allocation runs a
//!   collection once the index outgrows its sweep limit and retries once on
//!   host OOM
//! - **Mark-sweep engine**: conservative scanning of pinned roots and the
//!   native stack, then transitive heap tracing; sweep finalizes and releases
//!   everything unmarked
//!
//! No type information is used anywhere: every overlapping pointer-sized
//! byte window of a root, the stack, or a marked payload is a candidate
//! block address. That makes the collector safe but conservative: a word
//! that happens to look like a block address retains the block.
//!
//! The collector is strictly single-threaded: the mutator must be paused for
//! the entirety of a collection cycle, and [`Collector`] is neither `Send`
//! nor `Sync`.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod collector;
pub mod error;
pub mod global;
mod host;
pub mod record;
pub mod registry;
pub mod stack;
pub mod wrappers;

pub use collector::{Collector, GcConfig, GcStats};
pub use error::GcError;
pub use record::{Finalizer, tags};
pub use registry::AllocationRegistry;
pub use stack::approximate_stack_pointer;
pub use wrappers::{GcArray, GcBuffer};
