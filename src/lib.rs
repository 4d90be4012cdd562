//! General purpose memory allocator with `malloc`, `free`, `realloc` and
//! `calloc` semantics.
//!
//! Memory is obtained from the kernel in fenced extents of [`ARENA_SIZE`]
//! bytes and carved into boundary tagged blocks. Free blocks are kept in a
//! single address ordered free list that is searched first-fit, split when
//! the remainder is usable and coalesced with both neighbors when freed.
//! Memory is never given back to the kernel while the heap is alive.
//!
//! - [`Heap`] is the single threaded engine.
//! - [`MemAlloc`] wraps it in a mutex, keeps call statistics and implements
//!   [`std::alloc::GlobalAlloc`].
//! - `abi` (unix only) exposes the C entry points. With the `c-abi` feature
//!   they are exported unmangled, so the `cdylib` can replace the C library
//!   allocator.

mod block;
mod freelist;
mod kernel;
mod list;
mod region;
mod utils;

mod allocator;
mod config;
mod error;
mod heap;
mod stats;

#[cfg(unix)]
pub mod abi;

pub use allocator::MemAlloc;
pub use config::{Config, VERBOSE_VAR};
pub use error::HeapError;
pub use heap::{ARENA_SIZE, FreeBlockInfo, Heap};
pub use stats::Stats;
