use std::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    io::Write,
    mem,
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    block::ALIGNMENT,
    error::HeapError,
    heap::Heap,
    stats::Stats,
    utils::align,
};

/// Everything protected by the heap lock.
struct State {
    heap: Heap,
    stats: Stats,
}

/// Thread safe allocator with `malloc`, `free`, `realloc` and `calloc`
/// semantics on top of a single [`Heap`].
///
/// One mutex covers the whole heap. Every operation takes it once, keeps the
/// guard for its whole critical section and releases it by dropping the guard,
/// so no exit path can leave it locked. Callers block until the lock is
/// available.
///
/// The engine is not reentrant: calling back into the same `MemAlloc` while
/// the lock is held (from a signal handler, for instance) deadlocks. That is
/// also why nothing is logged while the lock is held; log records are emitted
/// after the guard is gone, so a logger that allocates through this very
/// allocator works fine.
///
/// # Examples
///
/// ```rust
/// use memalloc::MemAlloc;
///
/// let allocator = MemAlloc::new();
///
/// let ptr = allocator.malloc(64).unwrap();
/// unsafe {
///     ptr.as_ptr().write_bytes(0, 64);
///     allocator.free(ptr.as_ptr()).unwrap();
/// }
///
/// assert_eq!(allocator.stats().malloc_calls, 1);
/// ```
///
/// It can also be installed as the global allocator of a Rust program:
///
/// ```no_run
/// use memalloc::MemAlloc;
///
/// #[global_allocator]
/// static ALLOCATOR: MemAlloc = MemAlloc::new();
///
/// fn main() {
///     let numbers: Vec<u64> = (0..100).collect();
///     assert_eq!(numbers.len(), 100);
/// }
/// ```
pub struct MemAlloc {
    state: Mutex<State>,
}

impl MemAlloc {
    /// Allocator backed by standard 2 MiB extents.
    pub const fn new() -> Self {
        Self::with_heap(Heap::new())
    }

    /// Allocator whose standard extents hold `arena_size` usable bytes.
    pub const fn with_arena_size(arena_size: usize) -> Self {
        Self::with_heap(Heap::with_arena_size(arena_size))
    }

    const fn with_heap(heap: Heap) -> Self {
        Self {
            state: Mutex::new(State {
                heap,
                stats: Stats {
                    heap_size: 0,
                    extents: 0,
                    malloc_calls: 0,
                    free_calls: 0,
                    realloc_calls: 0,
                    calloc_calls: 0,
                },
            }),
        }
    }

    /// Runs `operation` with the heap locked. The guard lives exactly as long
    /// as this call.
    fn locked<R>(&self, operation: impl FnOnce(&mut State) -> R) -> R {
        let (result, extents_before, extents_after) = {
            let mut state = self.lock();
            let extents_before = state.heap.extents();
            let result = operation(&mut *state);

            (result, extents_before, state.heap.extents())
        };

        if extents_after > extents_before {
            log::debug!(
                "mapped {} new extent(s), {} in total",
                extents_after - extents_before,
                extents_after
            );
        }

        result
    }

    /// No operation panics while holding the guard, so a poisoned lock still
    /// protects a consistent heap.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a pointer to at least `size` writable bytes, aligned to 8.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.locked(|state| {
            state.stats.malloc_calls += 1;
            state.heap.allocate(size)
        })
    }

    /// Frees a pointer returned by this allocator. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from this allocator that has
    /// not been freed yet. Double frees and foreign pointers are detected on a
    /// best effort basis and reported as errors.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        self.locked(|state| {
            state.stats.free_calls += 1;

            match NonNull::new(ptr) {
                Some(ptr) => unsafe { state.heap.free(ptr) },
                None => Ok(()),
            }
        })
    }

    /// Moves the contents of `ptr` into a block of `size` bytes and frees the
    /// old block. The first `min(old usable size, size)` bytes are preserved.
    /// A null `ptr` behaves like [`Self::malloc`].
    ///
    /// The old pointer is validated, the new block obtained and the old one
    /// freed in a single critical section.
    ///
    /// # Safety
    ///
    /// Same as [`Self::free`].
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.locked(|state| {
            state.stats.realloc_calls += 1;

            match NonNull::new(ptr) {
                Some(old) => unsafe { state.heap.reallocate(old, size) },
                None => state.heap.allocate(size),
            }
        })
    }

    /// Returns a zeroed region of `count * element_size` bytes.
    pub fn calloc(&self, count: usize, element_size: usize) -> Result<NonNull<u8>, HeapError> {
        self.locked(|state| {
            state.stats.calloc_calls += 1;

            let size = count
                .checked_mul(element_size)
                .ok_or(HeapError::SizeOverflow)?;
            let ptr = state.heap.allocate(size)?;

            unsafe { ptr.as_ptr().write_bytes(0, size) };

            Ok(ptr)
        })
    }

    /// Size recorded in the block header of `ptr`, boundary tags included.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer obtained from this allocator.
    pub unsafe fn object_size(&self, ptr: NonNull<u8>) -> usize {
        self.locked(|state| unsafe { state.heap.object_size(ptr) })
    }

    /// How many bytes can be written at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer obtained from this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.locked(|state| unsafe { state.heap.usable_size(ptr) })
    }

    /// Call counters and heap growth so far.
    pub fn stats(&self) -> Stats {
        self.locked(|state| Stats {
            heap_size: state.heap.heap_size(),
            extents: state.heap.extents(),
            ..state.stats
        })
    }

    /// Writes the free list, see [`Heap::write_free_list`].
    ///
    /// The lock is held while writing, so `out` must not allocate through this
    /// same allocator.
    pub fn write_free_list(&self, out: &mut impl fmt::Write) -> fmt::Result {
        self.locked(|state| state.heap.write_free_list(out))
    }

    /// Verifies the heap invariants, see [`Heap::check`].
    pub fn check(&self) -> Result<(), HeapError> {
        self.locked(|state| state.heap.check())
    }

    /// Memory for a layout whose alignment is stricter than [`ALIGNMENT`].
    ///
    /// We over-allocate by `align` bytes and hand out the first suitably
    /// aligned address that leaves room for a back pointer right below it:
    ///
    /// ```text
    /// +--------+---------------+--------------+--------------------+
    /// | Header |    padding    | back pointer |   aligned content  |
    /// +--------+---------------+--------------+--------------------+
    /// ^        ^                              ^
    /// block    payload <--------------------- returned address
    /// ```
    fn malloc_aligned(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        let padded = layout
            .size()
            .checked_add(layout.align())
            .ok_or(HeapError::SizeOverflow)?;

        let payload = self.malloc(padded)?;

        unsafe {
            let address = align(payload.as_ptr() as usize + mem::size_of::<usize>(), layout.align());
            let aligned = payload.add(address - payload.as_ptr() as usize);

            aligned.cast::<NonNull<u8>>().sub(1).write(payload);

            Ok(aligned)
        }
    }

    /// Inverse of [`Self::malloc_aligned`].
    unsafe fn payload_of_aligned(aligned: *mut u8) -> *mut u8 {
        unsafe { aligned.cast::<*mut u8>().sub(1).read() }
    }
}

impl Default for MemAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// Reports a heap error that cannot be recovered from and aborts.
///
/// Must be called with the heap unlocked. Standard error is unbuffered, so
/// the diagnostic line is formatted straight into it without allocating.
pub(crate) fn fatal(err: HeapError) -> ! {
    log::error!("{err}");

    let _ = writeln!(std::io::stderr(), "memalloc: fatal: {err}");

    std::process::abort()
}

/// Null for recoverable errors, abort for everything else.
fn null_or_abort(err: HeapError) -> *mut u8 {
    if err.is_fatal() {
        fatal(err)
    }

    ptr::null_mut()
}

unsafe impl GlobalAlloc for MemAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = if layout.align() <= ALIGNMENT {
            self.malloc(layout.size())
        } else {
            self.malloc_aligned(layout)
        };

        result.map_or_else(null_or_abort, NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            let ptr = unsafe { self.alloc(layout) };
            if !ptr.is_null() {
                unsafe { ptr.write_bytes(0, layout.size()) };
            }
            return ptr;
        }

        self.calloc(1, layout.size())
            .map_or_else(null_or_abort, NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let payload = if layout.align() <= ALIGNMENT {
            ptr
        } else {
            unsafe { Self::payload_of_aligned(ptr) }
        };

        if let Err(err) = unsafe { self.free(payload) } {
            fatal(err)
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
                return ptr::null_mut();
            };

            unsafe {
                let new = self.alloc(new_layout);
                if !new.is_null() {
                    ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
                return new;
            }
        }

        unsafe { MemAlloc::realloc(self, ptr, new_size) }.map_or_else(null_or_abort, NonNull::as_ptr)
    }
}
