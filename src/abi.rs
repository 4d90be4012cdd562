//! C allocation entry points.
//!
//! Every function here is a thin translation onto the process wide
//! [`MemAlloc`]. They are plain Rust functions unless the `c-abi` feature is
//! enabled, in which case they are exported unmangled:
//!
//! ```text
//! cargo build --release --features c-abi
//! LD_PRELOAD=target/release/libmemalloc.so ls
//! ```
//!
//! Only `malloc`, `free`, `realloc`, `calloc` and `malloc_usable_size` are
//! replaced. `memalign`, `posix_memalign`, `aligned_alloc`, `valloc` and
//! `pvalloc` still resolve to the C library, and handing one of their pointers
//! to our [`free`] is a foreign pointer: the process aborts. Preload this
//! allocator only under programs that stick to the four core entry points.
//!
//! Failure policy: a request whose size overflows returns null and sets
//! `errno` to `ENOMEM`. Running out of memory and any misuse of a pointer
//! (double free, foreign pointer, overwritten boundary tags) terminate the
//! process.
//!
//! Payloads are aligned to 8 bytes, which is less than what `max_align_t`
//! promises on 64-bit targets. Programs that rely on 16 byte alignment from
//! `malloc` should not preload this allocator.

use std::{
    ffi::{c_int, c_void},
    fmt::{self, Write},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    allocator::{MemAlloc, fatal},
    config::Config,
    error::HeapError,
};

/// The allocator behind the C entry points.
static ALLOCATOR: MemAlloc = MemAlloc::new();

/// Set by the first call into any entry point.
static STARTED: AtomicBool = AtomicBool::new(false);

/// Print statistics when the process exits. See [`Config`].
static VERBOSE: AtomicBool = AtomicBool::new(true);

/// First entry setup: reads the configuration and registers [`report`].
///
/// Runs outside the heap lock. `atexit` may allocate, in which case it calls
/// back into us, finds [`STARTED`] already set and goes straight to the heap.
fn startup() {
    if STARTED.load(Ordering::Acquire) || STARTED.swap(true, Ordering::AcqRel) {
        return;
    }

    configure(Config::from_env());

    unsafe { libc::atexit(report) };
}

fn configure(config: Config) {
    VERBOSE.store(config.verbose, Ordering::Release);
}

/// Prints the statistics summary unless `MALLOCVERBOSE=NO`.
extern "C" fn report() {
    if VERBOSE.load(Ordering::Acquire) {
        let _ = write!(Stdout, "{}", ALLOCATOR.stats());
    }
}

/// Standard output without buffering and without allocating.
struct Stdout;

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();

        while !bytes.is_empty() {
            let written =
                unsafe { libc::write(libc::STDOUT_FILENO, bytes.as_ptr().cast(), bytes.len()) };

            if written <= 0 {
                return Err(fmt::Error);
            }

            bytes = &bytes[written as usize..];
        }

        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_vendor = "apple", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__error() }
}

#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__errno() }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
))]
unsafe fn set_errno(value: c_int) {
    unsafe { *errno_location() = value };
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
)))]
unsafe fn set_errno(_value: c_int) {}

/// Maps the outcome of an allocation onto the C conventions.
fn into_raw(result: Result<NonNull<u8>, HeapError>) -> *mut c_void {
    match result {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) if !err.is_fatal() => {
            unsafe { set_errno(libc::ENOMEM) };
            ptr::null_mut()
        }
        Err(err) => fatal(err),
    }
}

/// Allocates `size` bytes of uninitialized memory. A zero size still returns
/// a unique pointer.
///
/// # Safety
///
/// The returned pointer must be released with [`free`] or [`realloc`] of this
/// same allocator, exactly once.
#[cfg_attr(all(feature = "c-abi", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    startup();
    into_raw(ALLOCATOR.malloc(size))
}

/// Releases memory obtained from this allocator. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
#[cfg_attr(all(feature = "c-abi", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    startup();

    if let Err(err) = unsafe { ALLOCATOR.free(ptr.cast()) } {
        fatal(err)
    }
}

/// Resizes the block behind `ptr`, preserving `min(old usable size, size)`
/// bytes. Null behaves like [`malloc`].
///
/// # Safety
///
/// Same as [`free`].
#[cfg_attr(all(feature = "c-abi", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    startup();
    into_raw(unsafe { ALLOCATOR.realloc(ptr.cast(), size) })
}

/// Allocates `count * element_size` zeroed bytes. Returns null with `ENOMEM`
/// if the product overflows.
///
/// # Safety
///
/// Same as [`malloc`].
#[cfg_attr(all(feature = "c-abi", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(count: usize, element_size: usize) -> *mut c_void {
    startup();
    into_raw(ALLOCATOR.calloc(count, element_size))
}

/// Number of bytes that can be written at `ptr`, 0 for null.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
#[cfg_attr(all(feature = "c-abi", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr.cast::<u8>()) {
        Some(ptr) => unsafe { ALLOCATOR.usable_size(ptr) },
        None => 0,
    }
}

/// Size of the block behind `ptr` including its boundary tags, 0 for null.
///
/// # Safety
///
/// Same as [`malloc_usable_size`].
#[cfg_attr(all(feature = "c-abi", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn memalloc_object_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr.cast::<u8>()) {
        Some(ptr) => unsafe { ALLOCATOR.object_size(ptr) },
        None => 0,
    }
}

/// Writes the free list to standard output.
#[cfg_attr(all(feature = "c-abi", not(test)), unsafe(no_mangle))]
pub extern "C" fn memalloc_print_free_list() {
    let _ = ALLOCATOR.write_free_list(&mut Stdout);
}

/// Writes the statistics summary to standard output, regardless of
/// `MALLOCVERBOSE`.
#[cfg_attr(all(feature = "c-abi", not(test)), unsafe(no_mangle))]
pub extern "C" fn memalloc_print_stats() {
    let _ = write!(Stdout, "{}", ALLOCATOR.stats());
}
