//! Shows how the free list evolves through splits and merges.

use memalloc::MemAlloc;

fn dump(step: &str, allocator: &MemAlloc) {
    let mut out = String::new();
    let _ = allocator.write_free_list(&mut out);
    print!("{step:<24}{out}");
}

fn main() -> Result<(), memalloc::HeapError> {
    // Small extents so growth is easy to trigger.
    let allocator = MemAlloc::with_arena_size(4096);

    let a = allocator.malloc(64)?;
    let b = allocator.malloc(128)?;
    let c = allocator.malloc(32)?;
    dump("a, b, c allocated", &allocator);

    unsafe {
        allocator.free(a.as_ptr())?;
        dump("a freed", &allocator);

        allocator.free(c.as_ptr())?;
        dump("c freed (right merge)", &allocator);

        allocator.free(b.as_ptr())?;
        dump("b freed (both sides)", &allocator);
    }

    let big = allocator.malloc(3000)?;
    let next = allocator.malloc(3000)?;
    dump("two 3000 byte blocks", &allocator);
    println!("Extents mapped: {}", allocator.stats().extents);

    unsafe {
        allocator.free(big.as_ptr())?;
        allocator.free(next.as_ptr())?;
    }
    dump("everything freed", &allocator);

    allocator.check()
}
