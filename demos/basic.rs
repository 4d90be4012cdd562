//! Plain use of the allocator API: allocate a few blocks of different sizes,
//! grow one of them and give everything back.

use memalloc::MemAlloc;

fn log_alloc(name: &str, allocator: &MemAlloc, addr: std::ptr::NonNull<u8>) {
    let usable = unsafe { allocator.usable_size(addr) };
    println!("{name}: {addr:?} ({usable} usable bytes)");
}

fn main() -> Result<(), memalloc::HeapError> {
    let allocator = MemAlloc::new();

    unsafe {
        let addr1 = allocator.malloc(8)?;
        log_alloc("malloc(8)", &allocator, addr1);

        let addr2 = allocator.calloc(4, 16)?;
        log_alloc("calloc(4, 16)", &allocator, addr2);

        addr1.cast::<u64>().write(0xDEAD_BEEF);
        let addr3 = allocator.realloc(addr1.as_ptr(), 256)?;
        log_alloc("realloc(addr1, 256)", &allocator, addr3);
        println!("Contents survived the move: {:#x}", addr3.cast::<u64>().read());

        allocator.free(addr2.as_ptr())?;
        allocator.free(addr3.as_ptr())?;
    }

    allocator.check()?;
    print!("{}", allocator.stats());

    Ok(())
}
