//! Installs [`MemAlloc`] as the global allocator so every `Box`, `Vec` and
//! `String` of this program goes through it.

use memalloc::MemAlloc;
use std::thread;

#[global_allocator]
static ALLOCATOR: MemAlloc = MemAlloc::new();

fn main() {
    // Box example
    let val_box = Box::new(22);
    println!("Box Value: {}, At: {:p}", val_box, val_box);

    // Vec example
    let mut v = Vec::new();
    for i in 0..5 {
        v.push(i * 10);
        println!("Added {}; Capacity: {}; At: {:p}", v[i], v.capacity(), v.as_ptr());
    }

    // String example
    let msg = String::from("Heap Testing");
    println!("\nString '{}' - At: {:p}", msg, msg.as_ptr());

    // Merge example: two neighbors freed in a row become one hole.
    let a = Box::new([0u8; 64]);
    let b = Box::new([0u8; 64]);
    let ptr_a = a.as_ptr();

    drop(a);
    drop(b);

    let c = Box::new([0u8; 128]);
    let ptr_c = c.as_ptr();

    if ptr_a == ptr_c {
        println!("Correctly reused at {:p}", ptr_c);
    } else {
        println!("Not reused. A was at {:p} and C is at {:p}", ptr_a, ptr_c);
    }

    // Over-aligned allocations.
    #[repr(align(64))]
    struct CacheLine([u8; 64]);

    let line = Box::new(CacheLine([1; 64]));
    println!("64 byte aligned: {}", (&*line as *const CacheLine as usize) % 64 == 0);

    // Thread example
    let handles: Vec<_> = (0..4)
        .map(|i| thread::spawn(move || (0..100).map(|n| n * i).collect::<Vec<u64>>().len()))
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    if let Err(err) = ALLOCATOR.check() {
        eprintln!("heap check failed: {err}");
    }

    let stats = ALLOCATOR.stats();
    println!(
        "\n{} mallocs, {} frees, {} bytes in {} extent(s)",
        stats.malloc_calls, stats.free_calls, stats.heap_size, stats.extents
    );
}
