use std::{
    fmt,
    ptr::{self, NonNull},
};

use crate::{
    block::{ALIGNMENT, BLOCK_OVERHEAD, BlockState, Header, MIN_BLOCK_SIZE, MIN_PAYLOAD},
    error::HeapError,
    freelist::FreeList,
    kernel,
    list::{List, Node},
    region::{EXTENT_OVERHEAD, Region},
    utils::checked_align,
};

/// Usable bytes of a standard extent, not counting the boundary tags of the
/// block that initially spans it.
pub const ARENA_SIZE: usize = 2 * 1024 * 1024;

/// One entry of the free list, as reported by [`Heap::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlockInfo {
    /// Distance in bytes from the first block of the first extent. Extents
    /// are not contiguous, so blocks of later extents can be negative.
    pub offset: isize,
    /// Total size of the block, boundary tags included.
    pub size: usize,
}

/// The allocator context. It owns every extent it maps and the free list that
/// threads through them.
///
/// ```text
///                                        Free List
///
///                 +-------------------------------+  +--------------------------------+
///                 |                               |  |                                |
/// +--------+-----|-------------------------+-----|--|-+    +--------+-----------------|-----------------+
/// |        |   +--|---+    +-------+    +--|---+ |   |    |        |   +-------+    +--|---+            |
/// | Region | F | Free | -> | Block | -> | Free | | F | -> | Region | F | Block | -> | Free |          F |
/// |        |   +------+    +-------+    +------+ |   |    |        |   +-------+    +------+            |
/// +--------+-------------------------------------+---+    +--------+------------------------------------+
///
/// ```
///
/// `F` are fence posts. A `Heap` is not thread safe, [`crate::MemAlloc`] wraps
/// it in a mutex.
///
/// # Drop
///
/// Dropping a `Heap` returns every extent to the kernel. The process-wide
/// allocator lives in a `static` and is never dropped, so in practice this
/// only happens to heaps built by tests or embedders.
pub struct Heap {
    /// Every extent mapped so far, in mapping order.
    regions: List<Region>,
    /// Free blocks of all extents, in address order.
    free_list: FreeList,
    /// Usable bytes of a standard extent.
    arena_size: usize,
    /// Bytes obtained from the kernel.
    heap_size: usize,
}

// The raw pointers only reference memory owned by this heap.
unsafe impl Send for Heap {}

impl Heap {
    /// Heap with the standard [`ARENA_SIZE`]. Nothing is mapped until the
    /// first allocation.
    pub const fn new() -> Self {
        Self::with_arena_size(ARENA_SIZE)
    }

    /// Heap whose standard extents hold `arena_size` usable bytes (at least
    /// [`MIN_PAYLOAD`], rounded up to the block alignment).
    pub const fn with_arena_size(arena_size: usize) -> Self {
        let arena_size = if arena_size < MIN_PAYLOAD { MIN_PAYLOAD } else { arena_size };

        Self {
            regions: List::new(),
            free_list: FreeList::new(),
            arena_size: (arena_size + ALIGNMENT - 1) & !(ALIGNMENT - 1),
            heap_size: 0,
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.regions.is_empty()
    }

    /// Maps the first extent. Runs once, subsequent calls do nothing.
    pub fn initialize(&mut self) -> Result<(), HeapError> {
        if !self.is_initialized() {
            self.grow_arena(0)?;
        }

        Ok(())
    }

    /// Bytes obtained from the kernel so far.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Number of extents mapped so far.
    #[inline]
    pub fn extents(&self) -> usize {
        self.regions.len()
    }

    /// Returns a pointer to at least `size` writable bytes, aligned to 8.
    ///
    /// Zero sized requests still get a minimum block. When no free block is
    /// large enough a new extent is mapped, sized to the request if it would
    /// not fit in a standard one.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.initialize()?;

        let rounded_size = Self::rounded_size(size)?;

        let block = match self.free_list.find_first_fit(rounded_size) {
            Some(block) => block,
            None => self.grow_arena(rounded_size)?,
        };

        unsafe { Ok(self.take(block, rounded_size)) }
    }

    /// Gives the block behind `ptr` back to the heap, merging it with any free
    /// neighbor.
    ///
    /// The block is validated first: pointers that don't land on a payload of
    /// one of our extents, blocks that are already free and blocks whose tags
    /// disagree are rejected without touching the heap.
    ///
    /// # Safety
    ///
    /// `ptr` should have been returned by [`Self::allocate`] on this heap.
    /// Pointers into our extents that are not block payloads are detected only
    /// on a best effort basis.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        unsafe {
            let block = self.validate(ptr)?;
            self.coalesce(block)
        }
    }

    /// Moves the payload of `ptr` into a block of `size` bytes and frees the
    /// old block. The first `min(usable size, size)` bytes are preserved.
    ///
    /// The old pointer is validated before anything else happens, so a bad
    /// pointer leaves the heap untouched.
    ///
    /// # Safety
    ///
    /// Same as [`Self::free`].
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, HeapError> {
        unsafe {
            let old = self.validate(ptr)?;
            let new = self.allocate(size)?;
            let count = (Header::tag_of(old).size - BLOCK_OVERHEAD).min(size);

            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), count);
            self.coalesce(old)?;

            Ok(new)
        }
    }

    /// Size recorded in the header of a live block, tags included.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer returned by [`Self::allocate`].
    pub unsafe fn object_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { Header::tag_of(Header::from_payload(ptr)).size }
    }

    /// Payload capacity of a live block, at least the size it was requested
    /// with.
    ///
    /// # Safety
    ///
    /// Same as [`Self::object_size`].
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { self.object_size(ptr) - BLOCK_OVERHEAD }
    }

    /// The free list in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = FreeBlockInfo> + '_ {
        // Offsets are relative to the first block of the first extent.
        let base = self
            .regions
            .first()
            .map_or(0, |region| unsafe { Region::first_block_of(region) }.as_ptr() as isize);

        self.free_list.iter().map(move |block| FreeBlockInfo {
            offset: block.as_ptr() as isize - base,
            size: unsafe { Header::tag_of(block).size },
        })
    }

    /// Writes the free list as `FreeList: [offset:o,size:s]->...`.
    pub fn write_free_list(&self, out: &mut impl fmt::Write) -> fmt::Result {
        out.write_str("FreeList: ")?;

        for (i, block) in self.free_blocks().enumerate() {
            if i > 0 {
                out.write_str("->")?;
            }
            write!(out, "[offset:{},size:{}]", block.offset, block.size)?;
        }

        out.write_str("\n")
    }

    /// Walks every extent and the free list verifying the heap invariants:
    /// fence posts are intact, every block has agreeing tags and stays inside
    /// its extent, no two neighbors are both free, and the free list holds
    /// exactly the free blocks in strictly ascending address order.
    pub fn check(&self) -> Result<(), HeapError> {
        let mut free_blocks = 0;

        for region in &self.regions {
            unsafe {
                let left_fence = Region::left_fence_of(region);
                if !(*left_fence.as_ptr()).is_fence_post() {
                    return Err(corruption(left_fence, "left fence post overwritten"));
                }

                let right_fence = Region::right_fence_of(region);
                if !Header::tag_of(right_fence).is_fence_post() {
                    return Err(corruption(right_fence, "right fence post overwritten"));
                }

                let mut block = Region::first_block_of(region);
                let mut prev_free = false;

                while block != right_fence {
                    let tag = Header::tag_of(block);
                    self.check_tags(block, Region::blocks_range(region).end)?;

                    if tag.is_free() {
                        if prev_free {
                            return Err(corruption(block, "adjacent free blocks"));
                        }
                        free_blocks += 1;
                    }

                    prev_free = tag.is_free();
                    block = Header::right_header_of(block);
                }
            }
        }

        if free_blocks != self.free_list.len() {
            return Err(HeapError::Corruption {
                address: 0,
                reason: "free list does not match free blocks",
            });
        }

        let mut prev: Option<NonNull<Header>> = None;

        for block in self.free_list.iter() {
            if prev.is_some_and(|prev| prev >= block) {
                return Err(corruption(block, "free list out of address order"));
            }

            if self.region_of(block.as_ptr() as usize).is_none() {
                return Err(corruption(block, "free block outside every extent"));
            }

            if !unsafe { Header::tag_of(block) }.is_free() {
                return Err(corruption(block, "allocated block in the free list"));
            }

            prev = Some(block);
        }

        Ok(())
    }

    /// Total block size needed for a `size` bytes payload.
    fn rounded_size(size: usize) -> Result<usize, HeapError> {
        size.max(MIN_PAYLOAD)
            .checked_add(BLOCK_OVERHEAD)
            .and_then(|size| checked_align(size, ALIGNMENT))
            .ok_or(HeapError::SizeOverflow)
    }

    /// Maps a new extent and links its lone free block into the free list.
    ///
    /// Standard extents hold `arena_size` usable bytes. A request that
    /// doesn't fit gets a dedicated extent, rounded up to whole pages, whose
    /// block is strictly larger than `rounded_size`.
    fn grow_arena(&mut self, rounded_size: usize) -> Result<NonNull<Header>, HeapError> {
        let standard_block = self.arena_size + BLOCK_OVERHEAD;

        let len = if rounded_size < standard_block {
            standard_block + EXTENT_OVERHEAD
        } else {
            rounded_size
                .checked_add(ALIGNMENT + EXTENT_OVERHEAD)
                .and_then(|len| checked_align(len, kernel::page_size()))
                .ok_or(HeapError::SizeOverflow)?
        };

        let addr = unsafe { kernel::request_memory(len) }
            .ok_or(HeapError::OutOfMemory { requested: len })?;

        unsafe {
            let block = Region::bootstrap(&mut self.regions, addr, len);

            self.heap_size += len;

            // mmap gives no ordering guarantee, so the new block goes to its
            // address position and not blindly to the end of the list.
            self.free_list.insert_ordered(block);

            Ok(block)
        }
    }

    /// Allocates `rounded_size` bytes out of the free `block`.
    ///
    /// If what is left would still hold more than [`MIN_PAYLOAD`] bytes the
    /// block is split and the tail stays in the free list, in the position
    /// the block had. Otherwise the whole block is handed out.
    ///
    /// **SAFETY**: `block` must be in the free list and larger than
    /// `rounded_size`.
    unsafe fn take(&mut self, block: NonNull<Header>, rounded_size: usize) -> NonNull<u8> {
        unsafe {
            let size = Header::tag_of(block).size;
            let remainder = (size - rounded_size).checked_sub(BLOCK_OVERHEAD);

            if remainder.is_some_and(|remainder| remainder > MIN_PAYLOAD) {
                let tail = block.cast::<u8>().add(rounded_size).cast::<Header>();

                Header::write_tags(tail, size - rounded_size, BlockState::Free);
                self.free_list.replace(block, tail);
                Header::write_tags(block, rounded_size, BlockState::Allocated);
            } else {
                self.free_list.remove(block);
                Header::write_tags(block, size, BlockState::Allocated);
            }

            Header::payload_of(block)
        }
    }

    /// Marks `block` free and merges it with its free neighbors.
    ///
    /// ```text
    /// +------+---------+-------+        +------------------------+
    /// | Free | Current | Free  |  --->  |          Free          |
    /// +------+---------+-------+        +------------------------+
    /// ```
    ///
    /// The merged block keeps a valid position in the address ordered list
    /// without scanning: absorbing the right neighbor inherits its links, and
    /// merging into the left neighbor keeps the left neighbor's links. Only an
    /// isolated block needs an ordered insertion.
    ///
    /// **SAFETY**: `block` must have passed [`Self::validate`].
    unsafe fn coalesce(&mut self, block: NonNull<Header>) -> Result<(), HeapError> {
        unsafe {
            let extent_end = self.extent_end_of(block)?;

            let left_free = (*Header::left_footer_of(block).as_ptr()).is_free();
            let right = Header::right_header_of(block);
            let right_free = Header::tag_of(right).is_free();

            let left = if left_free {
                Some(self.free_left_neighbor(block)?)
            } else {
                None
            };

            if right_free {
                self.check_tags(right, extent_end)?;
            }

            let mut size = Header::tag_of(block).size;

            if right_free {
                size += Header::tag_of(right).size;
                self.free_list.replace(right, block);
            }

            match left {
                Some(left) => {
                    if right_free {
                        self.free_list.remove(block);
                    }

                    let merged = Header::tag_of(left).size + size;
                    Header::write_tags(left, merged, BlockState::Free);

                    // The header stays behind inside the merged block. Mark
                    // it free so freeing the same pointer again is caught.
                    Header::set_state(block, BlockState::Free);
                }
                None => {
                    Header::write_tags(block, size, BlockState::Free);

                    if !right_free {
                        self.free_list.insert_ordered(block);
                    }
                }
            }
        }

        Ok(())
    }

    /// Header of the free block that ends right before `block`, after making
    /// sure its tags can be trusted.
    unsafe fn free_left_neighbor(&self, block: NonNull<Header>) -> Result<NonNull<Header>, HeapError> {
        unsafe {
            let footer = *Header::left_footer_of(block).as_ptr();
            let first = self.extent_start_of(block)?;

            if footer.size < MIN_BLOCK_SIZE || footer.size > block.as_ptr() as usize - first {
                return Err(corruption(block, "left neighbor size leaves its extent"));
            }

            let left = Header::left_header_of(block);
            if Header::tag_of(left) != footer {
                return Err(corruption(left, "header and footer disagree"));
            }

            Ok(left)
        }
    }

    /// Checks that the pointer lands on the payload of an allocated block
    /// with consistent tags, and returns the block header.
    unsafe fn validate(&self, ptr: NonNull<u8>) -> Result<NonNull<Header>, HeapError> {
        let address = ptr.as_ptr() as usize;

        if address % ALIGNMENT != 0 {
            return Err(HeapError::InvalidPointer { address });
        }

        let region = self
            .region_of(address)
            .ok_or(HeapError::InvalidPointer { address })?;

        unsafe {
            let range = Region::blocks_range(region);
            let block = Header::from_payload(ptr);

            if (block.as_ptr() as usize) < range.start {
                return Err(HeapError::InvalidPointer { address });
            }

            match Header::tag_of(block).state() {
                Some(BlockState::Allocated) => {}
                Some(BlockState::Free) => return Err(HeapError::DoubleFree { address }),
                _ => return Err(corruption(block, "unknown block state")),
            }

            self.check_tags(block, range.end)?;

            Ok(block)
        }
    }

    /// Verifies that `block` has a sane size that keeps it below `extent_end`
    /// and that its footer agrees with its header.
    unsafe fn check_tags(&self, block: NonNull<Header>, extent_end: usize) -> Result<(), HeapError> {
        unsafe {
            let tag = Header::tag_of(block);

            match tag.state() {
                Some(BlockState::Free | BlockState::Allocated) => {}
                Some(BlockState::Sentinel) => {
                    return Err(corruption(block, "sentinel state inside an extent"));
                }
                None => return Err(corruption(block, "unknown block state")),
            }

            let start = block.as_ptr() as usize;
            if tag.size < MIN_BLOCK_SIZE
                || tag.size % ALIGNMENT != 0
                || tag.size > extent_end - start
            {
                return Err(corruption(block, "block size leaves its extent"));
            }

            if *Header::footer_of(block).as_ptr() != tag {
                return Err(corruption(block, "header and footer disagree"));
            }
        }

        Ok(())
    }

    /// Extent whose block area contains `address`.
    fn region_of(&self, address: usize) -> Option<NonNull<Node<Region>>> {
        self.regions
            .iter()
            .find(|region| unsafe { Region::blocks_range(*region) }.contains(&address))
    }

    fn extent_start_of(&self, block: NonNull<Header>) -> Result<usize, HeapError> {
        self.region_of(block.as_ptr() as usize)
            .map(|region| unsafe { Region::blocks_range(region) }.start)
            .ok_or_else(|| corruption(block, "block outside every extent"))
    }

    fn extent_end_of(&self, block: NonNull<Header>) -> Result<usize, HeapError> {
        self.region_of(block.as_ptr() as usize)
            .map(|region| unsafe { Region::blocks_range(region) }.end)
            .ok_or_else(|| corruption(block, "block outside every extent"))
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for region in &self.regions {
            unsafe {
                let len = region.as_ref().data.size;
                kernel::return_memory(region.cast(), len);
            }
        }
    }
}

fn corruption<T>(at: NonNull<T>, reason: &'static str) -> HeapError {
    HeapError::Corruption {
        address: at.as_ptr() as usize,
        reason,
    }
}

/// Size of the block that spans a fresh standard extent of a heap built with
/// `arena_size`.
#[cfg(test)]
pub(crate) fn standard_block_size(arena_size: usize) -> usize {
    crate::utils::align(arena_size, ALIGNMENT) + BLOCK_OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{FOOTER_SIZE, HEADER_SIZE};

    const TEST_ARENA: usize = 64 * 1024;

    fn heap() -> Heap {
        Heap::with_arena_size(TEST_ARENA)
    }

    fn blocks(heap: &Heap) -> Vec<FreeBlockInfo> {
        heap.free_blocks().collect()
    }

    /// Fills the payload with a pattern derived from `seed`.
    unsafe fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
        for i in 0..len {
            unsafe { *ptr.as_ptr().add(i) = seed.wrapping_add(i as u8) };
        }
    }

    unsafe fn holds_pattern(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
        (0..len).all(|i| unsafe { *ptr.as_ptr().add(i) } == seed.wrapping_add(i as u8))
    }

    #[test]
    fn initialization_is_lazy() {
        let mut heap = heap();

        assert!(!heap.is_initialized());
        assert_eq!(heap.extents(), 0);
        assert_eq!(heap.heap_size(), 0);
        assert_eq!(blocks(&heap), vec![]);

        heap.allocate(16).unwrap();

        assert!(heap.is_initialized());
        assert_eq!(heap.extents(), 1);
        assert_eq!(
            heap.heap_size(),
            standard_block_size(TEST_ARENA) + EXTENT_OVERHEAD
        );

        // Initializing again is a no-op.
        heap.initialize().unwrap();
        assert_eq!(heap.extents(), 1);
    }

    #[test]
    fn fresh_extent_is_one_free_block() {
        let mut heap = heap();
        heap.initialize().unwrap();

        assert_eq!(
            blocks(&heap),
            vec![FreeBlockInfo { offset: 0, size: standard_block_size(TEST_ARENA) }]
        );
        heap.check().unwrap();
    }

    #[test]
    fn allocations_are_aligned_and_writable() {
        let mut heap = heap();
        let sizes = [0, 1, 7, 8, 9, 15, 16, 100, 1000, 4096, 10_000];
        let mut live = Vec::new();

        for (seed, &size) in sizes.iter().enumerate() {
            let ptr = heap.allocate(size).unwrap();

            assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
            assert!(unsafe { heap.usable_size(ptr) } >= size);

            unsafe { fill(ptr, size, seed as u8) };
            live.push((ptr, size, seed as u8));
        }

        heap.check().unwrap();

        for (ptr, size, seed) in live {
            assert!(unsafe { holds_pattern(ptr, size, seed) });
        }
    }

    #[test]
    fn zero_sized_request_gets_a_minimum_block() {
        let mut heap = heap();
        let ptr = heap.allocate(0).unwrap();

        unsafe {
            assert_eq!(heap.object_size(ptr), MIN_BLOCK_SIZE);
            assert_eq!(heap.usable_size(ptr), MIN_PAYLOAD);
            fill(ptr, MIN_PAYLOAD, 1);
        }

        heap.check().unwrap();
    }

    #[test]
    fn live_blocks_never_overlap() {
        let mut heap = heap();
        let mut ranges = Vec::new();

        for i in 0..200 {
            let size = (i * 37) % 700;
            let ptr = heap.allocate(size).unwrap();
            let start = ptr.as_ptr() as usize;
            ranges.push(start..start + unsafe { heap.usable_size(ptr) });

            // Free every third block so later requests reuse holes.
            if i % 3 == 0 {
                unsafe { heap.free(ptr).unwrap() };
                ranges.pop();
            }
        }

        ranges.sort_by_key(|range| range.start);

        for pair in ranges.windows(2) {
            // Tags of the next block sit between the two payloads.
            assert!(pair[0].end + BLOCK_OVERHEAD <= pair[1].start);
        }

        heap.check().unwrap();
    }

    #[test]
    fn first_fit_reuses_a_freed_hole() {
        let mut heap = heap();

        let _a = heap.allocate(64).unwrap();
        let b = heap.allocate(128).unwrap();
        let _c = heap.allocate(32).unwrap();

        unsafe { heap.free(b).unwrap() };

        let d = heap.allocate(100).unwrap();

        assert_eq!(d, b);
        assert_eq!(heap.extents(), 1);
        heap.check().unwrap();
    }

    #[test]
    fn freeing_the_middle_block_last_merges_both_sides() {
        let mut heap = heap();

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(128).unwrap();
        let c = heap.allocate(32).unwrap();

        unsafe {
            heap.free(a).unwrap();
            heap.free(c).unwrap();
        }

        // A alone, C merged with the tail of the extent.
        assert_eq!(heap.free_blocks().count(), 2);
        heap.check().unwrap();

        unsafe { heap.free(b).unwrap() };

        assert_eq!(
            blocks(&heap),
            vec![FreeBlockInfo { offset: 0, size: standard_block_size(TEST_ARENA) }]
        );
        heap.check().unwrap();
    }

    #[test]
    fn left_merge_keeps_the_left_block_in_place() {
        let mut heap = heap();

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let _guard = heap.allocate(64).unwrap();

        unsafe {
            heap.free(a).unwrap();
            heap.free(b).unwrap();
        }

        let free = blocks(&heap);
        assert_eq!(free.len(), 2);
        assert_eq!(free[0].offset, 0);
        assert_eq!(free[0].size, 2 * Heap::rounded_size(64).unwrap());
        heap.check().unwrap();
    }

    #[test]
    fn split_then_free_rebuilds_the_original_block() {
        let mut heap = heap();
        heap.initialize().unwrap();
        let before = blocks(&heap);

        let ptr = heap.allocate(1000).unwrap();
        assert_eq!(blocks(&heap).len(), 1);
        assert_eq!(
            blocks(&heap)[0].size,
            before[0].size - Heap::rounded_size(1000).unwrap()
        );

        unsafe { heap.free(ptr).unwrap() };

        assert_eq!(blocks(&heap), before);
    }

    #[test]
    fn unusable_remainder_hands_out_the_whole_block() {
        let mut heap = heap();

        let a = heap.allocate(200).unwrap();
        let _b = heap.allocate(8).unwrap();
        unsafe { heap.free(a).unwrap() };

        // 200 + 48 = 248 byte hole; 192 + 48 = 240 leaves a sliver of 8 bytes.
        let c = heap.allocate(192).unwrap();

        assert_eq!(c, a);
        assert_eq!(unsafe { heap.object_size(c) }, Heap::rounded_size(200).unwrap());
        assert_eq!(heap.free_blocks().count(), 1);
        heap.check().unwrap();
    }

    #[test]
    fn freeing_everything_in_any_order_restores_every_extent() {
        let mut heap = heap();
        let mut live = Vec::new();

        for i in 0..60 {
            let size = 64 + (i * 389) % 3000;
            let ptr = heap.allocate(size).unwrap();
            unsafe { fill(ptr, size, i as u8) };
            live.push((ptr, size, i as u8));
        }

        // Enough to need a second extent.
        assert!(heap.extents() > 1);

        // 7 is coprime with 60, so this visits every block once.
        for step in 0..live.len() {
            let (ptr, size, seed) = live[(step * 7) % live.len()];

            unsafe {
                assert!(holds_pattern(ptr, size, seed));
                heap.free(ptr).unwrap();
            }

            heap.check().unwrap();
        }

        let free = blocks(&heap);
        assert_eq!(free.len(), heap.extents());
        assert!(free.iter().all(|block| block.size == standard_block_size(TEST_ARENA)));
    }

    #[test]
    fn arena_grows_when_nothing_fits() {
        let mut heap = heap();

        let a = heap.allocate(TEST_ARENA / 2).unwrap();
        let b = heap.allocate(TEST_ARENA / 2).unwrap();

        assert_eq!(heap.extents(), 2);
        assert_eq!(
            heap.heap_size(),
            2 * (standard_block_size(TEST_ARENA) + EXTENT_OVERHEAD)
        );
        heap.check().unwrap();

        unsafe {
            heap.free(a).unwrap();
            heap.free(b).unwrap();
        }

        assert_eq!(heap.free_blocks().count(), 2);
        heap.check().unwrap();
    }

    #[test]
    fn oversized_request_gets_a_dedicated_extent() {
        let mut heap = heap();
        let size = TEST_ARENA * 4;

        let ptr = heap.allocate(size).unwrap();

        assert_eq!(heap.extents(), 2);
        assert!(unsafe { heap.usable_size(ptr) } >= size);

        unsafe {
            ptr.as_ptr().write_bytes(0x5A, size);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0x5A);
        }

        heap.check().unwrap();

        unsafe { heap.free(ptr).unwrap() };

        let sizes: Vec<usize> = heap.free_blocks().map(|block| block.size).collect();
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().any(|&size| size > TEST_ARENA * 4));
        heap.check().unwrap();
    }

    #[test]
    fn huge_requests_overflow_cleanly() {
        let mut heap = heap();

        assert_eq!(heap.allocate(usize::MAX), Err(HeapError::SizeOverflow));
        assert_eq!(
            heap.allocate(usize::MAX - BLOCK_OVERHEAD),
            Err(HeapError::SizeOverflow)
        );
    }

    #[test]
    fn double_free_is_detected() {
        let mut heap = heap();

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let c = heap.allocate(64).unwrap();

        unsafe {
            // Isolated block.
            heap.free(b).unwrap();
            assert_eq!(
                heap.free(b),
                Err(HeapError::DoubleFree { address: b.as_ptr() as usize })
            );

            // Block swallowed by its left neighbor.
            heap.free(c).unwrap();
            assert_eq!(
                heap.free(c),
                Err(HeapError::DoubleFree { address: c.as_ptr() as usize })
            );

            heap.free(a).unwrap();
        }

        heap.check().unwrap();
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let mut heap = heap();
        let ptr = heap.allocate(256).unwrap();
        let mut local = 0u64;

        unsafe {
            let stack = NonNull::from(&mut local).cast::<u8>();
            assert_eq!(
                heap.free(stack),
                Err(HeapError::InvalidPointer { address: stack.as_ptr() as usize })
            );

            let misaligned = ptr.add(1);
            assert_eq!(
                heap.free(misaligned),
                Err(HeapError::InvalidPointer { address: misaligned.as_ptr() as usize })
            );

            // Inside the payload: the bytes before it are not a valid header.
            ptr.as_ptr().write_bytes(0xFF, 256);
            assert!(heap.free(ptr.add(64)).is_err());
        }

        // Nothing was touched.
        heap.check().unwrap();
        unsafe { heap.free(ptr).unwrap() };
    }

    #[test]
    fn nothing_can_be_freed_before_initialization() {
        let mut heap = heap();
        let mut local = [0u64; 8];
        let ptr = NonNull::from(&mut local[4]).cast::<u8>();

        assert!(matches!(
            unsafe { heap.free(ptr) },
            Err(HeapError::InvalidPointer { .. })
        ));
    }

    #[test]
    fn overwritten_footer_is_detected() {
        let mut heap = heap();
        let ptr = heap.allocate(64).unwrap();
        let _next = heap.allocate(64).unwrap();

        unsafe {
            let usable = heap.usable_size(ptr);
            // One byte past the payload is the footer.
            ptr.as_ptr().add(usable).write_bytes(0x11, FOOTER_SIZE);

            assert!(matches!(
                heap.free(ptr),
                Err(HeapError::Corruption { reason: "header and footer disagree", .. })
            ));
        }

        assert!(heap.check().is_err());
    }

    #[test]
    fn overwritten_header_state_is_detected() {
        let mut heap = heap();
        let ptr = heap.allocate(64).unwrap();

        unsafe {
            let header = ptr.sub(HEADER_SIZE).cast::<Header>();
            Header::set_state(header, BlockState::Sentinel);

            assert!(matches!(heap.free(ptr), Err(HeapError::Corruption { .. })));
        }
    }

    #[test]
    fn free_list_dump() {
        let mut heap = heap();
        heap.allocate(64).unwrap();

        let taken = Heap::rounded_size(64).unwrap();
        let mut out = String::new();
        heap.write_free_list(&mut out).unwrap();

        assert_eq!(
            out,
            format!(
                "FreeList: [offset:{taken},size:{}]\n",
                standard_block_size(TEST_ARENA) - taken
            )
        );

        let a = heap.allocate(64).unwrap();
        heap.allocate(64).unwrap();
        unsafe { heap.free(a).unwrap() };

        let mut out = String::new();
        heap.write_free_list(&mut out).unwrap();

        assert_eq!(
            out,
            format!(
                "FreeList: [offset:{taken},size:{taken}]->[offset:{},size:{}]\n",
                3 * taken,
                standard_block_size(TEST_ARENA) - 3 * taken
            )
        );
    }

    #[test]
    fn reallocate_moves_the_payload_and_frees_the_old_block() {
        let mut heap = heap();

        let old = heap.allocate(40).unwrap();
        let _guard = heap.allocate(8).unwrap();

        unsafe {
            fill(old, 40, 9);

            let new = heap.reallocate(old, 400).unwrap();
            assert_ne!(new, old);
            assert!(holds_pattern(new, 40, 9));

            // The old block is a hole at the very start of the extent.
            assert_eq!(blocks(&heap)[0].offset, 0);

            let shrunk = heap.reallocate(new, 16).unwrap();
            assert!(holds_pattern(shrunk, 16, 9));
            assert_eq!(shrunk, old);
        }

        heap.check().unwrap();
    }

    #[test]
    fn reallocate_rejects_bad_pointers_before_allocating() {
        let mut heap = heap();
        let ptr = heap.allocate(64).unwrap();
        unsafe { heap.free(ptr).unwrap() };

        let before = blocks(&heap);

        assert_eq!(
            unsafe { heap.reallocate(ptr, 128) },
            Err(HeapError::DoubleFree { address: ptr.as_ptr() as usize })
        );
        assert_eq!(blocks(&heap), before);
    }

    #[test]
    fn largest_standard_request_takes_the_whole_first_block() {
        let mut heap = heap();

        let ptr = heap.allocate(TEST_ARENA - 8).unwrap();

        assert_eq!(heap.extents(), 1);
        assert_eq!(unsafe { heap.object_size(ptr) }, standard_block_size(TEST_ARENA));
        assert_eq!(blocks(&heap), vec![]);
        heap.check().unwrap();

        unsafe { heap.free(ptr).unwrap() };

        assert_eq!(
            blocks(&heap),
            vec![FreeBlockInfo { offset: 0, size: standard_block_size(TEST_ARENA) }]
        );
        heap.check().unwrap();
    }

    #[test]
    fn full_arena_request_needs_a_dedicated_extent() {
        let mut heap = heap();

        // The first block is exactly as large as the rounded request, and
        // first fit only takes strictly larger blocks.
        let ptr = heap.allocate(TEST_ARENA).unwrap();

        assert_eq!(heap.extents(), 2);
        assert!(unsafe { heap.usable_size(ptr) } >= TEST_ARENA);
        assert!(
            heap.free_blocks()
                .any(|block| block == FreeBlockInfo { offset: 0, size: standard_block_size(TEST_ARENA) })
        );
        heap.check().unwrap();

        unsafe { heap.free(ptr).unwrap() };

        assert_eq!(heap.free_blocks().count(), 2);
        assert!(heap.free_blocks().any(|block| block.size > standard_block_size(TEST_ARENA)));
        heap.check().unwrap();
    }

    #[test]
    fn tiny_arena_sizes_still_hold_a_minimum_block() {
        for arena_size in [0, 1, 7, 8] {
            let mut heap = Heap::with_arena_size(arena_size);
            heap.initialize().unwrap();
            heap.check().unwrap();

            assert_eq!(blocks(&heap)[0].size, MIN_BLOCK_SIZE);

            let ptr = heap.allocate(0).unwrap();
            heap.check().unwrap();

            unsafe { heap.free(ptr).unwrap() };
            heap.check().unwrap();
        }
    }

    #[test]
    fn dropping_the_heap_unmaps_every_extent() {
        let mut heap = heap();

        for _ in 0..3 {
            heap.allocate(TEST_ARENA - 1024).unwrap();
        }

        assert_eq!(heap.extents(), 3);
        drop(heap);
    }
}
