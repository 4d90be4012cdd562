use std::{mem, ops::Range, ptr::NonNull};
use crate::{
    block::{BlockState, FOOTER_SIZE, Footer, HEADER_SIZE, Header, Tag},
    list::{List, Node},
};


/// This is the overhead size introduced by the [`Region`] header in bytes.
/// The header is represented as a [`Node`]. See [`List`] for more detail.
pub(crate) const REGION_HEADER_SIZE: usize = mem::size_of::<Node<Region>>();

/// Bytes of every extent that never belong to a block: the region header and
/// the two fence posts.
pub(crate) const EXTENT_OVERHEAD: usize = REGION_HEADER_SIZE + FOOTER_SIZE + HEADER_SIZE;

/// This struct contains the extent specific metadata. However, as every other
/// header, this is usually represented as a [`Node<Region>`] so that would be
/// the complete region data.
///
/// Every extent we get from the kernel looks like this:
///
/// ```text
/// +-------------+-------------+--------------------------------------+-------------+
/// | Node<Region>| fence post  |  Header | ......  Block  ...... | Footer | fence post  |
/// |             |  (Footer)   |                                      |  (Header)   |
/// +-------------+-------------+--------------------------------------+-------------+
/// ```
///
/// Both fence posts are permanently allocated, so coalescing and any walk over
/// the blocks stops there. Extents are linked together only so they can be
/// found again (pointer validation and teardown); we cannot assume they are
/// adjacent, and nothing relies on them being so.
pub(crate) struct Region {
    /// Size of the whole extent, region header included.
    pub size: usize,
}

impl Region {
    /// Turns the raw memory at `addr` into an extent: appends the region header
    /// to `regions`, writes both fence posts and one free block spanning all
    /// the space between them. The block is returned unlinked, placing it in
    /// the free list is up to the caller.
    ///
    /// **SAFETY**: `addr` must point to `len` writable bytes aligned to at
    /// least `usize`, and `len` must leave room for a block.
    pub(crate) unsafe fn bootstrap(
        regions: &mut List<Region>,
        addr: NonNull<u8>,
        len: usize,
    ) -> NonNull<Header> {
        unsafe {
            let region = regions.append(Region { size: len }, addr);

            Self::left_fence_of(region).write(Tag::fence_post());
            Self::right_fence_of(region).write(Node {
                next: None,
                prev: None,
                data: Tag::fence_post(),
            });

            let block = Self::first_block_of(region);
            Header::write_tags(block, len - EXTENT_OVERHEAD, BlockState::Free);

            block
        }
    }

    #[inline]
    pub(crate) unsafe fn left_fence_of(region: NonNull<Node<Region>>) -> NonNull<Footer> {
        unsafe { region.cast::<u8>().add(REGION_HEADER_SIZE).cast() }
    }

    #[inline]
    pub(crate) unsafe fn right_fence_of(region: NonNull<Node<Region>>) -> NonNull<Header> {
        unsafe {
            let size = region.as_ref().data.size;
            region.cast::<u8>().add(size - HEADER_SIZE).cast()
        }
    }

    /// Header of the lowest block of the extent.
    #[inline]
    pub(crate) unsafe fn first_block_of(region: NonNull<Node<Region>>) -> NonNull<Header> {
        unsafe { region.cast::<u8>().add(REGION_HEADER_SIZE + FOOTER_SIZE).cast() }
    }

    /// Addresses covered by blocks, from the first block header up to the
    /// right fence post (excluded).
    #[inline]
    pub(crate) unsafe fn blocks_range(region: NonNull<Node<Region>>) -> Range<usize> {
        unsafe {
            let start = Self::first_block_of(region).as_ptr() as usize;
            let end = Self::right_fence_of(region).as_ptr() as usize;
            start..end
        }
    }
}
