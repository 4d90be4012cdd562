use std::{mem, ptr::NonNull};
use crate::list::Node;


/// Every payload we hand out is aligned to this many bytes, and every block
/// size is a multiple of it.
pub(crate) const ALIGNMENT: usize = 8;

/// Header of a block. Block headers are always list nodes so a free block can
/// be linked into the [`crate::freelist::FreeList`] without extra space. The
/// links are meaningless while the block is allocated.
pub(crate) type Header = Node<Tag>;

/// Footer of a block, a plain copy of the header's [`Tag`].
pub(crate) type Footer = Tag;

/// Header size of a block, links included.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Footer size of a block.
pub(crate) const FOOTER_SIZE: usize = mem::size_of::<Footer>();

/// Bytes of every block that the user never sees.
pub(crate) const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest payload we hand out or leave behind after a split.
pub(crate) const MIN_PAYLOAD: usize = 8;

/// Smallest total block size.
pub(crate) const MIN_BLOCK_SIZE: usize = BLOCK_OVERHEAD + MIN_PAYLOAD;

/// Reserved size written in fence posts. It is never a valid block size
/// since it is not a multiple of [`ALIGNMENT`].
pub(crate) const FENCE_POST_SIZE: usize = 123_456_789;

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(FOOTER_SIZE % ALIGNMENT == 0);
const _: () = assert!(FENCE_POST_SIZE % ALIGNMENT != 0);

/// State of a block as recorded in its boundary tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockState {
    /// Linked into the free list.
    Free = 0,
    /// Owned by the caller, or a fence post.
    Allocated = 1,
    /// Reserved for the free list anchor. The anchor is not heap memory, so
    /// finding this value inside an extent means the tags were overwritten.
    Sentinel = 2,
}

impl BlockState {
    /// Decodes a raw state read from heap memory. Anything the allocator never
    /// writes yields `None`.
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Allocated),
            2 => Some(Self::Sentinel),
            _ => None,
        }
    }
}

/// Boundary tag. Both ends of every block store one of these and they must
/// always agree, which is what lets us find neighbors in O(1):
///
/// ```text
///              +---------------------+ <------+
///              |   next (if free)    |        |
///              +---------------------+        |
///              |   prev (if free)    |        | -> Header (Node<Tag>)
///              +---------------------+        |
///              |  size  |   state    |        |
///              +---------------------+ <------+
/// payload ---> |       Content       |
///              |         ...         |
///              +---------------------+ <------+
///              |  size  |   state    |        | -> Footer (Tag)
///              +---------------------+ <------+
/// ```
///
/// `size` always covers the whole block: header, payload and footer.
///
/// The state is stored as a raw integer instead of [`BlockState`] because the
/// bytes can be overwritten by a buggy program and we must be able to read
/// them back without undefined behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Tag {
    /// Total size of the block in bytes.
    pub size: usize,
    /// Raw [`BlockState`].
    pub state: u32,
}

impl Tag {
    pub const fn new(size: usize, state: BlockState) -> Self {
        Self { size, state: state as u32 }
    }

    /// Tag written at both ends of an extent.
    pub const fn fence_post() -> Self {
        Self::new(FENCE_POST_SIZE, BlockState::Allocated)
    }

    #[inline]
    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.state)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state() == Some(BlockState::Free)
    }

    #[inline]
    pub fn is_fence_post(&self) -> bool {
        *self == Self::fence_post()
    }
}

impl Header {
    /// Returns the header that precedes a payload address.
    ///
    /// **SAFETY**: `payload` must point right after a [`Header`].
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Self> {
        unsafe { payload.cast::<u8>().sub(HEADER_SIZE).cast() }
    }

    /// Address handed out to the user for this block.
    #[inline]
    pub unsafe fn payload_of(header: NonNull<Self>) -> NonNull<u8> {
        unsafe { header.cast::<u8>().add(HEADER_SIZE) }
    }

    #[inline]
    pub unsafe fn tag_of(header: NonNull<Self>) -> Tag {
        unsafe { (*header.as_ptr()).data }
    }

    /// Footer of this block, found through the size recorded in the header.
    #[inline]
    pub unsafe fn footer_of(header: NonNull<Self>) -> NonNull<Footer> {
        unsafe {
            let size = (*header.as_ptr()).data.size;
            header.cast::<u8>().add(size - FOOTER_SIZE).cast()
        }
    }

    /// Footer of the block that ends right before this one. For the first
    /// block of an extent this is the left fence post.
    #[inline]
    pub unsafe fn left_footer_of(header: NonNull<Self>) -> NonNull<Footer> {
        unsafe { header.cast::<u8>().sub(FOOTER_SIZE).cast() }
    }

    /// Header of the block that ends right before this one.
    ///
    /// **SAFETY**: the left neighbor must be a real block, never call this
    /// when [`Self::left_footer_of`] is a fence post.
    #[inline]
    pub unsafe fn left_header_of(header: NonNull<Self>) -> NonNull<Self> {
        unsafe {
            let left_size = (*Self::left_footer_of(header).as_ptr()).size;
            header.cast::<u8>().sub(left_size).cast()
        }
    }

    /// Header of the block that starts right after this one. For the last
    /// block of an extent this is the right fence post.
    #[inline]
    pub unsafe fn right_header_of(header: NonNull<Self>) -> NonNull<Self> {
        unsafe {
            let size = (*header.as_ptr()).data.size;
            header.cast::<u8>().add(size).cast()
        }
    }

    /// Writes the same [`Tag`] at both ends of the block that starts at
    /// `header`. The footer position is derived from `size`, not from the old
    /// header contents.
    #[inline]
    pub unsafe fn write_tags(header: NonNull<Self>, size: usize, state: BlockState) {
        let tag = Tag::new(size, state);

        unsafe {
            (*header.as_ptr()).data = tag;
            header
                .cast::<u8>()
                .add(size - FOOTER_SIZE)
                .cast::<Footer>()
                .write(tag);
        }
    }

    /// Overwrites only the state in the header. Used to poison headers that
    /// stop describing an independent block.
    #[inline]
    pub unsafe fn set_state(header: NonNull<Self>, state: BlockState) {
        unsafe { (*header.as_ptr()).data.state = state as u32 }
    }
}
