use std::ptr::NonNull;

use crate::{
    block::{Header, Tag},
    list::{Iter, Link, List},
};

/// Circular, address ordered, doubly linked list of free blocks.
///
/// The links live inside the free blocks themselves (see [`Header`]), so
/// keeping track of free memory costs nothing extra. The anchor of the list,
/// the sentinel, is not a block: it is represented by the `None` link at both
/// ends of the underlying [`List`], and it is the only thing that may carry
/// [`crate::block::BlockState::Sentinel`].
///
/// ```text
///                       Free List (ascending addresses)
///
///     +----------+      +------+      +------+      +------+
///  +->| sentinel | ---> | Free | ---> | Free | ---> | Free | ---+
///  |  +----------+      +------+      +------+      +------+    |
///  +------------------------------------------------------------+
///
/// ```
///
/// Keeping the list sorted by address makes first-fit prefer low addresses and
/// lets a merged block simply inherit the position of the block it absorbed.
pub(crate) struct FreeList {
    /// Free block headers, lowest address first.
    items: List<Tag>,
}

impl FreeList {
    /// Creates a new empty List
    pub const fn new() -> Self {
        Self { items: List::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Free blocks in ascending address order.
    pub fn iter(&self) -> Iter<'_, Tag> {
        self.items.iter()
    }

    /// Returns the first block, in address order, whose size is strictly
    /// larger than `rounded_size`, or `None` if the scan came back to the
    /// sentinel.
    pub fn find_first_fit(&self, rounded_size: usize) -> Link<Header> {
        self.iter()
            .find(|block| unsafe { Header::tag_of(*block).size } > rounded_size)
    }

    /// Links `block` right before the first free block with a higher address,
    /// or right before the sentinel if there is none.
    ///
    /// **SAFETY**: `block` must be a block header that is not in the list.
    pub unsafe fn insert_ordered(&mut self, block: NonNull<Header>) {
        let successor = self.iter().find(|free| *free > block);

        unsafe { self.items.insert_before(block, successor) }
    }

    /// Unlinks `block`.
    ///
    /// **SAFETY**: `block` must be in the list.
    pub unsafe fn remove(&mut self, block: NonNull<Header>) {
        unsafe { self.items.remove(block) }
    }

    /// Puts `new` in the list position `old` had. Used when a block is split
    /// (the tail takes over) or when a block absorbs its right neighbor.
    ///
    /// **SAFETY**: `old` must be in the list, `new` must not, and no other
    /// free block may sit between their addresses.
    pub unsafe fn replace(&mut self, old: NonNull<Header>, new: NonNull<Header>) {
        unsafe { self.items.replace(old, new) }
    }
}
