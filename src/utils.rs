//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.


/// It aligns `to_be_aligned` using `aligment`.
///
/// This method is used to align extent sizes to be a multiple of [`crate::kernel::page_size`]
/// and block sizes to be a multiple of [`crate::block::ALIGNMENT`] because every
/// payload we hand out has to start on an aligned address.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when
/// `to_be_aligned` is too close to [`usize::MAX`]. User requests go through
/// this one since we don't control their size.
pub fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    Some(to_be_aligned.checked_add(aligment - 1)? & !(aligment - 1))
}
