use thiserror::Error;

/// Everything that can go wrong inside the heap.
///
/// Only [`HeapError::SizeOverflow`] is something a caller can recover from.
/// The rest mean either that the kernel ran out of memory or that the boundary
/// tags can no longer be trusted, and [`crate::MemAlloc`] terminates the
/// process for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The kernel refused to map another extent.
    #[error("out of memory: the kernel refused an extent of {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The request plus our own overhead does not fit in a `usize`.
    #[error("allocation size overflows the address space")]
    SizeOverflow,

    /// The pointer does not belong to any extent, or it is not aligned like
    /// the payloads we hand out.
    #[error("pointer {address:#x} was not returned by this allocator")]
    InvalidPointer { address: usize },

    /// The block behind the pointer is already free.
    #[error("double free of pointer {address:#x}")]
    DoubleFree { address: usize },

    /// Boundary tags are inconsistent.
    #[error("heap corruption at {address:#x}: {reason}")]
    Corruption { address: usize, reason: &'static str },
}

impl HeapError {
    /// Whether continuing after this error would risk running on a broken heap
    /// (or on no heap at all).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SizeOverflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_overflow_is_recoverable() {
        assert!(!HeapError::SizeOverflow.is_fatal());
        assert!(HeapError::OutOfMemory { requested: 4096 }.is_fatal());
        assert!(HeapError::InvalidPointer { address: 0x10 }.is_fatal());
        assert!(HeapError::DoubleFree { address: 0x10 }.is_fatal());
        assert!(HeapError::Corruption { address: 0x10, reason: "test" }.is_fatal());
    }

    #[test]
    fn messages_carry_the_address() {
        let err = HeapError::Corruption {
            address: 0xbeef,
            reason: "header and footer disagree",
        };

        assert_eq!(
            err.to_string(),
            "heap corruption at 0xbeef: header and footer disagree"
        );
        assert_eq!(
            HeapError::DoubleFree { address: 0x40 }.to_string(),
            "double free of pointer 0x40"
        );
    }
}
