use std::fmt;

/// Counters reported when the process exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Bytes obtained from the kernel so far. Never decreases.
    pub heap_size: usize,
    /// Number of extents obtained from the kernel.
    pub extents: usize,
    pub malloc_calls: usize,
    pub free_calls: usize,
    pub realloc_calls: usize,
    pub calloc_calls: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "-------------------")?;
        writeln!(f, "HeapSize:\t{} bytes", self.heap_size)?;
        writeln!(f, "# mallocs:\t{}", self.malloc_calls)?;
        writeln!(f, "# reallocs:\t{}", self.realloc_calls)?;
        writeln!(f, "# callocs:\t{}", self.calloc_calls)?;
        writeln!(f, "# frees:\t{}", self.free_calls)?;
        writeln!(f)?;
        writeln!(f, "-------------------")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_format() {
        let stats = Stats {
            heap_size: 2097304,
            extents: 1,
            malloc_calls: 5,
            free_calls: 3,
            realloc_calls: 2,
            calloc_calls: 1,
        };

        let expected = "\n-------------------\n\
                        HeapSize:\t2097304 bytes\n\
                        # mallocs:\t5\n\
                        # reallocs:\t2\n\
                        # callocs:\t1\n\
                        # frees:\t3\n\
                        \n-------------------\n";

        assert_eq!(stats.to_string(), expected);
    }
}
