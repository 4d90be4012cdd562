//! Runtime configuration.
//!
//! The only knob is the `MALLOCVERBOSE` environment variable:
//! - `NO`: don't print the statistics summary when the process exits.
//! - anything else, or unset (default): print it.

use std::ffi::CStr;

/// Name of the verbosity variable.
pub const VERBOSE_VAR: &CStr = c"MALLOCVERBOSE";

/// Allocator configuration resolved from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Print [`crate::Stats`] at exit.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { verbose: true }
    }
}

impl Config {
    /// Applies the parsing rule to the raw value of [`VERBOSE_VAR`]. The
    /// comparison is exact, `no` or `No` keep the summary on.
    pub fn from_value(value: Option<&CStr>) -> Self {
        Self {
            verbose: value != Some(c"NO"),
        }
    }

    /// Reads [`VERBOSE_VAR`] from the environment.
    ///
    /// This runs on the very first `malloc` of the process, so it must not
    /// allocate: `getenv` hands us a pointer into the environment block and
    /// nothing gets copied.
    #[cfg(unix)]
    pub fn from_env() -> Self {
        unsafe {
            let raw = libc::getenv(VERBOSE_VAR.as_ptr());

            if raw.is_null() {
                Self::from_value(None)
            } else {
                Self::from_value(Some(CStr::from_ptr(raw)))
            }
        }
    }

    #[cfg(not(unix))]
    pub fn from_env() -> Self {
        let verbose = std::env::var_os("MALLOCVERBOSE").is_none_or(|value| value != "NO");

        Self { verbose }
    }
}
