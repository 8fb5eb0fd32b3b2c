use core::ffi::CStr;

use crate::layout::GUARD_THRESHOLD;

/// Size of the region the process-wide heap starts with when the integrator
/// has not supplied any.
pub const DEFAULT_HEAP_SIZE: usize = 256 * 1024;

/// Runtime-adjustable settings of the process-wide heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    /// Allocations of at least this many bytes are guarded.
    pub threshold: usize,
}

impl GuardConfig {
    pub const DEFAULT: Self = Self {
        threshold: GUARD_THRESHOLD,
    };

    /// Apply `HEAPGUARD_THRESHOLD` and `HEAPGUARD_DISABLE` on top of the
    /// defaults. Malformed values are ignored.
    ///
    /// # Safety
    ///
    /// Calls `getenv`, which races with concurrent `setenv`.
    pub unsafe fn from_env() -> Self {
        let mut config = Self::DEFAULT;
        if let Some(threshold) = getenv(c"HEAPGUARD_THRESHOLD").and_then(parse_usize) {
            config.threshold = threshold;
        }
        if getenv(c"HEAPGUARD_DISABLE").is_some() {
            config.threshold = usize::MAX;
        }
        config
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

unsafe fn getenv(key: &CStr) -> Option<&'static [u8]> {
    let val = libc::getenv(key.as_ptr());
    if val.is_null() {
        return None;
    }
    Some(CStr::from_ptr(val).to_bytes())
}

/// Parse a decimal number without allocating.
fn parse_usize(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0usize, |acc, &byte| {
        if !byte.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add((byte - b'0') as usize)
    })
}
