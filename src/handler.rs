//! What happens when a footer canary turns out to be damaged.
use core::{
    ffi::c_void,
    fmt, mem, ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::layout::Requester;

/// Everything known about a damaged block at the time it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionReport {
    pub user_ptr: *mut u8,
    pub requester: Requester,
    pub usable_size: usize,
    /// Byte offset of the first damaged footer word from `user_ptr`
    pub offset: usize,
    pub expected: u32,
    pub found: u32,
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heap overrun detected at allocation {:p} ({} bytes, requested by {:#x}): \
             footer word at +{} is {:#010x}, expected {:#010x}",
            self.user_ptr,
            self.usable_size,
            self.requester.addr(),
            self.offset,
            self.found,
            self.expected,
        )
    }
}

/// Reacts to a damaged footer.
///
/// Called before the block goes back to the underlying allocator, with the
/// guard header still in place. An implementation that returns makes the
/// release fail and the block is never reclaimed.
pub trait CorruptionHandler {
    fn corruption_detected(&self, report: &CorruptionReport);
}

/// C callback notified of a corruption event. `ctx` is the value supplied at
/// registration.
pub type CorruptionCallback = unsafe extern "C" fn(ctx: *mut c_void) -> i32;

/// Reports the corruption, runs the registered callback, then aborts.
#[derive(Debug)]
pub struct AbortOnCorruption {
    callback: AtomicUsize,
    ctx: AtomicPtr<c_void>,
}

impl AbortOnCorruption {
    pub const fn new() -> Self {
        Self {
            callback: AtomicUsize::new(0),
            ctx: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Register `cb` to be called with `ctx` when corruption is detected.
    /// `None` removes the callback.
    pub fn register_callback(&self, cb: Option<CorruptionCallback>, ctx: *mut c_void) {
        // Publish `ctx` before the callback that consumes it
        self.callback.store(0, Ordering::Release);
        self.ctx.store(ctx, Ordering::Release);
        self.callback
            .store(cb.map_or(0, |cb| cb as usize), Ordering::Release);
    }

    fn callback(&self) -> Option<(CorruptionCallback, *mut c_void)> {
        let raw = self.callback.load(Ordering::Acquire);
        if raw == 0 {
            return None;
        }
        // Safety: only ever stored from a `CorruptionCallback`
        let cb = unsafe { mem::transmute::<usize, CorruptionCallback>(raw) };
        Some((cb, self.ctx.load(Ordering::Acquire)))
    }
}

impl Default for AbortOnCorruption {
    fn default() -> Self {
        Self::new()
    }
}

impl CorruptionHandler for AbortOnCorruption {
    fn corruption_detected(&self, report: &CorruptionReport) {
        error!("{report}");
        if let Some((cb, ctx)) = self.callback() {
            let status = unsafe { cb(ctx) };
            if status != 0 {
                warn!("corruption callback returned {status}");
            }
        }
        unsafe { libc::abort() };
    }
}

impl<T: CorruptionHandler + ?Sized> CorruptionHandler for &T {
    #[inline]
    fn corruption_detected(&self, report: &CorruptionReport) {
        (**self).corruption_detected(report)
    }
}
