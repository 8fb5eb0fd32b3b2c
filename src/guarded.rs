//! Wires a [`HeapGuard`] into any [`CAlloc`].
use core::{alloc::Layout, ptr::NonNull};

use rlsf::CAlloc;

use crate::{
    canary::{Entropy, LibcRand},
    guard::HeapGuard,
    handler::{AbortOnCorruption, CorruptionHandler},
    layout::{Requester, HEADER_ALIGN},
};

/// `malloc_usable_size`, which is [lacked][1] by `rlsf`
///
/// [1]: https://github.com/yvt/rlsf/issues/2
pub unsafe trait CAllocUsableSize: CAlloc {
    /// # Safety
    ///
    /// `ptr` must be a live allocation of `self`.
    unsafe fn allocation_usable_size(&self, ptr: NonNull<u8>) -> usize;
}

/// An allocator whose large blocks carry a guard header and a canary footer.
pub struct GuardedAlloc<T, H = AbortOnCorruption, E = LibcRand> {
    alloc: T,
    guard: HeapGuard<H, E>,
}

impl<T, H, E> GuardedAlloc<T, H, E> {
    pub const fn new(alloc: T, guard: HeapGuard<H, E>) -> Self {
        Self { alloc, guard }
    }

    pub fn guard(&self) -> &HeapGuard<H, E> {
        &self.guard
    }

    pub fn inner(&self) -> &T {
        &self.alloc
    }
}

impl<T: CAlloc, H: CorruptionHandler, E: Entropy> GuardedAlloc<T, H, E> {
    /// Allocate on behalf of `requester`.
    pub fn allocate_for(&self, layout: Layout, requester: Requester) -> Option<NonNull<u8>> {
        // The user pointer is only as aligned as the header
        if layout.align() > HEADER_ALIGN {
            return CAlloc::allocate(&self.alloc, layout);
        }

        let size = layout.size();
        let planned = self.guard.pre_alloc_hook(size);
        if planned == size {
            return CAlloc::allocate(&self.alloc, layout);
        }

        let raw_layout = Layout::from_size_align(planned, HEADER_ALIGN).ok()?;
        let raw = CAlloc::allocate(&self.alloc, raw_layout)?;
        Some(unsafe { self.guard.post_alloc_hook(raw, size, requester) })
    }
}

unsafe impl<T, H, E> CAlloc for GuardedAlloc<T, H, E>
where
    T: CAllocUsableSize,
    H: CorruptionHandler,
    E: Entropy,
{
    #[track_caller]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.allocate_for(layout, Requester::caller())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        match self.guard.release_hook(ptr.as_ptr()) {
            Ok(raw) => CAlloc::deallocate(&self.alloc, raw),
            Err(e) => warn!("ignoring the deallocation request for {ptr:p}: {e}"),
        }
    }

    #[track_caller]
    unsafe fn reallocate(&self, ptr: NonNull<u8>, new_layout: Layout) -> Option<NonNull<u8>> {
        let stays_unguarded = !self.guard.is_guarded(ptr.as_ptr())
            && (new_layout.align() > HEADER_ALIGN
                || self.guard.pre_alloc_hook(new_layout.size()) == new_layout.size());
        if stays_unguarded {
            return CAlloc::reallocate(&self.alloc, ptr, new_layout);
        }

        let old_size = self.allocation_usable_size(ptr);
        let new_ptr = self.allocate_for(new_layout, Requester::caller())?;
        core::ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_ptr.as_ptr(),
            old_size.min(new_layout.size()),
        );
        CAlloc::deallocate(self, ptr);
        Some(new_ptr)
    }
}

unsafe impl<T, H, E> CAllocUsableSize for GuardedAlloc<T, H, E>
where
    T: CAllocUsableSize,
    H: CorruptionHandler,
    E: Entropy,
{
    unsafe fn allocation_usable_size(&self, ptr: NonNull<u8>) -> usize {
        match self.guard.get_size(ptr.as_ptr()) {
            Ok(size) => size,
            Err(_) => self.alloc.allocation_usable_size(ptr),
        }
    }
}
