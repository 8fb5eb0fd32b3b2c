//! A TLSF heap assembled from caller-supplied memory regions, in the manner
//! of an RTOS heap that spans several banks of RAM.
//!
//! Every block handed out is preceded by a [`BlockLink`] recording how far
//! the block start lies in front of the user pointer and how many bytes were
//! requested. The link is as large as a guard header, and its first word,
//! which overlaps a header's magic, is always zero. The guard layer sits on
//! top of this; nothing here protects the link itself.
use core::{
    alloc::Layout,
    cell::UnsafeCell,
    marker::PhantomPinned,
    mem::{self, MaybeUninit},
    num::NonZeroUsize,
    ops,
    pin::Pin,
    ptr::{self, NonNull},
};

use rlsf::{CAlloc, Tlsf};

use crate::{guarded::CAllocUsableSize, layout::HEADER_SIZE};

type Pool = Tlsf<'static, u32, u16, 24, 16>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
struct BlockLink {
    /// Always zero. A block passed through the guard untagged can then never
    /// read leftover data as a header magic.
    tag: u32,
    margin: usize,
    size: usize,
}

impl BlockLink {
    #[inline]
    const fn new(margin: usize, size: usize) -> Self {
        Self {
            tag: 0,
            margin,
            size,
        }
    }
}

const LINK_SIZE: usize = mem::size_of::<BlockLink>();

const _: () = assert!(LINK_SIZE.is_power_of_two());
const _: () = assert!(LINK_SIZE == HEADER_SIZE);

/// Usage figures of a [`RegionHeap`]. Byte counts cover the block links but
/// not the TLSF bookkeeping, so they are approximate.
///
/// Unlike an RTOS `HeapStats_t` there is no largest or smallest free block
/// and no free block count: the TLSF pool does not expose a walk over its
/// free lists.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HeapStats {
    pub total_heap_bytes: usize,
    pub available_heap_bytes: usize,
    pub minimum_ever_free_bytes: usize,
    pub successful_allocations: usize,
    pub successful_frees: usize,
    pub regions: usize,
}

struct HeapState {
    pool: Pool,
    stats: HeapStats,
}

// The pool only refers to `'static` regions handed over for good
unsafe impl Send for HeapState {}

impl HeapState {
    fn note_allocated(&mut self, bytes: usize) {
        let stats = &mut self.stats;
        stats.available_heap_bytes = stats.available_heap_bytes.saturating_sub(bytes);
        stats.minimum_ever_free_bytes = stats
            .minimum_ever_free_bytes
            .min(stats.available_heap_bytes);
        stats.successful_allocations += 1;
    }

    fn note_freed(&mut self, bytes: usize) {
        let stats = &mut self.stats;
        stats.available_heap_bytes =
            (stats.available_heap_bytes + bytes).min(stats.total_heap_bytes);
        stats.successful_frees += 1;
    }
}

#[pin_project::pin_project]
pub struct RegionHeap {
    #[pin]
    state: Mutex<HeapState>,
}

#[inline]
fn outer_layout_and_margin(layout: Layout) -> Option<(Layout, usize)> {
    let margin = LINK_SIZE.max(layout.align());
    let outer_size = layout.size().checked_add(margin)?;
    let outer_layout = Layout::from_size_align(outer_size, margin).ok()?;
    Some((outer_layout, margin))
}

/// Read the link in front of `ptr`.
///
/// # Safety
///
/// `ptr` must have been returned by a [`RegionHeap`].
unsafe fn read_link(ptr: NonNull<u8>) -> Result<BlockLink, &'static str> {
    if ptr.as_ptr() as usize % mem::align_of::<BlockLink>() != 0 {
        return Err("misaligned");
    }
    let link = ptr.as_ptr().cast::<BlockLink>().wrapping_sub(1).read();
    if link.tag != 0
        || !link.margin.is_power_of_two()
        || link.margin < LINK_SIZE
        || ptr.as_ptr() as usize % link.margin != 0
        || link.size.checked_add(link.margin).is_none()
    {
        return Err("block link corrupted");
    }
    Ok(link)
}

impl RegionHeap {
    pub const INIT: Self = Self {
        state: Mutex::new(HeapState {
            pool: Pool::INIT,
            stats: HeapStats {
                total_heap_bytes: 0,
                available_heap_bytes: 0,
                minimum_ever_free_bytes: usize::MAX,
                successful_allocations: 0,
                successful_frees: 0,
                regions: 0,
            },
        }),
    };

    /// Hand a region of memory over to the heap for good.
    ///
    /// Returns the number of bytes the pool took over, which can be less than
    /// the region's length after alignment. A region too small to hold a
    /// block is rejected and `None` is returned.
    pub fn add_region(
        self: Pin<&Self>,
        region: &'static mut [MaybeUninit<u8>],
    ) -> Option<NonZeroUsize> {
        let len = region.len();
        let block = NonNull::slice_from_raw_parts(NonNull::from(region).cast::<u8>(), len);
        let mut state = self.project_ref().state.lock();
        // Safety: `region` is borrowed for `'static` and never handed out again
        let Some(added) = (unsafe { state.pool.insert_free_block_ptr(block) }) else {
            drop(state);
            warn!("ignoring a heap region of {len} bytes: too small");
            return None;
        };

        let stats = &mut state.stats;
        stats.total_heap_bytes += added.get();
        stats.available_heap_bytes += added.get();
        if stats.regions == 0 {
            stats.minimum_ever_free_bytes = stats.available_heap_bytes;
        }
        stats.regions += 1;
        Some(added)
    }

    pub fn stats(self: Pin<&Self>) -> HeapStats {
        let mut stats = self.project_ref().state.lock().stats;
        if stats.regions == 0 {
            stats.minimum_ever_free_bytes = 0;
        }
        stats
    }

    /// The lowest free byte count observed so far. With `reset`, the mark
    /// restarts from the current free byte count.
    pub fn low_water_mark(self: Pin<&Self>, reset: bool) -> usize {
        let mut state = self.project_ref().state.lock();
        let stats = &mut state.stats;
        let previous = stats.minimum_ever_free_bytes;
        if reset {
            stats.minimum_ever_free_bytes = stats.available_heap_bytes;
        }
        previous
    }

    pub fn allocate(self: Pin<&Self>, layout: Layout) -> Option<NonNull<u8>> {
        let (outer_layout, margin) = outer_layout_and_margin(layout)?;

        let mut state = self.project_ref().state.lock();
        let outer_ptr = state.pool.allocate(outer_layout)?;
        state.note_allocated(outer_layout.size());
        drop(state);

        unsafe {
            let user_ptr = outer_ptr.as_ptr().add(margin);
            user_ptr
                .cast::<BlockLink>()
                .sub(1)
                .write(BlockLink::new(margin, layout.size()));
            Some(NonNull::new_unchecked(user_ptr))
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub unsafe fn deallocate(self: Pin<&Self>, ptr: NonNull<u8>) {
        let link = match read_link(ptr) {
            Ok(link) => link,
            Err(e) => {
                warn!("ignoring the deallocation request for {ptr:p}: {e}");
                return;
            }
        };
        let outer_ptr = NonNull::new_unchecked(ptr.as_ptr().sub(link.margin));

        let mut state = self.project_ref().state.lock();
        state.pool.deallocate(outer_ptr, link.margin);
        state.note_freed(link.size + link.margin);
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub unsafe fn reallocate(
        self: Pin<&Self>,
        ptr: NonNull<u8>,
        new_layout: Layout,
    ) -> Option<NonNull<u8>> {
        let link = match read_link(ptr) {
            Ok(link) => link,
            Err(e) => {
                warn!("rejecting the reallocation request for {ptr:p}: {e}");
                return None;
            }
        };
        let new_ptr = self.allocate(new_layout)?;
        ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_ptr.as_ptr(),
            link.size.min(new_layout.size()),
        );
        self.deallocate(ptr);
        Some(new_ptr)
    }

    /// The size requested for the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub unsafe fn usable_size(self: Pin<&Self>, ptr: NonNull<u8>) -> Option<usize> {
        match read_link(ptr) {
            Ok(link) => Some(link.size),
            Err(e) => {
                warn!("rejecting the size query for {ptr:p}: {e}");
                None
            }
        }
    }
}

/// A shared handle to a pinned [`RegionHeap`], usable as a [`CAlloc`].
#[derive(Clone, Copy)]
pub struct HeapRef<'a>(&'a RegionHeap);

impl<'a> HeapRef<'a> {
    pub fn new(heap: Pin<&'a RegionHeap>) -> Self {
        Self(heap.get_ref())
    }

    #[inline]
    pub fn get(self) -> Pin<&'a RegionHeap> {
        // Safety: only ever built from a pinned or `'static` reference
        unsafe { Pin::new_unchecked(self.0) }
    }
}

impl HeapRef<'static> {
    /// A heap in a `static` never moves.
    pub const fn from_static(heap: &'static RegionHeap) -> Self {
        Self(heap)
    }
}

unsafe impl CAlloc for HeapRef<'_> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.get().allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.get().deallocate(ptr)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, new_layout: Layout) -> Option<NonNull<u8>> {
        self.get().reallocate(ptr, new_layout)
    }
}

unsafe impl CAllocUsableSize for HeapRef<'_> {
    unsafe fn allocation_usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.get().usable_size(ptr).unwrap_or(0)
    }
}

/// A `pthread` mutex that must stay put once used.
struct Mutex<T> {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    inner: UnsafeCell<T>,
    _unpin: PhantomPinned,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        // Nobody can hold a guard while we have `&mut self`
        unsafe { libc::pthread_mutex_destroy(self.mutex.get()) };
    }
}

impl<T> Mutex<T> {
    const fn new(inner: T) -> Self {
        Self {
            mutex: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
            inner: UnsafeCell::new(inner),
            _unpin: PhantomPinned,
        }
    }

    #[inline]
    fn lock(self: Pin<&Self>) -> impl ops::DerefMut<Target = T> + '_ {
        struct Guard<'a, T>(&'a Mutex<T>);

        impl<T> Drop for Guard<'_, T> {
            #[inline]
            fn drop(&mut self) {
                unsafe { libc::pthread_mutex_unlock(self.0.mutex.get()) };
            }
        }

        impl<T> ops::Deref for Guard<'_, T> {
            type Target = T;

            #[inline]
            fn deref(&self) -> &Self::Target {
                unsafe { &*self.0.inner.get() }
            }
        }

        impl<T> ops::DerefMut for Guard<'_, T> {
            #[inline]
            fn deref_mut(&mut self) -> &mut Self::Target {
                unsafe { &mut *self.0.inner.get() }
            }
        }

        unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        Guard(self.get_ref())
    }
}
