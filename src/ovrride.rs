//! The process-wide guarded heap and its C entry points.
use core::{
    alloc::{GlobalAlloc, Layout},
    ffi::c_void,
    mem::MaybeUninit,
    pin::Pin,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU8, Ordering},
};

use rlsf::CAlloc;

use crate::{
    config::{GuardConfig, DEFAULT_HEAP_SIZE},
    guard::HeapGuard,
    guarded::{CAllocUsableSize, GuardedAlloc},
    handler::CorruptionCallback,
    heap::{HeapRef, HeapStats, RegionHeap},
    layout::{Requester, HEADER_ALIGN},
};

const STATUS_OK: i32 = 0;
const STATUS_ERROR: i32 = -1;

/// Alignment of blocks handed out through the C entry points
/// (`alignof(max_align_t)`).
pub const MALLOC_ALIGN: usize = 16;

const _: () = assert!(MALLOC_ALIGN <= HEADER_ALIGN);

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

static HEAP: RegionHeap = RegionHeap::INIT;

static ALLOC: GuardedAlloc<HeapRef<'static>> =
    GuardedAlloc::new(HeapRef::from_static(&HEAP), HeapGuard::new());

static mut DEFAULT_REGION: [MaybeUninit<u8>; DEFAULT_HEAP_SIZE] =
    [MaybeUninit::uninit(); DEFAULT_HEAP_SIZE];

/// A memory region for [`heapguard_define_heap_regions`].
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HeapRegion {
    pub start: *mut u8,
    pub size: usize,
}

/// The process-wide guarded heap.
#[inline]
pub fn global() -> &'static GuardedAlloc<HeapRef<'static>> {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        init_slow();
    }
    &ALLOC
}

#[cold]
#[inline(never)]
fn init_slow() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    let config = unsafe { GuardConfig::from_env() };
    ALLOC.guard().set_threshold(config.threshold);

    let heap = Pin::static_ref(&HEAP);
    if heap.stats().regions == 0 {
        // Safety: reached once, guarded by `INIT_STATE`
        let region = unsafe { &mut *ptr::addr_of_mut!(DEFAULT_REGION) };
        heap.add_region(region);
    }

    INIT_STATE.store(READY, Ordering::Release);
}

#[inline]
fn malloc_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, MALLOC_ALIGN).ok()
}

/// Add the regions of a table terminated by an entry with a null `start`.
/// Returns the number of regions added; regions too small to hold a block are
/// skipped.
///
/// Call before the first allocation to keep the built-in region out of the
/// heap.
///
/// # Safety
///
/// Every region must be valid for reads and writes, not overlap any other
/// memory in use, and never be touched again by the caller.
#[no_mangle]
pub unsafe extern "C" fn heapguard_define_heap_regions(regions: *const HeapRegion) -> usize {
    if regions.is_null() {
        return 0;
    }
    let heap = Pin::static_ref(&HEAP);
    let (mut count, mut added) = (0, 0);
    loop {
        let region = regions.add(count).read();
        if region.start.is_null() {
            break;
        }
        let memory = core::slice::from_raw_parts_mut(region.start.cast(), region.size);
        if heap.add_region(memory).is_some() {
            added += 1;
        }
        count += 1;
    }
    added
}

#[no_mangle]
pub unsafe extern "C" fn heapguard_malloc(size: usize) -> *mut c_void {
    match malloc_layout(size) {
        Some(layout) => global()
            .allocate_for(layout, Requester::UNKNOWN)
            .map_or(ptr::null_mut(), |p| p.as_ptr().cast()),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn heapguard_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return ptr::null_mut();
    };
    let ptr = heapguard_malloc(total);
    if !ptr.is_null() {
        ptr::write_bytes(ptr.cast::<u8>(), 0, total);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn heapguard_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(old) = NonNull::new(ptr.cast::<u8>()) else {
        return heapguard_malloc(size);
    };
    if size == 0 {
        heapguard_free(ptr);
        return ptr::null_mut();
    }
    match malloc_layout(size) {
        Some(layout) => CAlloc::reallocate(global(), old, layout)
            .map_or(ptr::null_mut(), |p| p.as_ptr().cast()),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn heapguard_free(ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
        CAlloc::deallocate(global(), ptr);
    }
}

#[no_mangle]
pub unsafe extern "C" fn heapguard_usable_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr.cast::<u8>()) {
        Some(ptr) => global().allocation_usable_size(ptr),
        None => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn heapguard_is_guarded(ptr: *mut c_void) -> bool {
    global().guard().is_guarded(ptr.cast())
}

/// Store the requested size of the guarded block at `ptr` into `*size`.
#[no_mangle]
pub unsafe extern "C" fn heapguard_get_size(ptr: *mut c_void, size: *mut usize) -> i32 {
    if size.is_null() {
        return STATUS_ERROR;
    }
    match global().guard().get_size(ptr.cast()) {
        Ok(value) => {
            size.write(value);
            STATUS_OK
        }
        Err(_) => STATUS_ERROR,
    }
}

/// Register `cb` to run, with `ctx`, before the process is halted over a
/// damaged block. A null `cb` removes it.
#[no_mangle]
pub extern "C" fn heapguard_register_cb(
    cb: Option<CorruptionCallback>,
    ctx: *mut c_void,
) -> i32 {
    ALLOC.guard().handler().register_callback(cb, ctx);
    STATUS_OK
}

#[no_mangle]
pub extern "C" fn heapguard_low_water_mark(reset: bool) -> usize {
    global().inner().get().low_water_mark(reset)
}

#[no_mangle]
pub unsafe extern "C" fn heapguard_get_heap_stats(stats: *mut HeapStats) {
    if !stats.is_null() {
        stats.write(global().inner().get().stats());
    }
}

/// A zero-sized [`GlobalAlloc`] backed by the process-wide guarded heap.
///
/// ```rust,ignore
/// #[global_allocator]
/// static GLOBAL: heapguard::GuardedGlobal = heapguard::GuardedGlobal;
/// ```
pub struct GuardedGlobal;

unsafe impl GlobalAlloc for GuardedGlobal {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        global()
            .allocate_for(layout, Requester::UNKNOWN)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            CAlloc::deallocate(global(), ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        match NonNull::new(ptr) {
            Some(ptr) => CAlloc::reallocate(global(), ptr, new_layout)
                .map_or(ptr::null_mut(), NonNull::as_ptr),
            None => self.alloc(new_layout),
        }
    }
}

#[cfg(feature = "override")]
mod libc_override {
    use super::*;

    #[no_mangle]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        heapguard_malloc(size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        heapguard_calloc(nmemb, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        heapguard_realloc(ptr, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        heapguard_free(ptr)
    }

    #[no_mangle]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        heapguard_usable_size(ptr)
    }
}
