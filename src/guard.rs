//! The allocation hooks and the introspection queries built on the guard
//! header.
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    canary::{check_footer, write_footer, Canary, CanaryCell, CanaryState, Entropy, LibcRand},
    handler::{AbortOnCorruption, CorruptionHandler, CorruptionReport},
    layout::{
        header_slot, read_header, Addr, GuardHeader, Requester, GUARD_SIZE, GUARD_THRESHOLD,
        HEADER_SIZE,
    },
    GuardError,
};

/// Canary guard for one heap.
///
/// The underlying allocator calls [`pre_alloc_hook`](Self::pre_alloc_hook)
/// before requesting memory, [`post_alloc_hook`](Self::post_alloc_hook) once
/// it has memory, and [`release_hook`](Self::release_hook) before reclaiming
/// it.
#[derive(Debug)]
pub struct HeapGuard<H = AbortOnCorruption, E = LibcRand> {
    canary: CanaryCell,
    threshold: AtomicUsize,
    handler: H,
    entropy: E,
    stats: Counters,
}

#[derive(Debug)]
struct Counters {
    guarded: AtomicUsize,
    unguarded: AtomicUsize,
    skipped: AtomicUsize,
    released: AtomicUsize,
    corrupted: AtomicUsize,
}

/// A snapshot of a [`HeapGuard`]'s activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuardStats {
    /// Blocks that were tagged
    pub guarded_allocations: usize,
    /// Requests below the threshold, passed through at their own size
    pub unguarded_allocations: usize,
    /// Blocks left untagged because the canary was still being derived
    pub skipped_allocations: usize,
    /// Guarded blocks whose footer was intact at release
    pub validated_releases: usize,
    pub corruptions: usize,
}

impl HeapGuard {
    pub const fn new() -> Self {
        Self::with_parts(AbortOnCorruption::new(), LibcRand)
    }
}

impl Default for HeapGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, E> HeapGuard<H, E> {
    pub const fn with_parts(handler: H, entropy: E) -> Self {
        Self {
            canary: CanaryCell::new(),
            threshold: AtomicUsize::new(GUARD_THRESHOLD),
            handler,
            entropy,
            stats: Counters {
                guarded: AtomicUsize::new(0),
                unguarded: AtomicUsize::new(0),
                skipped: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                corrupted: AtomicUsize::new(0),
            },
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Minimum size an allocation must have to be guarded.
    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    /// `usize::MAX` disables guarding for every new allocation. Blocks that
    /// are already guarded keep their header and are still validated.
    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn canary_state(&self) -> CanaryState {
        self.canary.state()
    }

    /// Use `canary` instead of deriving one. Only possible before the first
    /// guarded allocation.
    pub fn force_canary(&self, canary: Canary) -> Result<(), CanaryState> {
        self.canary.force_init(canary)
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            guarded_allocations: self.stats.guarded.load(Ordering::Relaxed),
            unguarded_allocations: self.stats.unguarded.load(Ordering::Relaxed),
            skipped_allocations: self.stats.skipped.load(Ordering::Relaxed),
            validated_releases: self.stats.released.load(Ordering::Relaxed),
            corruptions: self.stats.corrupted.load(Ordering::Relaxed),
        }
    }

    /// The number of bytes to request from the underlying allocator for a
    /// `size`-byte allocation. Requests left at their own size are counted as
    /// unguarded allocations.
    pub fn plan(&self, size: usize) -> Result<usize, GuardError> {
        if size < self.threshold() {
            self.stats.unguarded.fetch_add(1, Ordering::Relaxed);
            return Ok(size);
        }
        if size >= usize::MAX - HEADER_SIZE - GUARD_SIZE {
            return Err(GuardError::SizeOverflow(size));
        }
        Ok(HEADER_SIZE + size + GUARD_SIZE)
    }

    /// Like [`plan`](Self::plan), but a request that cannot be inflated is
    /// fatal.
    ///
    /// A result different from `size` means the block must go through
    /// [`post_alloc_hook`](Self::post_alloc_hook).
    #[track_caller]
    pub fn pre_alloc_hook(&self, size: usize) -> usize {
        match self.plan(size) {
            Ok(planned) => planned,
            Err(e) => panic!("{e}"),
        }
    }

    /// Whether `ptr` carries a guard header.
    ///
    /// # Safety
    ///
    /// If `ptr` is not null, `HEADER_SIZE` bytes in front of it must be
    /// readable.
    pub unsafe fn is_guarded(&self, ptr: *mut u8) -> bool {
        read_header(ptr).is_ok()
    }

    /// The size originally requested for the guarded block at `ptr`.
    ///
    /// # Safety
    ///
    /// See [`is_guarded`](Self::is_guarded).
    pub unsafe fn get_size(&self, ptr: *mut u8) -> Result<usize, GuardError> {
        read_header(ptr).map(|header| header.usable_size)
    }

    /// The call site that allocated the guarded block at `ptr`.
    ///
    /// # Safety
    ///
    /// See [`is_guarded`](Self::is_guarded).
    pub unsafe fn requester(&self, ptr: *mut u8) -> Result<Requester, GuardError> {
        read_header(ptr).map(|header| header.requester)
    }

    /// Check the footer of a live guarded block without releasing it.
    ///
    /// Never calls the corruption handler.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block handed out through this guard, or an
    /// unguarded pointer satisfying [`is_guarded`](Self::is_guarded).
    pub unsafe fn verify(&self, ptr: *mut u8) -> Result<(), GuardError> {
        let header = read_header(ptr)?;
        let canary = self.canary.get().ok_or(GuardError::NotGuarded)?;
        match check_footer(ptr, header.usable_size, canary) {
            None => Ok(()),
            Some((offset, found)) => Err(GuardError::Corrupted {
                offset,
                expected: canary.get(),
                found,
            }),
        }
    }
}

impl<H: CorruptionHandler, E: Entropy> HeapGuard<H, E> {
    /// Tag a freshly allocated block and return the pointer to hand out.
    ///
    /// While the canary is being derived (the entropy source allocated
    /// through this guard) the block is returned untagged.
    ///
    /// # Safety
    ///
    /// `raw` must point to at least `pre_alloc_hook(size)` writable bytes and
    /// `pre_alloc_hook(size)` must have differed from `size`.
    pub unsafe fn post_alloc_hook(
        &self,
        raw: NonNull<u8>,
        size: usize,
        requester: Requester,
    ) -> NonNull<u8> {
        let Some(canary) = self.canary.get_or_init(Addr::of(raw.as_ptr()), &self.entropy) else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return raw;
        };

        raw.as_ptr()
            .cast::<GuardHeader>()
            .write_unaligned(GuardHeader::new(requester, size));
        let user = raw.as_ptr().add(HEADER_SIZE);
        write_footer(user, size, canary);

        self.stats.guarded.fetch_add(1, Ordering::Relaxed);
        NonNull::new_unchecked(user)
    }

    /// Validate a block that is about to be freed and return the pointer the
    /// underlying allocator must reclaim.
    ///
    /// Unguarded blocks come back unchanged. A damaged footer is reported to
    /// the handler; if the handler returns, the block must not be reclaimed.
    ///
    /// # Safety
    ///
    /// `user` must be null, or a live block obtained through this guard's
    /// allocator.
    pub unsafe fn release_hook(&self, user: *mut u8) -> Result<NonNull<u8>, GuardError> {
        let head = header_slot(user)?;
        let header = match read_header(user) {
            Ok(header) => header,
            Err(GuardError::NotGuarded) => return Ok(NonNull::new_unchecked(user)),
            Err(e) => return Err(e),
        };
        let Some(canary) = self.canary.get() else {
            // Only a stray magic can get here; no block was ever tagged
            return Ok(NonNull::new_unchecked(user));
        };

        if let Some((offset, found)) = check_footer(user, header.usable_size, canary) {
            self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
            let report = CorruptionReport {
                user_ptr: user,
                requester: header.requester,
                usable_size: header.usable_size,
                offset,
                expected: canary.get(),
                found,
            };
            self.handler.corruption_detected(&report);
            return Err(GuardError::Corrupted {
                offset,
                expected: canary.get(),
                found,
            });
        }

        // Freed memory must not look guarded
        head.as_ptr().cast::<u32>().write_unaligned(0);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        Ok(head.cast())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MAGIC;
    use core::cell::{Cell, RefCell, UnsafeCell};

    #[derive(Default)]
    struct Recorder {
        reports: RefCell<Vec<CorruptionReport>>,
    }

    impl CorruptionHandler for Recorder {
        fn corruption_detected(&self, report: &CorruptionReport) {
            self.reports.borrow_mut().push(*report);
        }
    }

    struct Fixed(u32);

    impl Entropy for Fixed {
        fn next_u32(&self) -> u32 {
            self.0
        }
    }

    fn recording_guard() -> HeapGuard<Recorder, Fixed> {
        HeapGuard::with_parts(Recorder::default(), Fixed(0x1357_9bdf))
    }

    /// Backing memory for a block of `planned` bytes, with some slack in
    /// front so header lookups on unguarded blocks stay in bounds.
    struct Arena {
        words: Vec<usize>,
    }

    const SLACK_WORDS: usize = 8;

    impl Arena {
        fn new(planned: usize) -> Self {
            let words = SLACK_WORDS + planned / core::mem::size_of::<usize>() + 2;
            Self {
                words: vec![0; words],
            }
        }

        fn raw(&mut self) -> NonNull<u8> {
            NonNull::new(self.words[SLACK_WORDS..].as_mut_ptr().cast()).unwrap()
        }

        fn bytes(&self) -> Vec<u8> {
            self.words.iter().flat_map(|w| w.to_ne_bytes()).collect()
        }
    }

    fn allocate<H: CorruptionHandler, E: Entropy>(
        guard: &HeapGuard<H, E>,
        arena: &mut Arena,
        size: usize,
    ) -> *mut u8 {
        let planned = guard.pre_alloc_hook(size);
        if planned == size {
            return arena.raw().as_ptr();
        }
        unsafe { guard.post_alloc_hook(arena.raw(), size, Requester::caller()) }.as_ptr()
    }

    #[test]
    fn small_allocations_are_not_inflated() {
        let guard = recording_guard();
        for size in 0..GUARD_THRESHOLD {
            assert_eq!(guard.pre_alloc_hook(size), size);

            let mut arena = Arena::new(size);
            let user = allocate(&guard, &mut arena, size);
            unsafe {
                assert!(!guard.is_guarded(user));
                assert_eq!(guard.get_size(user), Err(GuardError::NotGuarded));
            }
        }
        assert_eq!(guard.canary_state(), CanaryState::Uninitialized);
    }

    #[test]
    fn planner_counts_unguarded_requests() {
        let guard = recording_guard();
        for size in [0, 1, GUARD_THRESHOLD - 1] {
            assert_eq!(guard.plan(size), Ok(size));
        }
        assert!(guard.plan(GUARD_THRESHOLD).is_ok());
        assert!(guard.plan(usize::MAX).is_err());
        assert_eq!(
            guard.stats(),
            GuardStats {
                unguarded_allocations: 3,
                ..GuardStats::default()
            }
        );

        guard.set_threshold(usize::MAX);
        assert_eq!(guard.plan(4096), Ok(4096));
        assert_eq!(guard.stats().unguarded_allocations, 4);
    }

    #[test]
    fn large_allocations_record_their_size() {
        let guard = recording_guard();
        for size in [GUARD_THRESHOLD, 65, 100, 4096] {
            assert_eq!(guard.pre_alloc_hook(size), size + HEADER_SIZE + GUARD_SIZE);

            let mut arena = Arena::new(guard.pre_alloc_hook(size));
            let raw = arena.raw();
            let user = allocate(&guard, &mut arena, size);
            assert_eq!(user as usize - raw.as_ptr() as usize, HEADER_SIZE);
            unsafe {
                assert!(guard.is_guarded(user));
                assert_eq!(guard.get_size(user), Ok(size));
                assert_eq!(guard.verify(user), Ok(()));
            }
        }
        assert_eq!(guard.stats().guarded_allocations, 4);
    }

    #[test]
    fn introspection_does_not_mutate() {
        let guard = recording_guard();
        let mut arena = Arena::new(guard.pre_alloc_hook(80));
        let user = allocate(&guard, &mut arena, 80);
        let before = arena.bytes();

        for _ in 0..3 {
            unsafe {
                assert!(guard.is_guarded(user));
                assert_eq!(guard.get_size(user), Ok(80));
                assert!(guard.requester(user).is_ok());
            }
        }
        assert_eq!(arena.bytes(), before);
    }

    #[test]
    fn intact_footer_releases_raw_pointer() {
        let guard = recording_guard();
        let mut arena = Arena::new(guard.pre_alloc_hook(64));
        let raw = arena.raw();
        let user = allocate(&guard, &mut arena, 64);

        unsafe { core::ptr::write_bytes(user, 0xcc, 64) };
        assert_eq!(unsafe { guard.release_hook(user) }, Ok(raw));
        assert!(guard.handler().reports.borrow().is_empty());
        assert_eq!(guard.stats().validated_releases, 1);

        // The header does not outlive the block
        assert!(!unsafe { guard.is_guarded(user) });
    }

    #[test]
    fn footer_overwrite_is_reported() {
        let guard = recording_guard();
        let mut arena = Arena::new(guard.pre_alloc_hook(64));
        let user = allocate(&guard, &mut arena, 64);
        let requester = unsafe { guard.requester(user) }.unwrap();

        let canary = guard.canary.get().unwrap().get();
        let first = canary.to_ne_bytes()[0];
        unsafe { user.add(64).write(!first) };

        let result = unsafe { guard.release_hook(user) };
        assert!(matches!(
            result,
            Err(GuardError::Corrupted { offset: 64, expected, .. }) if expected == canary
        ));

        let reports = guard.handler().reports.borrow();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].user_ptr, user);
        assert_eq!(reports[0].usable_size, 64);
        assert_eq!(reports[0].requester, requester);
        assert_ne!(reports[0].found, canary);
        // The handler ran before anything touched the header
        assert!(unsafe { guard.is_guarded(user) });
        assert_eq!(guard.stats().corruptions, 1);
    }

    #[test]
    fn verify_reports_without_handler() {
        let guard = recording_guard();
        let mut arena = Arena::new(guard.pre_alloc_hook(70));
        let user = allocate(&guard, &mut arena, 70);
        unsafe { *user.add(72) ^= 0xff };
        assert!(matches!(
            unsafe { guard.verify(user) },
            Err(GuardError::Corrupted { offset: 70, .. })
        ));
        assert!(guard.handler().reports.borrow().is_empty());
    }

    #[test]
    fn unguarded_and_invalid_pointers_pass_through() {
        let guard = recording_guard();
        assert_eq!(
            unsafe { guard.release_hook(core::ptr::null_mut()) },
            Err(GuardError::InvalidPointer)
        );
        assert_eq!(
            unsafe { guard.get_size(core::ptr::null_mut()) },
            Err(GuardError::InvalidPointer)
        );
        assert!(!unsafe { guard.is_guarded(core::ptr::null_mut()) });

        let mut arena = Arena::new(16);
        let user = allocate(&guard, &mut arena, 16);
        assert_eq!(unsafe { guard.release_hook(user) }.map(NonNull::as_ptr), Ok(user));
    }

    #[test]
    fn stray_magic_without_canary_is_not_validated() {
        let guard = recording_guard();
        let mut arena = Arena::new(64);
        let raw = arena.raw();
        unsafe { raw.as_ptr().cast::<u32>().write(MAGIC) };
        let user = unsafe { raw.as_ptr().add(HEADER_SIZE) };
        assert_eq!(unsafe { guard.release_hook(user) }.map(NonNull::as_ptr), Ok(user));
        assert!(guard.handler().reports.borrow().is_empty());
    }

    #[test]
    fn overflowing_size_cannot_be_planned() {
        let guard = recording_guard();
        let limit = usize::MAX - HEADER_SIZE - GUARD_SIZE;
        assert_eq!(guard.plan(limit), Err(GuardError::SizeOverflow(limit)));
        assert_eq!(guard.plan(limit - 1), Ok(usize::MAX - 1));
    }

    #[test]
    #[should_panic(expected = "cannot be inflated")]
    fn overflowing_size_is_fatal() {
        recording_guard().pre_alloc_hook(usize::MAX);
    }

    #[test]
    fn threshold_is_adjustable() {
        let guard = recording_guard();
        guard.set_threshold(16);
        assert_eq!(guard.pre_alloc_hook(16), 16 + HEADER_SIZE + GUARD_SIZE);
        guard.set_threshold(usize::MAX);
        assert_eq!(guard.pre_alloc_hook(4096), 4096);
    }

    #[test]
    fn forced_canary_is_used() {
        let guard = recording_guard();
        guard.force_canary(Canary::from_raw(0x0102_0304)).unwrap();
        let mut arena = Arena::new(guard.pre_alloc_hook(64));
        let user = allocate(&guard, &mut arena, 64);
        let footer = unsafe { user.add(64).cast::<u32>().read_unaligned() };
        assert_eq!(footer, 0x0102_0304);
    }

    struct Nested {
        guard: Cell<*const HeapGuard<Recorder, Nested>>,
        block: UnsafeCell<[usize; 32]>,
        result: Cell<Option<*mut u8>>,
    }

    impl Entropy for Nested {
        fn next_u32(&self) -> u32 {
            let guard = unsafe { &*self.guard.get() };
            let raw = NonNull::new(self.block.get().cast::<u8>()).unwrap();
            let user = unsafe { guard.post_alloc_hook(raw, 64, Requester::UNKNOWN) };
            self.result.set(Some(user.as_ptr()));
            0x0bad_f00d
        }
    }

    #[test]
    fn allocation_during_derivation_is_left_untagged() {
        let guard = Box::new(HeapGuard::with_parts(
            Recorder::default(),
            Nested {
                guard: Cell::new(core::ptr::null()),
                block: UnsafeCell::new([0; 32]),
                result: Cell::new(None),
            },
        ));
        guard.entropy.guard.set(&*guard);

        let mut arena = Arena::new(guard.pre_alloc_hook(64));
        let user = allocate(&*guard, &mut arena, 64);

        let nested_raw = guard.entropy.block.get().cast::<u8>();
        assert_eq!(guard.entropy.result.get(), Some(nested_raw));
        assert!(unsafe { guard.is_guarded(user) });
        assert_eq!(guard.canary_state(), CanaryState::Initialized);
        assert_eq!(
            guard.stats(),
            GuardStats {
                guarded_allocations: 1,
                skipped_allocations: 1,
                ..GuardStats::default()
            }
        );
    }
}
