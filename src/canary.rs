//! The canary value shared by every guarded block of a heap.
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::layout::{footer_word, Addr, NUM_CANARIES};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// Lifecycle of a [`CanaryCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanaryState {
    Uninitialized,
    /// The canary is being derived. Nothing may use it yet.
    Initializing,
    Initialized,
}

/// A canary word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Canary(u32);

impl Canary {
    /// Mix a random value with an address. A zero result is inverted so a
    /// zero-filling overrun can never reproduce the canary.
    #[inline]
    pub const fn derive(random: u32, addr: Addr) -> Self {
        let value = random ^ addr.fold32();
        Self(if value == 0 { !value } else { value })
    }

    #[inline]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Source of the random half of the canary.
pub trait Entropy {
    fn next_u32(&self) -> u32;
}

/// `rand(3)`: a linear congruential generator. Not a CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcRand;

impl Entropy for LibcRand {
    #[inline]
    fn next_u32(&self) -> u32 {
        unsafe { libc::rand() as u32 }
    }
}

/// One-time, lazily derived canary.
///
/// The state moves `Uninitialized -> Initializing -> Initialized` exactly
/// once. A caller that observes `Initializing` (a reentrant call made while
/// the entropy source runs, or a thread losing the first-use race) gets
/// `None` and must leave its allocation unguarded.
#[derive(Debug)]
pub struct CanaryCell {
    state: AtomicU8,
    value: AtomicU32,
}

impl CanaryCell {
    pub const INIT: Self = Self::new();

    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> CanaryState {
        match self.state.load(Ordering::Acquire) {
            UNINIT => CanaryState::Uninitialized,
            INITIALIZING => CanaryState::Initializing,
            _ => CanaryState::Initialized,
        }
    }

    /// The canary, if it has been derived.
    #[inline]
    pub fn get(&self) -> Option<Canary> {
        if self.state.load(Ordering::Acquire) == READY {
            Some(Canary(self.value.load(Ordering::Relaxed)))
        } else {
            None
        }
    }

    /// Return the canary, deriving it from `entropy` and `addr` on first use.
    pub fn get_or_init(&self, addr: Addr, entropy: &impl Entropy) -> Option<Canary> {
        if let Some(canary) = self.get() {
            return Some(canary);
        }
        self.init_slow(addr, entropy)
    }

    #[cold]
    fn init_slow(&self, addr: Addr, entropy: &impl Entropy) -> Option<Canary> {
        match self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(INITIALIZING) => return None,
            Err(_) => return self.get(),
        }

        // The entropy source may allocate and land back in here
        let canary = Canary::derive(entropy.next_u32(), addr);
        self.value.store(canary.0, Ordering::Relaxed);
        self.state.store(READY, Ordering::Release);
        Some(canary)
    }

    /// Fix the canary to `canary` instead of deriving it.
    ///
    /// Fails (returning the current state) unless the cell is still
    /// uninitialized.
    pub fn force_init(&self, canary: Canary) -> Result<(), CanaryState> {
        match self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.value.store(canary.0, Ordering::Relaxed);
                self.state.store(READY, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(self.state()),
        }
    }
}

impl Default for CanaryCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill the footer of a block with `canary`.
///
/// # Safety
///
/// `GUARD_SIZE` bytes at `user + usable_size` must be writable.
#[inline]
pub unsafe fn write_footer(user: *mut u8, usable_size: usize, canary: Canary) {
    for i in 0..NUM_CANARIES {
        footer_word(user, usable_size, i).write_unaligned(canary.0);
    }
}

/// Find the first footer word that no longer holds `canary`.
///
/// Returns the byte offset from `user` and the value found there.
///
/// # Safety
///
/// `GUARD_SIZE` bytes at `user + usable_size` must be readable.
#[inline]
pub unsafe fn check_footer(
    user: *mut u8,
    usable_size: usize,
    canary: Canary,
) -> Option<(usize, u32)> {
    for i in 0..NUM_CANARIES {
        let word = footer_word(user, usable_size, i);
        let found = word.read_unaligned();
        if found != canary.0 {
            return Some((word as usize - user as usize, found));
        }
    }
    None
}
