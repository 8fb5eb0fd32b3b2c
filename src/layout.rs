//! Guard header layout and the address arithmetic around it.
//!
//! ```text
//! raw                 user                      user + usable_size
//!  │ GuardHeader       │ user data               │ canary words
//!  ▼                   ▼                         ▼
//!  ├───────────────────┼─────────────────────────┼──────────────┤
//!     HEADER_SIZE          usable_size              GUARD_SIZE
//! ```
use core::{mem, panic::Location, ptr::NonNull};

use crate::GuardError;

/// Sentinel marking a guarded block ("HEAP").
pub const MAGIC: u32 = 0x5041_4548;

/// Allocations smaller than this are left unguarded.
pub const GUARD_THRESHOLD: usize = 64;

/// Number of canary bytes following the user region.
pub const GUARD_SIZE: usize = 4;

/// Width of a canary word.
pub const CANARY_WORD: usize = mem::size_of::<u32>();

/// Number of canary words in a footer.
pub const NUM_CANARIES: usize = GUARD_SIZE / CANARY_WORD;

pub const HEADER_SIZE: usize = mem::size_of::<GuardHeader>();

/// Minimum alignment the underlying allocator must provide for a guarded
/// block. The user pointer inherits this alignment, which matches
/// `max_align_t` on the targets `malloc` is replaced on.
pub const HEADER_ALIGN: usize = mem::align_of::<GuardHeader>();

const _: () = assert!(GUARD_SIZE % CANARY_WORD == 0 && NUM_CANARIES > 0);
const _: () = assert!(HEADER_SIZE % HEADER_ALIGN == 0 && HEADER_ALIGN >= 16);

/// Metadata placed immediately in front of a guarded user pointer. Padded so
/// that the user pointer keeps the alignment of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct GuardHeader {
    pub magic: u32,
    pub requester: Requester,
    /// The size the caller asked for, not the inflated request.
    pub usable_size: usize,
}

impl GuardHeader {
    #[inline]
    pub const fn new(requester: Requester, usable_size: usize) -> Self {
        Self {
            magic: MAGIC,
            requester,
            usable_size,
        }
    }
}

/// Identifies the call site that requested an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Requester(usize);

impl Requester {
    pub const UNKNOWN: Self = Self(0);

    /// The caller's source location. `Location`s are `'static`, so their
    /// address identifies a call site.
    #[track_caller]
    #[inline]
    pub fn caller() -> Self {
        let location: &'static Location<'static> = Location::caller();
        Self(location as *const Location<'static> as usize)
    }

    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

/// A native-width address, used to validate pointer arithmetic without
/// truncating casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(usize);

impl Addr {
    #[inline]
    pub fn of<T>(ptr: *const T) -> Self {
        Self(ptr.cast::<u8>() as usize)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn checked_sub(self, offset: usize) -> Option<Self> {
        match self.0.checked_sub(offset) {
            Some(x) => Some(Self(x)),
            None => None,
        }
    }

    /// Fold the whole address into 32 bits.
    #[inline]
    pub const fn fold32(self) -> u32 {
        let wide = self.0 as u64;
        (wide ^ (wide >> 32)) as u32
    }
}

/// Locate the header slot in front of `user`.
///
/// Only the address is checked: the header must start strictly above address
/// zero. Nothing is read.
#[inline]
pub fn header_slot(user: *mut u8) -> Result<NonNull<GuardHeader>, GuardError> {
    match Addr::of(user).checked_sub(HEADER_SIZE) {
        Some(head) if head.get() != 0 => {}
        _ => return Err(GuardError::InvalidPointer),
    }
    NonNull::new(user.wrapping_sub(HEADER_SIZE).cast()).ok_or(GuardError::InvalidPointer)
}

/// Read the header in front of `user`, if it carries the magic.
///
/// # Safety
///
/// `HEADER_SIZE` bytes in front of `user` must be readable.
#[inline]
pub unsafe fn read_header(user: *mut u8) -> Result<GuardHeader, GuardError> {
    let head = header_slot(user)?;
    // `magic` is the first field; read it alone so an unguarded block never
    // has its neighbour's bytes interpreted as a whole header
    if head.as_ptr().cast::<u32>().read_unaligned() != MAGIC {
        return Err(GuardError::NotGuarded);
    }
    Ok(head.as_ptr().read_unaligned())
}

/// Address of the `i`-th footer word of a block with `usable_size` bytes.
#[inline]
pub fn footer_word(user: *mut u8, usable_size: usize, i: usize) -> *mut u32 {
    user.wrapping_add(usable_size)
        .wrapping_add(i * CANARY_WORD)
        .cast()
}
