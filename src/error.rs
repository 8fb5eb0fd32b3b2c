/// Outcome of a guard query or hook that did not yield a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    /// Null, or too close to the start of the address space to have a header
    /// in front of it.
    #[error("pointer cannot carry a guard header")]
    InvalidPointer,
    /// The block carries no guard header (e.g. it was below the threshold).
    #[error("allocation is not guarded")]
    NotGuarded,
    /// The request cannot be inflated by the guard overhead without wrapping.
    #[error("size {0} cannot be inflated by the guard overhead")]
    SizeOverflow(usize),
    /// A footer canary word no longer matches the canary.
    #[error("footer canary at offset {offset} is {found:#010x}, expected {expected:#010x}")]
    Corrupted {
        /// Byte offset of the damaged word from the user pointer
        offset: usize,
        expected: u32,
        found: u32,
    },
}
