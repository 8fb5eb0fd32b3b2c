#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod logger;
pub mod canary;
pub mod config;
mod error;
pub mod guard;
pub mod guarded;
pub mod handler;
pub mod heap;
pub mod layout;
pub mod ovrride;

pub use canary::{Canary, CanaryState, Entropy, LibcRand};
pub use config::GuardConfig;
pub use error::GuardError;
pub use guard::{GuardStats, HeapGuard};
pub use guarded::{CAllocUsableSize, GuardedAlloc};
pub use handler::{AbortOnCorruption, CorruptionCallback, CorruptionHandler, CorruptionReport};
pub use heap::{HeapRef, HeapStats, RegionHeap};
pub use layout::{
    Requester, GUARD_SIZE, GUARD_THRESHOLD, HEADER_ALIGN, HEADER_SIZE, MAGIC, NUM_CANARIES,
};
pub use ovrride::GuardedGlobal;
pub use rlsf::CAlloc;
