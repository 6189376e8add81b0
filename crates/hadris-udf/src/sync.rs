//! Lock type aliases.
//!
//! The concurrency model in spec (strict lock-ordering across Vcb / Fcb /
//! paging-I/O / directory-index / bitmap / cache) is expressed with plain
//! reader/writer locks and mutexes. Under `std` these are the real blocking
//! primitives (a thread that would need to sleep actually sleeps); when this
//! crate is built `no_std` the `spin` busy-wait equivalents from
//! [`spin`] stand in, matching how `hadris-common`/`hadris-io` pick between
//! `std` and `spin`-backed primitives based on the `std` feature.

#[cfg(feature = "std")]
pub use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(not(feature = "std"))]
pub use spin::{Mutex, MutexGuard, RwLock};
#[cfg(not(feature = "std"))]
pub type RwLockReadGuard<'a, T> = spin::RwLockReadGuard<'a, T>;
#[cfg(not(feature = "std"))]
pub type RwLockWriteGuard<'a, T> = spin::RwLockWriteGuard<'a, T>;
