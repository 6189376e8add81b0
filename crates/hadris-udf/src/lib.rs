//! A rust implementation of the UDF (Universal Disk Format, ECMA-167) on-disk
//! format, covering the subsystems that make UDF reads and writes correct and
//! fast: volume layout and partition mapping, the on-disk space allocator,
//! the extent-mapping engine, a write-back block cache, a directory index,
//! and the open-instance (FCB/FileInfo) graph.
//!
//! This crate deliberately does not implement any particular host's I/O
//! dispatch model (IRPs, io_uring, ...); callers provide a type implementing
//! [`hadris_io::Read`] + [`hadris_io::Write`] + [`hadris_io::Seek`] as the
//! backing block device, the same way other image-format crates in this
//! workspace take a generic `T: Read + Write + Seek`.
//!
//! ## Cargo Features
//!
//! - **std**: enables the mounted-volume runtime (geometry, cache, allocator,
//!   extent engine, directory index, open-instance graph). Without it, only
//!   the on-disk descriptor layout types are available.
//! - **alloc**: heap allocation without full `std`.
//! - **read** / **write**: gate parsing vs. formatting support.
//! - **sync** / **async**: select the `hadris-io` I/O trait flavor.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod descriptors;

#[cfg(feature = "std")]
mod sync;

#[cfg(feature = "std")]
pub mod error;
#[cfg(feature = "std")]
pub mod device;
#[cfg(feature = "std")]
pub mod geometry;
#[cfg(feature = "std")]
pub mod cache;
#[cfg(feature = "std")]
pub mod alloc_space;
#[cfg(feature = "std")]
pub mod extent;
#[cfg(feature = "std")]
pub mod directory;
#[cfg(feature = "std")]
pub mod instance;
#[cfg(feature = "std")]
pub mod volume;
#[cfg(feature = "std")]
pub mod ops;
#[cfg(feature = "std")]
pub mod options;

#[cfg(feature = "std")]
pub use error::UdfError;
#[cfg(feature = "std")]
pub use options::MountOptions;
#[cfg(feature = "write")]
pub use options::FormatOptions;
#[cfg(feature = "std")]
pub use volume::Volume;
