//! On-disk ECMA-167 / OSTA-UDF structures.
//!
//! Every on-disk layout here is a `#[repr(C)]`/`#[repr(C, packed)]` struct
//! made of little-endian [`hadris_common::types::number`] wrappers so it can
//! be cast directly onto/from the bytes read off the block device with
//! `bytemuck`. In-memory "info" companions (the decoded, native-endian view
//! the rest of the crate works with) live alongside each raw type — a
//! raw/decoded split used elsewhere in this workspace for other on-disk
//! format structures.

pub mod anchor;
pub mod ad;
pub mod charspec;
pub mod file_entry;
pub mod fid;
pub mod fsd;
pub mod lvid;
pub mod regid;
pub mod sparing;
pub mod tag;
pub mod timestamp;
pub mod vds;

pub use ad::{ExtentRun, LongAd, RunState, ShortAd};
pub use anchor::AnchorVolumeDescriptorPointer;
pub use fid::{FidCharacteristics, FileIdentifierDescriptor};
pub use tag::{DescriptorTag, TagIdentifier};
pub use timestamp::UdfTimestamp;
