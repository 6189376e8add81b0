//! File Identifier Descriptor (ECMA-167 §14.4): one directory entry, tagged,
//! 4-byte aligned, and variable-length (fixed header + implementation use +
//! file identifier, padded to a multiple of 4). spec.md §4.F's Directory
//! Index stores these packed end-to-end inside a directory's data extent.

use super::{ad::LongAd, tag::DescriptorTag};
use hadris_common::types::{
    endian::{Endian, LittleEndian},
    number::U16,
};

bitflags::bitflags! {
    /// `FileCharacteristics` (ECMA-167 §14.4.3).
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct FidCharacteristics: u8 {
        /// This FID's FE is hidden from a directory listing by default.
        const HIDDEN = 1 << 0;
        /// This FID names a directory (its ICB is a directory FE).
        const DIRECTORY = 1 << 1;
        /// This FID has been deleted; the directory index keeps the slot
        /// (tombstoned) until `pack_directory` reclaims it (spec.md §4.F).
        const DELETED = 1 << 2;
        /// The ICB this FID names lives in a different partition/File Set
        /// than its parent directory ("parent" bit, also used for `..`).
        const PARENT = 1 << 3;
        /// This FID is one of possibly several naming the same ICB
        /// (hard link metadata bit).
        const METADATA = 1 << 4;
    }
}

/// The fixed-size header of a File Identifier Descriptor; the variable-length
/// implementation-use area and the (possibly absent, for the `..` entry)
/// d-characters file identifier follow immediately in the backing buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FileIdentifierDescriptorHeader {
    pub tag: DescriptorTag,
    pub file_version_number: U16<LittleEndian>,
    pub file_characteristics: FidCharacteristics,
    pub length_of_file_identifier: u8,
    pub icb: LongAd,
    pub length_of_implementation_use: U16<LittleEndian>,
}

impl FileIdentifierDescriptorHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// A decoded directory entry: the fixed header plus its owned identifier
/// string and implementation-use bytes. This is the in-memory form the
/// Directory Index hands back from `find`/iteration; [`Self::encoded_len`]
/// gives the 4-byte-aligned on-disk size before it is re-packed.
#[derive(Debug, Clone)]
pub struct FileIdentifierDescriptor {
    pub file_version_number: u16,
    pub file_characteristics: FidCharacteristics,
    pub icb: LongAd,
    #[cfg(feature = "alloc")]
    pub implementation_use: alloc::vec::Vec<u8>,
    #[cfg(feature = "alloc")]
    pub file_identifier: alloc::string::String,
}

impl FileIdentifierDescriptor {
    /// Total on-disk size, header + implementation use + identifier bytes,
    /// rounded up to a multiple of 4 (ECMA-167 §14.4, "padding" field).
    #[cfg(feature = "alloc")]
    pub fn encoded_len(&self) -> usize {
        let id_bytes = if self.file_identifier.is_empty() {
            0
        } else {
            1 + super::charspec::encode_dstring(&self.file_identifier).len() - 1
        };
        let raw = FileIdentifierDescriptorHeader::SIZE + self.implementation_use.len() + id_bytes;
        raw.div_ceil(4) * 4
    }

    pub fn is_deleted(&self) -> bool {
        self.file_characteristics.contains(FidCharacteristics::DELETED)
    }

    pub fn is_directory(&self) -> bool {
        self.file_characteristics.contains(FidCharacteristics::DIRECTORY)
    }

    pub fn is_parent(&self) -> bool {
        self.file_characteristics.contains(FidCharacteristics::PARENT)
    }
}

#[cfg(all(test, feature = "alloc"))]
mod tests {
    use super::*;
    use crate::descriptors::ad::RunState;

    #[test]
    fn encoded_len_is_4_byte_aligned() {
        let fid = FileIdentifierDescriptor {
            file_version_number: 1,
            file_characteristics: FidCharacteristics::empty(),
            icb: LongAd::new(RunState::Recorded, 2048, 5, 0),
            implementation_use: alloc::vec::Vec::new(),
            file_identifier: "readme.txt".into(),
        };
        assert_eq!(fid.encoded_len() % 4, 0);
    }

    #[test]
    fn parent_entry_has_empty_identifier() {
        let fid = FileIdentifierDescriptor {
            file_version_number: 1,
            file_characteristics: FidCharacteristics::PARENT | FidCharacteristics::DIRECTORY,
            icb: LongAd::new(RunState::Recorded, 2048, 0, 0),
            implementation_use: alloc::vec::Vec::new(),
            file_identifier: alloc::string::String::new(),
        };
        assert!(fid.is_parent());
        assert!(fid.is_directory());
        assert_eq!(fid.encoded_len(), FileIdentifierDescriptorHeader::SIZE.div_ceil(4) * 4);
    }
}
