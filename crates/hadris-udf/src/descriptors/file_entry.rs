//! File Entry and Extended File Entry (ECMA-167 §14.9 / §14.17): the ICB
//! every FCB/Dloc in spec.md §4.G wraps. Carries permissions, timestamps,
//! the file's length, and either inline file data ("in-ICB") or the
//! allocation descriptors the Extent Engine walks.

use super::{regid::EntityId, tag::{DescriptorTag, TagIdentifier}, timestamp::UdfTimestamp};
use hadris_common::types::{
    endian::{Endian, LittleEndian},
    number::{U16, U32, U64},
};

bitflags::bitflags! {
    /// `ICBTag.flags` bits 0-2, "allocation descriptor type"
    /// (ECMA-167 §14.6.8): which AD form `allocationDescriptors` holds.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct AllocDescriptorType: u16 {
        const SHORT_AD = 0;
        const LONG_AD = 1;
        const EXTENDED_AD = 2;
        /// File data is stored directly in the ICB ("in-ICB"); there are no
        /// allocation descriptors at all (spec.md §3 Extent Run "In-ICB").
        const IN_ICB = 3;
    }
}

/// ICB Tag (ECMA-167 §14.6): classifies the ICB (file vs. directory vs.
/// symlink, etc.) and how its allocation descriptors are encoded.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IcbTag {
    pub prior_recorded_number_of_direct_entries: U32<LittleEndian>,
    pub strategy_type: U16<LittleEndian>,
    pub strategy_parameter: U16<LittleEndian>,
    pub number_of_entries: U16<LittleEndian>,
    reserved: u8,
    pub file_type: u8,
    pub parent_icb_location_partition: U16<LittleEndian>,
    pub parent_icb_location_block: U32<LittleEndian>,
    pub flags: U16<LittleEndian>,
}

impl IcbTag {
    /// `fileType` values this crate understands (ECMA-167 §14.6.6); every
    /// other value is treated as an opaque regular file.
    pub const FILE_TYPE_DIRECTORY: u8 = 4;
    pub const FILE_TYPE_REGULAR: u8 = 5;
    pub const FILE_TYPE_SYMLINK: u8 = 12;

    pub fn alloc_descriptor_type(&self) -> AllocDescriptorType {
        AllocDescriptorType::from_bits_truncate(self.flags.get() & 0x7)
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == Self::FILE_TYPE_DIRECTORY
    }
}

bitflags::bitflags! {
    /// `ICBTag.flags` bit 10 and the file permission bits this crate maps
    /// onto a POSIX-flavoured read/write/execute triad (ECMA-167 §14.9.5).
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct FilePermissions: u32 {
        const OTHER_EXECUTE = 1 << 0;
        const OTHER_WRITE = 1 << 1;
        const OTHER_READ = 1 << 2;
        const OTHER_ATTRIBUTES = 1 << 3;
        const GROUP_EXECUTE = 1 << 4;
        const GROUP_WRITE = 1 << 5;
        const GROUP_READ = 1 << 6;
        const GROUP_ATTRIBUTES = 1 << 7;
        const OWNER_EXECUTE = 1 << 8;
        const OWNER_WRITE = 1 << 9;
        const OWNER_READ = 1 << 10;
        const OWNER_ATTRIBUTES = 1 << 11;
        const OWNER_DELETE = 1 << 12;
        const OWNER_CHATTR = 1 << 13;
    }
}

bitflags::bitflags! {
    /// `ICBTag.flags` bit used on the File Entry proper
    /// (ECMA-167 §14.9.13, "File Entry" information control block flags).
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct IcbFlags: u16 {
        const SETUID = 1 << 0;
        const SETGID = 1 << 1;
        const STICKY = 1 << 2;
        /// Contiguous: the allocation descriptors form one contiguous run;
        /// readers may skip extent-by-extent translation.
        const CONTIGUOUS = 1 << 3;
        const SYSTEM = 1 << 4;
        const TRANSFORMED = 1 << 5;
        const MULTI_VERSION = 1 << 6;
    }
}

/// Fixed header of a File Entry (ECMA-167 §14.9). The extended attributes
/// area and the allocation descriptors (or inline file data, if
/// [`IcbTag::alloc_descriptor_type`] is [`AllocDescriptorType::IN_ICB`])
/// follow in the backing buffer, sized by `length_of_extended_attributes`
/// and `length_of_allocation_descriptors`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FileEntryHeader {
    pub tag: DescriptorTag,
    pub icb_tag: IcbTag,
    pub uid: U32<LittleEndian>,
    pub gid: U32<LittleEndian>,
    pub permissions: FilePermissions,
    pub file_link_count: U16<LittleEndian>,
    pub record_format: u8,
    pub record_display_attributes: u8,
    pub record_length: U32<LittleEndian>,
    /// File size in bytes, as seen by a reader (ECMA-167 §14.9.11
    /// `informationLength`).
    pub information_length: U64<LittleEndian>,
    /// Number of logical blocks actually recorded/allocated for this file,
    /// used to compute on-disk usage distinctly from `information_length`.
    pub logical_blocks_recorded: U64<LittleEndian>,
    pub access_date_and_time: UdfTimestamp,
    pub modification_date_and_time: UdfTimestamp,
    pub attribute_date_and_time: UdfTimestamp,
    pub checkpoint: U32<LittleEndian>,
    /// `long_ad` pointing at an `ExtendedAttributeHeaderDescriptor`, or
    /// zeroed if this ICB has no extended attributes.
    pub extended_attribute_icb: super::ad::LongAd,
    pub implementation_identifier: EntityId,
    pub unique_id: U64<LittleEndian>,
    pub length_of_extended_attributes: U32<LittleEndian>,
    pub length_of_allocation_descriptors: U32<LittleEndian>,
}

impl FileEntryHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn is_directory(&self) -> bool {
        self.icb_tag.is_directory()
    }

    pub fn alloc_descriptor_type(&self) -> AllocDescriptorType {
        self.icb_tag.alloc_descriptor_type()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.information_length.get()
    }
}

/// Fixed header of an Extended File Entry (ECMA-167 §14.17, UDF 2.0+). Adds
/// creation time, a streams directory ICB, and a 64-bit object size
/// distinct from `information_length` (object size counts named streams
/// too; this crate treats the two as equal since it does not implement
/// named streams — spec.md's Non-goals exclude extended attribute streams).
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ExtendedFileEntryHeader {
    pub tag: DescriptorTag,
    pub icb_tag: IcbTag,
    pub uid: U32<LittleEndian>,
    pub gid: U32<LittleEndian>,
    pub permissions: FilePermissions,
    pub file_link_count: U16<LittleEndian>,
    pub record_format: u8,
    pub record_display_attributes: u8,
    pub record_length: U32<LittleEndian>,
    pub information_length: U64<LittleEndian>,
    pub object_size: U64<LittleEndian>,
    pub logical_blocks_recorded: U64<LittleEndian>,
    pub access_date_and_time: UdfTimestamp,
    pub modification_date_and_time: UdfTimestamp,
    pub creation_date_and_time: UdfTimestamp,
    pub attribute_date_and_time: UdfTimestamp,
    pub checkpoint: U32<LittleEndian>,
    reserved: U32<LittleEndian>,
    pub extended_attribute_icb: super::ad::LongAd,
    pub stream_directory_icb: super::ad::LongAd,
    pub implementation_identifier: EntityId,
    pub unique_id: U64<LittleEndian>,
    pub length_of_extended_attributes: U32<LittleEndian>,
    pub length_of_allocation_descriptors: U32<LittleEndian>,
}

impl ExtendedFileEntryHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn is_directory(&self) -> bool {
        self.icb_tag.is_directory()
    }

    pub fn alloc_descriptor_type(&self) -> AllocDescriptorType {
        self.icb_tag.alloc_descriptor_type()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.information_length.get()
    }
}

/// Which tagged variant an ICB decoded to; the rest of this crate is
/// written against this rather than branching on [`TagIdentifier`]
/// everywhere an ICB is read.
#[derive(Debug, Clone, Copy)]
pub enum IcbKind {
    FileEntry,
    ExtendedFileEntry,
}

impl IcbKind {
    pub fn from_tag_identifier(id: TagIdentifier) -> Option<Self> {
        match id {
            TagIdentifier::FileEntry => Some(Self::FileEntry),
            TagIdentifier::ExtendedFileEntry => Some(Self::ExtendedFileEntry),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icb_tag_reads_alloc_descriptor_type() {
        let mut icb_tag: IcbTag = bytemuck::Zeroable::zeroed();
        icb_tag.flags = U16::new(AllocDescriptorType::IN_ICB.bits());
        icb_tag.file_type = IcbTag::FILE_TYPE_REGULAR;
        assert_eq!(icb_tag.alloc_descriptor_type(), AllocDescriptorType::IN_ICB);
        assert!(!icb_tag.is_directory());
    }

    #[test]
    fn directory_file_type_is_recognized() {
        let mut icb_tag: IcbTag = bytemuck::Zeroable::zeroed();
        icb_tag.file_type = IcbTag::FILE_TYPE_DIRECTORY;
        assert!(icb_tag.is_directory());
    }

    #[test]
    fn icb_kind_maps_from_tag_identifier() {
        assert!(matches!(
            IcbKind::from_tag_identifier(TagIdentifier::FileEntry),
            Some(IcbKind::FileEntry)
        ));
        assert!(IcbKind::from_tag_identifier(TagIdentifier::PrimaryVolumeDescriptor).is_none());
    }
}
