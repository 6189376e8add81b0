//! File Set Descriptor (ECMA-167 §4.14.1): the entry point into the
//! filesystem tree, found at the location the Logical Volume Descriptor's
//! `logical_volume_contents_use` names. Its one field every other subsystem
//! actually reads is `root_directory_icb`; [`crate::volume::Volume`]'s
//! `load_root_icb` decodes exactly this struct rather than the raw
//! byte-offset it used before this type existed.

use super::{
    ad::LongAd,
    charspec::CharSpec,
    regid::EntityId,
    tag::{DescriptorTag, TagIdentifier},
    timestamp::UdfTimestamp,
};
use hadris_common::types::{
    endian::{Endian, LittleEndian},
    number::{U16, U32},
};

/// `FileSetDescriptor` (ECMA-167 §4.14.1), 512 bytes, one logical block on
/// every volume this crate writes (spec.md §6 "File Set Descriptor at
/// partition root").
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FileSetDescriptorHeader {
    pub tag: DescriptorTag,
    pub recording_date_and_time: UdfTimestamp,
    pub interchange_level: U16<LittleEndian>,
    pub max_interchange_level: U16<LittleEndian>,
    pub character_set_list: U32<LittleEndian>,
    pub max_character_set_list: U32<LittleEndian>,
    pub file_set_number: U32<LittleEndian>,
    pub file_set_descriptor_number: U32<LittleEndian>,
    pub logical_volume_identifier_charset: CharSpec,
    pub logical_volume_identifier: [u8; 128],
    pub file_set_charset: CharSpec,
    pub file_set_identifier: [u8; 32],
    pub copyright_file_identifier: [u8; 32],
    pub abstract_file_identifier: [u8; 32],
    pub root_directory_icb: LongAd,
    pub domain_identifier: EntityId,
    pub next_extent: LongAd,
    pub system_stream_directory_icb: LongAd,
    reserved: [u8; 32],
}

impl core::fmt::Debug for FileSetDescriptorHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileSetDescriptorHeader")
            .field("tag", &self.tag)
            .field("root_directory_icb", &self.root_directory_icb)
            .finish_non_exhaustive()
    }
}

impl FileSetDescriptorHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Offset of `root_directory_icb` from the start of the descriptor;
    /// stable by construction (interchange_level is `U32`, not `U16`, unlike
    /// some other implementations' FSD, to match ECMA-167's fixed 512-byte
    /// layout exactly).
    pub const ROOT_ICB_OFFSET: usize = 400;

    pub fn new(root_directory_icb: LongAd, recording_date_and_time: UdfTimestamp, tag_location: u32) -> Self {
        Self {
            tag: DescriptorTag::new(TagIdentifier::FileSetDescriptor, tag_location, 0),
            recording_date_and_time,
            interchange_level: U16::new(2),
            max_interchange_level: U16::new(3),
            character_set_list: U32::new(1),
            max_character_set_list: U32::new(1),
            file_set_number: U32::new(0),
            file_set_descriptor_number: U32::new(0),
            logical_volume_identifier_charset: CharSpec::cs0(),
            logical_volume_identifier: [0; 128],
            file_set_charset: CharSpec::cs0(),
            file_set_identifier: [0; 32],
            copyright_file_identifier: [0; 32],
            abstract_file_identifier: [0; 32],
            root_directory_icb,
            domain_identifier: EntityId::udf_domain(0x0201),
            next_extent: LongAd::new(super::ad::RunState::Recorded, 0, 0, 0),
            system_stream_directory_icb: LongAd::new(super::ad::RunState::Recorded, 0, 0, 0),
            reserved: [0; 32],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::ad::RunState;
    use static_assertions::const_assert_eq;

    const_assert_eq!(FileSetDescriptorHeader::SIZE, 512);
    const_assert_eq!(FileSetDescriptorHeader::ROOT_ICB_OFFSET, 400);

    #[test]
    fn root_icb_lands_at_the_offset_load_root_icb_expects() {
        let header = FileSetDescriptorHeader::new(
            LongAd::new(RunState::Recorded, 2048, 1, 0),
            bytemuck::Zeroable::zeroed(),
            0,
        );
        let bytes = bytemuck::bytes_of(&header);
        let icb = *bytemuck::from_bytes::<LongAd>(
            &bytes[FileSetDescriptorHeader::ROOT_ICB_OFFSET..FileSetDescriptorHeader::ROOT_ICB_OFFSET + 16],
        );
        assert_eq!(icb.position(), 1);
    }
}
