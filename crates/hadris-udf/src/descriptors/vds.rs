//! Volume Descriptor Sequence members (ECMA-167 §3.10): Primary, Partition,
//! Logical, Unallocated Space, Implementation Use, and Terminating Volume
//! Descriptors. spec.md §4.B walks the main/reserve VDS extents and decodes
//! whichever of these tag identifiers it finds until a Terminating
//! Descriptor (or the extent runs out).

use super::{
    ad::ShortAd,
    charspec::CharSpec,
    regid::EntityId,
    tag::{DescriptorTag, TagIdentifier},
    timestamp::UdfTimestamp,
};
use hadris_common::types::{
    endian::{Endian, LittleEndian},
    number::{U16, U32},
};

/// Primary Volume Descriptor (ECMA-167 §3.10.1). Fixed-size; the trailing
/// `dstring` fields (`volumeIdentifier`, `volumeSetIdentifier`) are modelled
/// as raw byte arrays here and decoded on demand with
/// [`super::charspec::decode_dstring`].
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PrimaryVolumeDescriptor {
    pub tag: DescriptorTag,
    pub volume_descriptor_sequence_number: U32<LittleEndian>,
    pub primary_volume_descriptor_number: U32<LittleEndian>,
    pub volume_identifier: [u8; 32],
    pub volume_sequence_number: U16<LittleEndian>,
    pub maximum_volume_sequence_number: U16<LittleEndian>,
    pub interchange_level: U16<LittleEndian>,
    pub maximum_interchange_level: U16<LittleEndian>,
    pub character_set_list: U32<LittleEndian>,
    pub maximum_character_set_list: U32<LittleEndian>,
    pub volume_set_identifier: [u8; 128],
    pub descriptor_character_set: CharSpec,
    pub explanatory_character_set: CharSpec,
    pub volume_abstract: ShortAd,
    pub volume_copyright_notice: ShortAd,
    pub application_identifier: EntityId,
    pub recording_date_and_time: UdfTimestamp,
    pub implementation_identifier: EntityId,
    pub implementation_use: [u8; 64],
    pub predecessor_volume_descriptor_sequence_location: U32<LittleEndian>,
    pub flags: U16<LittleEndian>,
    reserved: [u8; 22],
}

impl core::fmt::Debug for PrimaryVolumeDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrimaryVolumeDescriptor")
            .field("tag", &self.tag)
            .field(
                "volume_descriptor_sequence_number",
                &self.volume_descriptor_sequence_number.get(),
            )
            .finish_non_exhaustive()
    }
}

impl PrimaryVolumeDescriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Logical Volume Descriptor (ECMA-167 §3.10.6): names the logical block
/// size, the partition maps that translate a partition reference number
/// into an actual on-media partition, and the location of the File Set
/// Descriptor (the entry point into the filesystem tree). Partition maps
/// are variable-length and follow this fixed header in the backing buffer.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LogicalVolumeDescriptorHeader {
    pub tag: DescriptorTag,
    pub volume_descriptor_sequence_number: U32<LittleEndian>,
    pub descriptor_character_set: CharSpec,
    pub logical_volume_identifier: [u8; 128],
    pub logical_block_size: U32<LittleEndian>,
    pub domain_identifier: EntityId,
    /// `long_ad` pointing at the File Set Descriptor.
    pub logical_volume_contents_use: super::ad::LongAd,
    pub map_table_length: U32<LittleEndian>,
    pub number_of_partition_maps: U32<LittleEndian>,
    pub implementation_identifier: EntityId,
    pub implementation_use: [u8; 128],
    pub integrity_sequence_extent_length: U32<LittleEndian>,
    pub integrity_sequence_extent_location: U32<LittleEndian>,
}

impl core::fmt::Debug for LogicalVolumeDescriptorHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogicalVolumeDescriptorHeader")
            .field("logical_block_size", &self.logical_block_size.get())
            .field(
                "number_of_partition_maps",
                &self.number_of_partition_maps.get(),
            )
            .finish_non_exhaustive()
    }
}

impl LogicalVolumeDescriptorHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

bitflags::bitflags! {
    /// `PartitionDescriptor.partitionFlags` (ECMA-167 §3.10.3.4).
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct PartitionFlags: u16 {
        /// The partition space is currently allocated (vs. "unallocated"
        /// partitions registered but not yet in use).
        const ALLOCATED = 1 << 0;
    }
}

/// Partition Descriptor (ECMA-167 §3.10.3): one physical partition's
/// location/length, access type, and the contents identifier (`+NSR02`/
/// `+FDC01` etc.) naming what filesystem occupies it.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PartitionDescriptor {
    pub tag: DescriptorTag,
    pub volume_descriptor_sequence_number: U32<LittleEndian>,
    pub partition_flags: PartitionFlags,
    pub partition_number: U16<LittleEndian>,
    pub partition_contents: EntityId,
    pub partition_contents_use: [u8; 128],
    pub access_type: U32<LittleEndian>,
    pub partition_starting_location: U32<LittleEndian>,
    pub partition_length: U32<LittleEndian>,
    pub implementation_identifier: EntityId,
    pub implementation_use: [u8; 128],
    reserved: [u8; 156],
}

impl PartitionDescriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn is_allocated(&self) -> bool {
        self.partition_flags.contains(PartitionFlags::ALLOCATED)
    }
}

/// Type 1 (physical) partition map entry (ECMA-167 §3.10.6.2 /
/// OSTA-UDF §2.2.8), the 6-byte table entry following
/// [`LogicalVolumeDescriptorHeader`] in the backing buffer. This crate only
/// ever writes one, since [`crate::geometry::Geometry`] resolves partitions
/// straight from the Partition Descriptors in the Volume Descriptor
/// Sequence and treats this table as informational.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PartitionMapType1 {
    pub partition_map_type: u8,
    pub partition_map_length: u8,
    pub volume_sequence_number: U16<LittleEndian>,
    pub partition_number: U16<LittleEndian>,
}

impl PartitionMapType1 {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const TYPE: u8 = 1;

    pub fn new(partition_number: u16) -> Self {
        Self {
            partition_map_type: Self::TYPE,
            partition_map_length: Self::SIZE as u8,
            volume_sequence_number: U16::new(1),
            partition_number: U16::new(partition_number),
        }
    }
}

/// Unallocated Space Descriptor (ECMA-167 §3.10.8): the extents on this
/// volume not claimed by any partition map, left for future partition
/// growth. This crate only needs to parse it through, never allocates from
/// it directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UnallocatedSpaceDescriptorHeader {
    pub tag: DescriptorTag,
    pub volume_descriptor_sequence_number: U32<LittleEndian>,
    pub number_of_allocation_descriptors: U32<LittleEndian>,
}

impl UnallocatedSpaceDescriptorHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Implementation Use Volume Descriptor (ECMA-167 §3.10.4): carries the
/// LVID charset/volume-set identification duplicated for implementation
/// tools. Parsed for completeness; no subsystem here depends on its
/// contents.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ImplementationUseVolumeDescriptorHeader {
    pub tag: DescriptorTag,
    pub volume_descriptor_sequence_number: U32<LittleEndian>,
    pub implementation_identifier: EntityId,
}

impl ImplementationUseVolumeDescriptorHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Terminating Descriptor (ECMA-167 §3.10.9): a tag with no body, marking
/// the end of a Volume/Integrity Descriptor Sequence.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TerminatingDescriptor {
    pub tag: DescriptorTag,
    reserved: [u8; 496],
}

impl TerminatingDescriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(tag_location: u32) -> Self {
        Self {
            tag: DescriptorTag::new(TagIdentifier::TerminatingDescriptor, tag_location, 0),
            reserved: [0; 496],
        }
    }
}

/// Partition Header Descriptor (ECMA-167 §14.3), the structure a Partition
/// Descriptor's `partition_contents_use` field holds when `partition_contents`
/// names an NSR/UDF partition. Names, as `short_ad`s relative to the start
/// of this partition, the Unallocated Space Table/Bitmap and Freed Space
/// Table/Bitmap (spec.md §6 "at most one of bitmap/table per role"); an
/// all-zero `short_ad` (length 0) means that role is absent.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PartitionHeaderDescriptor {
    pub unallocated_space_table: ShortAd,
    pub unallocated_space_bitmap: ShortAd,
    pub partition_integrity_table: ShortAd,
    pub freed_space_table: ShortAd,
    pub freed_space_bitmap: ShortAd,
    reserved: [u8; 88],
}

impl PartitionHeaderDescriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(unallocated_space_bitmap: ShortAd) -> Self {
        Self {
            unallocated_space_table: ShortAd::new(super::ad::RunState::Recorded, 0, 0),
            unallocated_space_bitmap,
            partition_integrity_table: ShortAd::new(super::ad::RunState::Recorded, 0, 0),
            freed_space_table: ShortAd::new(super::ad::RunState::Recorded, 0, 0),
            freed_space_bitmap: ShortAd::new(super::ad::RunState::Recorded, 0, 0),
            reserved: [0; 88],
        }
    }

    pub fn has_unallocated_space_bitmap(&self) -> bool {
        self.unallocated_space_bitmap.length() > 0
    }

    pub fn has_freed_space_bitmap(&self) -> bool {
        self.freed_space_bitmap.length() > 0
    }
}

/// Space Bitmap Descriptor (ECMA-167 §14.12): the on-disk free-space bitmap
/// itself, one bit per block of the partition it describes (bit set = free),
/// spec.md §4.D's bitmap model in its wire form. The bit array follows this
/// header immediately, packed LSB-first per byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SpaceBitmapDescriptorHeader {
    pub tag: DescriptorTag,
    pub number_of_bits: U32<LittleEndian>,
    pub number_of_bytes: U32<LittleEndian>,
}

impl SpaceBitmapDescriptorHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(number_of_bits: u32, tag_location: u32) -> Self {
        let number_of_bytes = number_of_bits.div_ceil(8);
        Self {
            tag: DescriptorTag::new(TagIdentifier::SpaceBitmapDescriptor, tag_location, 0),
            number_of_bits: U32::new(number_of_bits),
            number_of_bytes: U32::new(number_of_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(PartitionDescriptor::SIZE, 512);
    const_assert_eq!(TerminatingDescriptor::SIZE, 512);
    const_assert_eq!(PartitionHeaderDescriptor::SIZE, 128);
    const_assert_eq!(PartitionMapType1::SIZE, 6);

    #[test]
    fn partition_header_reports_absent_bitmap_by_zero_length() {
        let header = PartitionHeaderDescriptor::new(ShortAd::new(super::super::ad::RunState::Recorded, 0, 0));
        assert!(!header.has_unallocated_space_bitmap());
    }

    #[test]
    fn space_bitmap_header_rounds_bits_up_to_whole_bytes() {
        let header = SpaceBitmapDescriptorHeader::new(17, 0);
        assert_eq!(header.number_of_bytes.get(), 3);
    }

    #[test]
    fn partition_allocated_flag_round_trips() {
        let mut pd: PartitionDescriptor = bytemuck::Zeroable::zeroed();
        assert!(!pd.is_allocated());
        pd.partition_flags = PartitionFlags::ALLOCATED;
        assert!(pd.is_allocated());
    }

    #[test]
    fn terminating_descriptor_carries_expected_tag() {
        let td = TerminatingDescriptor::new(42);
        assert_eq!(td.tag.identifier(), TagIdentifier::TerminatingDescriptor);
    }
}
