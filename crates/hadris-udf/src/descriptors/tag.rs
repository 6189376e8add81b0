//! The 16-byte descriptor tag that prefixes every tagged ECMA-167 structure,
//! and the two independent checks spec.md §6 requires: an 8-bit checksum over
//! the tag itself, and an ITU-T V.41 CRC over the descriptor body.

use hadris_common::types::{
    endian::{Endian, LittleEndian},
    number::{U16, U32},
};

/// Which kind of descriptor a [`DescriptorTag`] introduces (ECMA-167 §3.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagIdentifier {
    PrimaryVolumeDescriptor,
    AnchorVolumeDescriptorPointer,
    VolumeDescriptorPointer,
    ImplementationUseVolumeDescriptor,
    PartitionDescriptor,
    LogicalVolumeDescriptor,
    UnallocatedSpaceDescriptor,
    TerminatingDescriptor,
    LogicalVolumeIntegrityDescriptor,
    FileSetDescriptor,
    FileIdentifierDescriptor,
    AllocationExtentDescriptor,
    IndirectEntry,
    TerminalEntry,
    FileEntry,
    ExtendedAttributeHeaderDescriptor,
    UnallocatedSpaceEntry,
    SpaceBitmapDescriptor,
    PartitionIntegrityEntry,
    ExtendedFileEntry,
    Unknown(u16),
}

impl TagIdentifier {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::PrimaryVolumeDescriptor,
            2 => Self::AnchorVolumeDescriptorPointer,
            3 => Self::VolumeDescriptorPointer,
            4 => Self::ImplementationUseVolumeDescriptor,
            5 => Self::PartitionDescriptor,
            6 => Self::LogicalVolumeDescriptor,
            7 => Self::UnallocatedSpaceDescriptor,
            8 => Self::TerminatingDescriptor,
            9 => Self::LogicalVolumeIntegrityDescriptor,
            256 => Self::FileSetDescriptor,
            257 => Self::FileIdentifierDescriptor,
            258 => Self::AllocationExtentDescriptor,
            259 => Self::IndirectEntry,
            260 => Self::TerminalEntry,
            261 => Self::FileEntry,
            262 => Self::ExtendedAttributeHeaderDescriptor,
            263 => Self::UnallocatedSpaceEntry,
            264 => Self::SpaceBitmapDescriptor,
            265 => Self::PartitionIntegrityEntry,
            266 => Self::ExtendedFileEntry,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(&self) -> u16 {
        match self {
            Self::PrimaryVolumeDescriptor => 1,
            Self::AnchorVolumeDescriptorPointer => 2,
            Self::VolumeDescriptorPointer => 3,
            Self::ImplementationUseVolumeDescriptor => 4,
            Self::PartitionDescriptor => 5,
            Self::LogicalVolumeDescriptor => 6,
            Self::UnallocatedSpaceDescriptor => 7,
            Self::TerminatingDescriptor => 8,
            Self::LogicalVolumeIntegrityDescriptor => 9,
            Self::FileSetDescriptor => 256,
            Self::FileIdentifierDescriptor => 257,
            Self::AllocationExtentDescriptor => 258,
            Self::IndirectEntry => 259,
            Self::TerminalEntry => 260,
            Self::FileEntry => 261,
            Self::ExtendedAttributeHeaderDescriptor => 262,
            Self::UnallocatedSpaceEntry => 263,
            Self::SpaceBitmapDescriptor => 264,
            Self::PartitionIntegrityEntry => 265,
            Self::ExtendedFileEntry => 266,
            Self::Unknown(v) => *v,
        }
    }
}

/// Raw on-disk descriptor tag (ECMA-167 §3.2.1 / §3.7.1), 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DescriptorTag {
    pub tag_identifier: U16<LittleEndian>,
    pub descriptor_version: U16<LittleEndian>,
    pub tag_checksum: u8,
    pub reserved: u8,
    pub tag_serial_number: U16<LittleEndian>,
    pub descriptor_crc: U16<LittleEndian>,
    pub descriptor_crc_length: U16<LittleEndian>,
    pub tag_location: U32<LittleEndian>,
}

const CRC_ITU_T: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

impl DescriptorTag {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(identifier: TagIdentifier, tag_location: u32, crc_length: u16) -> Self {
        Self {
            tag_identifier: U16::new(identifier.to_u16()),
            descriptor_version: U16::new(2),
            tag_checksum: 0,
            reserved: 0,
            tag_serial_number: U16::new(1),
            descriptor_crc: U16::new(0),
            descriptor_crc_length: U16::new(crc_length),
            tag_location: U32::new(tag_location),
        }
    }

    /// The 8-bit sum-of-bytes checksum over the tag, excluding the checksum
    /// byte itself (ECMA-167 §3.2.1.1, a.k.a. "tag checksum").
    pub fn compute_checksum(&self) -> u8 {
        let bytes = bytemuck::bytes_of(self);
        let mut sum: u8 = 0;
        for (i, b) in bytes.iter().enumerate() {
            if i == 4 {
                continue;
            }
            sum = sum.wrapping_add(*b);
        }
        sum
    }

    pub fn finalize(&mut self, body: &[u8]) {
        self.descriptor_crc_length = U16::new(body.len() as u16);
        let crc = CRC_ITU_T.checksum(body);
        self.descriptor_crc = U16::new(crc);
        self.tag_checksum = self.compute_checksum();
    }

    /// Verifies the tag checksum only. A failure here means the tag itself
    /// (and therefore `tag_identifier`/`descriptor_crc_length`) cannot be
    /// trusted, so it is reported distinctly from a CRC failure.
    pub fn verify_tag(&self) -> bool {
        self.tag_checksum == self.compute_checksum()
    }

    /// Verifies the descriptor body CRC, given the tag already passed
    /// [`Self::verify_tag`].
    pub fn verify_crc(&self, body: &[u8]) -> bool {
        if body.len() != self.descriptor_crc_length.get() as usize {
            return false;
        }
        CRC_ITU_T.checksum(body) == self.descriptor_crc.get()
    }

    pub fn identifier(&self) -> TagIdentifier {
        TagIdentifier::from_u16(self.tag_identifier.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_and_crc_round_trip() {
        let body = [0xABu8; 64];
        let mut tag = DescriptorTag::new(TagIdentifier::FileEntry, 7, 0);
        tag.finalize(&body);
        assert!(tag.verify_tag());
        assert!(tag.verify_crc(&body));

        let mut corrupt = tag;
        corrupt.tag_serial_number = U16::new(999);
        assert!(!corrupt.verify_tag());
    }

    #[test]
    fn crc_detects_body_corruption() {
        let body = [0x11u8; 32];
        let mut tag = DescriptorTag::new(TagIdentifier::FileIdentifierDescriptor, 3, 0);
        tag.finalize(&body);
        assert!(tag.verify_tag());
        let mut corrupt_body = body;
        corrupt_body[5] ^= 0xFF;
        assert!(!tag.verify_crc(&corrupt_body));
    }
}
