//! Anchor Volume Descriptor Pointer (ECMA-167 §3.10.1): the fixed, always-at
//! a known-sector structure that bootstraps discovery of the Volume
//! Descriptor Sequence (spec.md §4.B "Anchor/VDS discovery").

use super::{ad::ShortAd, tag::{DescriptorTag, TagIdentifier}};

/// `AnchorVolumeDescriptorPointer` (ECMA-167 §3.10.1), 512 bytes total once
/// padded to the logical block size; only the first 24 bytes are defined.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AnchorVolumeDescriptorPointer {
    pub tag: DescriptorTag,
    /// Extent describing the main Volume Descriptor Sequence.
    pub main_vds: ShortAd,
    /// Extent describing the backup/reserve Volume Descriptor Sequence,
    /// consulted when the main sequence fails its tag checks.
    pub reserve_vds: ShortAd,
}

impl AnchorVolumeDescriptorPointer {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Sector 256 on the volume, the first of the three locations ECMA-167
    /// §3.10.1 + OSTA-UDF §2.2.3 require an AVDP be probed at, in probe
    /// order (256, then N-256, then N).
    pub const PRIMARY_SECTOR: u32 = 256;

    pub fn new(main_vds: ShortAd, reserve_vds: ShortAd, tag_location: u32) -> Self {
        Self {
            tag: DescriptorTag::new(TagIdentifier::AnchorVolumeDescriptorPointer, tag_location, 0),
            main_vds,
            reserve_vds,
        }
    }

    /// The three candidate sectors a UDF reader must try, in order, to find
    /// a usable AVDP (OSTA-UDF §2.2.3): 256, `volume_sectors - 256`, and
    /// `volume_sectors` (the very last sector, used by media that cannot
    /// predict their own final extent at format time).
    pub fn probe_sectors(volume_sectors: u32) -> [u32; 3] {
        [
            Self::PRIMARY_SECTOR,
            volume_sectors.saturating_sub(Self::PRIMARY_SECTOR),
            volume_sectors,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::ad::RunState;

    #[test]
    fn probe_sectors_cover_the_three_ecma_locations() {
        let probes = AnchorVolumeDescriptorPointer::probe_sectors(100_000);
        assert_eq!(probes, [256, 99_744, 100_000]);
    }

    #[test]
    fn new_sets_anchor_tag_identifier() {
        let avdp = AnchorVolumeDescriptorPointer::new(
            ShortAd::new(RunState::Recorded, 2048, 257),
            ShortAd::new(RunState::Recorded, 2048, 99_000),
            256,
        );
        assert_eq!(avdp.tag.identifier(), TagIdentifier::AnchorVolumeDescriptorPointer);
    }
}
