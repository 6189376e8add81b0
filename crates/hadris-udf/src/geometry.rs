//! Volume Geometry (spec.md §4.B): partition maps, sparing table, anchor/VDS
//! discovery, and the address translation every higher layer routes through
//! rather than touching a physical LBA directly.

use crate::{
    descriptors::{
        ad::ShortAd,
        anchor::AnchorVolumeDescriptorPointer,
        sparing::SparingTable,
        tag::TagIdentifier,
        vds::{
            LogicalVolumeDescriptorHeader, PartitionDescriptor, PartitionHeaderDescriptor,
            PrimaryVolumeDescriptor,
        },
    },
    device::BlockDevice,
    error::UdfError,
    options::MountOptions,
};
use hadris_io::{Read, Seek, SeekFrom, Write};

/// A single entry in the Logical Volume Descriptor's partition map table,
/// reduced to what [`Geometry::part_lba_to_phys`] needs: the physical start
/// and length of the partition this reference names. UDF "Type 2" (sparable/
/// metadata) maps are resolved once at mount time into this same shape; only
/// their sparing table behaves differently afterward.
#[derive(Debug, Clone, Copy)]
pub struct PartitionMap {
    pub partition_number: u16,
    pub physical_start: u32,
    pub length: u32,
}

/// Sentinel values accepted by [`Geometry::part_start`]/[`Geometry::part_end`]
/// (spec.md §4.B).
pub const PART_WHOLE_VOLUME: i64 = -1;
pub const PART_FIRST_TO_LAST: i64 = -2;

/// A post-sparing-remap physical extent; callers must issue I/O against
/// this, never against the raw partition-relative LBA (spec.md §4.B
/// `relocate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub physical_lba: u32,
    pub block_count: u32,
}

/// Holds partition maps, the decoded sparing table, and the physical extent
/// of the volume; everything address-translation-related that spec.md §3
/// attributes to the Vcb.
#[derive(Debug)]
pub struct Geometry {
    pub logical_block_size: u32,
    pub last_valid_lba: u32,
    pub(crate) partitions: alloc::vec::Vec<PartitionMap>,
    pub(crate) sparing_table: Option<SparingTable>,
    pub(crate) instant_burner_compat: bool,
    /// Decoded Partition Header Descriptor per partition (in `partitions`
    /// order), naming where that partition's Unallocated/Freed Space Bitmap
    /// lives, if any (spec.md §6 "Partition Header Descriptor").
    pub(crate) partition_headers: alloc::vec::Vec<Option<PartitionHeaderDescriptor>>,
    /// Absolute LBA and byte length of the Logical Volume Integrity
    /// Descriptor sequence, as named by the Logical Volume Descriptor
    /// (spec.md §6 "Logical Volume Integrity Descriptor"). `None` if the LVD
    /// named an empty integrity sequence.
    pub(crate) integrity_extent: Option<(u32, u32)>,
}

impl Geometry {
    /// Probes the three AVDP candidate sectors, follows whichever anchor
    /// verifies first to its main (falling back to reserve) Volume
    /// Descriptor Sequence, and decodes the Primary/Logical/Partition
    /// Descriptor triple with the highest `volumeDescriptorSequenceNumber`
    /// (spec.md §4.B "Anchor & VDS load").
    pub fn discover<T>(device: &mut BlockDevice<T>, options: &MountOptions) -> Result<Self, UdfError>
    where
        T: Read + Write + Seek,
    {
        let sector_size = device.sector_size();
        let volume_sectors = device.sector_count() as u32;

        let avdp = Self::find_anchor(device, volume_sectors)?;
        let (pvd, lvd_header, partition_descriptors) =
            Self::load_vds(device, sector_size, &avdp)?;
        let _ = pvd;

        let mut partitions = alloc::vec::Vec::with_capacity(partition_descriptors.len());
        let mut partition_headers = alloc::vec::Vec::with_capacity(partition_descriptors.len());
        for pd in &partition_descriptors {
            partitions.push(PartitionMap {
                partition_number: pd.partition_number.get(),
                physical_start: pd.partition_starting_location.get(),
                length: pd.partition_length.get(),
            });
            let header = bytemuck::try_from_bytes::<PartitionHeaderDescriptor>(
                &pd.partition_contents_use[..PartitionHeaderDescriptor::SIZE],
            )
            .ok()
            .copied();
            partition_headers.push(header);
        }
        if partitions.is_empty() {
            return Err(UdfError::VolumeCorrupt("no usable partition descriptors"));
        }

        let integrity_extent = if lvd_header.integrity_sequence_extent_length.get() > 0 {
            Some((
                lvd_header.integrity_sequence_extent_location.get(),
                lvd_header.integrity_sequence_extent_length.get(),
            ))
        } else {
            None
        };

        Ok(Self {
            logical_block_size: lvd_header.logical_block_size.get(),
            last_valid_lba: volume_sectors.saturating_sub(1),
            partitions,
            sparing_table: None,
            instant_burner_compat: options.instant_burner_compat,
            partition_headers,
            integrity_extent,
        })
    }

    fn find_anchor<T>(
        device: &mut BlockDevice<T>,
        volume_sectors: u32,
    ) -> Result<AnchorVolumeDescriptorPointer, UdfError>
    where
        T: Read + Write + Seek,
    {
        let sector_size = device.sector_size();
        let mut buf = alloc::vec![0u8; sector_size as usize];
        for sector in AnchorVolumeDescriptorPointer::probe_sectors(volume_sectors) {
            if device.read_sectors(sector as u64, &mut buf).is_err() {
                continue;
            }
            let Ok(avdp) = bytemuck::try_from_bytes::<AnchorVolumeDescriptorPointer>(
                &buf[..AnchorVolumeDescriptorPointer::SIZE],
            ) else {
                continue;
            };
            if !avdp.tag.verify_tag() {
                log::trace!("anchor candidate at sector {sector} failed tag checksum");
                continue;
            }
            if avdp.tag.identifier() != TagIdentifier::AnchorVolumeDescriptorPointer {
                continue;
            }
            log::debug!("found anchor volume descriptor pointer at sector {sector}");
            return Ok(*avdp);
        }
        Err(UdfError::NotAUdfVolume)
    }

    /// Walks an extent of tagged descriptors (the main or reserve VDS) and
    /// returns the newest-by-sequence-number Primary/Logical/Partition
    /// triple. Partition descriptors accumulate (a volume may have more
    /// than one); PVD/LVD keep only the newest seen.
    fn load_vds<T>(
        device: &mut BlockDevice<T>,
        sector_size: u32,
        avdp: &AnchorVolumeDescriptorPointer,
    ) -> Result<
        (
            PrimaryVolumeDescriptor,
            LogicalVolumeDescriptorHeader,
            alloc::vec::Vec<PartitionDescriptor>,
        ),
        UdfError,
    >
    where
        T: Read + Write + Seek,
    {
        for extent in [avdp.main_vds, avdp.reserve_vds] {
            match Self::load_vds_extent(device, sector_size, &extent) {
                Ok(result) => return Ok(result),
                Err(err) => log::warn!("volume descriptor sequence extent rejected: {err}"),
            }
        }
        Err(UdfError::VolumeCorrupt(
            "neither main nor reserve volume descriptor sequence is usable",
        ))
    }

    fn load_vds_extent<T>(
        device: &mut BlockDevice<T>,
        sector_size: u32,
        extent: &ShortAd,
    ) -> Result<
        (
            PrimaryVolumeDescriptor,
            LogicalVolumeDescriptorHeader,
            alloc::vec::Vec<PartitionDescriptor>,
        ),
        UdfError,
    >
    where
        T: Read + Write + Seek,
    {
        let sectors = extent.length().div_ceil(sector_size);
        let mut pvd: Option<PrimaryVolumeDescriptor> = None;
        let mut lvd: Option<LogicalVolumeDescriptorHeader> = None;
        let mut partitions = alloc::vec::Vec::new();

        let mut buf = alloc::vec![0u8; sector_size as usize];
        for i in 0..sectors {
            device.read_sectors(extent.position() as u64 + i as u64, &mut buf)?;
            let Ok(tag) = bytemuck::try_from_bytes::<crate::descriptors::DescriptorTag>(
                &buf[..crate::descriptors::DescriptorTag::SIZE],
            ) else {
                continue;
            };
            if !tag.verify_tag() {
                continue;
            }
            match tag.identifier() {
                TagIdentifier::TerminatingDescriptor => break,
                TagIdentifier::PrimaryVolumeDescriptor => {
                    if let Ok(candidate) =
                        bytemuck::try_from_bytes::<PrimaryVolumeDescriptor>(
                            &buf[..PrimaryVolumeDescriptor::SIZE],
                        )
                    {
                        if pvd
                            .map(|p| {
                                candidate.volume_descriptor_sequence_number.get()
                                    > p.volume_descriptor_sequence_number.get()
                            })
                            .unwrap_or(true)
                        {
                            pvd = Some(*candidate);
                        }
                    }
                }
                TagIdentifier::LogicalVolumeDescriptor => {
                    if let Ok(candidate) =
                        bytemuck::try_from_bytes::<LogicalVolumeDescriptorHeader>(
                            &buf[..LogicalVolumeDescriptorHeader::SIZE],
                        )
                    {
                        if lvd
                            .map(|l| {
                                candidate.volume_descriptor_sequence_number.get()
                                    > l.volume_descriptor_sequence_number.get()
                            })
                            .unwrap_or(true)
                        {
                            lvd = Some(*candidate);
                        }
                    }
                }
                TagIdentifier::PartitionDescriptor => {
                    if let Ok(candidate) = bytemuck::try_from_bytes::<PartitionDescriptor>(
                        &buf[..PartitionDescriptor::SIZE],
                    ) {
                        partitions.push(*candidate);
                    }
                }
                _ => {}
            }
        }

        match (pvd, lvd) {
            (Some(pvd), Some(lvd)) if !partitions.is_empty() => Ok((pvd, lvd, partitions)),
            _ => Err(UdfError::VolumeCorrupt(
                "volume descriptor sequence missing a required descriptor",
            )),
        }
    }

    pub fn install_sparing_table(&mut self, table: SparingTable) {
        self.sparing_table = Some(table);
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// The decoded Partition Header Descriptor for partition index `i` (in
    /// `Geometry::discover`'s partition-descriptor order), if one was
    /// present and decoded (spec.md §6).
    pub fn partition_header(&self, i: usize) -> Option<&PartitionHeaderDescriptor> {
        self.partition_headers.get(i).and_then(|h| h.as_ref())
    }

    /// Absolute LBA and byte length of the Logical Volume Integrity
    /// Descriptor sequence, if the Logical Volume Descriptor named one
    /// (spec.md §6).
    pub fn integrity_extent(&self) -> Option<(u32, u32)> {
        self.integrity_extent
    }

    /// Translates a (partition reference, partition-relative LBN) pair to a
    /// physical LBA (spec.md §4.B `part_lba_to_phys`).
    pub fn part_lba_to_phys(&self, partition_ref: u16, lbn: u32) -> Result<u32, UdfError> {
        let index = self.resolve_partition_index(partition_ref)?;
        let map = &self.partitions[index];
        let phys = map
            .physical_start
            .checked_add(lbn)
            .ok_or(UdfError::InvalidParameter("lbn overflows partition start"))?;
        if lbn >= map.length || phys > self.last_valid_lba {
            return Err(UdfError::InvalidParameter("lbn is out of partition extent"));
        }
        Ok(phys)
    }

    /// Reverse lookup: which partition (if any) contains `phys_lba`.
    /// Last-match wins when authored media register overlapping partitions
    /// (spec.md §4.B `phys_to_part_ref`).
    pub fn phys_to_part_ref(&self, phys_lba: u32) -> Option<u16> {
        self.partitions
            .iter()
            .rev()
            .find(|m| phys_lba >= m.physical_start && phys_lba < m.physical_start + m.length)
            .map(|m| m.partition_number)
    }

    fn resolve_partition_index(&self, partition_ref: u16) -> Result<usize, UdfError> {
        let index = partition_ref as usize;
        if index < self.partitions.len() {
            return Ok(index);
        }
        if self.instant_burner_compat && !self.partitions.is_empty() {
            log::warn!(
                "partition reference {partition_ref} out of range, clamping to last partition \
                 (instant-burner compatibility)"
            );
            return Ok(self.partitions.len() - 1);
        }
        Err(UdfError::InvalidParameter("partition reference out of range"))
    }

    pub fn part_start(&self, partition_ref: i64) -> Result<u32, UdfError> {
        match partition_ref {
            PART_WHOLE_VOLUME => Ok(0),
            PART_FIRST_TO_LAST => Ok(self.partitions.first().map(|p| p.physical_start).unwrap_or(0)),
            n if n >= 0 => Ok(self.partitions[self.resolve_partition_index(n as u16)?].physical_start),
            _ => Err(UdfError::InvalidParameter("unknown partition sentinel")),
        }
    }

    pub fn part_end(&self, partition_ref: i64) -> Result<u32, UdfError> {
        match partition_ref {
            PART_WHOLE_VOLUME => Ok(self.last_valid_lba),
            PART_FIRST_TO_LAST => Ok(self
                .partitions
                .last()
                .map(|p| p.physical_start + p.length - 1)
                .unwrap_or(0)),
            n if n >= 0 => {
                let map = &self.partitions[self.resolve_partition_index(n as u16)?];
                Ok(map.physical_start + map.length - 1)
            }
            _ => Err(UdfError::InvalidParameter("unknown partition sentinel")),
        }
    }

    pub fn part_len(&self, partition_ref: i64) -> Result<u32, UdfError> {
        Ok(self.part_end(partition_ref)? - self.part_start(partition_ref)? + 1)
    }

    /// Resolves a physical extent to the mapping I/O must actually target,
    /// applying any sparing-table remaps covering it (spec.md §4.B
    /// `relocate`). Packets not present in the sparing table pass through
    /// unchanged.
    pub fn relocate(&self, lba: u32, block_count: u32) -> Mapping {
        let Some(table) = &self.sparing_table else {
            return Mapping { physical_lba: lba, block_count };
        };
        let packet_start = lba - (lba % table.packet_length);
        match table.lookup(packet_start) {
            Some(mapped) => Mapping {
                physical_lba: mapped + (lba - packet_start),
                block_count,
            },
            None => Mapping { physical_lba: lba, block_count },
        }
    }

    pub fn are_sectors_relocated(&self, lba: u32, block_count: u32) -> bool {
        self.relocate(lba, block_count).physical_lba != lba
    }

    /// Picks a free sparing entry for the packet containing `lba` and
    /// records the remap (spec.md §4.B `remap_packet`). Fails with
    /// [`UdfError::NoSpare`] once the table is exhausted and the
    /// configured policy refuses to proceed without one.
    pub fn remap_packet(
        &mut self,
        lba: u32,
        spare_location: u32,
        options: &MountOptions,
    ) -> Result<(), UdfError> {
        let table = self
            .sparing_table
            .as_mut()
            .ok_or(UdfError::InvalidParameter("volume has no sparing table"))?;
        let packet_start = lba - (lba % table.packet_length);
        let Some(entry) = table.first_free_entry_mut() else {
            return match options.no_spare_action {
                crate::options::NoSpareAction::RefuseWrites => Err(UdfError::NoSpare),
                crate::options::NoSpareAction::BestEffort => {
                    log::warn!("sparing table exhausted, writing through to original location");
                    Ok(())
                }
            };
        };
        *entry = crate::descriptors::sparing::SparingEntry::mapping(packet_start, spare_location);
        Ok(())
    }

    /// Frees any sparing entries fully covered by `[lba, lba+n)` (spec.md
    /// §4.B `unmap_range`).
    pub fn unmap_range(&mut self, lba: u32, n: u32) {
        let Some(table) = self.sparing_table.as_mut() else {
            return;
        };
        let packet_length = table.packet_length;
        for entry in table_entries_mut(table) {
            let original = entry.original_location();
            if !entry.is_free() && original >= lba && original + packet_length <= lba + n {
                *entry = crate::descriptors::sparing::SparingEntry::free();
            }
        }
    }
}

fn table_entries_mut(
    table: &mut SparingTable,
) -> impl Iterator<Item = &mut crate::descriptors::sparing::SparingEntry> {
    // SparingTable only exposes a read-only `entries()`; `remap_packet`
    // needs mutable access too, so this crate keeps the vec private and
    // walks it via `first_free_entry_mut` for allocation and this helper
    // for bulk updates.
    table.entries_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry_with_one_partition() -> Geometry {
        Geometry {
            logical_block_size: 2048,
            last_valid_lba: 99_999,
            partitions: alloc::vec![PartitionMap {
                partition_number: 0,
                physical_start: 300,
                length: 90_000,
            }],
            sparing_table: None,
            instant_burner_compat: false,
            partition_headers: alloc::vec![None],
            integrity_extent: None,
        }
    }

    #[test]
    fn part_lba_to_phys_adds_partition_start() {
        let geometry = geometry_with_one_partition();
        assert_eq!(geometry.part_lba_to_phys(0, 10).unwrap(), 310);
    }

    #[test]
    fn out_of_range_partition_without_compat_flag_fails() {
        let geometry = geometry_with_one_partition();
        assert!(geometry.part_lba_to_phys(5, 10).is_err());
    }

    #[test]
    fn out_of_range_partition_with_compat_flag_clamps() {
        let mut geometry = geometry_with_one_partition();
        geometry.instant_burner_compat = true;
        assert_eq!(geometry.part_lba_to_phys(5, 10).unwrap(), 310);
    }

    #[test]
    fn phys_to_part_ref_finds_containing_partition() {
        let geometry = geometry_with_one_partition();
        assert_eq!(geometry.phys_to_part_ref(305), Some(0));
        assert_eq!(geometry.phys_to_part_ref(1), None);
    }

    #[test]
    fn relocate_passes_through_without_sparing_table() {
        let geometry = geometry_with_one_partition();
        let mapping = geometry.relocate(500, 4);
        assert_eq!(mapping, Mapping { physical_lba: 500, block_count: 4 });
    }
}
