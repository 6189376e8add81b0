//! High-level file operations (spec.md §4.G "Opening a path...", "Delete-
//! on-close", "Rename/move", "Stream directory"): the layer that composes
//! the Directory Index, Extent Engine and Space Allocator into whole-file
//! create/open/read/write/delete/rename. Bookkeeping for open handles
//! (Fcb/Dloc/Ccb reference counts) lives one level up in [`crate::instance`];
//! this module only moves bytes and FIDs.

use crate::{
    alloc_space::AllocFlags,
    descriptors::{
        ad::{ExtentRun, LongAd, RunState},
        charspec,
        fid::{FidCharacteristics, FileIdentifierDescriptor, FileIdentifierDescriptorHeader},
        file_entry::{AllocDescriptorType, ExtendedFileEntryHeader, FileEntryHeader, IcbTag},
        tag::{DescriptorTag, TagIdentifier},
    },
    device::BlockDevice,
    directory::DirectoryIndex,
    error::UdfError,
    extent::{self, ExtentInfo},
    instance::FeLocation,
    volume::Vcb,
};
use hadris_common::types::{
    endian::{Endian, LittleEndian},
    number::{U16, U32, U64},
};
use hadris_io::{Read, Seek, Write};

/// A loaded ICB: its decoded header plus the file's data mapping. Named
/// streams (extended attributes, the stream directory) are resolved
/// separately through [`open_stream_directory`] rather than as a second
/// `ExtentInfo` on this type.
#[derive(Clone)]
pub struct LoadedIcb {
    pub location: FeLocation,
    pub is_directory: bool,
    pub information_length: u64,
    pub data: ExtentInfo,
}

fn read_tagged_block<T>(vcb: &mut Vcb, device: &mut BlockDevice<T>, location: FeLocation) -> Result<alloc::vec::Vec<u8>, UdfError>
where
    T: Read + Write + Seek,
{
    let phys = vcb.geometry.part_lba_to_phys(location.partition_reference_number, location.lbn)?;
    let mapping = vcb.geometry.relocate(phys, 1);
    vcb.cache.read_block(device, mapping.physical_lba)
}

fn decode_mapping(alloc_type: AllocDescriptorType, ad_bytes: &[u8], partition_reference_number: u16) -> Result<alloc::vec::Vec<ExtentRun>, UdfError> {
    match alloc_type {
        AllocDescriptorType::SHORT_AD => {
            let mut runs = alloc::vec::Vec::with_capacity(ad_bytes.len() / 8);
            for chunk in ad_bytes.chunks_exact(8) {
                let ad = *bytemuck::from_bytes::<crate::descriptors::ad::ShortAd>(chunk);
                runs.push(ExtentRun::from_short_ad(&ad, partition_reference_number));
            }
            Ok(runs)
        }
        AllocDescriptorType::LONG_AD => {
            let mut runs = alloc::vec::Vec::with_capacity(ad_bytes.len() / 16);
            for chunk in ad_bytes.chunks_exact(16) {
                let ad = *bytemuck::from_bytes::<LongAd>(chunk);
                runs.push(ExtentRun::from_long_ad(&ad));
            }
            Ok(runs)
        }
        _ => Err(UdfError::VolumeCorrupt("unsupported allocation descriptor type")),
    }
}

/// Reads the File Entry (or Extended File Entry) at `location` and decodes
/// its allocation into an [`ExtentInfo`] (spec.md §4.G).
///
/// Assumes the File Entry's fixed header, extended-attribute area, and
/// allocation descriptor list together fit within one logical block — true
/// for every File Entry this crate itself constructs. A File Entry whose
/// allocation descriptors spill into a continuation extent (ECMA-167
/// §14.14.1.1 "next extent of allocation descriptors") is rejected with
/// [`UdfError::VolumeCorrupt`] rather than silently truncated.
pub fn load_icb<T>(vcb: &mut Vcb, device: &mut BlockDevice<T>, location: FeLocation) -> Result<LoadedIcb, UdfError>
where
    T: Read + Write + Seek,
{
    let buf = read_tagged_block(vcb, device, location)?;

    let tag = *bytemuck::try_from_bytes::<DescriptorTag>(&buf[..DescriptorTag::SIZE])
        .map_err(|_| UdfError::VolumeCorrupt("icb tag did not decode"))?;
    if !tag.verify_tag() {
        return Err(UdfError::VolumeCorrupt("icb failed tag checksum"));
    }

    match tag.identifier() {
        TagIdentifier::FileEntry => {
            let header = *bytemuck::from_bytes::<FileEntryHeader>(&buf[..FileEntryHeader::SIZE]);
            let ad_offset = FileEntryHeader::SIZE + header.length_of_extended_attributes.get() as usize;
            let ad_len = header.length_of_allocation_descriptors.get() as usize;
            if ad_offset + ad_len > buf.len() {
                return Err(UdfError::VolumeCorrupt("file entry allocation descriptors spill past one logical block"));
            }
            let ad_bytes = &buf[ad_offset..ad_offset + ad_len];
            let data = match header.alloc_descriptor_type() {
                AllocDescriptorType::IN_ICB => ExtentInfo::InIcb {
                    data: ad_bytes.to_vec(),
                    capacity: buf.len() - ad_offset,
                },
                other => ExtentInfo::Mapped {
                    runs: decode_mapping(other, ad_bytes, location.partition_reference_number)?,
                },
            };
            Ok(LoadedIcb {
                location,
                is_directory: header.is_directory(),
                information_length: header.size_in_bytes(),
                data,
            })
        }
        TagIdentifier::ExtendedFileEntry => {
            let header = *bytemuck::from_bytes::<ExtendedFileEntryHeader>(&buf[..ExtendedFileEntryHeader::SIZE]);
            let ad_offset = ExtendedFileEntryHeader::SIZE + header.length_of_extended_attributes.get() as usize;
            let ad_len = header.length_of_allocation_descriptors.get() as usize;
            if ad_offset + ad_len > buf.len() {
                return Err(UdfError::VolumeCorrupt("extended file entry allocation descriptors spill past one logical block"));
            }
            let ad_bytes = &buf[ad_offset..ad_offset + ad_len];
            let data = match header.alloc_descriptor_type() {
                AllocDescriptorType::IN_ICB => ExtentInfo::InIcb {
                    data: ad_bytes.to_vec(),
                    capacity: buf.len() - ad_offset,
                },
                other => ExtentInfo::Mapped {
                    runs: decode_mapping(other, ad_bytes, location.partition_reference_number)?,
                },
            };
            Ok(LoadedIcb {
                location,
                is_directory: header.is_directory(),
                information_length: header.size_in_bytes(),
                data,
            })
        }
        _ => Err(UdfError::VolumeCorrupt("only File Entries and Extended File Entries are supported by this loader")),
    }
}

/// Re-encodes `header`'s allocation from `data`, finalizes its tag, and
/// returns the bytes to write back (shared by [`write_fresh_icb`] and
/// [`store_icb`] so both paths compute the descriptor CRC over exactly the
/// bytes that matter, not the whole padded block).
pub(crate) fn encode_file_entry(mut header: FileEntryHeader, data: &ExtentInfo, block_size: usize) -> Result<alloc::vec::Vec<u8>, UdfError> {
    let ea_len = header.length_of_extended_attributes.get() as usize;
    let ad_offset = FileEntryHeader::SIZE + ea_len;

    let (ad_bytes, alloc_type): (alloc::vec::Vec<u8>, AllocDescriptorType) = match data {
        ExtentInfo::InIcb { data, .. } => (data.clone(), AllocDescriptorType::IN_ICB),
        ExtentInfo::Mapped { runs } => {
            let mut bytes = alloc::vec::Vec::with_capacity(runs.len() * 8);
            for run in runs {
                bytes.extend_from_slice(bytemuck::bytes_of(&run.to_short_ad()));
            }
            (bytes, AllocDescriptorType::SHORT_AD)
        }
    };
    if ad_offset + ad_bytes.len() > block_size {
        return Err(UdfError::InvalidParameter("file entry allocation does not fit in one logical block"));
    }

    header.information_length = U64::new(data.len());
    header.length_of_allocation_descriptors = U32::new(ad_bytes.len() as u32);
    header.icb_tag.flags = U16::new((header.icb_tag.flags.get() & !0x7) | alloc_type.bits());

    let mut buf = alloc::vec![0u8; block_size];
    buf[..FileEntryHeader::SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    buf[ad_offset..ad_offset + ad_bytes.len()].copy_from_slice(&ad_bytes);

    let body_len = FileEntryHeader::SIZE - DescriptorTag::SIZE + ad_bytes.len();
    let body = buf[DescriptorTag::SIZE..DescriptorTag::SIZE + body_len].to_vec();
    header.tag.finalize(&body);
    buf[..DescriptorTag::SIZE].copy_from_slice(bytemuck::bytes_of(&header.tag));

    Ok(buf)
}

/// Writes a brand-new, empty (in-ICB) File Entry at `location`.
fn write_fresh_icb<T>(vcb: &mut Vcb, device: &mut BlockDevice<T>, location: FeLocation, is_directory: bool) -> Result<(), UdfError>
where
    T: Read + Write + Seek,
{
    let block_size = vcb.geometry.logical_block_size as usize;
    let mut header: FileEntryHeader = bytemuck::Zeroable::zeroed();
    header.icb_tag.file_type = if is_directory { IcbTag::FILE_TYPE_DIRECTORY } else { IcbTag::FILE_TYPE_REGULAR };
    header.file_link_count = U16::new(1);
    header.tag = DescriptorTag::new(TagIdentifier::FileEntry, location.lbn, 0);

    let capacity = block_size - FileEntryHeader::SIZE;
    let data = ExtentInfo::InIcb { data: alloc::vec::Vec::new(), capacity };
    let buf = encode_file_entry(header, &data, block_size)?;

    let phys = vcb.geometry.part_lba_to_phys(location.partition_reference_number, location.lbn)?;
    let mapping = vcb.geometry.relocate(phys, 1);
    vcb.cache.write_blocks(device, mapping.physical_lba, &buf, true)
}

/// Writes `icb` back to its File Entry block, preserving every header field
/// this crate does not itself manage (permissions, timestamps, uid/gid).
pub fn store_icb<T>(vcb: &mut Vcb, device: &mut BlockDevice<T>, icb: &LoadedIcb) -> Result<(), UdfError>
where
    T: Read + Write + Seek,
{
    let block_size = vcb.geometry.logical_block_size as usize;
    let buf = read_tagged_block(vcb, device, icb.location)?;
    let header = *bytemuck::from_bytes::<FileEntryHeader>(&buf[..FileEntryHeader::SIZE]);
    let encoded = encode_file_entry(header, &icb.data, block_size)?;

    let phys = vcb.geometry.part_lba_to_phys(icb.location.partition_reference_number, icb.location.lbn)?;
    let mapping = vcb.geometry.relocate(phys, 1);
    vcb.cache.write_blocks(device, mapping.physical_lba, &encoded, true)
}

/// Reads up to `buf.len()` bytes from `icb` at `offset` (spec.md §4.E
/// `read_extent`, dispatched through the mounted volume's cache/geometry).
pub fn read<T>(vcb: &mut Vcb, device: &mut BlockDevice<T>, icb: &LoadedIcb, offset: u64, buf: &mut [u8]) -> Result<usize, UdfError>
where
    T: Read + Write + Seek,
{
    let block_size = vcb.geometry.logical_block_size;
    let Vcb { geometry, cache, .. } = vcb;
    extent::read_extent(&icb.data, offset, buf.len(), buf, device, cache, geometry, block_size)
}

/// Writes `buf` into `icb` at `offset`, extending the mapping first if the
/// write reaches past the current length (spec.md §4.G, S4 "Seek past EOF
/// and write").
pub fn write<T>(
    vcb: &mut Vcb,
    device: &mut BlockDevice<T>,
    icb: &mut LoadedIcb,
    allocator_index: usize,
    offset: u64,
    buf: &[u8],
) -> Result<usize, UdfError>
where
    T: Read + Write + Seek,
{
    let needed = offset + buf.len() as u64;
    if needed > icb.data.len() {
        resize(vcb, device, icb, allocator_index, needed)?;
    }
    let block_size = vcb.geometry.logical_block_size;
    let allocator = vcb
        .allocators
        .get_mut(allocator_index)
        .ok_or(UdfError::InvalidParameter("allocator index out of range"))?;
    let Vcb { geometry, cache, .. } = vcb;
    let written = extent::write_extent(&mut icb.data, offset, buf, device, cache, geometry, allocator, block_size)?;
    icb.information_length = icb.data.len();
    Ok(written)
}

/// Grows or shrinks `icb`'s mapping to `new_length` bytes (spec.md §4.E
/// `resize`, S3 "Truncate").
pub fn resize<T>(vcb: &mut Vcb, device: &mut BlockDevice<T>, icb: &mut LoadedIcb, allocator_index: usize, new_length: u64) -> Result<(), UdfError>
where
    T: Read + Write + Seek,
{
    let block_size = vcb.geometry.logical_block_size;
    let sparse_threshold = vcb.options.sparse_threshold;
    let allocator = vcb
        .allocators
        .get_mut(allocator_index)
        .ok_or(UdfError::InvalidParameter("allocator index out of range"))?;
    let Vcb { geometry, cache, .. } = vcb;
    extent::resize(&mut icb.data, new_length, device, cache, geometry, allocator, block_size, sparse_threshold)?;
    icb.information_length = icb.data.len();
    Ok(())
}

/// Scans a directory's data stream into FIDs for [`DirectoryIndex::build`]
/// (spec.md §4.F "Build").
pub fn scan_directory<T>(
    vcb: &mut Vcb,
    device: &mut BlockDevice<T>,
    directory: &LoadedIcb,
) -> Result<alloc::vec::Vec<(FileIdentifierDescriptor, u64)>, UdfError>
where
    T: Read + Write + Seek,
{
    if !directory.is_directory {
        return Err(UdfError::NotADirectory);
    }
    let len = directory.data.len();
    let mut buf = alloc::vec![0u8; len as usize];
    read(vcb, device, directory, 0, &mut buf)?;

    let mut fids = alloc::vec::Vec::new();
    let mut offset = 0usize;
    while offset + FileIdentifierDescriptorHeader::SIZE <= buf.len() {
        let header = *bytemuck::from_bytes::<FileIdentifierDescriptorHeader>(
            &buf[offset..offset + FileIdentifierDescriptorHeader::SIZE],
        );
        if !header.tag.verify_tag() || header.tag.identifier() != TagIdentifier::FileIdentifierDescriptor {
            break;
        }
        let impl_use_start = offset + FileIdentifierDescriptorHeader::SIZE;
        let impl_use_len = header.length_of_implementation_use.get() as usize;
        let name_start = impl_use_start + impl_use_len;
        let name_len = header.length_of_file_identifier as usize;
        if name_start + name_len > buf.len() {
            break;
        }
        let identifier = if name_len == 0 {
            alloc::string::String::new()
        } else {
            charspec::decode_dstring(&buf[name_start..name_start + name_len]).unwrap_or_default()
        };
        let fid = FileIdentifierDescriptor {
            file_version_number: header.file_version_number.get(),
            file_characteristics: header.file_characteristics,
            icb: header.icb,
            implementation_use: buf[impl_use_start..impl_use_start + impl_use_len].to_vec(),
            file_identifier: identifier,
        };
        let total_len = (FileIdentifierDescriptorHeader::SIZE + impl_use_len + name_len).div_ceil(4) * 4;
        fids.push((fid, offset as u64));
        offset += total_len.max(4);
    }
    Ok(fids)
}

/// Encodes `fid` to its on-disk, 4-byte-aligned, tagged form.
fn encode_fid(fid: &FileIdentifierDescriptor) -> alloc::vec::Vec<u8> {
    let name_bytes = if fid.file_identifier.is_empty() {
        alloc::vec::Vec::new()
    } else {
        charspec::encode_dstring(&fid.file_identifier)
    };
    let total = fid.encoded_len();
    let mut bytes = alloc::vec![0u8; total];

    let mut header = FileIdentifierDescriptorHeader {
        tag: DescriptorTag::new(TagIdentifier::FileIdentifierDescriptor, 0, 0),
        file_version_number: U16::new(fid.file_version_number),
        file_characteristics: fid.file_characteristics,
        length_of_file_identifier: name_bytes.len() as u8,
        icb: fid.icb,
        length_of_implementation_use: U16::new(fid.implementation_use.len() as u16),
    };

    bytes[..FileIdentifierDescriptorHeader::SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    let mut cursor = FileIdentifierDescriptorHeader::SIZE;
    bytes[cursor..cursor + fid.implementation_use.len()].copy_from_slice(&fid.implementation_use);
    cursor += fid.implementation_use.len();
    bytes[cursor..cursor + name_bytes.len()].copy_from_slice(&name_bytes);

    let body_len = FileIdentifierDescriptorHeader::SIZE - DescriptorTag::SIZE + fid.implementation_use.len() + name_bytes.len();
    let body = bytes[DescriptorTag::SIZE..DescriptorTag::SIZE + body_len].to_vec();
    header.tag.finalize(&body);
    bytes[..DescriptorTag::SIZE].copy_from_slice(bytemuck::bytes_of(&header.tag));
    bytes
}

/// Creates a new (empty, in-ICB) file or directory named `name` inside
/// `parent`, appends its FID to the directory index, and returns the new
/// entry's [`FeLocation`] (spec.md §4.G "a new FileInfo is allocated... a
/// new Dloc is created on miss").
pub fn create<T>(
    vcb: &mut Vcb,
    device: &mut BlockDevice<T>,
    parent: &mut LoadedIcb,
    index: &mut DirectoryIndex,
    allocator_index: usize,
    name: &str,
    is_directory: bool,
) -> Result<FeLocation, UdfError>
where
    T: Read + Write + Seek,
{
    if vcb.is_read_only() {
        return Err(UdfError::VolumeReadOnly);
    }
    if index.find(name, true).is_some() {
        return Err(UdfError::NameCollision);
    }
    let directory_lbn = parent.location.lbn;
    let block_size = vcb.geometry.logical_block_size;

    let fe_lbn = match vcb.allocators[allocator_index].charge_fe_block(directory_lbn) {
        Some(lbn) => lbn,
        None => {
            let search_limit = vcb.allocators[allocator_index].free_space.len() as u32;
            let runs = vcb.allocators[allocator_index].alloc(block_size as u64, 0, search_limit, AllocFlags::default())?;
            runs.first().ok_or(UdfError::DiskFull)?.start_lbn
        }
    };
    let location = FeLocation {
        partition_reference_number: parent.location.partition_reference_number,
        lbn: fe_lbn,
    };

    write_fresh_icb(vcb, device, location, is_directory)?;

    let icb_ad = LongAd::new(RunState::Recorded, block_size, fe_lbn, location.partition_reference_number);
    let mut characteristics = FidCharacteristics::empty();
    if is_directory {
        characteristics |= FidCharacteristics::DIRECTORY;
    }
    let fid = FileIdentifierDescriptor {
        file_version_number: 1,
        file_characteristics: characteristics,
        icb: icb_ad,
        implementation_use: alloc::vec::Vec::new(),
        file_identifier: name.into(),
    };
    append_fid(vcb, device, parent, index, allocator_index, fid)?;
    Ok(location)
}

/// Appends `fid`'s encoding to `parent`'s data stream and the in-memory
/// index (spec.md §4.F `grow`).
fn append_fid<T>(
    vcb: &mut Vcb,
    device: &mut BlockDevice<T>,
    parent: &mut LoadedIcb,
    index: &mut DirectoryIndex,
    allocator_index: usize,
    fid: FileIdentifierDescriptor,
) -> Result<(), UdfError>
where
    T: Read + Write + Seek,
{
    let encoded = encode_fid(&fid);
    let offset = parent.data.len();
    resize(vcb, device, parent, allocator_index, offset + encoded.len() as u64)?;
    write(vcb, device, parent, allocator_index, offset, &encoded)?;
    store_icb(vcb, device, parent)?;
    index.push(fid, offset);
    Ok(())
}

/// Removes `name`'s FID from `index` and, if this was the only surviving
/// link, releases the FE's space (spec.md §4.G "Delete-on-close
/// semantics"). `link_ref_count` is supplied by the caller's Dloc lookup:
/// greater than 1 means only the FID should go.
pub fn delete<T>(
    vcb: &mut Vcb,
    device: &mut BlockDevice<T>,
    parent: &LoadedIcb,
    index: &mut DirectoryIndex,
    allocator_index: usize,
    name: &str,
    link_ref_count: usize,
) -> Result<(), UdfError>
where
    T: Read + Write + Seek,
{
    if vcb.is_read_only() {
        return Err(UdfError::VolumeReadOnly);
    }
    let found = index.find(name, true).ok_or(UdfError::NotFound)?;
    let item = index.item(found.index).ok_or(UdfError::NotFound)?.clone();

    if item.fid.is_directory() {
        let child_location = FeLocation {
            partition_reference_number: item.fid.icb.partition_reference_number(),
            lbn: item.fid.icb.position(),
        };
        let child = load_icb(vcb, device, child_location)?;
        let self_icb = LongAd::new(RunState::Recorded, vcb.geometry.logical_block_size, child_location.lbn, child_location.partition_reference_number);
        let child_index = DirectoryIndex::build(scan_directory(vcb, device, &child)?, self_icb, item.fid.icb, vcb.options.pack_threshold);
        if child_index.len() > 2 {
            return Err(UdfError::DirectoryNotEmpty);
        }
    }

    index.mark_deleted(found.index);
    let directory_lbn = parent.location.lbn;

    if link_ref_count <= 1 {
        let location = FeLocation {
            partition_reference_number: item.fid.icb.partition_reference_number(),
            lbn: item.fid.icb.position(),
        };
        let icb = load_icb(vcb, device, location)?;
        if let ExtentInfo::Mapped { runs } = &icb.data {
            vcb.allocators[allocator_index].mark(runs, crate::alloc_space::MarkAs::Free);
        }
        vcb.allocators[allocator_index].release_fe_block(directory_lbn, location.lbn);
    }

    if index.should_pack() {
        let _remap = index.pack();
    }
    Ok(())
}

/// Renames `old_name` to `new_name` within the same directory (spec.md
/// §4.G "cheap case").
pub fn rename_same_directory(index: &mut DirectoryIndex, old_name: &str, new_name: &str) -> Result<(), UdfError> {
    if index.find(new_name, true).is_some() {
        return Err(UdfError::NameCollision);
    }
    let found = index.find(old_name, true).ok_or(UdfError::NotFound)?;
    let item = index.item(found.index).ok_or(UdfError::NotFound)?;
    let icb = item.fid.icb;
    let characteristics = item.fid.file_characteristics;
    index.mark_deleted(found.index);
    let fid = FileIdentifierDescriptor {
        file_version_number: 1,
        file_characteristics: characteristics,
        icb,
        implementation_use: alloc::vec::Vec::new(),
        file_identifier: new_name.into(),
    };
    index.push(fid, 0);
    Ok(())
}

/// Moves an entry from `src_index` to `dst_index` under `dst_name`
/// (spec.md §4.G "requires removing the FID from the source and inserting
/// into the destination with optional overwrite"). Caller is responsible
/// for reaping the delayed-close queue under both directories first.
pub fn rename_cross_directory(
    src_index: &mut DirectoryIndex,
    src_name: &str,
    dst_index: &mut DirectoryIndex,
    dst_name: &str,
    overwrite: bool,
) -> Result<(), UdfError> {
    if let Some(existing) = dst_index.find(dst_name, true) {
        if !overwrite {
            return Err(UdfError::NameCollision);
        }
        dst_index.mark_deleted(existing.index);
    }
    let found = src_index.find(src_name, true).ok_or(UdfError::NotFound)?;
    let item = src_index.item(found.index).ok_or(UdfError::NotFound)?;
    let icb = item.fid.icb;
    let characteristics = item.fid.file_characteristics;
    src_index.mark_deleted(found.index);

    let fid = FileIdentifierDescriptor {
        file_version_number: 1,
        file_characteristics: characteristics,
        icb,
        implementation_use: alloc::vec::Vec::new(),
        file_identifier: dst_name.into(),
    };
    dst_index.push(fid, 0);
    Ok(())
}

/// Resolves the two-step stream path `(file, stream_name)` (spec.md §4.G
/// "Stream directory"): follows `file`'s Extended FE to its stream
/// directory ICB. Fails with [`UdfError::NotFound`] if the file has no
/// Extended FE or no stream directory (spec.md's Non-goals exclude stream
/// content itself; this resolves the ICB location only).
pub fn open_stream_directory<T>(vcb: &mut Vcb, device: &mut BlockDevice<T>, file: FeLocation) -> Result<FeLocation, UdfError>
where
    T: Read + Write + Seek,
{
    let buf = read_tagged_block(vcb, device, file)?;
    let tag = *bytemuck::try_from_bytes::<DescriptorTag>(&buf[..DescriptorTag::SIZE])
        .map_err(|_| UdfError::VolumeCorrupt("icb tag did not decode"))?;
    if tag.identifier() != TagIdentifier::ExtendedFileEntry {
        return Err(UdfError::NotFound);
    }
    let header = *bytemuck::from_bytes::<ExtendedFileEntryHeader>(&buf[..ExtendedFileEntryHeader::SIZE]);
    if header.stream_directory_icb.length() == 0 {
        return Err(UdfError::NotFound);
    }
    Ok(FeLocation {
        partition_reference_number: header.stream_directory_icb.partition_reference_number(),
        lbn: header.stream_directory_icb.position(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::BlockCache,
        descriptors::sparing::SparingTable,
        device::BlockDevice,
        geometry::Geometry,
        instance::{DelayedCloseQueue, DlocTable, OpenFileTable},
        options::MountOptions,
    };
    use std::io::Cursor;

    fn test_geometry() -> Geometry {
        Geometry {
            logical_block_size: 2048,
            last_valid_lba: 900,
            partitions: alloc::vec![crate::geometry::PartitionMap { partition_number: 0, physical_start: 16, length: 900 }],
            sparing_table: None::<SparingTable>,
            instant_burner_compat: false,
            partition_headers: alloc::vec![None],
            integrity_extent: None,
        }
    }

    fn test_vcb() -> (Vcb, BlockDevice<Cursor<alloc::vec::Vec<u8>>>) {
        let device = BlockDevice::new(Cursor::new(vec![0u8; 2048 * 1000]), 2048, 1000);
        let vcb = Vcb {
            geometry: test_geometry(),
            allocators: alloc::vec![crate::alloc_space::SpaceAllocator::new(900, 2048, 32, 8)],
            cache: BlockCache::new(2048, 32, &MountOptions::default()),
            dlocs: DlocTable::new(),
            open_files: OpenFileTable::new(),
            delayed_close: DelayedCloseQueue::new(),
            root_icb: LongAd::new(RunState::Recorded, 2048, 0, 0),
            options: MountOptions::default(),
            read_only: false,
        };
        (vcb, device)
    }

    fn empty_index() -> DirectoryIndex {
        index_with_threshold(128)
    }

    fn index_with_threshold(pack_threshold: usize) -> DirectoryIndex {
        DirectoryIndex::build(
            alloc::vec::Vec::new(),
            LongAd::new(RunState::Recorded, 2048, 0, 0),
            LongAd::new(RunState::Recorded, 2048, 0, 0),
            pack_threshold,
        )
    }

    #[test]
    fn create_then_write_then_read_round_trips_small_file() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut root_index = empty_index();

        let file_location = create(&mut vcb, &mut device, &mut root, &mut root_index, 0, "hello.txt", false).unwrap();
        let mut icb = load_icb(&mut vcb, &mut device, file_location).unwrap();
        let payload = b"The quick brown fox jumps 0123\r\n";
        write(&mut vcb, &mut device, &mut icb, 0, 0, payload).unwrap();
        store_icb(&mut vcb, &mut device, &icb).unwrap();

        let reread = load_icb(&mut vcb, &mut device, file_location).unwrap();
        let mut buf = vec![0u8; payload.len()];
        let n = read(&mut vcb, &mut device, &reread, 0, &mut buf).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&buf, payload);
        assert_eq!(reread.information_length, payload.len() as u64);
        assert!(root_index.find("hello.txt", true).is_some());
    }

    #[test]
    fn create_rejects_name_collision() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut index = empty_index();
        create(&mut vcb, &mut device, &mut root, &mut index, 0, "dup.txt", false).unwrap();
        let result = create(&mut vcb, &mut device, &mut root, &mut index, 0, "dup.txt", false);
        assert!(matches!(result, Err(UdfError::NameCollision)));
    }

    #[test]
    fn rename_same_directory_keeps_single_entry() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut index = empty_index();
        create(&mut vcb, &mut device, &mut root, &mut index, 0, "old.txt", false).unwrap();

        rename_same_directory(&mut index, "old.txt", "new.txt").unwrap();
        assert!(index.find("old.txt", true).is_none());
        assert!(index.find("new.txt", true).is_some());
    }

    #[test]
    fn delete_refuses_non_empty_directory() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut index = empty_index();
        let child_location = create(&mut vcb, &mut device, &mut root, &mut index, 0, "subdir", true).unwrap();

        let mut child = load_icb(&mut vcb, &mut device, child_location).unwrap();
        let mut child_index = empty_index();
        create(&mut vcb, &mut device, &mut child, &mut child_index, 0, "inner.txt", false).unwrap();

        let result = delete(&mut vcb, &mut device, &root, &mut index, 0, "subdir", 1);
        assert!(matches!(result, Err(UdfError::DirectoryNotEmpty)));
    }

    /// S1: a file small enough to fit in the ICB's reserved area never
    /// leaves the `InIcb` representation, even after a write + read cycle.
    #[test]
    fn small_file_write_stays_in_icb_representation() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut index = empty_index();

        let file_location = create(&mut vcb, &mut device, &mut root, &mut index, 0, "small.txt", false).unwrap();
        let mut icb = load_icb(&mut vcb, &mut device, file_location).unwrap();
        write(&mut vcb, &mut device, &mut icb, 0, 0, b"tiny payload").unwrap();
        store_icb(&mut vcb, &mut device, &icb).unwrap();

        let reread = load_icb(&mut vcb, &mut device, file_location).unwrap();
        assert!(matches!(reread.data, ExtentInfo::InIcb { .. }));
    }

    /// S2: a multi-block sequential write is fully readable back before any
    /// explicit flush/store of the ICB happens.
    #[test]
    fn large_sequential_write_reads_back_without_flush() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut index = empty_index();

        let file_location = create(&mut vcb, &mut device, &mut root, &mut index, 0, "big.bin", false).unwrap();
        let mut icb = load_icb(&mut vcb, &mut device, file_location).unwrap();

        let payload: alloc::vec::Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let written = write(&mut vcb, &mut device, &mut icb, 0, 0, &payload).unwrap();
        assert_eq!(written, payload.len());
        assert!(matches!(icb.data, ExtentInfo::Mapped { .. }));

        let mut readback = vec![0u8; payload.len()];
        let n = read(&mut vcb, &mut device, &icb, 0, &mut readback).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(readback, payload);
    }

    /// S3: truncating a file frees its tail blocks back to the allocator and
    /// a read past the new end-of-file returns nothing.
    #[test]
    fn truncate_frees_space_and_shortens_readable_range() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut index = empty_index();

        let file_location = create(&mut vcb, &mut device, &mut root, &mut index, 0, "shrink.bin", false).unwrap();
        let mut icb = load_icb(&mut vcb, &mut device, file_location).unwrap();
        let payload = alloc::vec![0xABu8; 100_000];
        write(&mut vcb, &mut device, &mut icb, 0, 0, &payload).unwrap();
        let count_free = |vcb: &Vcb| (0..vcb.allocators[0].free_space.len()).filter(|&b| vcb.allocators[0].free_space.get(b)).count();
        let free_before = count_free(&vcb);

        resize(&mut vcb, &mut device, &mut icb, 0, 1024).unwrap();
        let free_after = count_free(&vcb);
        assert!(free_after > free_before);
        assert_eq!(icb.information_length, 1024);

        let mut buf = [0u8; 16];
        let n = read(&mut vcb, &mut device, &icb, 2048, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    /// S4: a write far past the current end of file leaves an intervening
    /// sparse hole that reads back as zeros rather than allocating it.
    #[test]
    fn seek_past_eof_write_leaves_sparse_hole() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut index = empty_index();

        let file_location = create(&mut vcb, &mut device, &mut root, &mut index, 0, "sparse.bin", false).unwrap();
        let mut icb = load_icb(&mut vcb, &mut device, file_location).unwrap();
        // First write forces conversion out of InIcb so the hole is modeled
        // as an unrecorded run rather than zero-padded inline bytes.
        write(&mut vcb, &mut device, &mut icb, 0, 0, &alloc::vec![1u8; 40_000]).unwrap();

        let hole_offset = icb.data.len() + 4096;
        write(&mut vcb, &mut device, &mut icb, 0, hole_offset, b"tail").unwrap();

        let mut hole = [0xFFu8; 16];
        let n = read(&mut vcb, &mut device, &icb, icb.data.len() - 16, &mut hole).unwrap();
        assert_eq!(n, 16);
        assert!(hole.iter().all(|&b| b == 0));
    }

    /// S5: packing a directory after many deletions keeps every surviving
    /// entry findable by name.
    #[test]
    fn directory_pack_keeps_surviving_entries_findable() {
        let (mut vcb, mut device) = test_vcb();
        let root_location = FeLocation { partition_reference_number: 0, lbn: 0 };
        write_fresh_icb(&mut vcb, &mut device, root_location, true).unwrap();
        let mut root = load_icb(&mut vcb, &mut device, root_location).unwrap();
        let mut index = index_with_threshold(4);

        for i in 0..10 {
            let name = alloc::format!("file{i}.txt");
            create(&mut vcb, &mut device, &mut root, &mut index, 0, &name, false).unwrap();
        }
        for i in 0..5 {
            let name = alloc::format!("file{i}.txt");
            delete(&mut vcb, &mut device, &root, &mut index, 0, &name, 1).unwrap();
        }
        assert!(index.should_pack() || index.len() < 10);

        for i in 5..10 {
            let name = alloc::format!("file{i}.txt");
            assert!(index.find(&name, true).is_some(), "{name} should survive packing");
        }
        for i in 0..5 {
            let name = alloc::format!("file{i}.txt");
            assert!(index.find(&name, true).is_none(), "{name} should stay gone after packing");
        }
    }
}
