//! Sparing Table (UDF 2.60 §2.2.12 / OSTA-UDF Appendix B): the CD-RW/rewritable
//! packet-media defect-remapping table spec.md §4.B's `remap_packet` and
//! §9's `NoSpareAction` operate on. Not tagged (ECMA-167 tags only cover
//! Volume Recognition / Volume Descriptor Sequence structures); instead it
//! carries its own `SparingIdentifier` + entry count header.

use super::regid::EntityId;
use hadris_common::types::{
    endian::{Endian, LittleEndian},
    number::{U16, U32},
};

/// Fixed header of a Sparing Table; `reserved_entry_count` entries of
/// [`SparingEntry`] follow immediately in the backing buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SparingTableHeader {
    pub sparing_identifier: EntityId,
    pub reallocation_table_length: U16<LittleEndian>,
    reserved: U16<LittleEndian>,
    pub sequence_number: U32<LittleEndian>,
}

impl SparingTableHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(reallocation_table_length: u16, sequence_number: u32) -> Self {
        Self {
            sparing_identifier: EntityId::new("*UDF Sparing Table"),
            reallocation_table_length: U16::new(reallocation_table_length),
            reserved: U16::new(0),
            sequence_number: U32::new(sequence_number),
        }
    }
}

/// One remap entry: a packet's original logical block, and the spare
/// location it has been redirected to. `0xFFFFFFFF` in `mapped_location`
/// marks a still-free spare slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SparingEntry {
    original_location: U32<LittleEndian>,
    mapped_location: U32<LittleEndian>,
}

impl SparingEntry {
    pub const UNALLOCATED: u32 = 0xFFFF_FFFF;

    pub fn free() -> Self {
        Self {
            original_location: U32::new(Self::UNALLOCATED),
            mapped_location: U32::new(Self::UNALLOCATED),
        }
    }

    pub fn mapping(original: u32, mapped: u32) -> Self {
        Self {
            original_location: U32::new(original),
            mapped_location: U32::new(mapped),
        }
    }

    pub fn is_free(&self) -> bool {
        self.mapped_location.get() == Self::UNALLOCATED
    }

    pub fn original_location(&self) -> u32 {
        self.original_location.get()
    }

    pub fn mapped_location(&self) -> u32 {
        self.mapped_location.get()
    }
}

/// In-memory view over a decoded Sparing Table, giving the packet lookup
/// `remap_packet` needs without re-scanning the raw entry array on every
/// call.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone)]
pub struct SparingTable {
    pub packet_length: u32,
    entries: alloc::vec::Vec<SparingEntry>,
}

#[cfg(feature = "alloc")]
impl SparingTable {
    pub fn new(packet_length: u32, entries: alloc::vec::Vec<SparingEntry>) -> Self {
        Self { packet_length, entries }
    }

    /// Returns the spare location for `packet_start_lbn`, if this packet has
    /// already been remapped.
    pub fn lookup(&self, packet_start_lbn: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| !e.is_free() && e.original_location() == packet_start_lbn)
            .map(SparingEntry::mapped_location)
    }

    /// The first unused entry, or `None` if the table is exhausted
    /// (spec.md §9 `NoSpareAction`).
    pub fn first_free_entry_mut(&mut self) -> Option<&mut SparingEntry> {
        self.entries.iter_mut().find(|e| e.is_free())
    }

    pub fn entries(&self) -> &[SparingEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> core::slice::IterMut<'_, SparingEntry> {
        self.entries.iter_mut()
    }
}

#[cfg(all(test, feature = "alloc"))]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_remapped_packet() {
        let table = SparingTable::new(
            32,
            alloc::vec![SparingEntry::mapping(0, 1000), SparingEntry::free()],
        );
        assert_eq!(table.lookup(0), Some(1000));
        assert_eq!(table.lookup(32), None);
    }

    #[test]
    fn first_free_entry_is_none_when_exhausted() {
        let mut table = SparingTable::new(32, alloc::vec![SparingEntry::mapping(0, 1000)]);
        assert!(table.first_free_entry_mut().is_none());
    }
}
