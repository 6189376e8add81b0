//! Space Allocator (spec.md §4.D): free/zero/bad block bitmaps, best-fit
//! extent selection, and the small per-partition FE allocation charge cache
//! that keeps a directory's file-entry blocks from scattering across the
//! volume.

use crate::descriptors::ad::{ExtentRun, RunState};
use crate::error::UdfError;

/// One bit per block; word-scanned the way spec.md §4.D's `run_length_at`
/// describes ("scanning 32 bits at a time"). Bit set = the asserted
/// condition (free / known-zero / bad, depending which bitmap this backs).
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: alloc::vec::Vec<u32>,
    len_bits: usize,
}

impl Bitmap {
    /// A fresh bitmap of `len_bits` bits, all set to `initial`.
    pub fn new(len_bits: usize, initial: bool) -> Self {
        let word_count = len_bits.div_ceil(32);
        let fill = if initial { u32::MAX } else { 0 };
        Self { words: alloc::vec![fill; word_count], len_bits }
    }

    /// Unpacks an on-disk Space Bitmap Descriptor's bit array (ECMA-167
    /// §14.12, LSB-first per byte) into a bitmap of `len_bits` bits
    /// (spec.md §6 "Space Bitmap Descriptor").
    pub fn from_bytes(bytes: &[u8], len_bits: usize) -> Self {
        let word_count = len_bits.div_ceil(32);
        let mut words = alloc::vec![0u32; word_count];
        for (i, chunk) in bytes.chunks(4).enumerate() {
            if i >= words.len() {
                break;
            }
            let mut word_bytes = [0u8; 4];
            word_bytes[..chunk.len()].copy_from_slice(chunk);
            words[i] = u32::from_le_bytes(word_bytes);
        }
        Self { words, len_bits }
    }

    /// Packs this bitmap back into the LSB-first-per-byte on-disk form
    /// (spec.md §6), truncated to exactly `len_bits.div_ceil(8)` bytes.
    pub fn to_bytes(&self) -> alloc::vec::Vec<u8> {
        let mut out = alloc::vec::Vec::with_capacity(self.words.len() * 4);
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.truncate(self.len_bits.div_ceil(8));
        out
    }

    /// Sets every bit `other` has set (a bitwise OR), used to fold an
    /// on-disk Unallocated/Freed Space Bitmap into the in-memory free-space
    /// bitmap at mount (spec.md §6).
    pub fn merge_or(&mut self, other: &Bitmap) {
        for bit in 0..self.len_bits.min(other.len_bits) {
            if other.get(bit) {
                self.set(bit, true);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len_bits
    }

    /// Number of set bits, truncated to `len_bits` (the tail bits of the
    /// last word past `len_bits` are not guaranteed clear). Used to report
    /// a partition's free-block count in the Logical Volume Integrity
    /// Descriptor (spec.md §6, §9).
    pub fn count_set(&self) -> usize {
        (0..self.len_bits).filter(|&bit| self.get(bit)).count()
    }

    pub fn get(&self, bit: usize) -> bool {
        if bit >= self.len_bits {
            return false;
        }
        (self.words[bit / 32] >> (bit % 32)) & 1 != 0
    }

    pub fn set(&mut self, bit: usize, value: bool) {
        if bit >= self.len_bits {
            return;
        }
        let word = &mut self.words[bit / 32];
        if value {
            *word |= 1 << (bit % 32);
        } else {
            *word &= !(1 << (bit % 32));
        }
    }

    pub fn set_range(&mut self, start: usize, len: usize, value: bool) {
        for bit in start..(start + len).min(self.len_bits) {
            self.set(bit, value);
        }
    }

    /// Length of the maximal run of bits equal to `self.get(offset)`
    /// starting at `offset`, bounded by `limit` (spec.md §4.D
    /// `run_length_at`).
    pub fn run_length_at(&self, offset: usize, limit: usize) -> usize {
        if offset >= self.len_bits || limit == 0 {
            return 0;
        }
        let target = self.get(offset);
        let end = (offset + limit).min(self.len_bits);
        let mut pos = offset;
        while pos < end {
            let word_index = pos / 32;
            let bit_in_word = pos % 32;
            let word = self.words[word_index];
            let word_as_target = if target { word } else { !word };
            let bits_left_in_word = (32 - bit_in_word).min(end - pos);
            let shifted = word_as_target >> bit_in_word;
            let run_in_word = (!shifted).trailing_zeros() as usize;
            let run_here = run_in_word.min(bits_left_in_word);
            pos += run_here;
            if run_here < bits_left_in_word {
                break;
            }
        }
        pos - offset
    }

    /// Finds the smallest free run at or after `search_start`, bounded by
    /// `search_limit`, that is at least `min_length` bits long. Falls back
    /// to the largest run seen if none is long enough (spec.md §4.D
    /// `find_min_suitable_extent`).
    pub fn find_min_suitable_run(
        &self,
        min_length: usize,
        search_start: usize,
        search_limit: usize,
    ) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        let mut largest: Option<(usize, usize)> = None;
        let mut pos = search_start;
        let end = (search_start + search_limit).min(self.len_bits);
        while pos < end {
            if self.get(pos) {
                let run = self.run_length_at(pos, end - pos);
                if run >= min_length && best.map(|(_, l)| run < l).unwrap_or(true) {
                    best = Some((pos, run));
                }
                if largest.map(|(_, l)| run > l).unwrap_or(true) {
                    largest = Some((pos, run));
                }
                pos += run.max(1);
            } else {
                pos += self.run_length_at(pos, end - pos).max(1);
            }
        }
        best.or(largest)
    }
}

/// Extent selection policy (spec.md §4.D "Policy flags").
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocFlags {
    pub verify: bool,
    pub alloc_sequential: bool,
    pub cd_r_mode: bool,
}

/// The 30-bit field every allocation descriptor's length shares with its
/// 2-bit run state tag (spec.md §4.E / ECMA-167 §14.14.1.1).
pub const MAX_EXTENT_LENGTH: u32 = 0x3FFF_FFFF;

/// One freed, FE-sized run held in the allocation charge cache, tagged by
/// the directory that last used it so a subsequent create in that
/// directory is handed a nearby block (spec.md §4.D "FE Allocation
/// Charge").
#[derive(Debug, Clone, Copy)]
struct ChargedRun {
    directory_lbn: u32,
    lbn: u32,
}

/// Free/zero/bad bitmaps for one partition, plus the FE allocation charge
/// cache spec.md §4.D describes as per-partition.
pub struct SpaceAllocator {
    pub free_space: Bitmap,
    pub zero_space: Bitmap,
    pub bad_space: Bitmap,
    block_size: u32,
    packet_size: u32,
    fe_charge_cache: alloc::vec::Vec<ChargedRun>,
    fe_charge_cache_size: usize,
}

/// What [`SpaceAllocator::mark`] should do to each block in a mapping
/// (spec.md §4.D `mark`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkAs {
    Free,
    Used,
    Bad,
    Discarded,
}

impl SpaceAllocator {
    pub fn new(last_valid_lba: u32, block_size: u32, packet_size: u32, fe_charge_cache_size: usize) -> Self {
        let len_bits = last_valid_lba as usize + 1;
        Self {
            free_space: Bitmap::new(len_bits, true),
            zero_space: Bitmap::new(len_bits, false),
            bad_space: Bitmap::new(len_bits, false),
            block_size,
            packet_size,
            fe_charge_cache: alloc::vec::Vec::new(),
            fe_charge_cache_size,
        }
    }

    /// Scans for the smallest suitable free extent, preferring packet
    /// alignment when `length` is a multiple of the packet size and the
    /// allocator isn't in CD-R mode (spec.md §4.D
    /// `find_min_suitable_extent`).
    pub fn find_min_suitable_extent(
        &self,
        length: u32,
        search_start: u32,
        search_limit: u32,
        flags: AllocFlags,
    ) -> Option<(u32, u32)> {
        let length = length.min(MAX_EXTENT_LENGTH);
        let wants_alignment =
            !flags.cd_r_mode && (flags.alloc_sequential || length % self.packet_size == 0);

        if wants_alignment {
            if let Some((lba, len)) = self.find_aligned(length, search_start, search_limit) {
                return Some((lba, len));
            }
        }
        self.free_space
            .find_min_suitable_run(length as usize, search_start as usize, search_limit as usize)
            .map(|(lba, len)| (lba as u32, len as u32))
    }

    fn find_aligned(&self, length: u32, search_start: u32, search_limit: u32) -> Option<(u32, u32)> {
        let mut pos = search_start.div_ceil(self.packet_size) * self.packet_size;
        let end = search_start + search_limit;
        while pos < end {
            let run = self.free_space.run_length_at(pos as usize, (end - pos) as usize) as u32;
            if run >= length {
                return Some((pos, run));
            }
            pos += self.packet_size.max(1);
        }
        None
    }

    /// Allocates `length_bytes` worth of blocks, possibly spanning several
    /// runs, rejecting partial satisfaction as [`UdfError::DiskFull`]
    /// (spec.md §4.D `alloc`).
    pub fn alloc(
        &mut self,
        length_bytes: u64,
        search_start: u32,
        search_limit: u32,
        flags: AllocFlags,
    ) -> Result<alloc::vec::Vec<ExtentRun>, UdfError> {
        let mut remaining = length_bytes.div_ceil(self.block_size as u64) as u32;
        let mut runs: alloc::vec::Vec<ExtentRun> = alloc::vec::Vec::new();
        let mut cursor = search_start;

        while remaining > 0 {
            let Some((lba, len)) =
                self.find_min_suitable_extent(remaining, cursor, search_limit, flags)
            else {
                self.rollback(&runs);
                return Err(UdfError::DiskFull);
            };
            let take = len.min(remaining);

            if flags.verify && self.bad_space.run_length_at(lba as usize, take as usize) != 0 {
                self.rollback(&runs);
                return Err(UdfError::VolumeCorrupt("allocated extent intersects bad-block bitmap"));
            }

            self.free_space.set_range(lba as usize, take as usize, false);
            self.zero_space.set_range(lba as usize, take as usize, true);

            runs.push(ExtentRun {
                start_lbn: lba,
                length: take * self.block_size,
                partition_reference_number: 0,
                state: RunState::Recorded,
            });
            remaining -= take;
            cursor = lba + take;
        }

        Ok(crate::extent::merge_adjacent(runs, self.block_size))
    }

    fn rollback(&mut self, runs: &[ExtentRun]) {
        for run in runs {
            let blocks = run.length / self.block_size;
            self.free_space.set_range(run.start_lbn as usize, blocks as usize, true);
        }
    }

    /// Updates the bitmaps to reflect `mapping` transitioning to state
    /// `as_` (spec.md §4.D `mark`).
    pub fn mark(&mut self, mapping: &[ExtentRun], as_: MarkAs) {
        for run in mapping {
            let blocks = (run.length / self.block_size) as usize;
            let start = run.start_lbn as usize;
            match as_ {
                MarkAs::Used => self.free_space.set_range(start, blocks, false),
                MarkAs::Free => {
                    for bit in start..(start + blocks).min(self.free_space.len()) {
                        if !self.bad_space.get(bit) {
                            self.free_space.set(bit, true);
                        }
                    }
                }
                MarkAs::Bad => self.bad_space.set_range(start, blocks, true),
                MarkAs::Discarded => {
                    self.free_space.set_range(start, blocks, true);
                    self.zero_space.set_range(start, blocks, false);
                }
            }
        }
    }

    /// Asks the FE allocation charge cache for a block near
    /// `directory_lbn` before falling back to the global bitmap search
    /// (spec.md §4.D "FE Allocation Charge").
    pub fn charge_fe_block(&mut self, directory_lbn: u32) -> Option<u32> {
        let index = self
            .fe_charge_cache
            .iter()
            .position(|r| r.directory_lbn == directory_lbn)?;
        Some(self.fe_charge_cache.swap_remove(index).lbn)
    }

    /// Hands a freed FE block back to the charge cache rather than the
    /// global bitmap, up to the configured cache size; excess is marked
    /// free normally.
    pub fn release_fe_block(&mut self, directory_lbn: u32, lbn: u32) {
        if self.fe_charge_cache.len() >= self.fe_charge_cache_size {
            self.free_space.set(lbn as usize, true);
            return;
        }
        self.fe_charge_cache.push(ChargedRun { directory_lbn, lbn });
    }

    /// Flushes the FE allocation charge cache back to the global bitmap
    /// (spec.md §4.D, run at dismount).
    pub fn flush_fe_charge_cache(&mut self) {
        for run in self.fe_charge_cache.drain(..) {
            self.free_space.set(run.lbn as usize, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_length_at_stops_at_boundary() {
        let mut bitmap = Bitmap::new(128, true);
        bitmap.set(10, false);
        assert_eq!(bitmap.run_length_at(0, 128), 10);
    }

    #[test]
    fn find_min_suitable_run_prefers_smallest_fit() {
        let mut bitmap = Bitmap::new(64, false);
        bitmap.set_range(0, 4, true);
        bitmap.set_range(20, 10, true);
        let (lba, len) = bitmap.find_min_suitable_run(3, 0, 64).unwrap();
        assert_eq!((lba, len), (0, 4));
    }

    #[test]
    fn find_min_suitable_run_falls_back_to_largest() {
        let mut bitmap = Bitmap::new(64, false);
        bitmap.set_range(0, 2, true);
        let result = bitmap.find_min_suitable_run(5, 0, 64).unwrap();
        assert_eq!(result, (0, 2));
    }

    #[test]
    fn alloc_fails_disk_full_and_rolls_back() {
        let mut allocator = SpaceAllocator::new(63, 2048, 32, 4);
        allocator.free_space = Bitmap::new(64, false);
        allocator.free_space.set_range(0, 4, true);
        let result = allocator.alloc(2048 * 10, 0, 64, AllocFlags::default());
        assert!(matches!(result, Err(UdfError::DiskFull)));
        assert_eq!(allocator.free_space.run_length_at(0, 64), 4);
    }

    #[test]
    fn mark_discarded_clears_zero_space() {
        let mut allocator = SpaceAllocator::new(63, 2048, 32, 4);
        let run = ExtentRun { start_lbn: 0, length: 2048 * 4, partition_reference_number: 0, state: RunState::Recorded };
        allocator.mark(&[run], MarkAs::Used);
        allocator.zero_space.set_range(0, 4, true);
        allocator.mark(&[run], MarkAs::Discarded);
        assert!(allocator.free_space.get(0));
        assert!(!allocator.zero_space.get(0));
    }

    #[test]
    fn fe_charge_cache_returns_block_for_matching_directory() {
        let mut allocator = SpaceAllocator::new(63, 2048, 32, 4);
        allocator.release_fe_block(100, 7);
        assert_eq!(allocator.charge_fe_block(100), Some(7));
        assert_eq!(allocator.charge_fe_block(100), None);
    }
}
