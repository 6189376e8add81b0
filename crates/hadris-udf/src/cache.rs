//! Block Cache (spec.md §4.C): caches fixed block-size buffers keyed by
//! LBA, batches dirty entries into coalesced write-back I/O, and tracks a
//! sequential-write fast path. The pool/index split described in spec.md
//! maps onto a `Vec<CacheEntry>` pool plus a `HashMap<u32, usize>` index,
//! the natural idiomatic-Rust stand-in for a fixed hash table with chaining
//! — the externally observable contract (capacity, eviction policy, flush
//! thresholds) is unchanged.

use crate::{device::BlockDevice, error::UdfError, options::MountOptions};
use hadris_io::{Read, Seek, SeekFrom, Write};
use std::collections::HashMap;
use std::time::Instant;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct EntryFlags: u8 {
        const VALID = 1 << 0;
        const MODIFIED = 1 << 1;
        const FLUSHING = 1 << 2;
        const BAD = 1 << 3;
    }
}

struct CacheEntry {
    lba: u32,
    buf: Vec<u8>,
    flags: EntryFlags,
    last_access: Instant,
}

/// Caches fixed-size blocks read from/written to a [`BlockDevice`]. Holds
/// its own copy of the relevant [`MountOptions`] thresholds so callers don't
/// need to thread them through every call.
pub struct BlockCache {
    block_size: u32,
    capacity: usize,
    pool: Vec<CacheEntry>,
    index: HashMap<u32, usize>,
    dirty_list: Vec<usize>,
    dirty_threshold: usize,
    flush_interval_ms: u64,
    max_coalesce_distance: u32,
    sequential_threshold: u32,
    last_flush: Instant,
    last_written_lba: Option<u32>,
    sequential_run: u32,
}

impl BlockCache {
    pub fn new(block_size: u32, capacity: usize, options: &MountOptions) -> Self {
        Self {
            block_size,
            capacity,
            pool: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity * 2),
            dirty_list: Vec::new(),
            dirty_threshold: options.dirty_threshold,
            flush_interval_ms: options.flush_interval_ms,
            max_coalesce_distance: options.max_coalesce_distance,
            sequential_threshold: options.sequential_threshold,
            last_flush: Instant::now(),
            last_written_lba: None,
            sequential_run: 0,
        }
    }

    fn in_sequential_mode(&self) -> bool {
        self.sequential_run >= self.sequential_threshold
    }

    fn dirty_flush_threshold(&self) -> usize {
        if self.in_sequential_mode() {
            (self.dirty_threshold * 3) / 4
        } else {
            self.dirty_threshold
        }
    }

    fn find_slot(&self, lba: u32) -> Option<usize> {
        self.index.get(&lba).copied()
    }

    /// Looks up `lba`, stamping `last_access` on a hit (spec.md §4.C
    /// `find`).
    fn find(&mut self, lba: u32) -> Option<usize> {
        let slot = self.find_slot(lba)?;
        self.pool[slot].last_access = Instant::now();
        Some(slot)
    }

    /// Reads one block, serving it from cache on a hit or reading through
    /// to the device and inserting on a miss.
    pub fn read_block<T>(&mut self, device: &mut BlockDevice<T>, lba: u32) -> Result<Vec<u8>, UdfError>
    where
        T: Read + Write + Seek,
    {
        if let Some(slot) = self.find(lba) {
            return Ok(self.pool[slot].buf.clone());
        }
        let mut buf = vec![0u8; self.block_size as usize];
        device.read_sectors(lba as u64, &mut buf)?;
        self.insert_clean(device, lba, buf.clone())?;
        Ok(buf)
    }

    fn insert_clean<T>(&mut self, device: &mut BlockDevice<T>, lba: u32, buf: Vec<u8>) -> Result<(), UdfError>
    where
        T: Read + Write + Seek,
    {
        let slot = self.reserve_slot(device, lba)?;
        self.pool[slot] = CacheEntry {
            lba,
            buf,
            flags: EntryFlags::VALID,
            last_access: Instant::now(),
        };
        self.index.insert(lba, slot);
        Ok(())
    }

    /// Returns a pool slot for `lba`, evicting the least-recently-used
    /// valid entry when the pool is full. If the victim is dirty it is
    /// flushed inline before its slot is reused, so no write is lost and no
    /// stale slot index is left in the dirty list (spec.md §4.C
    /// "Eviction").
    fn reserve_slot<T>(&mut self, device: &mut BlockDevice<T>, lba: u32) -> Result<usize, UdfError>
    where
        T: Read + Write + Seek,
    {
        if self.pool.len() < self.capacity {
            self.pool.push(CacheEntry {
                lba,
                buf: Vec::new(),
                flags: EntryFlags::empty(),
                last_access: Instant::now(),
            });
            return Ok(self.pool.len() - 1);
        }
        let victim = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, e)| e.flags.contains(EntryFlags::VALID))
            .min_by_key(|(_, e)| e.last_access)
            .map(|(i, _)| i)
            .unwrap_or(0);
        if self.pool[victim].flags.contains(EntryFlags::MODIFIED) {
            self.pool[victim].flags.insert(EntryFlags::FLUSHING);
            self.flush_run(device, &[victim])?;
            self.pool[victim].flags.remove(EntryFlags::MODIFIED | EntryFlags::FLUSHING);
            self.dirty_list.retain(|&slot| slot != victim);
        }
        self.index.remove(&self.pool[victim].lba);
        Ok(victim)
    }

    /// Writes `buf` (one or more whole blocks) starting at `lba`, marking
    /// the touched entries modified and appending them to the dirty list.
    /// With `cached_only` false the cache may opportunistically flush but
    /// is not obligated to before returning (spec.md §4.C "Write
    /// contract").
    pub fn write_blocks<T>(
        &mut self,
        device: &mut BlockDevice<T>,
        lba: u32,
        buf: &[u8],
        cached_only: bool,
    ) -> Result<(), UdfError>
    where
        T: Read + Write + Seek,
    {
        let block_size = self.block_size as usize;
        if buf.len() % block_size != 0 {
            return Err(UdfError::InvalidParameter(
                "write_blocks buffer is not a whole number of blocks",
            ));
        }
        self.note_write_order(lba);

        for (i, chunk) in buf.chunks(block_size).enumerate() {
            let block_lba = lba + i as u32;
            let slot = match self.find_slot(block_lba) {
                Some(slot) => slot,
                None => self.reserve_slot(device, block_lba)?,
            };
            self.pool[slot] = CacheEntry {
                lba: block_lba,
                buf: chunk.to_vec(),
                flags: EntryFlags::VALID | EntryFlags::MODIFIED,
                last_access: Instant::now(),
            };
            self.index.insert(block_lba, slot);
            self.dirty_list.push(slot);
        }

        if !cached_only && self.should_flush() {
            self.flush_all(device)?;
        }
        Ok(())
    }

    fn note_write_order(&mut self, lba: u32) {
        match self.last_written_lba {
            Some(prev) if prev + 1 == lba => self.sequential_run += 1,
            _ => self.sequential_run = 0,
        }
        self.last_written_lba = Some(lba + 1);
    }

    /// Whether the flush policy in spec.md §4.C fires: the dirty count
    /// threshold (adjusted for sequential mode), or the flush interval has
    /// elapsed with at least one dirty block outstanding.
    fn should_flush(&self) -> bool {
        if self.dirty_list.is_empty() {
            return false;
        }
        self.dirty_list.len() >= self.dirty_flush_threshold()
            || self.last_flush.elapsed().as_millis() as u64 >= self.flush_interval_ms
    }

    /// Flushes every dirty entry, coalescing contiguous runs (within
    /// [`MountOptions::max_coalesce_distance`]) into single writes. Falls
    /// back to per-entry writes if the coalesce buffer cannot be
    /// allocated.
    pub fn flush_all<T>(&mut self, device: &mut BlockDevice<T>) -> Result<(), UdfError>
    where
        T: Read + Write + Seek,
    {
        if self.dirty_list.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }

        let mut slots: Vec<usize> = core::mem::take(&mut self.dirty_list);
        slots.sort_by_key(|&slot| self.pool[slot].lba);
        slots.dedup();

        for slot in &slots {
            self.pool[*slot].flags.insert(EntryFlags::FLUSHING);
        }

        let mut i = 0;
        while i < slots.len() {
            let mut j = i + 1;
            let mut run_end_lba = self.pool[slots[i]].lba;
            while j < slots.len() {
                let gap = self.pool[slots[j]].lba - run_end_lba;
                if gap > self.max_coalesce_distance {
                    break;
                }
                run_end_lba = self.pool[slots[j]].lba;
                j += 1;
            }
            self.flush_run(device, &slots[i..j])?;
            i = j;
        }

        for slot in &slots {
            let entry = &mut self.pool[*slot];
            entry.flags.remove(EntryFlags::MODIFIED | EntryFlags::FLUSHING);
        }
        self.last_flush = Instant::now();
        Ok(())
    }

    fn flush_run<T>(&mut self, device: &mut BlockDevice<T>, run: &[usize]) -> Result<(), UdfError>
    where
        T: Read + Write + Seek,
    {
        let start_lba = self.pool[run[0]].lba;
        let end_lba = self.pool[*run.last().unwrap()].lba;
        let span_blocks = (end_lba - start_lba + 1) as usize;
        let block_size = self.block_size as usize;

        let mut coalesce_buf: Vec<u8> = Vec::new();
        let mut coalesced = if coalesce_buf.try_reserve_exact(span_blocks * block_size).is_ok() {
            coalesce_buf.resize(span_blocks * block_size, 0);
            Some(coalesce_buf)
        } else {
            None
        };

        match &mut coalesced {
            Some(buf) => {
                for &slot in run {
                    let offset = (self.pool[slot].lba - start_lba) as usize * block_size;
                    buf[offset..offset + block_size].copy_from_slice(&self.pool[slot].buf);
                }
                device.write_sectors(start_lba as u64, buf)?;
            }
            None => {
                log::warn!("coalesce buffer allocation failed, falling back to per-entry flush");
                for &slot in run {
                    let lba = self.pool[slot].lba;
                    let buf = self.pool[slot].buf.clone();
                    device.write_sectors(lba as u64, &buf)?;
                }
            }
        }
        Ok(())
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn device(sectors: u64, block: u32) -> BlockDevice<Cursor<Vec<u8>>> {
        BlockDevice::new(Cursor::new(vec![0u8; (sectors * block as u64) as usize]), block, sectors)
    }

    #[test]
    fn write_then_read_hits_cache_without_touching_device() {
        let mut dev = device(64, 2048);
        let mut options = MountOptions::default();
        options.dirty_threshold = 1000;
        let mut cache = BlockCache::new(2048, 8, &options);
        cache.write_blocks(&mut dev, 4, &[0xCDu8; 2048], true).unwrap();
        let read_back = cache.read_block(&mut dev, 4).unwrap();
        assert_eq!(read_back, vec![0xCDu8; 2048]);
        assert_eq!(cache.dirty_count(), 1);
    }

    #[test]
    fn flush_all_clears_dirty_list() {
        let mut dev = device(64, 2048);
        let options = MountOptions::default();
        let mut cache = BlockCache::new(2048, 8, &options);
        cache.write_blocks(&mut dev, 4, &[0xAAu8; 2048 * 2], true).unwrap();
        assert_eq!(cache.dirty_count(), 2);
        cache.flush_all(&mut dev).unwrap();
        assert_eq!(cache.dirty_count(), 0);
        let mut out = vec![0u8; 2048];
        dev.read_sectors(4, &mut out).unwrap();
        assert_eq!(out, vec![0xAAu8; 2048]);
    }

    #[test]
    fn eviction_picks_least_recently_used_entry() {
        let mut dev = device(64, 2048);
        let options = MountOptions::default();
        let mut cache = BlockCache::new(2048, 2, &options);
        cache.read_block(&mut dev, 0).unwrap();
        cache.read_block(&mut dev, 1).unwrap();
        // Touch lba 0 so it is no longer the least-recently-used entry.
        cache.read_block(&mut dev, 0).unwrap();
        cache.read_block(&mut dev, 2).unwrap();
        assert!(cache.find_slot(0).is_some());
        assert!(cache.find_slot(1).is_none());
    }

    #[test]
    fn sequential_writes_enter_sequential_mode() {
        let mut dev = device(64, 2048);
        let options = MountOptions::default();
        let mut cache = BlockCache::new(2048, 16, &options);
        for lba in 0..5 {
            cache.write_blocks(&mut dev, lba, &[0u8; 2048], true).unwrap();
        }
        assert!(cache.in_sequential_mode());
    }
}
