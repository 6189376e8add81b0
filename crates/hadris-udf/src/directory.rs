//! Directory Index (spec.md §4.F): the in-memory, frame-paged view over a
//! directory's FID sequence that every lookup in spec.md §4.G goes through
//! instead of re-scanning the raw extent on every `find`.

use crate::descriptors::fid::{FidCharacteristics, FileIdentifierDescriptor};

/// Three independent name hashes computed once per lookup and compared
/// against each item's stored hashes before falling back to a real string
/// comparison (spec.md §4.F `find`). `dos_8_3` is `None` when the name
/// cannot be represented in 8.3 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameHashes {
    pub posix: u32,
    pub long_filename: u32,
    pub dos_8_3: Option<u32>,
}

impl NameHashes {
    pub fn compute(name: &str) -> Self {
        Self {
            posix: posix_hash(name),
            long_filename: long_filename_hash(name),
            dos_8_3: dos_short_name(name).map(|short| posix_hash(&short)),
        }
    }
}

fn posix_hash(name: &str) -> u32 {
    // A simple case-sensitive FNV-1a style hash; collisions only cost a
    // skipped fast-path comparison, never correctness.
    let mut hash: u32 = 2166136261;
    for byte in name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

fn long_filename_hash(name: &str) -> u32 {
    // Case-folded variant of the same hash, so a case-insensitive lookup
    // can still short-circuit on a hash mismatch.
    let mut hash: u32 = 2166136261;
    for c in name.chars().flat_map(|c| c.to_lowercase()) {
        let mut buf = [0u8; 4];
        for byte in c.encode_utf8(&mut buf).bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(16777619);
        }
    }
    hash
}

/// Best-effort 8.3 short-name synthesis (uppercase, truncate to 8.3,
/// replace characters DOS can't represent with `_`). Returns `None` when
/// the name already fits losslessly and therefore has no separate DOS
/// form worth indexing.
fn dos_short_name(name: &str) -> Option<alloc::string::String> {
    if !name.is_ascii() {
        return Some(alloc::string::String::from("~1"));
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) => (s, e),
        None => (name, ""),
    };
    let needs_shortening = stem.len() > 8 || ext.len() > 3 || name.contains(' ');
    if !needs_shortening {
        return None;
    }
    let sanitize = |s: &str, max: usize| -> alloc::string::String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .take(max)
            .flat_map(|c| c.to_uppercase())
            .collect()
    };
    let mut short = sanitize(stem, 6);
    short.push_str("~1");
    if !ext.is_empty() {
        short.push('.');
        short.push_str(&sanitize(ext, 3));
    }
    Some(short)
}

/// One slot in the directory index: a decoded FID, its precomputed hashes,
/// and the byte offset into the directory's data extent it was read from
/// (needed to rewrite the FID in place when an attribute changes).
#[derive(Debug, Clone)]
pub struct DirectoryIndexItem {
    pub fid: FileIdentifierDescriptor,
    pub hashes: NameHashes,
    pub extent_offset: u64,
}

/// The frame-paged array spec.md §4.F describes, flattened to a growable
/// `Vec` — frames only matter for the on-disk layout's allocation
/// granularity, which [`DirectoryIndex::grow`] still models explicitly.
pub struct DirectoryIndex {
    items: alloc::vec::Vec<DirectoryIndexItem>,
    frame_item_capacity: usize,
    deleted_count: usize,
    pack_threshold: usize,
}

/// Outcome of a [`DirectoryIndex::find`] lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundEntry {
    pub index: usize,
}

impl DirectoryIndex {
    /// Builds an index from an already-decoded FID sequence, synthesising
    /// the "." and ".." entries at indices 0 and 1 (spec.md §4.F "Build").
    pub fn build(
        mut fids: alloc::vec::Vec<(FileIdentifierDescriptor, u64)>,
        self_icb: crate::descriptors::ad::LongAd,
        parent_icb: crate::descriptors::ad::LongAd,
        pack_threshold: usize,
    ) -> Self {
        let mut items = alloc::vec::Vec::with_capacity(fids.len() + 2);
        items.push(synth_entry(".", self_icb, true));
        items.push(synth_entry("..", parent_icb, true));

        let mut deleted_count = 0;
        for (fid, offset) in fids.drain(..) {
            if fid.is_deleted() {
                deleted_count += 1;
            }
            let hashes = NameHashes::compute(&fid.file_identifier);
            items.push(DirectoryIndexItem { fid, hashes, extent_offset: offset });
        }

        Self {
            items,
            frame_item_capacity: next_power_of_two(items.len().max(16)),
            deleted_count,
            pack_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, index: usize) -> Option<&DirectoryIndexItem> {
        self.items.get(index)
    }

    /// Looks up `name`, comparing by the precomputed hashes first and
    /// falling back to a real string comparison only on a hash match
    /// (spec.md §4.F `find`). Indices 0/1 ("." / "..") compare specially.
    pub fn find(&self, name: &str, case_sensitive: bool) -> Option<FoundEntry> {
        if name == "." {
            return Some(FoundEntry { index: 0 });
        }
        if name == ".." {
            return Some(FoundEntry { index: 1 });
        }

        let search = NameHashes::compute(name);
        for (index, item) in self.items.iter().enumerate().skip(2) {
            if item.fid.is_deleted() || item.fid.file_identifier.is_empty() {
                continue;
            }
            if !hashes_could_match(&search, &item.hashes) {
                continue;
            }
            let matches = if case_sensitive {
                item.fid.file_identifier == name
            } else {
                item.fid.file_identifier.eq_ignore_ascii_case(name)
            };
            if matches {
                return Some(FoundEntry { index });
            }
        }
        None
    }

    /// Increases the last frame's item count by `d`, allocating a new
    /// power-of-two frame if the per-frame cap is crossed (spec.md §4.F
    /// `grow`). Truncation (`d < 0` in spec terms) is symmetric; callers
    /// pass a negative delta through [`Self::truncate`] instead.
    pub fn grow(&mut self, d: usize) {
        let needed = self.items.len() + d;
        if needed > self.frame_item_capacity {
            self.frame_item_capacity = next_power_of_two(needed);
        }
    }

    pub fn truncate(&mut self, new_len: usize) {
        self.items.truncate(new_len);
    }

    pub fn push(&mut self, fid: FileIdentifierDescriptor, extent_offset: u64) -> usize {
        let hashes = NameHashes::compute(&fid.file_identifier);
        self.items.push(DirectoryIndexItem { fid, hashes, extent_offset });
        self.grow(1);
        self.items.len() - 1
    }

    pub fn mark_deleted(&mut self, index: usize) {
        if let Some(item) = self.items.get_mut(index) {
            if !item.fid.is_deleted() {
                item.fid.file_characteristics.insert(FidCharacteristics::DELETED);
                self.deleted_count += 1;
            }
        }
    }

    pub fn should_pack(&self) -> bool {
        self.deleted_count >= self.pack_threshold
    }

    /// Rewrites the index dropping deleted entries, returning the mapping
    /// from old index to new index for every surviving item so open
    /// `FileInfo`s can be updated in lock-step (spec.md §4.F `pack_directory`,
    /// the in-memory half — the on-disk rewrite is driven by
    /// [`crate::ops`]).
    pub fn pack(&mut self) -> alloc::collections::BTreeMap<usize, usize> {
        let mut remap = alloc::collections::BTreeMap::new();
        let mut kept = alloc::vec::Vec::with_capacity(self.items.len());
        // Indices 0/1 ("."/"..") are never packed away.
        kept.push(core::mem::replace(&mut self.items[0], synth_entry(".", bytemuck::Zeroable::zeroed(), true)));
        kept.push(core::mem::replace(&mut self.items[1], synth_entry("..", bytemuck::Zeroable::zeroed(), true)));
        remap.insert(0, 0);
        remap.insert(1, 1);

        for (old_index, item) in self.items.drain(2..).enumerate() {
            let old_index = old_index + 2;
            if item.fid.is_deleted() {
                continue;
            }
            let new_index = kept.len();
            remap.insert(old_index, new_index);
            kept.push(item);
        }

        self.items = kept;
        self.deleted_count = 0;
        remap
    }
}

fn synth_entry(name: &str, icb: crate::descriptors::ad::LongAd, is_internal: bool) -> DirectoryIndexItem {
    let mut flags = FidCharacteristics::DIRECTORY;
    if name == ".." {
        flags |= FidCharacteristics::PARENT;
    }
    if is_internal {
        flags |= FidCharacteristics::METADATA;
    }
    DirectoryIndexItem {
        fid: FileIdentifierDescriptor {
            file_version_number: 1,
            file_characteristics: flags,
            icb,
            implementation_use: alloc::vec::Vec::new(),
            file_identifier: alloc::string::String::new(),
        },
        hashes: NameHashes { posix: 0, long_filename: 0, dos_8_3: None },
        extent_offset: 0,
    }
}

fn hashes_could_match(search: &NameHashes, item: &NameHashes) -> bool {
    if search.posix == item.posix || search.long_filename == item.long_filename {
        return true;
    }
    match (search.dos_8_3, item.dos_8_3) {
        (Some(s), Some(i)) => s == i,
        _ => false,
    }
}

fn next_power_of_two(n: usize) -> usize {
    n.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::ad::{LongAd, RunState};

    fn fid(name: &str, icb_lbn: u32) -> FileIdentifierDescriptor {
        FileIdentifierDescriptor {
            file_version_number: 1,
            file_characteristics: FidCharacteristics::empty(),
            icb: LongAd::new(RunState::Recorded, 2048, icb_lbn, 0),
            implementation_use: alloc::vec::Vec::new(),
            file_identifier: name.into(),
        }
    }

    fn build_index() -> DirectoryIndex {
        let fids = alloc::vec![
            (fid("readme.txt", 10), 0u64),
            (fid("notes.md", 11), 40u64),
        ];
        DirectoryIndex::build(
            fids,
            LongAd::new(RunState::Recorded, 2048, 1, 0),
            LongAd::new(RunState::Recorded, 2048, 0, 0),
            128,
        )
    }

    #[test]
    fn find_locates_existing_entry_by_name() {
        let index = build_index();
        let found = index.find("notes.md", true).unwrap();
        assert_eq!(index.item(found.index).unwrap().fid.file_identifier, "notes.md");
    }

    #[test]
    fn find_dot_and_dotdot_resolve_without_scanning() {
        let index = build_index();
        assert_eq!(index.find(".", true), Some(FoundEntry { index: 0 }));
        assert_eq!(index.find("..", true), Some(FoundEntry { index: 1 }));
    }

    #[test]
    fn case_insensitive_find_matches_regardless_of_case() {
        let index = build_index();
        assert!(index.find("README.TXT", false).is_some());
        assert!(index.find("README.TXT", true).is_none());
    }

    #[test]
    fn pack_removes_deleted_entries_and_remaps_indices() {
        let mut index = build_index();
        index.mark_deleted(2);
        assert!(index.should_pack() == false);
        let remap = index.pack();
        assert_eq!(index.len(), 2);
        assert_eq!(remap.get(&3), Some(&2));
        assert!(remap.get(&2).is_none());
    }
}
