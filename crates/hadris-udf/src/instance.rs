//! Open-Instance Graph (spec.md §4.G): the Dloc/Fcb/Ccb/FileInfo graph that
//! every open path builds and tears down through, and the reference-count
//! transitions that decide when an FCB is actually destroyed versus merely
//! queued for later reaping. Grounded directly in spec.md §4.G and the lock
//! order in §5 — no sibling crate in this workspace models an open-file
//! graph, so the shapes here (`Arc<RwLock<...>>` nodes, a shared `Vcb`-owned
//! table) follow the idiomatic-Rust way of expressing the same ownership
//! spec.md describes as "CCBs are owned by FCBs... Dlocs are owned by the
//! Vcb's Dloc table" (§5 "Shared-resource policy").

use crate::{error::UdfError, extent::ExtentInfo, sync::RwLock};
use alloc::{
    collections::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};

/// Physical identity of a File Entry: the (partition reference, LBN) pair
/// hard-linked FileInfos share, used as the Dloc table's key (spec.md §4.G
/// "hard-link sharing").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeLocation {
    pub partition_reference_number: u16,
    pub lbn: u32,
}

/// Which of a File Entry's (at most three) allocation streams an
/// [`ExtentInfo`] describes (spec.md §4.G "its three ExtentInfos").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// The file's own data, or a directory's FID stream.
    Data,
    /// Extended-attribute space referenced by the FE's extended attribute
    /// allocation descriptors.
    ExtendedAttributes,
    /// The named-streams sub-directory an Extended FE may point to
    /// (spec.md §4.G "Stream directory").
    StreamDirectory,
}

/// One on-disk data location: the decoded FE plus its (up to three) extent
/// mappings, shared by every hard-linked [`FileInfo`] that names it.
/// Destruction waits for [`Dloc::link_ref_count`] to reach zero (spec.md
/// §4.G `Dloc.LinkRefCount`).
pub struct Dloc {
    pub location: FeLocation,
    pub is_directory: bool,
    link_ref_count: usize,
    extents: BTreeMap<u8, ExtentInfo>,
}

impl Dloc {
    pub fn new(location: FeLocation, is_directory: bool) -> Self {
        Self {
            location,
            is_directory,
            link_ref_count: 0,
            extents: BTreeMap::new(),
        }
    }

    fn stream_slot(kind: StreamKind) -> u8 {
        match kind {
            StreamKind::Data => 0,
            StreamKind::ExtendedAttributes => 1,
            StreamKind::StreamDirectory => 2,
        }
    }

    pub fn set_extent(&mut self, kind: StreamKind, info: ExtentInfo) {
        self.extents.insert(Self::stream_slot(kind), info);
    }

    pub fn extent(&self, kind: StreamKind) -> Option<&ExtentInfo> {
        self.extents.get(&Self::stream_slot(kind))
    }

    pub fn extent_mut(&mut self, kind: StreamKind) -> Option<&mut ExtentInfo> {
        self.extents.get_mut(&Self::stream_slot(kind))
    }

    pub fn link_ref_count(&self) -> usize {
        self.link_ref_count
    }

    fn retain(&mut self) {
        self.link_ref_count += 1;
    }

    /// Drops one hard-link reference, returning whether the count reached
    /// zero (the Dloc table should evict it).
    fn release(&mut self) -> bool {
        self.link_ref_count = self.link_ref_count.saturating_sub(1);
        self.link_ref_count == 0
    }
}

/// Volume-wide table mapping FE physical location to the shared [`Dloc`],
/// owned by the Vcb (spec.md §5 "Dlocs are owned by the Vcb's Dloc table").
#[derive(Default)]
pub struct DlocTable {
    entries: BTreeMap<FeLocation, Arc<RwLock<Dloc>>>,
}

impl DlocTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing Dloc for `location`, or creates and inserts a
    /// fresh one on miss, bumping its link count either way (spec.md §4.G
    /// "its Dloc is looked up... a new Dloc is created on miss").
    pub fn get_or_create(&mut self, location: FeLocation, is_directory: bool) -> Arc<RwLock<Dloc>> {
        let dloc = self
            .entries
            .entry(location)
            .or_insert_with(|| Arc::new(RwLock::new(Dloc::new(location, is_directory))))
            .clone();
        dloc.write().expect("dloc lock poisoned").retain();
        dloc
    }

    /// Releases one hard-link reference; removes the table entry once the
    /// Dloc's link count reaches zero and no other `Arc` still holds it.
    pub fn release(&mut self, location: FeLocation) {
        let Some(dloc) = self.entries.get(&location) else { return };
        let should_remove = dloc.write().expect("dloc lock poisoned").release();
        if should_remove && Arc::strong_count(dloc) <= 1 {
            self.entries.remove(&location);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

bitflags::bitflags! {
    /// Per-FCB policy bits distinct from its reference counters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FcbFlags: u8 {
        /// Drop-to-zero on [`Fcb::release_reference`] enqueues on the
        /// delayed-close queue instead of destroying the FCB immediately
        /// (spec.md §4.G `FcbReference`).
        const DELAY_CLOSE = 1 << 0;
        /// The file should be deleted when the last CCB is cleaned up
        /// (spec.md §4.G "Delete-on-close semantics").
        const DELETE_ON_CLOSE = 1 << 1;
        /// This FCB is a named-stream FCB, opened via the two-step stream
        /// path resolution (spec.md §4.G "Stream directory").
        const IS_STREAM = 1 << 2;
    }
}

/// File Control Block: the open-instance state for one on-disk file or
/// directory, shared by every [`Ccb`] (handle) currently open on it.
pub struct Fcb {
    pub dloc: Arc<RwLock<Dloc>>,
    pub flags: FcbFlags,
    /// CCBs + internal holds (spec.md §4.G `FcbReference`).
    reference_count: usize,
    /// CCBs not yet cleaned up (spec.md §4.G `FcbCleanup`).
    cleanup_count: usize,
    /// Handles holding a cache-backed view (spec.md §4.G
    /// `CachedOpenHandleCount`).
    cached_open_handle_count: usize,
    ccbs: Vec<Weak<RwLock<Ccb>>>,
}

impl Fcb {
    pub fn new(dloc: Arc<RwLock<Dloc>>) -> Self {
        Self {
            dloc,
            flags: FcbFlags::empty(),
            reference_count: 0,
            cleanup_count: 0,
            cached_open_handle_count: 0,
            ccbs: Vec::new(),
        }
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanup_count
    }

    pub fn cached_open_handle_count(&self) -> usize {
        self.cached_open_handle_count
    }

    pub fn add_reference(&mut self) {
        self.reference_count += 1;
        self.cleanup_count += 1;
    }

    /// Drops one CCB reference. Returns `true` when the FCB should be
    /// destroyed now rather than enqueued on the delayed-close queue
    /// (spec.md §4.G `FcbReference`).
    pub fn release_reference(&mut self) -> bool {
        self.reference_count = self.reference_count.saturating_sub(1);
        self.reference_count == 0 && !self.flags.contains(FcbFlags::DELAY_CLOSE)
    }

    /// Marks one CCB as cleaned up: releases its locks, flushes cached
    /// data, and honours delete-on-close if this was the last one
    /// (spec.md §4.G `FcbCleanup`). Returns whether this cleanup should
    /// trigger a delete.
    pub fn note_cleanup(&mut self) -> bool {
        self.cleanup_count = self.cleanup_count.saturating_sub(1);
        self.cleanup_count == 0 && self.flags.contains(FcbFlags::DELETE_ON_CLOSE)
    }

    pub fn retain_cache(&mut self) {
        self.cached_open_handle_count += 1;
    }

    /// Drops one cache-backed handle. Returns whether the file's cached
    /// pages should now be purged (spec.md §4.G `CachedOpenHandleCount`:
    /// "when this reaches zero while `FcbCleanup > 0`...").
    pub fn release_cache(&mut self) -> bool {
        self.cached_open_handle_count = self.cached_open_handle_count.saturating_sub(1);
        self.cached_open_handle_count == 0 && self.cleanup_count > 0
    }

    pub fn register_ccb(&mut self, ccb: &Arc<RwLock<Ccb>>) {
        self.ccbs.push(Arc::downgrade(ccb));
    }

    /// Whether this FCB can be deleted now (spec.md §4.G "CannotDelete —
    /// share-, link-, or reference-count prevents delete"). Hard-linked
    /// Dlocs always allow it (only the naming FID goes away, the FE
    /// survives); otherwise a delete already pending on the sole remaining
    /// link refuses a second one rather than double-queuing it.
    pub fn is_deletable(&self) -> Result<(), UdfError> {
        let dloc = self.dloc.read().expect("dloc lock poisoned");
        if dloc.link_ref_count() > 1 {
            return Ok(());
        }
        drop(dloc);
        if self.flags.contains(FcbFlags::DELETE_ON_CLOSE) {
            return Err(UdfError::CannotDelete("delete already pending on this file"));
        }
        Ok(())
    }
}

/// Per-handle open context: cached absolute pathname, the chain of
/// ancestor [`FileInfo`]s whose references must be released on close, and
/// the FCB it targets.
pub struct Ccb {
    pub fcb: Arc<RwLock<Fcb>>,
    pub cached_pathname: String,
    /// How many ancestor FileInfo references this CCB holds and must
    /// release on close (spec.md §4.G "per-CCB `TreeLength`").
    pub tree_length: usize,
    ancestors: Vec<Arc<RwLock<FileInfo>>>,
}

impl Ccb {
    pub fn new(fcb: Arc<RwLock<Fcb>>, cached_pathname: String, ancestors: Vec<Arc<RwLock<FileInfo>>>) -> Self {
        let tree_length = ancestors.len();
        Self { fcb, cached_pathname, tree_length, ancestors }
    }

    /// Rewrites this CCB's cached pathname and rebinds its ancestor chain
    /// after a rename/move whose source directory was one of this CCB's
    /// ancestors (spec.md §4.G "Rename/move").
    pub fn rebind_after_move(
        &mut self,
        new_pathname: String,
        new_ancestors: Vec<Arc<RwLock<FileInfo>>>,
    ) {
        self.cached_pathname = new_pathname;
        self.tree_length = new_ancestors.len();
        self.ancestors = new_ancestors;
    }

    pub fn ancestors(&self) -> &[Arc<RwLock<FileInfo>>] {
        &self.ancestors
    }
}

/// One node in the open-instance tree: a directory slot `(parent,
/// directory-index-slot)` that has at least one open reference, reused by
/// every subsequent open of that same slot (spec.md §4.G "Opening a
/// path...").
pub struct FileInfo {
    pub parent: Option<Arc<RwLock<FileInfo>>>,
    pub directory_index_slot: usize,
    pub name: String,
    pub fcb: Arc<RwLock<Fcb>>,
    reference_count: usize,
}

impl FileInfo {
    pub fn new(
        parent: Option<Arc<RwLock<FileInfo>>>,
        directory_index_slot: usize,
        name: String,
        fcb: Arc<RwLock<Fcb>>,
    ) -> Self {
        Self { parent, directory_index_slot, name, fcb, reference_count: 0 }
    }

    pub fn add_reference(&mut self) {
        self.reference_count += 1;
    }

    pub fn release_reference(&mut self) -> usize {
        self.reference_count = self.reference_count.saturating_sub(1);
        self.reference_count
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    /// After an index-packing pass, the slot a surviving FileInfo now
    /// lives at may have shifted; the directory must walk its open
    /// FileInfos and rewrite each one in lock-step (spec.md §4.F
    /// `pack_directory`).
    pub fn renumber(&mut self, new_slot: usize) {
        self.directory_index_slot = new_slot;
    }
}

/// Per-directory (or per-volume, for the root) table of open [`FileInfo`]
/// nodes keyed by directory-index slot, so a repeated open of the same
/// name reuses the existing node instead of allocating a duplicate
/// (spec.md §4.G "if a FileInfo already exists at that (parent, index)
/// slot it is reused").
#[derive(Default)]
pub struct OpenFileTable {
    by_slot: BTreeMap<usize, Arc<RwLock<FileInfo>>>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: usize) -> Option<Arc<RwLock<FileInfo>>> {
        self.by_slot.get(&slot).cloned()
    }

    pub fn insert(&mut self, slot: usize, info: Arc<RwLock<FileInfo>>) {
        self.by_slot.insert(slot, info);
    }

    pub fn remove(&mut self, slot: usize) {
        self.by_slot.remove(&slot);
    }

    /// Applies a `pack_directory` remap (old slot -> new slot) to every
    /// tracked FileInfo, dropping entries whose old slot was reclaimed
    /// (i.e. absent from the remap).
    pub fn apply_pack_remap(&mut self, remap: &BTreeMap<usize, usize>) {
        let mut rebuilt = BTreeMap::new();
        for (old_slot, info) in core::mem::take(&mut self.by_slot) {
            if let Some(&new_slot) = remap.get(&old_slot) {
                info.write().expect("fileinfo lock poisoned").renumber(new_slot);
                rebuilt.insert(new_slot, info);
            }
        }
        self.by_slot = rebuilt;
    }
}

/// Entry on the delayed-close queue: an FCB whose reference count reached
/// zero while [`FcbFlags::DELAY_CLOSE`] was set, awaiting later reaping
/// (spec.md §4.G `FcbReference`).
pub struct DelayedCloseEntry {
    pub fcb: Arc<RwLock<Fcb>>,
    pub directory: FeLocation,
}

/// Queue of FCBs deferred for later teardown. Rename/move reaps every
/// entry under the directories it touches before proceeding, so the move
/// sees a quiescent tree (spec.md §4.G "Rename/move").
#[derive(Default)]
pub struct DelayedCloseQueue {
    entries: Vec<DelayedCloseEntry>,
}

impl DelayedCloseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, fcb: Arc<RwLock<Fcb>>, directory: FeLocation) {
        self.entries.push(DelayedCloseEntry { fcb, directory });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes and returns every entry under `directory`, for the caller
    /// to actually tear down (flush, release its Dloc reference, drop).
    pub fn reap_directory(&mut self, directory: FeLocation) -> Vec<DelayedCloseEntry> {
        let (reap, keep): (Vec<_>, Vec<_>) =
            core::mem::take(&mut self.entries).into_iter().partition(|e| e.directory == directory);
        self.entries = keep;
        reap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(lbn: u32) -> FeLocation {
        FeLocation { partition_reference_number: 0, lbn }
    }

    #[test]
    fn dloc_table_shares_one_dloc_across_hard_links() {
        let mut table = DlocTable::new();
        let a = table.get_or_create(loc(10), false);
        let b = table.get_or_create(loc(10), false);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.read().unwrap().link_ref_count(), 2);
    }

    #[test]
    fn dloc_table_evicts_after_last_release() {
        let mut table = DlocTable::new();
        table.get_or_create(loc(20), false);
        table.release(loc(20));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn fcb_without_delay_close_reports_destroy_at_zero_references() {
        let dloc = Arc::new(RwLock::new(Dloc::new(loc(1), false)));
        let mut fcb = Fcb::new(dloc);
        fcb.add_reference();
        fcb.add_reference();
        assert!(!fcb.release_reference());
        assert!(fcb.release_reference());
    }

    #[test]
    fn fcb_with_delay_close_never_reports_immediate_destroy() {
        let dloc = Arc::new(RwLock::new(Dloc::new(loc(1), false)));
        let mut fcb = Fcb::new(dloc);
        fcb.flags.insert(FcbFlags::DELAY_CLOSE);
        fcb.add_reference();
        assert!(!fcb.release_reference());
    }

    #[test]
    fn is_deletable_allows_hard_linked_dloc_regardless_of_pending_flag() {
        let dloc = Arc::new(RwLock::new(Dloc::new(loc(1), false)));
        dloc.write().unwrap().retain();
        dloc.write().unwrap().retain();
        let mut fcb = Fcb::new(dloc);
        fcb.flags.insert(FcbFlags::DELETE_ON_CLOSE);
        assert!(fcb.is_deletable().is_ok());
    }

    #[test]
    fn is_deletable_refuses_second_delete_on_sole_remaining_link() {
        let dloc = Arc::new(RwLock::new(Dloc::new(loc(1), false)));
        dloc.write().unwrap().retain();
        let mut fcb = Fcb::new(dloc);
        assert!(fcb.is_deletable().is_ok());
        fcb.flags.insert(FcbFlags::DELETE_ON_CLOSE);
        assert!(matches!(fcb.is_deletable(), Err(UdfError::CannotDelete(_))));
    }

    #[test]
    fn cache_handle_drop_triggers_purge_only_with_pending_cleanup() {
        let dloc = Arc::new(RwLock::new(Dloc::new(loc(1), false)));
        let mut fcb = Fcb::new(dloc);
        fcb.retain_cache();
        assert!(!fcb.release_cache());

        fcb.add_reference();
        fcb.retain_cache();
        assert!(fcb.release_cache());
    }

    #[test]
    fn open_file_table_reuses_existing_fileinfo_for_same_slot() {
        let dloc = Arc::new(RwLock::new(Dloc::new(loc(1), false)));
        let fcb = Arc::new(RwLock::new(Fcb::new(dloc)));
        let mut table = OpenFileTable::new();
        let info = Arc::new(RwLock::new(FileInfo::new(None, 3, "readme.txt".into(), fcb)));
        table.insert(3, info.clone());
        let fetched = table.get(3).unwrap();
        assert!(Arc::ptr_eq(&info, &fetched));
    }

    #[test]
    fn pack_remap_renumbers_surviving_fileinfo_and_drops_reclaimed_slots() {
        let dloc = Arc::new(RwLock::new(Dloc::new(loc(1), false)));
        let fcb = Arc::new(RwLock::new(Fcb::new(dloc)));
        let mut table = OpenFileTable::new();
        let surviving = Arc::new(RwLock::new(FileInfo::new(None, 5, "kept.txt".into(), fcb.clone())));
        let reclaimed = Arc::new(RwLock::new(FileInfo::new(None, 6, "gone.txt".into(), fcb)));
        table.insert(5, surviving.clone());
        table.insert(6, reclaimed);

        let mut remap = BTreeMap::new();
        remap.insert(5, 2);
        table.apply_pack_remap(&remap);

        assert!(table.get(6).is_none());
        let moved = table.get(2).unwrap();
        assert!(Arc::ptr_eq(&moved, &surviving));
        assert_eq!(surviving.read().unwrap().directory_index_slot, 2);
    }

    #[test]
    fn delayed_close_queue_reaps_only_matching_directory() {
        let dloc = Arc::new(RwLock::new(Dloc::new(loc(1), false)));
        let fcb = Arc::new(RwLock::new(Fcb::new(dloc)));
        let mut queue = DelayedCloseQueue::new();
        queue.enqueue(fcb.clone(), loc(100));
        queue.enqueue(fcb, loc(200));

        let reaped = queue.reap_directory(loc(100));
        assert_eq!(reaped.len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
