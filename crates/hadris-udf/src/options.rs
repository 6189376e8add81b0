//! Mount options: the explicit, constructed analogue of the registry
//! parameters a host driver would otherwise read (spec.md §1 puts those out
//! of scope), the same role an explicit options struct plays for other
//! image-format crates in this workspace.

/// What to do when a `remap_packet` finds zero free sparing-table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoSpareAction {
    /// Refuse further writes to the affected packet (spec.md §4.B default).
    #[default]
    RefuseWrites,
    /// Allow the write to proceed against the original (possibly defective)
    /// location rather than failing outright.
    BestEffort,
}

/// Mount-time and runtime policy, gathering every compat/policy flag named
/// across spec.md §4 and §9.
#[derive(Debug, Clone, PartialEq)]
pub struct MountOptions {
    /// Clamp an out-of-range partition reference to the last partition map
    /// instead of failing, for authored media that emit the wrong partition
    /// reference (spec.md §4.B).
    pub instant_burner_compat: bool,

    /// Policy for `remap_packet` when the sparing table has no free entries.
    pub no_spare_action: NoSpareAction,

    /// Whether a volume whose LVID integrity is "open" (not cleanly
    /// unmounted) mounts read-only. Default `true`; set `false` to opt in to
    /// read-write mounting of a dirty volume (spec.md §9).
    pub dirty_ro: bool,

    /// When the free-space bitmap fails to load, assume all space is used
    /// (mount read-only) rather than refusing the mount outright. Default
    /// `false`: refuse-to-mount-writable is the conservative choice (spec.md
    /// §9).
    pub assume_all_used_on_bitmap_failure: bool,

    /// Hint to the block device adapter that writes should not race a
    /// concurrent media-eject request.
    pub force_media_lock: bool,

    /// Always allocate packet-aligned runs (future append-only media
    /// support); spec.md §4.D.
    pub alloc_sequential: bool,

    /// Disable best-fit extent selection and always append (CD-R policy
    /// variant); spec.md §4.D.
    pub cd_r_mode: bool,

    /// Maximum hole size, in bytes, that a growing write is allowed to leave
    /// as a sparse (`NotAllocatedNotRecorded`) run rather than allocating it
    /// outright; spec.md §4.E `resize`.
    pub sparse_threshold: u64,

    /// Block cache: number of dirty blocks that forces a flush (spec.md
    /// §4.C default 128).
    pub dirty_threshold: usize,

    /// Block cache: milliseconds since the last flush that forces one given
    /// at least one dirty block (spec.md §4.C default 5000).
    pub flush_interval_ms: u64,

    /// Block cache: maximum gap between dirty LBAs that still get coalesced
    /// into one I/O (spec.md §4.C default 32).
    pub max_coalesce_distance: u32,

    /// Block cache: consecutive writes needed to enter sequential mode
    /// (spec.md §4.C default 4).
    pub sequential_threshold: u32,

    /// Directory index: number of deleted entries that triggers
    /// `pack_directory` (spec.md §4.F default 128).
    pub pack_threshold: usize,

    /// Space allocator: maximum number of recently-freed FE-sized runs held
    /// per partition in the FE allocation charge cache (spec.md §4.D).
    pub fe_charge_cache_size: usize,
}

/// Write-time policy for [`crate::volume::Volume::format`]: the explicit
/// options struct a fresh volume is laid out from. Unlike options structs
/// for other image formats, a UDF volume's logical block size is the
/// backing [`crate::device::BlockDevice`]'s sector size, not a separately
/// chosen value, so it is not duplicated here.
#[cfg(feature = "write")]
#[derive(Debug, Clone, PartialEq)]
pub struct FormatOptions {
    /// Written into the Primary Volume Descriptor's and Logical Volume
    /// Descriptor's `dstring` identifier fields (spec.md §6).
    pub volume_identifier: alloc::string::String,

    /// Options the implicit mount that follows a successful format is
    /// carried out with.
    pub mount_options: MountOptions,
}

#[cfg(feature = "write")]
impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            volume_identifier: alloc::string::String::from("hadris-udf"),
            mount_options: MountOptions::default(),
        }
    }
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            instant_burner_compat: false,
            no_spare_action: NoSpareAction::RefuseWrites,
            dirty_ro: true,
            assume_all_used_on_bitmap_failure: false,
            force_media_lock: false,
            alloc_sequential: false,
            cd_r_mode: false,
            sparse_threshold: 1024 * 1024,
            dirty_threshold: 128,
            flush_interval_ms: 5000,
            max_coalesce_distance: 32,
            sequential_threshold: 4,
            pack_threshold: 128,
            fe_charge_cache_size: 64,
        }
    }
}
