//! Error taxonomy (spec.md §7).
//!
//! Every fallible operation in this crate returns `Result<T, UdfError>`. A
//! subset of variants is "expected" — the mount/request layer treats them as
//! retryable/transient instead of surfacing them to the caller as a hard
//! failure; see [`UdfError::is_transient`] and [`UdfError::is_expected`].

/// Errors produced while mounting, reading, or writing a UDF volume.
#[derive(Debug, thiserror::Error)]
pub enum UdfError {
    /// No usable Anchor Volume Descriptor Pointer / Volume Descriptor Sequence
    /// was found; this media is not a UDF volume.
    #[error("not a UDF volume")]
    NotAUdfVolume,

    /// A required descriptor failed its tag checksum or CRC and no mirror
    /// copy was usable either.
    #[error("volume is corrupt: {0}")]
    VolumeCorrupt(&'static str),

    /// Policy or media denies writes to this volume.
    #[error("volume is read-only")]
    VolumeReadOnly,

    /// The device is transiently not ready (spin-up, bus reset, ...).
    #[error("device not ready")]
    DeviceNotReady,

    /// No media is present in the device.
    #[error("no media in device")]
    NoMedia,

    /// A media change was detected mid-operation; the volume must be
    /// re-verified/re-mounted before the request can be retried.
    #[error("verify volume required")]
    VerifyRequired,

    /// The allocator could not satisfy a request for the requested byte
    /// count, even after returning an unsatisfiable partial mapping.
    #[error("disk full")]
    DiskFull,

    /// A share, link, or reference count prevents this delete.
    #[error("cannot delete: {0}")]
    CannotDelete(&'static str),

    /// The target of a rename/hard-link exists and overwrite was not
    /// permitted.
    #[error("name collision")]
    NameCollision,

    /// A directory operation was attempted on a non-directory.
    #[error("not a directory")]
    NotADirectory,

    /// A directory delete/rename-over was attempted on a non-empty
    /// directory.
    #[error("directory not empty")]
    DirectoryNotEmpty,

    /// Security policy or the read-only flag denied this operation.
    #[error("access denied")]
    AccessDenied,

    /// The request was malformed (bad offset, zero-length name, ...).
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The requested path component, file, or extent run does not exist.
    #[error("not found")]
    NotFound,

    /// No spare sparing-table entries remain and the configured no-spare
    /// policy is to refuse further writes to the volume.
    #[error("no spare sparing-table entries available")]
    NoSpare,

    /// An I/O error propagated from the backing block device.
    #[error(transparent)]
    Io(#[from] hadris_io::Error),

    /// An invariant this crate relies on was violated; this indicates a bug
    /// in this crate rather than a caller or media error (the analogue of
    /// `DriverInternalError`).
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl UdfError {
    /// True for the closed set of errors spec.md §7 calls "expected": ones
    /// that never bring down the host and are handled by a verify/retry
    /// cycle rather than propagated as a hard failure.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            UdfError::DeviceNotReady
                | UdfError::NoMedia
                | UdfError::VerifyRequired
                | UdfError::DiskFull
                | UdfError::VolumeReadOnly
        )
    }

    /// True for the subset that should drive the verify-volume retry loop
    /// (spec.md §7 "Retry").
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UdfError::DeviceNotReady | UdfError::NoMedia | UdfError::VerifyRequired
        )
    }
}
