//! The error taxonomy of the UBI layer.

use std::io;

use thiserror::Error;

/// Errors reported by the UBI layer.
///
/// The variants mirror the POSIX-style codes of the on-device
/// implementation this layer interoperates with; the `EIO` class carries
/// the underlying MTD error.
#[derive(Debug, Error)]
pub enum UbiError {
    /// A caller-supplied argument failed validation (`EINVAL`).
    #[error("invalid argument")]
    InvalidArgument,

    /// The volume or logical erase block does not exist (`ENOENT`).
    #[error("no such volume or logical erase block")]
    NotFound,

    /// No free PEBs, or no room left in the partition or volume table
    /// (`ENOSPC`).
    #[error("no space left on device")]
    NoSpace,

    /// A logical erase block number lies outside the volume (`EACCES`).
    #[error("logical erase block number out of range")]
    OutOfRange,

    /// The underlying MTD reported a failure (`EIO`).
    #[error("flash I/O failed")]
    Io(#[from] io::Error),

    /// An on-flash record had a bad magic, version, or CRC (`EBADMSG`).
    #[error("on-flash header magic or CRC mismatch")]
    BadHeader,

    /// The operation does not apply to this volume, e.g. resizing a static
    /// volume (`ECANCELED`).
    #[error("operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, UbiError>;
