//! # Error Kinds
//!
//! All fallible paths return [`eyre::Result`] with context chains. The kinds a
//! caller must distinguish programmatically (to map onto an errno for the
//! syscall layer) are raised as [`FsError`] values inside the report and can
//! be recovered with `report.downcast_ref::<FsError>()`.

use thiserror::Error;

/// Error kinds surfaced by the core.
#[derive(Debug, Error)]
pub enum FsError {
    /// The meta-block signature does not match; the file is served by plain
    /// host I/O instead. Never an error at the public surface.
    #[error("not a valid core file (bad signature)")]
    NotCoreFile,

    /// The persistent bitmaps have no free word left.
    #[error("no free blocks left in the bitmap")]
    NoSpace,

    /// Persistent state violated a layout invariant during replay. The file
    /// is switched to read-only and subsequent writes fail.
    #[error("corrupt persistent state: {0}")]
    Corruption(String),

    /// A host syscall failed underneath us.
    #[error("host I/O failure")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The errno a syscall shim should report for this kind.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotCoreFile => libc::EINVAL,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Corruption(_) => libc::EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// The errno equivalent of an error report, for callers translating back to
/// the POSIX surface. Reports not carrying an [`FsError`] map to `EIO`.
pub fn report_errno(report: &eyre::Report) -> i32 {
    report
        .downcast_ref::<FsError>()
        .map(FsError::errno)
        .unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_space_maps_to_enospc() {
        assert_eq!(FsError::NoSpace.errno(), libc::ENOSPC);
    }

    #[test]
    fn corruption_maps_to_eio() {
        assert_eq!(FsError::Corruption("x".into()).errno(), libc::EIO);
    }

    #[test]
    fn report_errno_recovers_kind_through_context() {
        use eyre::WrapErr;

        let report = eyre::Result::<()>::Err(FsError::NoSpace.into())
            .wrap_err("while allocating blocks")
            .unwrap_err();

        assert_eq!(report_errno(&report), libc::ENOSPC);
    }

    #[test]
    fn foreign_report_defaults_to_eio() {
        let report = eyre::eyre!("unrelated failure");

        assert_eq!(report_errno(&report), libc::EIO);
    }
}
