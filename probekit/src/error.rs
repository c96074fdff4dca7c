use thiserror::Error;

use crate::consts::ErrnoKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between user code and the kernel.
///
/// Syscall failures keep the raw errno alongside its symbolic kind so
/// callers can match without memorizing numbers. Verifier rejections keep
/// the full log text; that log is the primary debugging artifact for
/// bytecode under development.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel rejected a syscall.
    #[error("{cmd} failed: {kind} (errno {errno})")]
    Syscall {
        cmd: &'static str,
        errno: i32,
        kind: ErrnoKind,
    },

    /// prog-load failed; the verifier log explains why.
    #[error("verifier rejected program:\n{log}")]
    VerifierRejected { log: String },

    /// A named kernel object (tracepoint, BTF type, interface, symbol)
    /// does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// Caller-side contract violation: bad sizes, bad alignment, bad names.
    #[error("invalid shape: {detail}")]
    InvalidShape { detail: String },

    /// The running kernel lacks a required feature.
    #[error("kernel {kernel} does not support {feature}")]
    Unsupported { feature: String, kernel: String },

    /// Host ISA is not in the syscall table.
    #[error("unsupported architecture: {arch}")]
    UnsupportedArch { arch: String },

    /// A tracefs event with the generated name already exists.
    #[error("trace event {name} already exists")]
    AlreadyExists { name: String },

    /// Cleanup failed while tearing down an attachment. Never raised from
    /// destructors; surfaced only from explicit detach calls.
    #[error("resource cleanup failed: {detail}")]
    ResourceLeak { detail: String },

    /// Filesystem access (tracefs, /sys/kernel/btf) failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `Syscall` error from the calling thread's current errno.
    pub(crate) fn last_errno(cmd: &'static str) -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Error::Syscall {
            cmd,
            errno,
            kind: ErrnoKind::from_raw(errno),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    pub(crate) fn shape(detail: impl Into<String>) -> Self {
        Error::InvalidShape {
            detail: detail.into(),
        }
    }

    /// The errno carried by a `Syscall` error, if that is what this is.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Syscall { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// True when the kernel answered ENOENT, which map lookup and delete
    /// treat as absence rather than failure.
    pub(crate) fn is_enoent(&self) -> bool {
        self.errno() == Some(libc::ENOENT)
    }

    /// True when the kernel answered EINVAL, the signal that a batch
    /// command is unsupported for the map type.
    pub(crate) fn is_einval(&self) -> bool {
        self.errno() == Some(libc::EINVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_error_formats_kind_and_errno() {
        let err = Error::Syscall {
            cmd: "map_create",
            errno: libc::EPERM,
            kind: ErrnoKind::from_raw(libc::EPERM),
        };
        let text = err.to_string();
        assert!(text.contains("map_create"));
        assert!(text.contains("EPERM"));
    }

    #[test]
    fn unsupported_names_feature_and_kernel() {
        let err = Error::Unsupported {
            feature: "batch update for LruHash maps".into(),
            kernel: "5.4.0-150-generic".into(),
        };
        let text = err.to_string();
        assert!(text.contains("batch update for LruHash maps"));
        assert!(text.contains("5.4.0-150-generic"));
    }

    #[test]
    fn enoent_detection() {
        let err = Error::Syscall {
            cmd: "map_lookup_elem",
            errno: libc::ENOENT,
            kind: ErrnoKind::from_raw(libc::ENOENT),
        };
        assert!(err.is_enoent());
        assert!(!err.is_einval());
    }
}
