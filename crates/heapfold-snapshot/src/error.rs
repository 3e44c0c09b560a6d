//! Error types for the heapfold-snapshot crate.

use std::backtrace::Backtrace;
use std::fmt;

/// Error type for snapshot loading.
///
/// Uses the canonical struct pattern: a private kind enum, a captured
/// backtrace, and `is_xxx()` classifiers for callers.
///
/// Why: offsets stay inside the kind so new variants can be added without
/// breaking callers, which only ever ask what class of failure occurred.
#[derive(Debug)]
pub struct SnapshotError {
    kind: SnapshotErrorKind,
    backtrace: Backtrace,
}

/// Internal error variants. Not exposed publicly; use `is_xxx()` methods.
#[derive(Debug)]
pub(crate) enum SnapshotErrorKind {
    /// I/O error when reading the dump.
    Io(std::io::Error),
    /// The header is not an HPROF header, or uses an unsupported id size.
    UnsupportedFormat(String),
    /// A record extends past the end of the input.
    Truncated { offset: usize, needed: usize },
    /// A record is structurally invalid, or the records together describe
    /// an impossible heap. `offset` is `None` for the latter.
    Malformed {
        offset: Option<usize>,
        message: String,
    },
}

impl SnapshotError {
    /// Creates an error from an error kind, capturing a backtrace.
    pub(crate) fn new(kind: SnapshotErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::new(SnapshotErrorKind::UnsupportedFormat(message.into()))
    }

    pub(crate) fn truncated(offset: usize, needed: usize) -> Self {
        Self::new(SnapshotErrorKind::Truncated { offset, needed })
    }

    pub(crate) fn malformed(offset: usize, message: impl Into<String>) -> Self {
        Self::new(SnapshotErrorKind::Malformed {
            offset: Some(offset),
            message: message.into(),
        })
    }

    /// A defect that only shows once all records are read, such as a
    /// superclass cycle.
    pub(crate) fn inconsistent(message: impl Into<String>) -> Self {
        Self::new(SnapshotErrorKind::Malformed {
            offset: None,
            message: message.into(),
        })
    }

    /// Returns true if this error is due to I/O failure.
    pub fn is_io(&self) -> bool {
        matches!(self.kind, SnapshotErrorKind::Io(_))
    }

    /// Returns true if the input is not a supported heap dump at all.
    pub fn is_unsupported_format(&self) -> bool {
        matches!(self.kind, SnapshotErrorKind::UnsupportedFormat(_))
    }

    /// Returns true if the input ended in the middle of a record.
    pub fn is_truncated(&self) -> bool {
        matches!(self.kind, SnapshotErrorKind::Truncated { .. })
    }

    /// Returns true if a record could not be decoded, or the dump as a
    /// whole is inconsistent.
    pub fn is_malformed(&self) -> bool {
        matches!(self.kind, SnapshotErrorKind::Malformed { .. })
    }

    /// Returns the backtrace captured when this error was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for SnapshotErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotErrorKind::Io(err) => write!(f, "I/O error: {err}"),
            SnapshotErrorKind::UnsupportedFormat(message) => {
                write!(f, "unsupported snapshot format: {message}")
            }
            SnapshotErrorKind::Truncated { offset, needed } => write!(
                f,
                "snapshot truncated at offset {offset} ({needed} more bytes expected)"
            ),
            SnapshotErrorKind::Malformed {
                offset: Some(offset),
                message,
            } => write!(f, "malformed record at offset {offset}: {message}"),
            SnapshotErrorKind::Malformed {
                offset: None,
                message,
            } => write!(f, "malformed snapshot: {message}"),
        }
    }
}

impl fmt::Display for SnapshotError {
    /// Formats the error with a summary and captured backtrace.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;

        // Empty unless RUST_BACKTRACE is set.
        write!(f, "{}", self.backtrace)
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SnapshotErrorKind::Io(err) => Some(err),
            SnapshotErrorKind::UnsupportedFormat(_)
            | SnapshotErrorKind::Truncated { .. }
            | SnapshotErrorKind::Malformed { .. } => None,
        }
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        Self::new(SnapshotErrorKind::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_io_from() {
        let io_err =
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = SnapshotError::from(io_err);

        assert!(err.is_io());
        assert!(!err.is_truncated());
        assert!(err.to_string().contains("I/O error"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_truncated_formats_offset() {
        let err = SnapshotError::truncated(31, 4);

        assert!(err.is_truncated());
        assert!(!err.is_malformed());
        assert!(err.to_string().contains("offset 31"));
        assert!(err.source().is_none());
    }

    /// Format errors carry the offending header text so users can tell a
    /// wrong file from a damaged one.
    #[test]
    fn test_unsupported_format() {
        let err = SnapshotError::unsupported("header \"PK\"");

        assert!(err.is_unsupported_format());
        assert!(err.to_string().contains("PK"));
    }

    #[test]
    fn test_inconsistent_has_no_offset() {
        let err = SnapshotError::inconsistent("superclass cycle through class 0x10");

        assert!(err.is_malformed());
        assert!(err.to_string().starts_with("malformed snapshot: superclass cycle"));
    }

    #[test]
    fn test_debug_impl() {
        let err = SnapshotError::malformed(0, "bad tag");
        assert!(format!("{err:?}").contains("SnapshotError"));
    }
}
