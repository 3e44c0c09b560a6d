//! Error types for the heapfold-fold crate.

use std::backtrace::Backtrace;
use std::fmt;

use heapfold_snapshot::SnapshotError;

/// Error type for analysis runs.
///
/// Follows the canonical struct pattern: a private kind enum, a captured
/// backtrace, and `is_xxx()` classifiers so callers never match on
/// variants.
///
/// Why: a snapshot failure is wrapped rather than flattened so the binary
/// can print the parser's offset and message through `source()`.
#[derive(Debug)]
pub struct AnalysisError {
    kind: AnalysisErrorKind,
    backtrace: Backtrace,
}

#[derive(Debug)]
pub(crate) enum AnalysisErrorKind {
    /// The heap dump could not be read or parsed.
    Snapshot(SnapshotError),
    /// The analyzer configuration is not valid JSON for `AnalyzerConfig`.
    Config(serde_json::Error),
    /// I/O error outside snapshot parsing, e.g. reading the config file.
    Io(std::io::Error),
}

impl AnalysisError {
    pub(crate) fn new(kind: AnalysisErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Returns true if the snapshot failed to load.
    pub fn is_snapshot(&self) -> bool {
        matches!(self.kind, AnalysisErrorKind::Snapshot(_))
    }

    /// Returns true if the configuration failed to parse.
    pub fn is_config(&self) -> bool {
        matches!(self.kind, AnalysisErrorKind::Config(_))
    }

    /// Returns true if this error is due to I/O failure.
    pub fn is_io(&self) -> bool {
        matches!(self.kind, AnalysisErrorKind::Io(_))
    }

    /// Returns the backtrace captured when this error was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for AnalysisErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisErrorKind::Snapshot(err) => {
                write!(f, "failed to load snapshot: {err}")
            }
            AnalysisErrorKind::Config(err) => {
                write!(f, "invalid analyzer config: {err}")
            }
            AnalysisErrorKind::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;
        write!(f, "{}", self.backtrace)
    }
}

impl std::error::Error for AnalysisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            AnalysisErrorKind::Snapshot(err) => Some(err),
            AnalysisErrorKind::Config(err) => Some(err),
            AnalysisErrorKind::Io(err) => Some(err),
        }
    }
}

impl From<SnapshotError> for AnalysisError {
    fn from(err: SnapshotError) -> Self {
        Self::new(AnalysisErrorKind::Snapshot(err))
    }
}

impl From<std::io::Error> for AnalysisError {
    fn from(err: std::io::Error) -> Self {
        Self::new(AnalysisErrorKind::Io(err))
    }
}
