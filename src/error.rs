use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

/// Reason attached to a `CorruptDatabase` fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionKind {
    ChunkNotFound,
    BadHeader(String),
    BadFooter(String),
    BadLength { expected: u64, actual: u64 },
    ChecksumMismatch,
    BadRecord(String),
    ExtraneousFile,
    NotCompleted,
    BadCheckpoint(String),
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionKind::ChunkNotFound => write!(f, "chunk file not found"),
            CorruptionKind::BadHeader(msg) => write!(f, "bad header: {}", msg),
            CorruptionKind::BadFooter(msg) => write!(f, "bad footer: {}", msg),
            CorruptionKind::BadLength { expected, actual } => {
                write!(f, "file length {} does not match expected {}", actual, expected)
            }
            CorruptionKind::ChecksumMismatch => write!(f, "checksum mismatch"),
            CorruptionKind::BadRecord(msg) => write!(f, "bad record: {}", msg),
            CorruptionKind::ExtraneousFile => write!(f, "unexpected file in database"),
            CorruptionKind::NotCompleted => write!(f, "chunk is not completed"),
            CorruptionKind::BadCheckpoint(msg) => write!(f, "bad checkpoint: {}", msg),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// A log file failed validation. Never retried.
    CorruptDatabase(CorruptionKind, PathBuf),
    /// An index file failed validation. Never retried.
    CorruptIndex(String),
    /// Append or flush against a completed chunk.
    ReadOnly(String),
    RecordTooLarge { size: usize, capacity: usize },
    InvalidInput(String),
    InvalidOperation(String),
    MutexPoisoned,
    LockError(io::Error),
}

impl Error {
    pub fn corrupt_db(kind: CorruptionKind, path: impl Into<PathBuf>) -> Self {
        Error::CorruptDatabase(kind, path.into())
    }

    /// True for faults that mean on-disk data can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptDatabase(..) | Error::CorruptIndex(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::CorruptDatabase(kind, path) => {
                write!(f, "Corrupt database at {}: {}", path.display(), kind)
            }
            Error::CorruptIndex(msg) => write!(f, "Corrupt index: {}", msg),
            Error::ReadOnly(msg) => write!(f, "Read-only: {}", msg),
            Error::RecordTooLarge { size, capacity } => write!(
                f,
                "Record of {} bytes does not fit in a chunk of {} bytes",
                size, capacity
            ),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        let err = Error::corrupt_db(CorruptionKind::ChecksumMismatch, "/tmp/chunk-000000.000000");
        assert!(err.is_corruption());
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(Error::CorruptIndex("bad".into()).is_corruption());
        assert!(!Error::ReadOnly("chunk".into()).is_corruption());
    }
}
