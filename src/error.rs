use std::io;

use thiserror::Error;

/// A custom `Result` type for this crate, combining a return value with an [`RssError`]. It is
/// used all over the crate and also returned by many functions and methods of its external API.
pub type Result<T> = std::result::Result<T, RssError>;

/// An error type returned by calls to the sampling API exposed by this crate.
///
/// Every failure of a sampling tick is reported through this type; nothing in the sampling path
/// panics or terminates the process. The binary maps each variant to a process exit code through
/// [`RssError::exit_code`].
#[derive(Debug, Error)]
pub enum RssError {
    /// Error opening a file; for a `/proc/<PID>/...` file this usually means the target exited.
    #[error("could not open '{path}': {source}")]
    Open {
        /// The path of the file that was attempted to be opened.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error reading from a file.
    #[error("could not read '{path}': {source}")]
    Read {
        /// The path of the file that was attempted to be read.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error seeking in a file.
    #[error("could not seek in '{path}': {source}")]
    Seek {
        /// The path of the file that was attempted to be seeked.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// A positioned read returned end-of-file before the requested range was complete.
    #[error("short read from '{path}' at offset {offset}: got {read} of {expected} bytes")]
    TruncatedRead {
        /// The path of the file being read.
        path: String,
        /// Byte offset of the range.
        offset: u64,
        /// Bytes requested.
        expected: usize,
        /// Bytes actually read.
        read: usize,
    },

    /// A text record could not be parsed.
    #[error("could not parse '{line}': {reason}")]
    Parse {
        /// The offending line, possibly truncated.
        line: String,
        /// What was expected.
        reason: &'static str,
    },

    /// The snapshot of a tick does not fit in the byte region of the arena.
    #[error("snapshot needs {needed} bytes but the arena holds {capacity}")]
    SnapshotTooLarge {
        /// Bytes needed.
        needed: u64,
        /// Bytes available.
        capacity: u64,
    },

    /// The process has more VMAs than the arena can hold.
    #[error("more than {capacity} VMAs")]
    VmaCapacity {
        /// Number of entries the VMA array can hold.
        capacity: usize,
    },

    /// Error reserving an arena region.
    #[error("could not map {len} bytes: {source}")]
    Map {
        /// Requested length.
        len: usize,
        /// The underlying error.
        source: io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RssError {
    /// The exit code the command line tool terminates with when sampling stops on this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RssError::SnapshotTooLarge { .. } => -1,
            RssError::TruncatedRead { .. } => -2,
            RssError::Read { path, .. } | RssError::Seek { path, .. }
                if path.ends_with("/pagemap") =>
            {
                -2
            }
            RssError::Open { .. } | RssError::Read { .. } | RssError::Seek { .. } => -3,
            RssError::Map { .. } => -4,
            RssError::Parse { .. } => -5,
            RssError::VmaCapacity { .. } => -10,
            RssError::Io(_) => -3,
        }
    }

    /// Returns `true` if sampling cannot meaningfully continue after this error, i.e., the
    /// target is gone or the arena could not be set up. Every other error only spoils the current
    /// tick.
    pub fn ends_sampling(&self) -> bool {
        matches!(self, RssError::Open { .. } | RssError::Map { .. })
    }

    pub(crate) fn parse(line: &str, reason: &'static str) -> Self {
        const MAX_LINE: usize = 120;
        let line = match line.char_indices().nth(MAX_LINE) {
            Some((idx, _)) => &line[..idx],
            None => line,
        };
        RssError::Parse {
            line: line.to_owned(),
            reason,
        }
    }
}
