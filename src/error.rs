use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::chunk::FileId;
use crate::state::PipelineStats;

/// Failure raised by a [`Codec`](crate::codec::Codec) while transforming one chunk.
///
/// Codec errors are local to a single file: the coordinator poisons that
/// file's stream and keeps processing the others.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input could not be decoded (truncated or garbage stream).
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The codec refused the input or a parameter.
    #[error("unsupported input: {0}")]
    Unsupported(String),

    /// The stored bytes do not match the checksum recorded in the index.
    #[error("checksum mismatch (expected {expected:#010x}, actual {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Decoded length differs from the length recorded for the chunk.
    #[error("length mismatch (expected {expected}, actual {actual})")]
    LengthMismatch { expected: u64, actual: u64 },
}

/// The primary error type for every pack/extract operation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Read or write failure at the driver, a reader worker or the writer.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", .path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Corrupt or unsupported data while compressing/decompressing a chunk.
    #[error("codec error in '{file}' at chunk {sequence}: {source}")]
    Codec {
        file: String,
        sequence: u64,
        #[source]
        source: CodecError,
    },

    /// A cooperative abort was observed before the operation completed.
    #[error("operation cancelled")]
    CancellationRequested,

    /// The configured limits cannot admit even a single job.
    #[error("backpressure deadlock: memory budget of {budget} bytes cannot hold a job of {required} bytes")]
    BackpressureDeadlock { budget: u64, required: u64 },

    /// The archive container is malformed.
    #[error("invalid archive format: {0}")]
    Format(String),

    /// Serialization or deserialization of the archive index failed.
    #[error("index serialization error: {0}")]
    Index(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A chunk was observed twice by the coordinator.
    #[error("chunk {sequence} of file {file_id} dispatched more than once")]
    DuplicateChunk { file_id: FileId, sequence: u64 },

    /// Chunks were still held when the pipeline drained.
    #[error("{held} chunk(s) never became releasable (sequence gap)")]
    SequenceGap { held: usize },

    /// A pipeline thread panicked.
    #[error("a {0} thread panicked")]
    WorkerPanicked(&'static str),
}

impl PipelineError {
    /// Wraps an `io::Error` together with the path it happened on.
    pub fn io(source: io::Error, path: impl AsRef<Path>) -> Self {
        PipelineError::Io {
            source,
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// A file that was excluded from release after one of its chunks failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonedFile {
    pub file_id: FileId,
    pub path: String,
    pub reason: String,
}

/// What a failed operation hands back to the caller: the first error
/// observed pipeline-wide plus every file that was poisoned on the way.
#[derive(Debug, Error)]
#[error("{error}{}", poisoned_suffix(.poisoned))]
pub struct PipelineFailure {
    #[source]
    pub error: PipelineError,
    pub poisoned: Vec<PoisonedFile>,
    /// Counters at the time of failure; all zero if the pipeline never started.
    pub stats: PipelineStats,
}

fn poisoned_suffix(poisoned: &[PoisonedFile]) -> String {
    if poisoned.is_empty() {
        String::new()
    } else {
        format!(" ({} file(s) poisoned)", poisoned.len())
    }
}

impl From<PipelineError> for PipelineFailure {
    fn from(error: PipelineError) -> Self {
        PipelineFailure {
            error,
            poisoned: Vec::new(),
            stats: PipelineStats::default(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
