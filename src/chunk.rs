//! Units of work flowing through the pipeline.
//!
//! A [`Chunk`] owns its bytes and the governor reservation covering them.
//! Stages hand chunks to each other by value, so at any instant exactly one
//! stage owns a chunk's memory; dropping the chunk retires it (buffer back to
//! the pool, bytes back to the governor).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer_pool::PooledBuffer;
use crate::error::PipelineError;
use crate::governor::Permit;

/// Identifies a file within one pack/extract operation (its index position).
pub type FileId = u32;

/// Identity and geometry of a chunk. Never changes while the chunk moves
/// through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub file_id: FileId,
    /// Position within the file, starting at 0.
    pub sequence: u64,
    /// Offset of the chunk's first uncompressed byte inside the file.
    pub offset: u64,
    /// Uncompressed length of the chunk.
    pub length: u64,
}

#[derive(Debug)]
pub struct Chunk {
    header: ChunkHeader,
    data: PooledBuffer,
    permit: Permit,
}

impl Chunk {
    pub fn new(header: ChunkHeader, data: PooledBuffer, permit: Permit) -> Self {
        Chunk {
            header,
            data,
            permit,
        }
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn buffer_mut(&mut self) -> &mut PooledBuffer {
        &mut self.data
    }

    /// Swap in a freshly produced buffer; the old one is retired.
    pub fn replace_data(&mut self, data: PooledBuffer) {
        self.data = data;
    }

    pub fn permit_mut(&mut self) -> &mut Permit {
        &mut self.permit
    }

    /// Bytes this chunk currently holds against the memory budget.
    pub fn reserved_bytes(&self) -> u64 {
        self.permit.bytes()
    }
}

/// A source file opened for positional reads by packing workers.
#[derive(Debug)]
pub struct SourceFile {
    path: PathBuf,
    file: File,
}

impl SourceFile {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| PipelineError::io(e, path))?;
        Ok(SourceFile {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// What a worker does with a job's chunk.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Read `header.length` bytes at `header.offset` from `source`, then compress.
    Compress { source: Arc<SourceFile> },
    /// The chunk holds stored bytes; verify and (if `packed`) decompress.
    Decompress { packed: bool, checksum: u32 },
}

/// Where a processed chunk goes once the coordinator releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Positional write into an extracted file.
    OutputFile(FileId),
    /// Sequential append at a caller-ordered slot of the archive stream.
    ArchiveSlot(u64),
}

/// A chunk paired with its operation. Immutable once dispatched.
#[derive(Debug)]
pub struct Job {
    chunk: Chunk,
    op: Operation,
    target: Target,
    file: Arc<str>,
}

impl Job {
    pub fn new(chunk: Chunk, op: Operation, target: Target, file: Arc<str>) -> Self {
        Job {
            chunk,
            op,
            target,
            file,
        }
    }

    pub fn header(&self) -> &ChunkHeader {
        self.chunk.header()
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn into_parts(self) -> (Chunk, Operation, Target, Arc<str>) {
        (self.chunk, self.op, self.target, self.file)
    }
}

/// How the chunk's bytes are stored in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoredForm {
    /// `false` when the bytes are kept raw because compressing did not help.
    pub packed: bool,
    /// CRC32 over the stored bytes.
    pub checksum: u32,
}

#[derive(Debug)]
pub enum JobStatus {
    Ok,
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct JobResult {
    pub chunk: Chunk,
    pub target: Target,
    pub file: Arc<str>,
    pub stored: StoredForm,
    pub status: JobStatus,
}

impl JobResult {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, JobStatus::Ok)
    }

    pub fn header(&self) -> &ChunkHeader {
        self.chunk.header()
    }
}
