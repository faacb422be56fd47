//! # Extraction
//!
//! Sequential read side of the pipeline. [`produce`] walks the archive in
//! stream order and turns every stored chunk into a decompression job; the
//! [`FileSink`] receives chunks back from the coordinator in per-file order
//! and writes them into the destination files.
//!
//! Output files are written under a temporary name in their destination
//! directory and renamed into place only after their last chunk has been
//! written. A file that never completes (poisoned, cancelled, I/O error) is
//! deleted, or kept with a `.partial` suffix when asked to.

pub mod backend;

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::archive::{sanitize_entry_path, ArchiveIndex, ArchiveReader, PlannedChunk};
use crate::chunk::{Chunk, ChunkHeader, FileId, Job, JobResult, Operation, Target};
use crate::coordinator::ReleaseSink;
use crate::error::{PipelineError, Result};
use crate::fsx;
use crate::queue::JobSender;
use crate::state::PipelineState;

use backend::{OutputHandle, WriteBackend};

pub const PARTIAL_SUFFIX: &str = ".partial";

/// Bytes a chunk needs while it is being decompressed.
pub fn job_reservation(chunk: &PlannedChunk) -> u64 {
    chunk.record.stored_size.saturating_add(chunk.record.raw_size)
}

/// Read every chunk in archive order and queue it for decompression.
///
/// Stops early (without error) once the pipeline is aborted; chunks of
/// files that are already poisoned are skipped without being read. Any
/// read error is returned and is fatal for the operation.
pub fn produce(
    reader: &mut ArchiveReader,
    plan: &[PlannedChunk],
    names: &[Arc<str>],
    queue: &JobSender,
    state: &Arc<PipelineState>,
) -> Result<()> {
    for step in plan {
        if state.is_aborted() {
            tracing::debug!("extraction driver stopping on abort");
            break;
        }
        if state.is_poisoned(step.file_id) {
            continue;
        }
        let permit = state.governor().acquire(job_reservation(step), || state.is_aborted())?;
        let mut data = state.buffers().acquire(step.record.stored_size as usize);
        reader.read_chunk(&step.record, &mut data)?;
        state.add_bytes_in(step.record.stored_size);

        let header = ChunkHeader {
            file_id: step.file_id,
            sequence: step.sequence,
            offset: step.file_offset,
            length: step.record.raw_size,
        };
        let job = Job::new(
            Chunk::new(header, data, permit),
            Operation::Decompress {
                packed: step.record.packed,
                checksum: step.record.crc32,
            },
            Target::OutputFile(step.file_id),
            Arc::clone(&names[step.file_id as usize]),
        );
        queue.enqueue(job)?;
    }
    Ok(())
}

/// What the sink needs to know about each entry, indexed by file id.
#[derive(Debug, Clone)]
pub struct OutputEntry {
    pub relative: PathBuf,
    pub size: u64,
    pub permissions: Option<u32>,
    pub chunk_count: u64,
}

impl OutputEntry {
    /// Check every path before anything is written.
    pub fn from_index(index: &ArchiveIndex) -> Result<Vec<OutputEntry>> {
        index
            .entries
            .iter()
            .map(|entry| {
                Ok(OutputEntry {
                    relative: sanitize_entry_path(&entry.path)?,
                    size: entry.size,
                    permissions: entry.permissions,
                    chunk_count: entry.chunks.len() as u64,
                })
            })
            .collect()
    }
}

struct OpenFile {
    handle: OutputHandle,
    tmp: NamedTempFile,
    remaining: u64,
}

/// Final counts of an extraction sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkTotals {
    pub files_completed: usize,
    pub files_incomplete: usize,
}

/// Destination of released chunks during extraction.
pub struct FileSink {
    out_dir: PathBuf,
    entries: Vec<OutputEntry>,
    open: HashMap<FileId, OpenFile>,
    backend: Box<dyn WriteBackend>,
    keep_partial: bool,
    totals: SinkTotals,
}

impl FileSink {
    pub fn new(out_dir: &Path, entries: Vec<OutputEntry>, backend: Box<dyn WriteBackend>, keep_partial: bool) -> Self {
        FileSink {
            out_dir: out_dir.to_path_buf(),
            entries,
            open: HashMap::new(),
            backend,
            keep_partial,
            totals: SinkTotals::default(),
        }
    }

    fn final_path(&self, file_id: FileId) -> PathBuf {
        self.out_dir.join(&self.entries[file_id as usize].relative)
    }

    fn open_file(&mut self, file_id: FileId) -> Result<&mut OpenFile> {
        if !self.open.contains_key(&file_id) {
            let entry = self
                .entries
                .get(file_id as usize)
                .ok_or_else(|| PipelineError::Format(format!("chunk for unknown file id {file_id}")))?;
            let path = self.out_dir.join(&entry.relative);
            let dir = path.parent().unwrap_or(&self.out_dir);
            fsx::create_dir_all(dir).map_err(|e| PipelineError::io(e, dir))?;
            let tmp = tempfile::Builder::new()
                .prefix(".blitzpipe-")
                .suffix(".tmp")
                .tempfile_in(dir)
                .map_err(|e| PipelineError::io(e, dir))?;
            tmp.as_file().set_len(entry.size).map_err(|e| PipelineError::io(e, &path))?;
            let file = tmp.as_file().try_clone().map_err(|e| PipelineError::io(e, &path))?;
            self.open.insert(
                file_id,
                OpenFile {
                    handle: OutputHandle {
                        file_id,
                        file: Arc::new(file),
                        path,
                    },
                    tmp,
                    remaining: entry.chunk_count,
                },
            );
        }
        self.open
            .get_mut(&file_id)
            .ok_or_else(|| PipelineError::Format(format!("output file {file_id} vanished")))
    }

    fn finalize(&mut self, file_id: FileId) -> Result<()> {
        let Some(open) = self.open.remove(&file_id) else {
            return Ok(());
        };
        self.backend.complete(&open.handle)?;
        let OpenFile { handle, tmp, .. } = open;
        let path = handle.path;
        drop(handle.file);
        if let Some(mode) = self.entries[file_id as usize].permissions {
            fsx::set_unix_permissions(tmp.path(), mode).map_err(|e| PipelineError::io(e, &path))?;
        }
        tmp.persist(&path).map_err(|e| PipelineError::io(e.error, &path))?;
        self.totals.files_completed += 1;
        tracing::debug!(file = %path.display(), "file extracted");
        Ok(())
    }

    /// Mark a file that will never complete: wait for its writes, then
    /// delete it or keep it under `<name>.partial`.
    fn abandon(&mut self, file_id: FileId) {
        let Some(open) = self.open.remove(&file_id) else {
            return;
        };
        self.totals.files_incomplete += 1;
        let _ = self.backend.complete(&open.handle);
        let OpenFile { handle, tmp, .. } = open;
        let path = handle.path;
        drop(handle.file);
        if self.keep_partial {
            let mut name: OsString = path.as_os_str().to_owned();
            name.push(PARTIAL_SUFFIX);
            let partial = PathBuf::from(name);
            match tmp.persist(&partial) {
                Ok(_) => tracing::warn!(file = %partial.display(), "incomplete file kept"),
                Err(e) => tracing::warn!(file = %partial.display(), error = %e.error, "could not keep incomplete file"),
            }
        } else {
            tracing::warn!(file = %path.display(), "incomplete file removed");
        }
    }

    /// Settle every file once the pipeline has drained.
    ///
    /// Files still open are incomplete. Entries without chunks are created
    /// empty, unless the run was aborted.
    pub fn finish(mut self, state: &PipelineState) -> Result<SinkTotals> {
        let open: Vec<FileId> = self.open.keys().copied().collect();
        for file_id in open {
            self.abandon(file_id);
        }
        if !state.is_aborted() {
            for file_id in 0..self.entries.len() as FileId {
                if self.entries[file_id as usize].chunk_count == 0 && !state.is_poisoned(file_id) {
                    let path = self.final_path(file_id);
                    if let Some(dir) = path.parent() {
                        fsx::create_dir_all(dir).map_err(|e| PipelineError::io(e, dir))?;
                    }
                    fsx::File::create(&path).map_err(|e| PipelineError::io(e, &path))?;
                    if let Some(mode) = self.entries[file_id as usize].permissions {
                        fsx::set_unix_permissions(&path, mode).map_err(|e| PipelineError::io(e, &path))?;
                    }
                    self.totals.files_completed += 1;
                }
            }
        }
        Ok(self.totals)
    }
}

impl ReleaseSink for FileSink {
    fn release(&mut self, result: JobResult) -> Result<()> {
        let file_id = result.header().file_id;
        let offset = result.header().offset;
        let open = self.open_file(file_id)?;
        let handle = open.handle.clone();
        open.remaining = open.remaining.saturating_sub(1);
        let done = open.remaining == 0;
        self.backend.submit(&handle, offset, result)?;
        if done {
            self.finalize(file_id)?;
        }
        Ok(())
    }

    fn poisoned(&mut self, file_id: FileId) {
        self.abandon(file_id);
    }
}
