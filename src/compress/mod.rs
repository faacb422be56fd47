//! # Packing
//!
//! Input collection, the packing dispatcher and the archive-side sink.
//!
//! The dispatcher runs on the calling thread. It walks the caller's file list
//! and admits one chunk descriptor at a time, strictly in archive order: each
//! admission first reserves the chunk's worst-case working set with the
//! governor, then queues a `Compress` job carrying only the source handle and
//! the byte range. Workers do the positional read themselves. Because slots
//! are admitted in order, the oldest unreleased slot always holds its
//! reservation and the ordered writer can never starve.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::archive::{entry_name, ArchiveWriter};
use crate::chunk::{Chunk, ChunkHeader, FileId, Job, JobResult, Operation, SourceFile, Target};
use crate::codec::Codec;
use crate::coordinator::ReleaseSink;
use crate::error::{PipelineError, Result};
use crate::fsx;
use crate::queue::JobSender;
use crate::state::PipelineState;

/// One file to pack: where to read it and the name it gets in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub source: PathBuf,
    pub name: String,
}

impl PackEntry {
    pub fn new(source: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        PackEntry {
            source: source.into(),
            name: name.into(),
        }
    }
}

/// Expand CLI inputs into pack entries.
///
/// A directory contributes every regular file below it, named relative to
/// the directory; a file is named by its file name. Symlinks are skipped.
/// Order is the order of `inputs`, directories walked by file name.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PackEntry>> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    for input in inputs {
        let meta = fsx::symlink_metadata(input).map_err(|e| PipelineError::io(e, input))?;
        let base = if meta.is_dir() {
            input.clone()
        } else {
            input.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        for item in WalkDir::new(input).sort_by_file_name() {
            let item = item.map_err(|e| {
                let path = e.path().unwrap_or(input.as_path()).to_path_buf();
                PipelineError::io(e.into(), path)
            })?;
            if !item.file_type().is_file() {
                continue;
            }
            let relative = item.path().strip_prefix(&base).unwrap_or(item.path());
            let name = entry_name(relative);
            if !seen.insert(name.clone()) {
                return Err(PipelineError::Config(format!("duplicate archive entry '{name}'")));
            }
            entries.push(PackEntry::new(item.path(), name));
        }
    }
    Ok(entries)
}

/// Bytes a compress job may hold at its peak: raw input plus codec output.
pub fn job_reservation(codec: &dyn Codec, raw_len: u64) -> u64 {
    raw_len.saturating_add(codec.compress_bound(raw_len as usize) as u64)
}

/// A source file ready for dispatch.
pub struct PackSource {
    pub file_id: FileId,
    pub size: u64,
    pub name: Arc<str>,
    pub source: Arc<SourceFile>,
}

/// Open every entry and register it with the archive, in caller order.
///
/// Entries that cannot be opened are still registered (so ids match index
/// positions) but are poisoned right away and never dispatched.
pub fn register_sources(entries: &[PackEntry], writer: &mut ArchiveWriter, state: &PipelineState) -> Vec<PackSource> {
    let mut sources = Vec::with_capacity(entries.len());
    for entry in entries {
        let opened = SourceFile::open(&entry.source).and_then(|source| {
            let meta = source.file().metadata().map_err(|e| PipelineError::io(e, &entry.source))?;
            Ok((source, meta))
        });
        match opened {
            Ok((source, meta)) => {
                let file_id = writer.add_entry(entry.name.clone(), meta.len(), fsx::unix_mode(&meta));
                sources.push(PackSource {
                    file_id,
                    size: meta.len(),
                    name: Arc::from(entry.name.as_str()),
                    source: Arc::new(source),
                });
            }
            Err(e) => {
                let file_id = writer.add_entry(entry.name.clone(), 0, None);
                state.poison(file_id, &entry.name, e);
            }
        }
    }
    sources
}

/// Dispatch every chunk of every source, assigning consecutive archive slots.
pub fn dispatch(
    sources: &[PackSource],
    chunk_size: u64,
    codec: &dyn Codec,
    queue: &JobSender,
    state: &Arc<PipelineState>,
) -> Result<()> {
    let mut slot = 0u64;
    for src in sources {
        let mut offset = 0u64;
        let mut sequence = 0u64;
        while offset < src.size {
            if state.is_aborted() {
                tracing::debug!("packing dispatcher stopping on abort");
                return Ok(());
            }
            if state.is_poisoned(src.file_id) {
                break;
            }
            let length = chunk_size.min(src.size - offset);
            let permit = state
                .governor()
                .acquire(job_reservation(codec, length), || state.is_aborted())?;
            let header = ChunkHeader {
                file_id: src.file_id,
                sequence,
                offset,
                length,
            };
            let job = Job::new(
                Chunk::new(header, state.buffers().acquire(length as usize), permit),
                Operation::Compress {
                    source: Arc::clone(&src.source),
                },
                Target::ArchiveSlot(slot),
                Arc::clone(&src.name),
            );
            queue.enqueue(job)?;
            slot += 1;
            sequence += 1;
            offset += length;
        }
    }
    Ok(())
}

/// Write role of the sequential driver: appends released chunks to the archive.
pub struct ArchiveSink {
    writer: ArchiveWriter,
    chunks: u64,
}

impl ArchiveSink {
    pub fn new(writer: ArchiveWriter) -> Self {
        ArchiveSink { writer, chunks: 0 }
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks
    }

    pub fn into_writer(self) -> ArchiveWriter {
        self.writer
    }
}

impl ReleaseSink for ArchiveSink {
    fn release(&mut self, result: JobResult) -> Result<()> {
        let header = *result.header();
        self.writer.append_chunk(
            header.file_id,
            result.chunk.data(),
            header.length,
            result.stored.packed,
            result.stored.checksum,
        )?;
        self.chunks += 1;
        Ok(())
    }
}
