//! Completion coordinator.
//!
//! Workers finish in whatever order the scheduler likes. The coordinator puts
//! results back in order before anything reaches a destination: each ordering
//! stream keeps the next expected sequence number and a sparse holding area
//! (`BTreeMap`) for results that arrived early. When the expected result shows
//! up it is released, followed by every now-contiguous successor.
//!
//! Extraction orders per file (`StreamKey::File`); packing orders the whole
//! archive stream by slot (`StreamKey::Archive`), which also keeps every
//! file's chunks in sequence.
//!
//! A failed result poisons its file. Nothing more is released for a poisoned
//! file; its chunks are retired as they come in (per-file streams) or when
//! their slot comes up (archive stream, so later files are not stalled).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::chunk::{FileId, JobResult, JobStatus, Target};
use crate::error::{PipelineError, Result};
use crate::state::PipelineState;

/// Destination of released chunks.
pub trait ReleaseSink {
    /// Write a chunk whose predecessors in its stream have all been released.
    fn release(&mut self, result: JobResult) -> Result<()>;

    /// `file_id` will never be completed; drop anything prepared for it.
    fn poisoned(&mut self, _file_id: FileId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKey {
    File(FileId),
    Archive,
}

#[derive(Debug, Default)]
struct StreamState {
    next: u64,
    held: BTreeMap<u64, JobResult>,
    closed: bool,
}

pub struct Coordinator {
    streams: HashMap<StreamKey, StreamState>,
    poisoned: HashSet<FileId>,
    state: Arc<PipelineState>,
}

impl Coordinator {
    pub fn new(state: Arc<PipelineState>) -> Self {
        Coordinator {
            streams: HashMap::new(),
            poisoned: HashSet::new(),
            state,
        }
    }

    fn ordering_of(result: &JobResult) -> (StreamKey, u64) {
        match result.target {
            Target::OutputFile(id) => (StreamKey::File(id), result.header().sequence),
            Target::ArchiveSlot(slot) => (StreamKey::Archive, slot),
        }
    }

    /// Take one completed job and release whatever became contiguous.
    ///
    /// Errors are fatal: a duplicate chunk, or a failing sink write.
    pub fn accept<S: ReleaseSink>(&mut self, mut result: JobResult, sink: &mut S) -> Result<()> {
        let (key, position) = Self::ordering_of(&result);
        let header = *result.header();
        let stream = self.streams.entry(key).or_default();

        if position < stream.next || stream.held.contains_key(&position) {
            return Err(PipelineError::DuplicateChunk {
                file_id: header.file_id,
                sequence: header.sequence,
            });
        }

        if let JobStatus::Failed(error) = std::mem::replace(&mut result.status, JobStatus::Ok) {
            if self.poisoned.insert(header.file_id) {
                self.state.poison(header.file_id, &result.file, error);
                sink.poisoned(header.file_id);
            }
            if let StreamKey::File(_) = key {
                stream.closed = true;
                for (_, held) in std::mem::take(&mut stream.held) {
                    self.state.chunk_discarded();
                    drop(held);
                }
            }
        }

        if stream.closed {
            self.state.chunk_discarded();
            return Ok(());
        }

        stream.held.insert(position, result);
        while let Some(ready) = stream.held.remove(&stream.next) {
            stream.next += 1;
            let file_id = ready.header().file_id;
            if self.state.is_aborted() || self.poisoned.contains(&file_id) {
                self.state.chunk_discarded();
                continue;
            }
            let bytes = ready.chunk.data().len() as u64;
            tracing::trace!(file_id, sequence = ready.header().sequence, bytes, "chunk released");
            sink.release(ready)?;
            self.state.chunk_released(bytes);
        }
        Ok(())
    }

    /// Results waiting for a predecessor.
    pub fn held(&self) -> usize {
        self.streams.values().map(|s| s.held.len()).sum()
    }

    /// Called once every job has completed. Held results at that point can
    /// only mean a gap in the dispatched sequence, unless the run was aborted
    /// (then they are simply retired).
    pub fn finish(&mut self) -> Result<()> {
        let held = self.held();
        for stream in self.streams.values_mut() {
            stream.held.clear();
        }
        if held > 0 && !self.state.is_aborted() {
            return Err(PipelineError::SequenceGap { held });
        }
        Ok(())
    }
}

/// Where workers post finished jobs.
pub trait CompletionPort: Send + Sync {
    fn post(&self, result: JobResult);
}

impl<T: CompletionPort + ?Sized> CompletionPort for &T {
    fn post(&self, result: JobResult) {
        (**self).post(result)
    }
}

/// Dedicated-writer mode: results travel to the writer thread. Each worker
/// holds a clone; the writer stops once the last clone is dropped.
#[derive(Clone)]
pub struct ChannelPort {
    tx: Sender<JobResult>,
}

impl ChannelPort {
    pub fn new(tx: Sender<JobResult>) -> Self {
        ChannelPort { tx }
    }
}

impl CompletionPort for ChannelPort {
    fn post(&self, result: JobResult) {
        // The writer only hangs up after a panic; the result is retired here then.
        let _ = self.tx.send(result);
    }
}

/// Pool-hosted mode: the posting worker runs the release itself.
pub struct HostedCoordinator<S> {
    inner: Mutex<(Coordinator, S)>,
    state: Arc<PipelineState>,
}

impl<S: ReleaseSink> HostedCoordinator<S> {
    pub fn new(coordinator: Coordinator, sink: S, state: Arc<PipelineState>) -> Self {
        HostedCoordinator {
            inner: Mutex::new((coordinator, sink)),
            state,
        }
    }

    pub fn into_inner(self) -> (Coordinator, S) {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S: ReleaseSink + Send> CompletionPort for HostedCoordinator<S> {
    fn post(&self, result: JobResult) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (coordinator, sink) = &mut *guard;
        if let Err(e) = coordinator.accept(result, sink) {
            self.state.abort(e);
        }
    }
}

/// Dedicated writer thread body: drain results until every worker hung up.
pub fn run_writer<S: ReleaseSink>(
    rx: Receiver<JobResult>,
    mut coordinator: Coordinator,
    mut sink: S,
    state: &PipelineState,
) -> (Coordinator, S) {
    for result in rx {
        if let Err(e) = coordinator.accept(result, &mut sink) {
            state.abort(e);
        }
    }
    (coordinator, sink)
}
