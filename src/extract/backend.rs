//! Platform write backends for extracted files.
//!
//! The releasing thread (a pool worker or the dedicated writer) hands each
//! in-order chunk to a [`WriteBackend`]. The blocking backend writes on the
//! spot. The runtime backend submits the write to a tokio runtime's blocking
//! pool and only waits for it when the file is finalized, so the releasing
//! thread moves straight on to the next chunk.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use crate::chunk::{FileId, JobResult};
use crate::config::IoBackendKind;
use crate::error::{PipelineError, Result};
use crate::fsx::{self, File};

/// An output file opened for positional writes.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    pub file_id: FileId,
    pub file: Arc<File>,
    /// Final path, used in error messages.
    pub path: PathBuf,
}

pub trait WriteBackend: Send {
    fn name(&self) -> &'static str;

    /// Write the chunk's bytes at `offset`. The chunk (and the memory it
    /// holds against the budget) is retired once the write is done.
    fn submit(&mut self, target: &OutputHandle, offset: u64, chunk: JobResult) -> Result<()>;

    /// Wait until every write submitted for `target` has completed.
    fn complete(&mut self, target: &OutputHandle) -> Result<()>;
}

/// Synchronous positional writes on the calling thread.
#[derive(Debug, Default)]
pub struct BlockingBackend;

impl WriteBackend for BlockingBackend {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn submit(&mut self, target: &OutputHandle, offset: u64, chunk: JobResult) -> Result<()> {
        fsx::write_all_at(&target.file, chunk.chunk.data(), offset).map_err(|e| PipelineError::io(e, &target.path))
    }

    fn complete(&mut self, _target: &OutputHandle) -> Result<()> {
        Ok(())
    }
}

/// Writes run on a small tokio runtime; completion is awaited per file.
pub struct RuntimeBackend {
    runtime: Runtime,
    pending: HashMap<FileId, Vec<JoinHandle<io::Result<()>>>>,
}

impl RuntimeBackend {
    pub fn new(write_threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(write_threads.max(1))
            .thread_name("blitzpipe-write")
            .build()?;
        Ok(RuntimeBackend {
            runtime,
            pending: HashMap::new(),
        })
    }
}

impl WriteBackend for RuntimeBackend {
    fn name(&self) -> &'static str {
        "runtime"
    }

    fn submit(&mut self, target: &OutputHandle, offset: u64, chunk: JobResult) -> Result<()> {
        let file = Arc::clone(&target.file);
        let handle = self
            .runtime
            .spawn_blocking(move || fsx::write_all_at(&file, chunk.chunk.data(), offset));
        self.pending.entry(target.file_id).or_default().push(handle);
        Ok(())
    }

    fn complete(&mut self, target: &OutputHandle) -> Result<()> {
        let mut first_error = None;
        for handle in self.pending.remove(&target.file_id).unwrap_or_default() {
            let outcome = match self.runtime.block_on(handle) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => PipelineError::io(e, &target.path),
                Err(_) => PipelineError::WorkerPanicked("write"),
            };
            first_error.get_or_insert(outcome);
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Pick the backend once per run. `Auto` uses the runtime backend where the
/// platform has a native asynchronous file path (Linux, Windows) and falls
/// back to blocking writes elsewhere or if the runtime cannot start.
pub fn select_backend(kind: IoBackendKind, write_threads: usize) -> Box<dyn WriteBackend> {
    let want_runtime = match kind {
        IoBackendKind::Blocking => false,
        IoBackendKind::Runtime => true,
        IoBackendKind::Auto => cfg!(any(target_os = "linux", target_os = "windows")),
    };
    if want_runtime {
        match RuntimeBackend::new(write_threads) {
            Ok(backend) => {
                tracing::debug!(kind = ?kind, "using runtime write backend");
                return Box::new(backend);
            }
            Err(e) => tracing::warn!(error = %e, "write runtime unavailable, falling back to blocking writes"),
        }
    }
    tracing::debug!(kind = ?kind, "using blocking write backend");
    Box::new(BlockingBackend)
}
