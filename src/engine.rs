//! Orchestration of one pack or extract operation.
//!
//! Every call builds a fresh [`PipelineState`], starts the compute pool (and
//! the dedicated writer thread, depending on [`WriterStrategy`]) inside a
//! `std::thread::scope`, runs the sequential driver on the calling thread and
//! tears everything down again. Nothing outlives the call.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::unbounded;

use crate::archive::{ArchiveIndex, ArchiveReader, ArchiveWriter};
use crate::codec::{Codec, CompressionAlgo};
use crate::compress::{self, ArchiveSink, PackEntry};
use crate::config::{PipelineConfig, WriterStrategy};
use crate::coordinator::{run_writer, ChannelPort, Coordinator, HostedCoordinator, ReleaseSink};
use crate::error::{PipelineError, PipelineFailure, Result};
use crate::extract::{self, backend::select_backend, FileSink, OutputEntry};
use crate::fsx;
use crate::queue::{work_queue, JobSender};
use crate::state::{CancelToken, PipelineState, PipelineStats};
use crate::workers::{spawn_pool, Worker};

/// Outcome of a successful pack.
#[derive(Debug, Clone)]
pub struct PackReport {
    pub files: usize,
    pub chunks: u64,
    /// Uncompressed bytes read from the sources.
    pub bytes_in: u64,
    /// Size of the finished archive.
    pub archive_bytes: u64,
    pub codec: &'static str,
    pub stats: PipelineStats,
}

/// Outcome of a successful extraction.
#[derive(Debug, Clone)]
pub struct ExtractReport {
    pub files: usize,
    pub chunks: u64,
    pub bytes_written: u64,
    pub backend: &'static str,
    pub stats: PipelineStats,
}

/// Entry point for packing and extracting.
///
/// ```no_run
/// use blitzpipe::{Pipeline, PipelineConfig, PackEntry};
/// use std::path::Path;
///
/// let pipeline = Pipeline::new(PipelineConfig::default());
/// let entries = vec![PackEntry::new("data.bin", "data.bin")];
/// pipeline.pack(&entries, Path::new("data.bzp")).unwrap();
/// pipeline.extract(Path::new("data.bzp"), Path::new("out")).unwrap();
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    algo: CompressionAlgo,
    codec: Option<Arc<dyn Codec>>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline {
            config,
            algo: CompressionAlgo::default(),
            codec: None,
            cancel: CancelToken::new(),
        }
    }

    /// Algorithm used when packing. Extraction follows the archive's index.
    pub fn with_algo(mut self, algo: CompressionAlgo) -> Self {
        self.algo = algo;
        self
    }

    /// Use a specific codec instance for both directions. Its name must
    /// match the codec recorded in archives it extracts.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle for cancelling a running operation from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn new_state(&self) -> Arc<PipelineState> {
        let chunk = self.config.chunk_size_bytes;
        PipelineState::new(
            self.config.memory_budget_bytes,
            chunk,
            self.config.resolved_queue_depth() + self.config.resolved_pool_size() * 2,
            self.cancel.clone(),
            self.config.fail_fast,
        )
    }

    /// Pack `entries` (in this order) into a new archive at `archive`.
    pub fn pack(&self, entries: &[PackEntry], archive: &Path) -> Result<PackReport, PipelineFailure> {
        let started = Instant::now();
        let codec = self.codec.clone().unwrap_or_else(|| self.algo.build());
        let chunk_size = self.config.chunk_size_bytes as u64;
        self.config.validate(compress::job_reservation(codec.as_ref(), chunk_size))?;

        let state = self.new_state();
        let mut writer = ArchiveWriter::create(archive, codec.name(), chunk_size)?;
        let sources = compress::register_sources(entries, &mut writer, &state);
        tracing::info!(
            files = entries.len(),
            codec = codec.name(),
            pool = self.config.resolved_pool_size(),
            budget = self.config.memory_budget_bytes,
            writer = ?self.config.writer_strategy,
            "packing started"
        );

        let worker = Worker::new(Arc::clone(&codec), Arc::clone(&state), self.config.adaptive);
        let sink = self.run(&state, &worker, ArchiveSink::new(writer), |queue| {
            compress::dispatch(&sources, chunk_size, codec.as_ref(), queue, &state)
        });

        let mut chunks = 0;
        let mut index = None;
        if let Some(sink) = sink {
            chunks = sink.chunks_written();
            // An aborted pack leaves nothing behind; dropping the writer deletes the temp file.
            if !state.is_aborted() {
                let omit: HashSet<_> = state.poisoned_files().iter().map(|p| p.file_id).collect();
                match sink.into_writer().finish(&omit) {
                    Ok(written) => index = Some(written),
                    Err(e) => state.abort(e),
                }
            }
        }
        self.conclude(&state)?;

        let index = index.ok_or(PipelineError::WorkerPanicked("writer"))?;
        let archive_bytes = fsx::metadata(archive).map(|m| m.len()).unwrap_or(0);
        let stats = state.stats();
        tracing::info!(
            files = index.entries.len(),
            chunks,
            bytes_in = stats.bytes_in,
            archive_bytes,
            peak_buffered = stats.peak_buffered_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "packing finished"
        );
        Ok(PackReport {
            files: index.entries.len(),
            chunks,
            bytes_in: stats.bytes_in,
            archive_bytes,
            codec: codec.name(),
            stats,
        })
    }

    /// Extract every file of `archive` below `out_dir`.
    pub fn extract(&self, archive: &Path, out_dir: &Path) -> Result<ExtractReport, PipelineFailure> {
        let started = Instant::now();
        let mut reader = ArchiveReader::open(archive)?;
        let codec = self.decoder_for(reader.index())?;
        let outputs = OutputEntry::from_index(reader.index())?;
        let plan = reader.plan();
        let max_job = plan.iter().map(extract::job_reservation).max().unwrap_or(0);
        self.config.validate(max_job)?;
        fsx::create_dir_all(out_dir).map_err(|e| PipelineError::io(e, out_dir))?;

        let names: Vec<Arc<str>> = reader
            .index()
            .entries
            .iter()
            .map(|e| Arc::from(e.path.as_str()))
            .collect();
        let state = self.new_state();
        let backend = select_backend(self.config.io_backend, self.config.resolved_pool_size());
        let backend_name = backend.name();
        tracing::info!(
            archive = %archive.display(),
            files = outputs.len(),
            chunks = plan.len(),
            pool = self.config.resolved_pool_size(),
            backend = backend_name,
            writer = ?self.config.writer_strategy,
            "extraction started"
        );

        let worker = Worker::new(codec, Arc::clone(&state), self.config.adaptive);
        let sink = FileSink::new(out_dir, outputs, backend, self.config.keep_partial);
        let sink = self.run(&state, &worker, sink, |queue| {
            extract::produce(&mut reader, &plan, &names, queue, &state)
        });

        let mut files = 0;
        if let Some(sink) = sink {
            match sink.finish(&state) {
                Ok(totals) => files = totals.files_completed,
                Err(e) => state.abort(e),
            }
        }
        self.conclude(&state)?;

        let stats = state.stats();
        tracing::info!(
            files,
            chunks = stats.chunks_released,
            bytes_out = stats.bytes_out,
            peak_buffered = stats.peak_buffered_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction finished"
        );
        Ok(ExtractReport {
            files,
            chunks: stats.chunks_released,
            bytes_written: stats.bytes_out,
            backend: backend_name,
            stats,
        })
    }

    fn decoder_for(&self, index: &ArchiveIndex) -> Result<Arc<dyn Codec>> {
        match &self.codec {
            Some(codec) if codec.name() == index.codec => Ok(Arc::clone(codec)),
            Some(codec) => Err(PipelineError::Format(format!(
                "archive was packed with '{}', pipeline codec is '{}'",
                index.codec,
                codec.name()
            ))),
            None => Ok(CompressionAlgo::from_name(&index.codec)?.build()),
        }
    }

    /// Run the driver on this thread against the pool and coordinator.
    ///
    /// Returns the sink once everything has drained, or `None` if the
    /// dedicated writer thread died with it.
    fn run<S, D>(&self, state: &Arc<PipelineState>, worker: &Worker, sink: S, drive: D) -> Option<S>
    where
        S: ReleaseSink + Send,
        D: FnOnce(&JobSender) -> Result<()>,
    {
        let pool_size = self.config.resolved_pool_size();
        let (jobs_tx, jobs_rx) = work_queue(self.config.resolved_queue_depth(), Arc::clone(state));
        let coordinator = Coordinator::new(Arc::clone(state));

        let drive_then_close = |jobs_tx: JobSender| {
            if let Err(e) = drive(&jobs_tx) {
                if !matches!(e, PipelineError::CancellationRequested) {
                    tracing::error!(error = %e, "driver failed, draining");
                }
                state.abort(e);
            }
            drop(jobs_tx);
        };

        let (coordinator, sink) = match self.config.writer_strategy {
            WriterStrategy::PoolHosted => {
                let hosted = HostedCoordinator::new(coordinator, sink, Arc::clone(state));
                let panicked = thread::scope(|s| {
                    let handles = spawn_pool(s, pool_size, worker, &jobs_rx, &&hosted);
                    drop(jobs_rx);
                    drive_then_close(jobs_tx);
                    handles.into_iter().map(|h| h.join()).filter(|r| r.is_err()).count()
                });
                if panicked > 0 {
                    state.abort(PipelineError::WorkerPanicked("compute"));
                }
                let (coordinator, sink) = hosted.into_inner();
                (Some(coordinator), Some(sink))
            }
            WriterStrategy::DedicatedThread => {
                let (results_tx, results_rx) = unbounded();
                thread::scope(|s| {
                    let writer = s.spawn(move || run_writer(results_rx, coordinator, sink, state));
                    let port = ChannelPort::new(results_tx);
                    let handles = spawn_pool(s, pool_size, worker, &jobs_rx, &port);
                    drop(port);
                    drop(jobs_rx);
                    drive_then_close(jobs_tx);
                    if handles.into_iter().map(|h| h.join()).any(|r| r.is_err()) {
                        state.abort(PipelineError::WorkerPanicked("compute"));
                    }
                    match writer.join() {
                        Ok((coordinator, sink)) => (Some(coordinator), Some(sink)),
                        Err(_) => {
                            state.abort(PipelineError::WorkerPanicked("writer"));
                            (None, None)
                        }
                    }
                })
            }
        };

        if let Some(mut coordinator) = coordinator {
            if let Err(e) = coordinator.finish() {
                state.abort(e);
            }
        }
        sink
    }

    /// Turn the state into the operation's result and log any leftovers.
    fn conclude(&self, state: &PipelineState) -> Result<(), PipelineFailure> {
        let stats = state.stats();
        if stats.buffered_bytes != 0 || stats.buffers.outstanding != 0 {
            tracing::error!(
                buffered = stats.buffered_bytes,
                outstanding = stats.buffers.outstanding,
                "pipeline drained with memory still reserved"
            );
        }
        state.outcome().map_err(|failure| {
            if matches!(failure.error, PipelineError::CancellationRequested) {
                tracing::warn!("operation cancelled");
            } else {
                tracing::warn!(error = %failure.error, poisoned = failure.poisoned.len(), "operation failed");
            }
            failure
        })
    }
}

/// Read an archive's index without extracting anything.
pub fn list(archive: &Path) -> Result<ArchiveIndex> {
    Ok(ArchiveReader::open(archive)?.index().clone())
}
