//! Operation-scoped shared state.
//!
//! One [`PipelineState`] is created per pack/extract call and handed to every
//! stage as an `Arc`. It owns the governor and buffer pool, the abort flag,
//! the first error observed and the list of poisoned files. Counters are
//! plain relaxed atomics; they are only read for reporting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer_pool::{BufferPool, PoolMetricsSnapshot};
use crate::chunk::FileId;
use crate::error::{PipelineError, PipelineFailure, PoisonedFile};
use crate::governor::Governor;

/// Cooperative cancellation handle shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct PipelineState {
    governor: Arc<Governor>,
    buffers: BufferPool,
    cancel: CancelToken,
    aborted: AtomicBool,
    fail_fast: bool,
    first_error: Mutex<Option<PipelineError>>,
    poisoned: Mutex<BTreeMap<FileId, PoisonedFile>>,
    in_flight_jobs: AtomicUsize,
    dispatched: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl PipelineState {
    pub fn new(budget_bytes: u64, buffer_capacity: usize, max_idle_buffers: usize, cancel: CancelToken, fail_fast: bool) -> Arc<Self> {
        Arc::new(PipelineState {
            governor: Governor::new(budget_bytes),
            buffers: BufferPool::new(buffer_capacity, max_idle_buffers),
            cancel,
            aborted: AtomicBool::new(false),
            fail_fast,
            first_error: Mutex::new(None),
            poisoned: Mutex::new(BTreeMap::new()),
            in_flight_jobs: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        })
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// True once the caller cancelled or a fatal error was recorded.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Record `error` (if it is the first) and start the drain-then-abort sequence.
    pub fn abort(&self, error: PipelineError) {
        self.record_error(error);
        self.aborted.store(true, Ordering::Release);
        self.governor.wake_all();
    }

    fn record_error(&self, error: PipelineError) {
        let mut slot = self.first_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Exclude a file from further release. Only the first reason per file is kept.
    pub fn poison(&self, file_id: FileId, path: &str, error: PipelineError) {
        tracing::warn!(file_id, path, error = %error, "file poisoned");
        {
            let mut poisoned = self.poisoned.lock().unwrap_or_else(|e| e.into_inner());
            poisoned.entry(file_id).or_insert_with(|| PoisonedFile {
                file_id,
                path: path.to_string(),
                reason: error.to_string(),
            });
        }
        if self.fail_fast {
            self.abort(error);
        } else {
            self.record_error(error);
        }
    }

    pub fn is_poisoned(&self, file_id: FileId) -> bool {
        self.poisoned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&file_id)
    }

    pub fn poisoned_files(&self) -> Vec<PoisonedFile> {
        self.poisoned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Count a job as in flight. Called before it is handed to the queue, so
    /// a worker finishing it can never observe the counter at zero.
    pub fn job_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.in_flight_jobs.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo [`job_dispatched`](Self::job_dispatched) for a job the queue never accepted.
    pub fn job_withdrawn(&self) {
        self.dispatched.fetch_sub(1, Ordering::Relaxed);
        self.in_flight_jobs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn job_completed(&self) {
        self.in_flight_jobs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_flight_jobs(&self) -> usize {
        self.in_flight_jobs.load(Ordering::Acquire)
    }

    pub fn chunk_released(&self, bytes_written: u64) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_written, Ordering::Relaxed);
    }

    pub fn chunk_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Turn the recorded outcome into the operation's result.
    ///
    /// Any recorded error, any poisoned file or an observed cancellation
    /// makes the operation fail; there is no partial success.
    pub fn outcome(&self) -> Result<(), PipelineFailure> {
        let error = self
            .first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let poisoned = self.poisoned_files();
        match error {
            Some(error) => Err(PipelineFailure {
                error,
                poisoned,
                stats: self.stats(),
            }),
            None if self.cancel.is_cancelled() => Err(PipelineFailure {
                error: PipelineError::CancellationRequested,
                poisoned,
                stats: self.stats(),
            }),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            chunks_dispatched: self.dispatched.load(Ordering::Relaxed),
            jobs_in_flight: self.in_flight_jobs(),
            chunks_released: self.released.load(Ordering::Relaxed),
            chunks_discarded: self.discarded.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            buffered_bytes: self.governor.in_flight(),
            peak_buffered_bytes: self.governor.peak(),
            memory_budget_bytes: self.governor.budget(),
            buffers: self.buffers.metrics(),
        }
    }
}

/// Counters captured at the end of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub chunks_dispatched: u64,
    /// Jobs queued or being processed; zero once the pool has drained.
    pub jobs_in_flight: usize,
    pub chunks_released: u64,
    pub chunks_discarded: u64,
    /// Bytes read from the input side (archive or source files).
    pub bytes_in: u64,
    /// Bytes written to the output side.
    pub bytes_out: u64,
    /// Bytes still reserved; zero after a clean drain.
    pub buffered_bytes: u64,
    pub peak_buffered_bytes: u64,
    pub memory_budget_bytes: u64,
    pub buffers: PoolMetricsSnapshot,
}
