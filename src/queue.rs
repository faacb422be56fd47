//! Bounded work queue between the driver and the compute pool.
//!
//! The job-count limit is the channel capacity; the byte limit is enforced by
//! the governor permit every chunk carries, which the producer has to obtain
//! before it may build the job. `enqueue` therefore blocks while either limit
//! is reached. Jobs come out in the order they went in.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};

use crate::chunk::Job;
use crate::error::{PipelineError, Result};
use crate::state::PipelineState;

const ABORT_POLL: Duration = Duration::from_millis(25);

/// Creates a queue holding at most `depth` jobs.
pub fn work_queue(depth: usize, state: Arc<PipelineState>) -> (JobSender, JobReceiver) {
    let (tx, rx) = bounded(depth.max(1));
    (JobSender { tx, state }, JobReceiver { rx })
}

/// Producer half. Dropping it closes the queue once the remaining jobs drain.
pub struct JobSender {
    tx: Sender<Job>,
    state: Arc<PipelineState>,
}

impl JobSender {
    /// Blocks until the job fits. Gives the job back to the caller's drop
    /// (retiring it) and returns `CancellationRequested` if the pipeline aborts
    /// while waiting.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        let mut job = job;
        self.state.job_dispatched();
        loop {
            if self.state.is_aborted() {
                self.state.job_withdrawn();
                return Err(PipelineError::CancellationRequested);
            }
            match self.tx.send_timeout(job, ABORT_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => job = back,
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.state.job_withdrawn();
                    return Err(PipelineError::WorkerPanicked("compute"));
                }
            }
        }
    }

    /// Jobs waiting to be picked up.
    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}

/// Consumer half, cloned into every worker.
#[derive(Clone)]
pub struct JobReceiver {
    rx: Receiver<Job>,
}

impl JobReceiver {
    /// Blocks while the queue is empty; `None` once it is closed and drained.
    pub fn dequeue(&self) -> Option<Job> {
        self.rx.recv().ok()
    }
}
