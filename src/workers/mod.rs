//! Compute thread pool.
//!
//! `pool_size` workers pull jobs from the work queue, run the codec and post
//! the result to a completion port. Packing workers also pull their chunk's
//! raw bytes from the source file (positional reads, so any number of them
//! can read the same file). A failing job becomes a `Failed` result; the
//! worker itself keeps going.

use std::sync::Arc;
use std::thread::{Scope, ScopedJoinHandle};

use crate::chunk::{Chunk, Job, JobResult, JobStatus, Operation, SourceFile, StoredForm};
use crate::codec::Codec;
use crate::coordinator::CompletionPort;
use crate::error::{CodecError, PipelineError};
use crate::fsx;
use crate::queue::JobReceiver;
use crate::state::PipelineState;

/// Everything a worker needs besides its job. Shared by reference.
pub struct Worker {
    codec: Arc<dyn Codec>,
    state: Arc<PipelineState>,
    adaptive: bool,
}

impl Worker {
    pub fn new(codec: Arc<dyn Codec>, state: Arc<PipelineState>, adaptive: bool) -> Self {
        Worker {
            codec,
            state,
            adaptive,
        }
    }

    /// Worker loop. Returns when the queue is closed and drained.
    pub fn run<P: CompletionPort>(&self, jobs: &JobReceiver, port: &P) {
        while let Some(job) = jobs.dequeue() {
            if self.state.is_aborted() {
                self.state.chunk_discarded();
                drop(job);
            } else {
                port.post(self.process(job));
            }
            self.state.job_completed();
        }
    }

    /// Run one job to completion.
    pub fn process(&self, job: Job) -> JobResult {
        let (mut chunk, op, target, file) = job.into_parts();
        let sequence = chunk.header().sequence;
        let outcome = match op {
            Operation::Compress { source } => self.compress(&mut chunk, &source),
            Operation::Decompress { packed, checksum } => self.decompress(&mut chunk, packed, checksum),
        };
        let (stored, status) = match outcome {
            Ok(stored) => (stored, JobStatus::Ok),
            Err(Failure::Io(e, path)) => (StoredForm::default(), JobStatus::Failed(PipelineError::io(e, path))),
            Err(Failure::Codec(source)) => (
                StoredForm::default(),
                JobStatus::Failed(PipelineError::Codec {
                    file: file.to_string(),
                    sequence,
                    source,
                }),
            ),
        };
        JobResult {
            chunk,
            target,
            file,
            stored,
            status,
        }
    }

    fn compress(&self, chunk: &mut Chunk, source: &SourceFile) -> Result<StoredForm, Failure> {
        let header = *chunk.header();
        let len = header.length as usize;
        {
            let raw = chunk.buffer_mut();
            raw.clear();
            raw.resize(len, 0);
            fsx::read_exact_at(source.file(), &mut raw[..], header.offset)
                .map_err(|e| Failure::Io(e, source.path().display().to_string()))?;
        }
        self.state.add_bytes_in(len as u64);

        let mut packed_buf = self.state.buffers().acquire(self.codec.compress_bound(len));
        self.codec.compress(chunk.data(), &mut packed_buf).map_err(Failure::Codec)?;

        let packed = !self.adaptive || packed_buf.len() < len;
        if packed {
            chunk.replace_data(packed_buf);
        }
        let stored_len = chunk.data().len() as u64;
        chunk.permit_mut().shrink_to(stored_len);
        Ok(StoredForm {
            packed,
            checksum: crc32fast::hash(chunk.data()),
        })
    }

    fn decompress(&self, chunk: &mut Chunk, packed: bool, checksum: u32) -> Result<StoredForm, Failure> {
        let actual = crc32fast::hash(chunk.data());
        if actual != checksum {
            return Err(Failure::Codec(CodecError::ChecksumMismatch {
                expected: checksum,
                actual,
            }));
        }
        let len = chunk.header().length as usize;
        if packed {
            let mut out = self.state.buffers().acquire(len);
            self.codec.decompress(chunk.data(), len, &mut out).map_err(Failure::Codec)?;
            chunk.replace_data(out);
        } else if chunk.data().len() != len {
            return Err(Failure::Codec(CodecError::LengthMismatch {
                expected: len as u64,
                actual: chunk.data().len() as u64,
            }));
        }
        chunk.permit_mut().shrink_to(len as u64);
        Ok(StoredForm { packed, checksum })
    }
}

enum Failure {
    Io(std::io::Error, String),
    Codec(CodecError),
}

/// Start `size` workers inside `scope`. Each gets its own clone of `port`.
pub fn spawn_pool<'scope, 'env, P>(
    scope: &'scope Scope<'scope, 'env>,
    size: usize,
    worker: &'scope Worker,
    jobs: &JobReceiver,
    port: &P,
) -> Vec<ScopedJoinHandle<'scope, ()>>
where
    P: CompletionPort + Clone + 'scope,
{
    (0..size.max(1))
        .map(|_| {
            let jobs = jobs.clone();
            let port = port.clone();
            scope.spawn(move || worker.run(&jobs, &port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkHeader, Target};
    use crate::codec::ZstdCodec;
    use crate::state::CancelToken;
    use std::io::Write;

    fn worker(state: &Arc<PipelineState>, adaptive: bool) -> Worker {
        Worker::new(Arc::new(ZstdCodec::default()), Arc::clone(state), adaptive)
    }

    fn compress_job(state: &Arc<PipelineState>, source: &Arc<SourceFile>, offset: u64, length: u64) -> Job {
        let permit = state.governor().try_acquire(length * 2 + 64).unwrap();
        let header = ChunkHeader {
            file_id: 0,
            sequence: 0,
            offset,
            length,
        };
        Job::new(
            Chunk::new(header, state.buffers().acquire(length as usize), permit),
            Operation::Compress {
                source: Arc::clone(source),
            },
            Target::ArchiveSlot(0),
            Arc::from("src.bin"),
        )
    }

    fn decompress_job(state: &Arc<PipelineState>, stored: &[u8], length: u64, packed: bool, checksum: u32) -> Job {
        let permit = state.governor().try_acquire(stored.len() as u64 + length).unwrap();
        let mut data = state.buffers().acquire(stored.len());
        data.extend_from_slice(stored);
        let header = ChunkHeader {
            file_id: 0,
            sequence: 0,
            offset: 0,
            length,
        };
        Job::new(
            Chunk::new(header, data, permit),
            Operation::Decompress { packed, checksum },
            Target::OutputFile(0),
            Arc::from("out.bin"),
        )
    }

    fn source_with(bytes: &[u8]) -> (tempfile::NamedTempFile, Arc<SourceFile>) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        tmp.flush().unwrap();
        let source = Arc::new(SourceFile::open(tmp.path()).unwrap());
        (tmp, source)
    }

    #[test]
    fn compress_then_decompress_restores_the_slice() {
        let state = PipelineState::new(1 << 20, 1024, 8, CancelToken::new(), false);
        let bytes: Vec<u8> = b"abcabcabc".iter().cycle().take(10_000).copied().collect();
        let (_tmp, source) = source_with(&bytes);
        let w = worker(&state, true);

        let packed = w.process(compress_job(&state, &source, 1000, 4000));
        assert!(packed.is_ok());
        assert!(packed.stored.packed);
        assert_eq!(packed.chunk.reserved_bytes(), packed.chunk.data().len() as u64);

        let restored = w.process(decompress_job(&state, packed.chunk.data(), 4000, true, packed.stored.checksum));
        assert!(restored.is_ok());
        assert_eq!(restored.chunk.data(), &bytes[1000..5000]);
    }

    #[test]
    fn incompressible_chunk_is_stored_raw() {
        use rand::RngCore;
        let state = PipelineState::new(1 << 20, 1024, 8, CancelToken::new(), false);
        let mut bytes = vec![0u8; 8192];
        rand::thread_rng().fill_bytes(&mut bytes);
        let (_tmp, source) = source_with(&bytes);

        let result = worker(&state, true).process(compress_job(&state, &source, 0, 8192));
        assert!(!result.stored.packed);
        assert_eq!(result.chunk.data(), &bytes[..]);
        assert_eq!(result.stored.checksum, crc32fast::hash(&bytes));

        let forced = worker(&state, false).process(compress_job(&state, &source, 0, 8192));
        assert!(forced.stored.packed);
    }

    #[test]
    fn checksum_mismatch_fails_the_job() {
        let state = PipelineState::new(1 << 20, 1024, 8, CancelToken::new(), false);
        let result = worker(&state, true).process(decompress_job(&state, b"raw!", 4, false, 0xdead_beef));
        match result.status {
            JobStatus::Failed(PipelineError::Codec {
                source: CodecError::ChecksumMismatch { expected, .. },
                ..
            }) => assert_eq!(expected, 0xdead_beef),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn short_source_read_is_an_io_failure() {
        let state = PipelineState::new(1 << 20, 1024, 8, CancelToken::new(), false);
        let (_tmp, source) = source_with(b"tiny");
        let result = worker(&state, true).process(compress_job(&state, &source, 0, 100));
        assert!(matches!(result.status, JobStatus::Failed(PipelineError::Io { .. })));
    }
}
