#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use blitzpipe::codec::{Codec, ZstdCodec};
use blitzpipe::{CodecError, IoBackendKind, PackEntry, PipelineConfig, WriterStrategy};
use rand::{Rng, RngCore, SeedableRng};

/// Zstd with a random sleep before every call, so workers finish out of order.
pub struct DelayCodec {
    inner: ZstdCodec,
    max_delay: Duration,
}

impl DelayCodec {
    pub fn new(max_delay: Duration) -> Arc<dyn Codec> {
        Arc::new(DelayCodec {
            inner: ZstdCodec::new(1),
            max_delay,
        })
    }

    fn nap(&self) {
        let micros = self.max_delay.as_micros() as u64;
        if micros > 0 {
            let pick = rand::thread_rng().gen_range(0..=micros);
            std::thread::sleep(Duration::from_micros(pick));
        }
    }
}

impl Codec for DelayCodec {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        self.nap();
        self.inner.compress(input, out)
    }

    fn decompress(&self, input: &[u8], expected_len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
        self.nap();
        self.inner.decompress(input, expected_len, out)
    }

    fn compress_bound(&self, len: usize) -> usize {
        self.inner.compress_bound(len)
    }
}

/// Half compressible text, half random bytes.
pub fn mixed_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(len);
    let phrase = b"the quick brown fox jumps over the lazy dog. ";
    while data.len() < len {
        let run = rng.gen_range(1..=8192).min(len - data.len());
        if rng.gen_bool(0.5) {
            data.extend(phrase.iter().cycle().take(run));
        } else {
            let start = data.len();
            data.resize(start + run, 0);
            rng.fill_bytes(&mut data[start..]);
        }
    }
    data
}

pub fn config(pool_size: usize, chunk_size: usize, budget: u64) -> PipelineConfig {
    PipelineConfig {
        pool_size,
        chunk_size_bytes: chunk_size,
        memory_budget_bytes: budget,
        io_backend: IoBackendKind::Blocking,
        writer_strategy: WriterStrategy::DedicatedThread,
        ..PipelineConfig::default()
    }
}

/// Write `files` (name, contents) below `dir` and return matching pack entries.
pub fn write_inputs(dir: &Path, files: &[(&str, Vec<u8>)]) -> Vec<PackEntry> {
    files
        .iter()
        .map(|(name, bytes)| {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, bytes).unwrap();
            PackEntry::new(path, *name)
        })
        .collect()
}

/// Every regular file below `dir`, relative, sorted.
pub fn tree(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(dir).unwrap().to_path_buf())
        .collect();
    out.sort();
    out
}
