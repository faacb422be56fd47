//! # Codecs
//!
//! The pipeline never cares which compression algorithm it runs; workers
//! only see `Arc<dyn Codec>`. Implementations must be pure with respect to
//! their inputs and safe to call from many threads at once.
//!
//! Available algorithms:
//! - [`ZstdCodec`]: Zstandard, fast and effective (default).
//! - [`Lzma2Codec`]: LZMA2 (`.xz` stream), better ratio, much slower.
//! - [`StoreCodec`]: plain copy, for already-compressed ("dense") data.

use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, PipelineError};

pub trait Codec: Send + Sync {
    /// Name recorded in the archive index.
    fn name(&self) -> &'static str;

    /// Compress `input`, appending the result to `out`.
    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Decompress `input`, appending to `out`. `expected_len` is the
    /// uncompressed length recorded for the chunk; a different result is an error.
    fn decompress(&self, input: &[u8], expected_len: usize, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Upper bound of `compress` output for `len` input bytes.
    fn compress_bound(&self, len: usize) -> usize;
}

/// Drain a stream decoder into `out`, reading at most one byte past
/// `expected_len`. A longer stream is reported as a length mismatch before it
/// can grow `out` any further.
fn read_capped<R: Read>(decoder: R, expected_len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let start = out.len();
    out.reserve_exact(expected_len);
    decoder
        .take(expected_len as u64 + 1)
        .read_to_end(out)
        .map_err(|e| CodecError::Corrupt(e.to_string()))?;
    check_len(expected_len, out.len() - start)
}

fn check_len(expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::LengthMismatch {
            expected: expected as u64,
            actual: actual as u64,
        });
    }
    Ok(())
}

/// Zstandard at a fixed level.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        ZstdCodec { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        ZstdCodec::new(3)
    }
}

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        zstd::stream::copy_encode(input, &mut *out, self.level)
            .map_err(|e| CodecError::Unsupported(e.to_string()))
    }

    fn decompress(&self, input: &[u8], expected_len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let decoder = zstd::stream::read::Decoder::with_buffer(input).map_err(|e| CodecError::Corrupt(e.to_string()))?;
        read_capped(decoder, expected_len, out)
    }

    fn compress_bound(&self, len: usize) -> usize {
        zstd::zstd_safe::compress_bound(len)
    }
}

/// LZMA2 wrapped in an `.xz` stream.
#[derive(Debug, Clone, Copy)]
pub struct Lzma2Codec {
    preset: u32,
}

impl Lzma2Codec {
    pub fn new(preset: u32) -> Self {
        Lzma2Codec { preset: preset.min(9) }
    }
}

impl Codec for Lzma2Codec {
    fn name(&self) -> &'static str {
        "lzma2"
    }

    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut encoder = xz2::write::XzEncoder::new(&mut *out, self.preset);
        encoder
            .write_all(input)
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|e| CodecError::Unsupported(e.to_string()))
    }

    fn decompress(&self, input: &[u8], expected_len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
        read_capped(xz2::read::XzDecoder::new(input), expected_len, out)
    }

    fn compress_bound(&self, len: usize) -> usize {
        // Incompressible input grows by block headers plus the xz container.
        len.saturating_add(len / 3).saturating_add(128)
    }
}

/// Plain storage without any compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCodec;

impl Codec for StoreCodec {
    fn name(&self) -> &'static str {
        "store"
    }

    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(input);
        Ok(())
    }

    fn decompress(&self, input: &[u8], expected_len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
        check_len(expected_len, input.len())?;
        out.extend_from_slice(input);
        Ok(())
    }

    fn compress_bound(&self, len: usize) -> usize {
        len
    }
}

/// Defines the available compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgo {
    /// Zstandard with the given level.
    Zstd { level: i32 },
    /// LZMA2 with a given preset (0-9).
    Lzma2 { preset: u32 },
    /// Plain storage.
    Store,
}

impl Default for CompressionAlgo {
    fn default() -> Self {
        CompressionAlgo::Zstd { level: 3 }
    }
}

impl CompressionAlgo {
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            CompressionAlgo::Zstd { level } => Arc::new(ZstdCodec::new(level)),
            CompressionAlgo::Lzma2 { preset } => Arc::new(Lzma2Codec::new(preset)),
            CompressionAlgo::Store => Arc::new(StoreCodec),
        }
    }

    /// Decoder for the codec named in an archive index. Levels do not matter
    /// for decompression, so defaults are used.
    pub fn from_name(name: &str) -> Result<Self, PipelineError> {
        match name {
            "zstd" => Ok(CompressionAlgo::Zstd { level: 3 }),
            "lzma2" => Ok(CompressionAlgo::Lzma2 { preset: 6 }),
            "store" => Ok(CompressionAlgo::Store),
            other => Err(PipelineError::Format(format!("unknown codec '{other}'"))),
        }
    }
}
