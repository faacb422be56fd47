//! # BlitzPipe Core Library
//!
//! A parallel chunk pipeline for archive packing and extraction. The archive
//! stream is read and written strictly sequentially by one driver, while
//! compression and decompression of individual chunks fan out over a fixed
//! worker pool. Completed chunks are put back in order before they reach a
//! destination, and every chunk in flight holds a reservation against one
//! memory budget.
//!
//! ## Key Modules
//!
//! - [`engine`]: [`Pipeline`], the pack/extract entry point.
//! - [`governor`], [`buffer_pool`], [`queue`]: bounded memory and backpressure.
//! - [`workers`]: the compute thread pool.
//! - [`coordinator`]: per-stream reordering and release.
//! - [`compress`], [`extract`]: the sequential driver for each direction.
//! - [`archive`]: the container format (chunk payloads plus a compressed JSON index).
//! - [`codec`]: pluggable compression algorithms.
//!
//! ## Examples
//!
//! ```no_run
//! use blitzpipe::{PackEntry, Pipeline, PipelineConfig};
//! use std::path::Path;
//!
//! let pipeline = Pipeline::new(PipelineConfig::default().apply_env());
//! let report = pipeline
//!     .pack(&[PackEntry::new("big.iso", "big.iso")], Path::new("big.bzp"))
//!     .expect("pack failed");
//! println!("{} chunks", report.chunks);
//! ```

pub mod archive;
pub mod buffer_pool;
pub mod chunk;
pub mod cli;
pub mod codec;
pub mod compress;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod extract;
pub mod governor;
pub mod queue;
pub mod state;
pub mod workers;

// Cross-platform filesystem wrapper
pub mod fsx;

pub use codec::{Codec, CompressionAlgo};
pub use compress::PackEntry;
pub use config::{IoBackendKind, PipelineConfig, WriterStrategy};
pub use engine::{ExtractReport, PackReport, Pipeline};
pub use error::{CodecError, PipelineError, PipelineFailure};
pub use state::{CancelToken, PipelineStats};
