use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::codec::CompressionAlgo;
use crate::config::{kib_to_bytes, mib_to_bytes, IoBackendKind, PipelineConfig, WriterStrategy};
use crate::error::{PipelineError, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: tracing::Level,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a new archive from specified files and directories.
    #[command(alias = "c")]
    Create {
        /// One or more input files or directories to add to the archive.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// The path for the output archive file (e.g., data.bzp).
        #[arg(short, long)]
        output: PathBuf,

        /// Compression algorithm for every chunk.
        #[arg(long, value_enum, default_value_t = CodecChoice::Zstd)]
        codec: CodecChoice,

        /// Compression level: zstd 1-22, lzma2 preset 0-9. [default: zstd 3, lzma2 6]
        #[arg(long)]
        level: Option<i32>,

        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// Extract all files from an archive.
    #[command(alias = "x")]
    Extract {
        /// The archive file to extract.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory where files will be extracted. Defaults to the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep incomplete files as `<name>.partial` instead of deleting them.
        #[arg(long)]
        keep_partial: bool,

        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// List the contents of an archive without extracting it.
    #[command(alias = "l")]
    List {
        /// The archive file to list contents of.
        #[arg(required = true)]
        archive: PathBuf,
    },
}

/// Compression algorithms selectable on the command line.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecChoice {
    Zstd,
    Lzma2,
    /// No compression.
    Store,
}

impl CodecChoice {
    pub fn algo(self, level: Option<i32>) -> CompressionAlgo {
        match self {
            CodecChoice::Zstd => CompressionAlgo::Zstd {
                level: level.unwrap_or(3).clamp(1, 22),
            },
            CodecChoice::Lzma2 => CompressionAlgo::Lzma2 {
                preset: level.unwrap_or(6).clamp(0, 9) as u32,
            },
            CodecChoice::Store => CompressionAlgo::Store,
        }
    }
}

/// Pipeline tuning shared by `create` and `extract`. Anything left unset
/// keeps the value from the config file, the environment or the defaults.
#[derive(ClapArgs, Clone, Debug, Default)]
pub struct TuningArgs {
    /// Number of worker threads. [0 = auto-detect based on CPU cores]
    #[arg(long)]
    pub threads: Option<usize>,

    /// Memory budget for in-flight chunks, in MiB.
    #[arg(long)]
    pub mem_budget_mb: Option<u64>,

    /// Chunk size used when packing, in KiB.
    #[arg(long)]
    pub chunk_size_kb: Option<usize>,

    /// Where ordered writes happen: on pool workers or a dedicated writer thread.
    #[arg(long, value_enum)]
    pub writer: Option<WriterStrategy>,

    /// Write backend for extracted files.
    #[arg(long, value_enum)]
    pub io_backend: Option<IoBackendKind>,

    /// Abort the whole operation on the first corrupt chunk.
    #[arg(long)]
    pub fail_fast: bool,

    /// Disable adaptive store (keep codec output even when it is larger).
    #[arg(long)]
    pub no_adaptive: bool,

    /// JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl TuningArgs {
    /// Defaults, then `--config`, then environment, then these flags.
    pub fn resolve(&self) -> Result<PipelineConfig> {
        let base = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        let mut config = base.apply_env();
        if let Some(threads) = self.threads {
            config.pool_size = threads;
        }
        if let Some(mb) = self.mem_budget_mb {
            config.memory_budget_bytes = mib_to_bytes(mb)
                .ok_or_else(|| PipelineError::Config(format!("--mem-budget-mb {mb} is out of range")))?;
        }
        if let Some(kb) = self.chunk_size_kb {
            config.chunk_size_bytes = kib_to_bytes(kb)
                .ok_or_else(|| PipelineError::Config(format!("--chunk-size-kb {kb} is out of range")))?;
        }
        if let Some(writer) = self.writer {
            config.writer_strategy = writer;
        }
        if let Some(backend) = self.io_backend {
            config.io_backend = backend;
        }
        config.fail_fast |= self.fail_fast;
        if self.no_adaptive {
            config.adaptive = false;
        }
        Ok(config)
    }
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::try_parse_from([
            "blitzpipe",
            "create",
            "in",
            "-o",
            "out.bzp",
            "--threads",
            "3",
            "--chunk-size-kb",
            "64",
            "--writer",
            "pool",
            "--no-adaptive",
        ])
        .unwrap();
        let Commands::Create { tuning, codec, .. } = args.command else {
            panic!("expected create");
        };
        assert_eq!(codec, CodecChoice::Zstd);
        let config = tuning.resolve().unwrap();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.chunk_size_bytes, 64 * 1024);
        assert_eq!(config.writer_strategy, WriterStrategy::PoolHosted);
        assert!(!config.adaptive);
    }

    #[test]
    fn oversized_unit_flags_are_config_errors() {
        let huge_budget = TuningArgs {
            mem_budget_mb: Some(u64::MAX),
            ..TuningArgs::default()
        };
        assert!(matches!(huge_budget.resolve(), Err(PipelineError::Config(_))));

        let huge_chunk = TuningArgs {
            chunk_size_kb: Some(usize::MAX),
            ..TuningArgs::default()
        };
        assert!(matches!(huge_chunk.resolve(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn levels_are_clamped_per_codec() {
        assert_eq!(CodecChoice::Zstd.algo(Some(40)), CompressionAlgo::Zstd { level: 22 });
        assert_eq!(CodecChoice::Lzma2.algo(None), CompressionAlgo::Lzma2 { preset: 6 });
    }
}
