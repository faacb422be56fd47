//! Main entry point for the blitzpipe CLI app

use blitzpipe::cli::{self, Commands};
use blitzpipe::{engine, Pipeline};
use std::path::PathBuf;
use tracing_subscriber::FmtSubscriber;

fn main() -> std::process::ExitCode {
    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::run();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Commands::Create {
            inputs,
            output,
            codec,
            level,
            tuning,
        } => {
            let config = tuning.resolve()?;
            let entries = blitzpipe::compress::collect_inputs(&inputs)?;
            let report = Pipeline::new(config)
                .with_algo(codec.algo(level))
                .pack(&entries, &output)?;
            println!(
                "Packed {} files ({} chunks, {} -> {} bytes, codec {}) into {}",
                report.files,
                report.chunks,
                report.bytes_in,
                report.archive_bytes,
                report.codec,
                output.display()
            );
        }
        Commands::Extract {
            archive,
            output,
            keep_partial,
            tuning,
        } => {
            let mut config = tuning.resolve()?;
            config.keep_partial |= keep_partial;
            let out_dir = output.unwrap_or_else(|| PathBuf::from("."));
            let report = Pipeline::new(config).extract(&archive, &out_dir)?;
            println!(
                "Extracted {} files ({} chunks, {} bytes, {} writes) into {}",
                report.files,
                report.chunks,
                report.bytes_written,
                report.backend,
                out_dir.display()
            );
        }
        Commands::List { archive } => {
            let index = engine::list(&archive)?;
            println!("Archive Index ({} files, codec {}):", index.entries.len(), index.codec);
            for entry in &index.entries {
                println!(
                    "- {} ({} bytes, {} chunks, {} stored)",
                    entry.path,
                    entry.size,
                    entry.chunks.len(),
                    entry.stored_size()
                );
            }
        }
    }

    Ok(())
}
