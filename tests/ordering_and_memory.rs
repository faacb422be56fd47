mod common;

use std::fs;
use std::time::Duration;

use blitzpipe::{engine, Pipeline, PipelineError, WriterStrategy};
use common::{config, mixed_bytes, write_inputs, DelayCodec};
use tempfile::tempdir;

#[test]
fn random_worker_delays_do_not_change_the_output() -> Result<(), Box<dyn std::error::Error>> {
    let src = tempdir()?;
    let files = vec![
        ("x.bin", mixed_bytes(400_000, 31)),
        ("y.bin", mixed_bytes(5_000, 32)),
        ("z.bin", mixed_bytes(250_000, 33)),
    ];
    let entries = write_inputs(src.path(), &files);

    for writer in [WriterStrategy::DedicatedThread, WriterStrategy::PoolHosted] {
        let mut cfg = config(8, 16 * 1024, 8 * 1024 * 1024);
        cfg.writer_strategy = writer;
        let pipeline = Pipeline::new(cfg).with_codec(DelayCodec::new(Duration::from_millis(3)));
        let work = tempdir()?;
        let archive = work.path().join("delayed.bzp");
        pipeline.pack(&entries, &archive)?;

        // Archive stream order: files in caller order, chunks by sequence.
        let index = engine::list(&archive)?;
        let offsets: Vec<u64> = index
            .entries
            .iter()
            .flat_map(|e| e.chunks.iter().map(|c| c.offset))
            .collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]), "{writer:?}");

        let out = tempdir()?;
        pipeline.extract(&archive, out.path())?;
        for (name, bytes) in &files {
            assert_eq!(&fs::read(out.path().join(name))?, bytes, "{name} with {writer:?}");
        }
    }
    Ok(())
}

#[test]
fn tight_budget_is_never_exceeded() -> Result<(), Box<dyn std::error::Error>> {
    let src = tempdir()?;
    let files = vec![("big.bin", mixed_bytes(3_000_000, 40)), ("small.bin", mixed_bytes(9_000, 41))];
    let entries = write_inputs(src.path(), &files);
    let work = tempdir()?;
    let archive = work.path().join("tight.bzp");

    // Room for roughly three 32 KiB jobs at a time across eight workers.
    let budget = 200 * 1024;
    let pipeline = Pipeline::new(config(8, 32 * 1024, budget)).with_codec(DelayCodec::new(Duration::from_millis(1)));
    let packed = pipeline.pack(&entries, &archive)?;
    assert!(packed.stats.peak_buffered_bytes <= budget);
    assert!(packed.stats.peak_buffered_bytes > 0);
    assert_eq!(packed.stats.buffered_bytes, 0);
    assert_eq!(packed.stats.buffers.outstanding, 0);
    assert_eq!(packed.stats.jobs_in_flight, 0);

    let out = tempdir()?;
    let extracted = pipeline.extract(&archive, out.path())?;
    assert!(extracted.stats.peak_buffered_bytes <= budget);
    assert_eq!(extracted.stats.buffered_bytes, 0);
    assert_eq!(extracted.stats.buffers.outstanding, 0);
    assert_eq!(extracted.stats.jobs_in_flight, 0);
    assert_eq!(extracted.stats.chunks_dispatched, extracted.stats.chunks_released);
    for (name, bytes) in &files {
        assert_eq!(&fs::read(out.path().join(name))?, bytes);
    }
    Ok(())
}

#[test]
fn budget_below_one_job_fails_before_starting() -> Result<(), Box<dyn std::error::Error>> {
    let src = tempdir()?;
    let entries = write_inputs(src.path(), &[("f", mixed_bytes(100_000, 50))]);
    let work = tempdir()?;
    let archive = work.path().join("never.bzp");

    let failure = Pipeline::new(config(2, 64 * 1024, 64 * 1024))
        .pack(&entries, &archive)
        .unwrap_err();
    assert!(matches!(failure.error, PipelineError::BackpressureDeadlock { budget: 65536, .. }));
    assert!(!archive.exists());
    assert_eq!(fs::read_dir(work.path())?.count(), 0);
    Ok(())
}

#[test]
fn extraction_checks_the_budget_against_the_archive() -> Result<(), Box<dyn std::error::Error>> {
    let src = tempdir()?;
    let entries = write_inputs(src.path(), &[("f", mixed_bytes(100_000, 51))]);
    let work = tempdir()?;
    let archive = work.path().join("big_chunks.bzp");
    Pipeline::new(config(2, 64 * 1024, 4 * 1024 * 1024)).pack(&entries, &archive)?;

    let out = tempdir()?;
    let failure = Pipeline::new(config(2, 64 * 1024, 32 * 1024))
        .extract(&archive, out.path())
        .unwrap_err();
    assert!(matches!(failure.error, PipelineError::BackpressureDeadlock { .. }));
    assert_eq!(fs::read_dir(out.path())?.count(), 0);
    Ok(())
}
