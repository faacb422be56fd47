mod common;

use std::fs;

use blitzpipe::{engine, CompressionAlgo, IoBackendKind, Pipeline, WriterStrategy};
use common::{config, mixed_bytes, tree, write_inputs};
use tempfile::tempdir;

const BUDGET: u64 = 16 * 1024 * 1024;

#[test]
fn three_file_scenario_round_trips_in_caller_order() -> Result<(), Box<dyn std::error::Error>> {
    let src = tempdir()?;
    let files = vec![
        ("one.bin", mixed_bytes(1_048_576, 1)),
        ("ten.bin", mixed_bytes(10_485_760, 2)),
        ("hundred_k.bin", mixed_bytes(102_400, 3)),
    ];
    let entries = write_inputs(src.path(), &files);
    let work = tempdir()?;
    let archive = work.path().join("scenario.bzp");

    let pipeline = Pipeline::new(config(2, 65536, BUDGET));
    let packed = pipeline.pack(&entries, &archive)?;
    assert_eq!(packed.files, 3);
    assert_eq!(packed.chunks, 16 + 160 + 2);
    assert!(packed.stats.peak_buffered_bytes <= BUDGET);

    let index = engine::list(&archive)?;
    let names: Vec<&str> = index.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(names, vec!["one.bin", "ten.bin", "hundred_k.bin"]);
    assert_eq!(index.chunk_size, 65536);

    let out = tempdir()?;
    let extracted = pipeline.extract(&archive, out.path())?;
    assert_eq!(extracted.files, 3);
    for (name, bytes) in &files {
        assert_eq!(&fs::read(out.path().join(name))?, bytes, "{name} differs");
    }
    assert_eq!(extracted.stats.buffered_bytes, 0);
    assert_eq!(extracted.stats.buffers.outstanding, 0);
    Ok(())
}

#[test]
fn extraction_is_independent_of_pool_size() -> Result<(), Box<dyn std::error::Error>> {
    let src = tempdir()?;
    let files = vec![
        ("a/first.dat", mixed_bytes(700_000, 10)),
        ("b/second.dat", mixed_bytes(33_333, 11)),
        ("c/third.dat", mixed_bytes(2_000_001, 12)),
    ];
    let entries = write_inputs(src.path(), &files);
    let work = tempdir()?;
    let archive = work.path().join("pools.bzp");
    Pipeline::new(config(4, 32 * 1024, BUDGET)).pack(&entries, &archive)?;

    let single = tempdir()?;
    let many = tempdir()?;
    Pipeline::new(config(1, 32 * 1024, BUDGET)).extract(&archive, single.path())?;
    Pipeline::new(config(8, 32 * 1024, BUDGET)).extract(&archive, many.path())?;

    assert_eq!(tree(single.path()), tree(many.path()));
    for rel in tree(single.path()) {
        assert_eq!(fs::read(single.path().join(&rel))?, fs::read(many.path().join(&rel))?);
    }
    Ok(())
}

#[test]
fn every_codec_and_writer_combination_round_trips() -> Result<(), Box<dyn std::error::Error>> {
    let src = tempdir()?;
    let files = vec![
        ("empty", Vec::new()),
        ("tiny.txt", b"hello".to_vec()),
        ("body.bin", mixed_bytes(300_000, 20)),
    ];
    let entries = write_inputs(src.path(), &files);

    let algos = [
        CompressionAlgo::Zstd { level: 3 },
        CompressionAlgo::Lzma2 { preset: 1 },
        CompressionAlgo::Store,
    ];
    let setups = [
        (WriterStrategy::DedicatedThread, IoBackendKind::Blocking),
        (WriterStrategy::PoolHosted, IoBackendKind::Runtime),
    ];
    for algo in algos {
        for (writer, backend) in setups {
            let mut cfg = config(3, 64 * 1024, BUDGET);
            cfg.writer_strategy = writer;
            cfg.io_backend = backend;
            let pipeline = Pipeline::new(cfg).with_algo(algo);

            let work = tempdir()?;
            let archive = work.path().join("combo.bzp");
            pipeline.pack(&entries, &archive)?;
            let out = tempdir()?;
            let report = pipeline.extract(&archive, out.path())?;
            assert_eq!(report.files, 3, "{algo:?} {writer:?}");
            for (name, bytes) in &files {
                assert_eq!(&fs::read(out.path().join(name))?, bytes, "{name} with {algo:?} {writer:?}");
            }
        }
    }
    Ok(())
}

#[test]
fn adaptive_store_keeps_random_chunks_raw() -> Result<(), Box<dyn std::error::Error>> {
    use rand::RngCore;
    let src = tempdir()?;
    let mut noise = vec![0u8; 256 * 1024];
    rand::thread_rng().fill_bytes(&mut noise);
    let text = b"abcdefgh".repeat(32 * 1024);
    let entries = write_inputs(src.path(), &[("noise", noise), ("text", text)]);
    let work = tempdir()?;
    let archive = work.path().join("adaptive.bzp");

    Pipeline::new(config(2, 64 * 1024, BUDGET)).pack(&entries, &archive)?;
    let index = engine::list(&archive)?;
    assert!(index.entries[0].chunks.iter().all(|c| !c.packed && c.stored_size == c.raw_size));
    assert!(index.entries[1].chunks.iter().all(|c| c.packed && c.stored_size < c.raw_size));
    Ok(())
}

#[test]
fn permissions_survive_the_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let src = tempdir()?;
        let entries = write_inputs(src.path(), &[("run.sh", b"#!/bin/sh\n".to_vec())]);
        fs::set_permissions(&entries[0].source, fs::Permissions::from_mode(0o750))?;
        let work = tempdir()?;
        let archive = work.path().join("perm.bzp");
        let pipeline = Pipeline::new(config(1, 4096, BUDGET));
        pipeline.pack(&entries, &archive)?;
        let out = tempdir()?;
        pipeline.extract(&archive, out.path())?;
        let mode = fs::metadata(out.path().join("run.sh"))?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }
    Ok(())
}
