mod common;

use std::fs;

use blitzpipe::{CompressionAlgo, Pipeline};
use common::{config, write_inputs};
use proptest::prelude::*;
use tempfile::tempdir;

fn any_algo() -> impl Strategy<Value = CompressionAlgo> {
    prop_oneof![
        (1i32..=9).prop_map(|level| CompressionAlgo::Zstd { level }),
        (0u32..=3).prop_map(|preset| CompressionAlgo::Lzma2 { preset }),
        Just(CompressionAlgo::Store),
    ]
}

proptest! {
    #[test]
    fn codec_output_stays_within_bound_and_decodes(
        algo in any_algo(),
        data in prop::collection::vec(any::<u8>(), 0..20_000),
    ) {
        let codec = algo.build();
        let mut packed = Vec::new();
        codec.compress(&data, &mut packed).unwrap();
        prop_assert!(packed.len() <= codec.compress_bound(data.len()));

        let mut out = Vec::new();
        codec.decompress(&packed, data.len(), &mut out).unwrap();
        prop_assert_eq!(out, data);
    }

    #[test]
    fn wrong_expected_length_is_rejected(
        algo in any_algo(),
        data in prop::collection::vec(any::<u8>(), 1..4_000),
    ) {
        let codec = algo.build();
        let mut packed = Vec::new();
        codec.compress(&data, &mut packed).unwrap();
        let mut out = Vec::new();
        prop_assert!(codec.decompress(&packed, data.len() + 1, &mut out).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn pipeline_round_trips_any_chunking(
        chunk_kb in 1usize..=48,
        pool in 1usize..=6,
        sizes in prop::collection::vec(0usize..200_000, 1..4),
        seed in any::<u64>(),
    ) {
        let src = tempdir().unwrap();
        let files: Vec<(String, Vec<u8>)> = sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| (format!("f{i}.bin"), common::mixed_bytes(len, seed.wrapping_add(i as u64))))
            .collect();
        let borrowed: Vec<(&str, Vec<u8>)> = files.iter().map(|(n, d)| (n.as_str(), d.clone())).collect();
        let entries = write_inputs(src.path(), &borrowed);

        let work = tempdir().unwrap();
        let archive = work.path().join("prop.bzp");
        let pipeline = Pipeline::new(config(pool, chunk_kb * 1024, 4 * 1024 * 1024));
        let packed = pipeline.pack(&entries, &archive).unwrap();
        let expected_chunks: u64 = sizes.iter().map(|&len| len.div_ceil(chunk_kb * 1024) as u64).sum();
        prop_assert_eq!(packed.chunks, expected_chunks);

        let out = tempdir().unwrap();
        pipeline.extract(&archive, out.path()).unwrap();
        for (name, bytes) in &files {
            prop_assert_eq!(&fs::read(out.path().join(name)).unwrap(), bytes);
        }
    }
}
