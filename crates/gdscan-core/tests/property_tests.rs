//! Property-based tests for scanning.
//!
//! Key invariants:
//! - One result per input path, in input order
//! - Ingested bytes are exactly the file contents
//! - For literal patterns, `matched` agrees with a substring search

use std::path::PathBuf;

use gdscan_core::{FileIngestor, MatchMode, MatcherOptions, ScanSession, SessionOptions};
use gdscan_gpu::{ContextConfig, DeviceContext, SimConfig, SimDevice};
use proptest::prelude::*;

/// A file to create, or `None` for a path that does not exist
fn entry() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::weighted(0.8, prop::collection::vec(any::<u8>(), 0..512))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn results_follow_input_order(entries in prop::collection::vec(entry(), 0..8)) {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = entries
            .iter()
            .enumerate()
            .map(|(i, contents)| {
                let path = dir.path().join(format!("{}.bin", i));
                if let Some(bytes) = contents {
                    std::fs::write(&path, bytes).unwrap();
                }
                path
            })
            .collect();

        let session = ScanSession::<SimDevice>::new(SimConfig::default(), SessionOptions::default());
        session.start().unwrap();
        let report = session.scan(&paths, "a").unwrap();

        prop_assert_eq!(report.results.len(), paths.len());
        for ((result, path), contents) in report.results.iter().zip(&paths).zip(&entries) {
            prop_assert_eq!(&result.path, path);
            prop_assert_eq!(result.is_ok(), contents.is_some());
            if let Some(bytes) = contents {
                prop_assert_eq!(result.bytes, bytes.len() as u64);
            }
        }
    }

    #[test]
    fn ingest_round_trips_file_bytes(contents in prop::collection::vec(any::<u8>(), 0..4096)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, &contents).unwrap();

        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        ctx.initialize(&SimConfig::default()).unwrap();
        let bytes = FileIngestor::default().ingest(&mut ctx, &path).unwrap();

        prop_assert_eq!(bytes, contents);
        prop_assert_eq!(ctx.buffers().stats().live_buffers(), 0);
    }

    #[test]
    fn literal_match_agrees_with_substring_search(
        contents in "[ab ]{0,64}",
        needle in "[ab]{1,3}",
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("text.txt");
        std::fs::write(&path, contents.as_bytes()).unwrap();

        let options = SessionOptions {
            matcher: MatcherOptions { mode: MatchMode::Literal, case_insensitive: false },
            ..SessionOptions::default()
        };
        let session = ScanSession::<SimDevice>::new(SimConfig::default(), options);
        session.start().unwrap();
        let report = session.scan(&[&path], &needle).unwrap();

        prop_assert_eq!(report.results[0].matched, contains(contents.as_bytes(), needle.as_bytes()));
    }
}
