//! Search engine over KMX databases
//!
//! Queries are probed against every loaded block: for each query k-mer the
//! engine fetches the rows at its hashed positions, ANDs them into an
//! accumulator, and tallies per-column popcounts. Columns passing the
//! coverage thresholds become [`Match`]es; a worker pool keeps blocks busy
//! and a single serializer restores input order.

mod engine;
mod result;

use std::collections::HashMap;
use std::io::Write;

pub use engine::{Database, SearchEngine, SearchStats};
pub use result::{
    Match, Query, QueryResult, SortBy, TSV_HEADER, keep_top_scores, sort_matches, write_result,
};

use crate::error::{ConfigError, Result};

/// Configuration of a search run
#[derive(Clone, Debug)]
pub struct SearchOptions {
    /// Query worker threads; 0 uses all cores
    pub threads: usize,
    /// Fetch rows with positioned reads instead of memory maps
    pub low_mem: bool,
    /// De-duplicate query k-mers when a query holds at least this many
    pub dedup_threshold: usize,
    /// Queries shorter than this yield an unmatched record
    pub min_query_len: u64,
    /// Minimal number of matched k-mers per hit
    pub min_kmers: u64,
    /// Minimal query coverage per hit
    pub min_query_cov: f64,
    /// Minimal target coverage per hit
    pub min_target_cov: f64,
    /// Score the matches of a query are ranked by
    pub sort_by: SortBy,
    /// Skip sorting (and top-score truncation) entirely
    pub do_not_sort: bool,
    /// Keep only matches carrying one of the top N distinct scores; 0 keeps all
    pub top_scores: usize,
    /// Emit placeholder rows for unmatched queries
    pub keep_unmatched: bool,
    /// Restore input order on output
    pub keep_order: bool,
}
impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            low_mem: false,
            dedup_threshold: 256,
            min_query_len: 70,
            min_kmers: 30,
            min_query_cov: 0.55,
            min_target_cov: 0.0,
            sort_by: SortBy::QCov,
            do_not_sort: false,
            top_scores: 0,
            keep_unmatched: false,
            keep_order: true,
        }
    }
}
impl SearchOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("--min-query-cov", self.min_query_cov),
            ("--min-target-cov", self.min_target_cov),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Fraction { name, value }.into());
            }
        }
        Ok(())
    }
}

/// Runs a search and serializes results as TSV
///
/// Unmatched queries are dropped unless `keep_unmatched` is set in the
/// engine's options; `name_map` rewrites target ids at output time.
pub fn search_to_tsv<W, I>(
    engine: &SearchEngine,
    queries: I,
    mut writer: W,
    header_row: bool,
    name_map: Option<&HashMap<String, String>>,
) -> Result<SearchStats>
where
    W: Write,
    I: IntoIterator<Item = Result<Query>>,
    I::IntoIter: Send,
{
    if header_row {
        writer.write_all(TSV_HEADER.as_bytes())?;
    }
    let keep_unmatched = engine.options().keep_unmatched;
    let stats = engine.search(queries, |result| {
        if !result.is_matched() && !keep_unmatched {
            return Ok(());
        }
        write_result(&mut writer, &result, name_map)
    })?;
    writer.flush()?;
    Ok(stats)
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::build::{BuildConfig, Builder};
    use crate::kms::{FileHeader, Metadata, Writer as KmsWriter};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::path::{Path, PathBuf};

    fn write_artifact(dir: &Path, name: &str, k: u8, codes: &[u64]) -> PathBuf {
        let path = dir.join(format!("{name}.kms"));
        let header = FileHeader::new(k).unwrap();
        let meta = Metadata::new(name, 1000);
        let mut writer = KmsWriter::create(&path, header, &meta, codes.len() as u64).unwrap();
        writer.write_sorted(codes).unwrap();
        writer.finish().unwrap();
        path
    }

    fn random_codes(rng: &mut StdRng, n: usize) -> Vec<u64> {
        let mut codes: Vec<u64> = (0..n).map(|_| rng.random()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), n, "seeded draw collided; adjust seed");
        codes
    }

    fn build_db(out: &Path, inputs: &[PathBuf]) {
        let config = BuildConfig {
            out_dir: out.to_path_buf(),
            threads: 2,
            ..BuildConfig::default()
        };
        Builder::new(config).unwrap().run(inputs).unwrap();
    }

    fn query(idx: u64, id: &str, k: u8, len: u64, kmers: Vec<u64>) -> Query {
        Query {
            idx,
            id: id.to_string(),
            len,
            k,
            canonical: true,
            hashed: true,
            kmers,
        }
    }

    fn run_queries(engine: &SearchEngine, queries: Vec<Query>) -> Vec<QueryResult> {
        let mut results = Vec::new();
        engine
            .search(queries.into_iter().map(Ok), |result| {
                results.push(result);
                Ok(())
            })
            .unwrap();
        results
    }

    #[test]
    fn test_full_containment_single_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let codes = random_codes(&mut rng, 1000);
        let input = write_artifact(dir.path(), "R1", 21, &codes);
        let out = dir.path().join("db");
        build_db(&out, &[input]);

        let engine = SearchEngine::open(&[out], SearchOptions::default()).unwrap();
        let results = run_queries(
            &engine,
            vec![query(0, "q0", 21, 300, codes[..100].to_vec())],
        );

        assert_eq!(results.len(), 1);
        let QueryResult::Matched {
            num_kmers, matches, ..
        } = &results[0]
        else {
            panic!("expected a match");
        };
        assert_eq!(*num_kmers, 100);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target, "R1");
        assert_eq!(matches[0].matched, 100);
        assert!((matches[0].q_cov - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_containment_filters_unrelated_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let r1 = random_codes(&mut rng, 1000);
        let r2 = random_codes(&mut rng, 1000);
        let noise = random_codes(&mut rng, 40);
        let inputs = vec![
            write_artifact(dir.path(), "R1", 21, &r1),
            write_artifact(dir.path(), "R2", 21, &r2),
        ];
        let out = dir.path().join("db");
        build_db(&out, &inputs);

        let mut kmers = r1[..60].to_vec();
        kmers.extend_from_slice(&noise);
        let engine = SearchEngine::open(&[out], SearchOptions::default()).unwrap();
        let results = run_queries(&engine, vec![query(0, "q0", 21, 300, kmers)]);

        let QueryResult::Matched { matches, .. } = &results[0] else {
            panic!("expected a match");
        };
        assert_eq!(matches.len(), 1, "R2 must stay below threshold");
        assert_eq!(matches[0].target, "R1");
        assert!(matches[0].q_cov >= 0.6);
    }

    #[test]
    fn test_duplicate_kmers_dedup_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let codes = random_codes(&mut rng, 1000);
        let input = write_artifact(dir.path(), "R1", 21, &codes);
        let out = dir.path().join("db");
        build_db(&out, &[input]);

        let engine = SearchEngine::open(&[out], SearchOptions::default()).unwrap();

        let unique = codes[..300].to_vec();
        let mut duplicated = Vec::with_capacity(600);
        for &code in &unique {
            duplicated.push(code);
            duplicated.push(code);
        }

        let results = run_queries(
            &engine,
            vec![
                query(0, "unique", 21, 300, unique),
                query(1, "duplicated", 21, 300, duplicated),
            ],
        );
        let (QueryResult::Matched { num_kmers: a, matches: ma, .. },
             QueryResult::Matched { num_kmers: b, matches: mb, .. }) =
            (&results[0], &results[1])
        else {
            panic!("expected matches");
        };
        assert_eq!(a, b);
        assert_eq!(ma[0].matched, mb[0].matched);
        assert_eq!(ma[0].q_cov, mb[0].q_cov);
    }

    #[test]
    fn test_mismatched_k_blocks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let r21 = random_codes(&mut rng, 500);
        let r31 = random_codes(&mut rng, 500);
        let db21 = dir.path().join("db21");
        let db31 = dir.path().join("db31");
        build_db(&db21, &[write_artifact(dir.path(), "R21", 21, &r21)]);
        build_db(&db31, &[write_artifact(dir.path(), "R31", 31, &r31)]);

        let engine = SearchEngine::open(&[db21, db31], SearchOptions::default()).unwrap();
        let results = run_queries(&engine, vec![query(0, "q0", 21, 300, r21[..100].to_vec())]);

        let QueryResult::Matched { matches, .. } = &results[0] else {
            panic!("expected a match");
        };
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target, "R21");
    }

    #[test]
    fn test_query_cov_below_fpr_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(10);
        let codes = random_codes(&mut rng, 200);
        let input = write_artifact(dir.path(), "R1", 21, &codes);
        let out = dir.path().join("db");
        build_db(&out, &[input]);

        let opts = SearchOptions {
            min_query_cov: 0.2,
            ..SearchOptions::default()
        };
        let result = SearchEngine::open(&[out], opts);
        assert!(matches!(
            result,
            Err(crate::Error::ConfigError(
                crate::error::ConfigError::QueryCovBelowFpr { .. }
            ))
        ));
    }

    #[test]
    fn test_short_query_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let codes = random_codes(&mut rng, 500);
        let input = write_artifact(dir.path(), "R1", 21, &codes);
        let out = dir.path().join("db");
        build_db(&out, &[input]);

        let engine = SearchEngine::open(&[out], SearchOptions::default()).unwrap();
        let results = run_queries(&engine, vec![query(0, "short", 21, 50, codes[..100].to_vec())]);
        assert!(matches!(&results[0], QueryResult::Unmatched { .. }));
    }

    #[test]
    fn test_target_coverage_tracks_containment_fraction() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(6);
        let codes = random_codes(&mut rng, 1000);
        let input = write_artifact(dir.path(), "R1", 21, &codes);
        let out = dir.path().join("db");
        build_db(&out, &[input]);

        let engine = SearchEngine::open(&[out], SearchOptions::default()).unwrap();
        let results = run_queries(&engine, vec![query(0, "half", 21, 300, codes[..500].to_vec())]);
        let QueryResult::Matched { matches, .. } = &results[0] else {
            panic!("expected a match");
        };
        assert!((matches[0].t_cov - 0.5).abs() < 1e-9);
        assert!((matches[0].q_cov - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_keep_order_across_thread_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let codes = random_codes(&mut rng, 2000);
        let input = write_artifact(dir.path(), "R1", 21, &codes);
        let out = dir.path().join("db");
        build_db(&out, &[input]);

        for threads in [1usize, 2, 8] {
            let opts = SearchOptions {
                threads,
                keep_unmatched: true,
                ..SearchOptions::default()
            };
            let engine = SearchEngine::open(std::slice::from_ref(&out), opts).unwrap();

            let queries: Vec<Query> = (0..40)
                .map(|i| {
                    let start = (i as usize * 37) % 1900;
                    query(i, &format!("q{i}"), 21, 300, codes[start..start + 64].to_vec())
                })
                .collect();
            let results = run_queries(&engine, queries);
            let order: Vec<u64> = results.iter().map(QueryResult::idx).collect();
            let expected: Vec<u64> = (0..40).collect();
            assert_eq!(order, expected, "order broken with {threads} threads");
        }
    }

    #[test]
    fn test_false_positive_fraction_within_bound() {
        // Random foreign k-mers must hit a column at roughly the configured
        // Bloom rate; the any-hit rate over cols columns is bounded by
        // 1 - (1 - fpr)^cols
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        let codes = random_codes(&mut rng, 1000);
        let input = write_artifact(dir.path(), "R1", 21, &codes);
        let out = dir.path().join("db");
        build_db(&out, &[input]);

        let block = crate::kbx::BlockReader::open(out.join("r001").join("block001.kmx"), false)
            .unwrap();
        let members: std::collections::HashSet<u64> = codes.iter().copied().collect();

        let trials = 4000;
        let mut hits = 0usize;
        let mut buf = vec![0u8; block.row_size()];
        for _ in 0..trials {
            let probe: u64 = rng.random();
            if members.contains(&probe) {
                continue;
            }
            let row = block.row(probe & block.mask(), &mut buf).unwrap();
            if row.iter().any(|&b| b != 0) {
                hits += 1;
            }
        }
        let rate = hits as f64 / trials as f64;
        assert!(rate <= 0.3 + 0.03, "false positive rate {rate} out of bound");
        assert!(rate > 0.0, "a loaded filter cannot be empty");
    }

    #[test]
    fn test_tsv_output_and_unmatched_suppression() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let codes = random_codes(&mut rng, 500);
        let input = write_artifact(dir.path(), "R1", 21, &codes);
        let out = dir.path().join("db");
        build_db(&out, &[input]);

        let engine = SearchEngine::open(&[out], SearchOptions::default()).unwrap();
        let queries = vec![
            query(0, "hit", 21, 300, codes[..100].to_vec()),
            query(1, "miss", 21, 300, random_codes(&mut rng, 100)),
        ];
        let mut tsv = Vec::new();
        let stats =
            search_to_tsv(&engine, queries.into_iter().map(Ok), &mut tsv, true, None).unwrap();

        assert_eq!(stats.queries, 2);
        assert_eq!(stats.matched, 1);
        let text = String::from_utf8(tsv).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert!(lines[0].starts_with("#query\t"));
        assert_eq!(lines.len(), 2, "unmatched row must be suppressed");
        assert!(lines[1].starts_with("hit\t"));
    }
}
