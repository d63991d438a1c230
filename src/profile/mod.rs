//! Profiler over search results
//!
//! Streams the search TSV (grouped by query), attributes multi-hit reads
//! proportionally across their targets, accumulates per-fragment read and
//! unique-read counts, and ranks the surviving references. The scoring rules
//! mirror the search output exactly; the profiler never touches the index.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Write};

use log::warn;

use crate::error::{ConfigError, ProfileError, Result};
use crate::hash::hash_bytes;

/// How per-fragment read counts are folded into one abundance value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NormAbund {
    #[default]
    Mean,
    Min,
    Max,
}
impl NormAbund {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "mean" => Ok(Self::Mean),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(ConfigError::NormAbund(other.to_string()).into()),
        }
    }
}

/// Configuration of a profiling run
#[derive(Clone, Debug)]
pub struct ProfileOptions {
    /// Hits with a per-query FPR above this are ignored
    pub max_fpr: f64,
    /// Hits with a query coverage below this are ignored
    pub min_query_cov: f64,
    /// A fragment counts as matched when its read count exceeds this
    pub min_reads: u64,
    /// References need at least this many unique reads overall
    pub min_uniq_reads: u64,
    /// References need at least this fraction of matched fragments
    pub min_frags_prop: f64,
    /// High-confidence gate: required high-confidence unique reads
    pub min_hic_ureads: u64,
    /// High-confidence gate: query coverage a unique read must reach
    pub min_hic_qcov: f64,
    /// High-confidence gate: required proportion among unique reads
    pub min_hic_prop: f64,
    /// Abundance normalization across fragments
    pub norm_abund: NormAbund,
    /// Hits this far below a query's best coverage are discarded
    pub max_qcov_gap: f64,
    /// Estimated per-base error a high-confidence read may carry
    pub max_mismatch_err: f64,
}
impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            max_fpr: 0.01,
            min_query_cov: 0.55,
            min_reads: 50,
            min_uniq_reads: 20,
            min_frags_prop: 0.8,
            min_hic_ureads: 1,
            min_hic_qcov: 0.8,
            min_hic_prop: 0.1,
            norm_abund: NormAbund::Mean,
            max_qcov_gap: 0.2,
            max_mismatch_err: 0.05,
        }
    }
}
impl ProfileOptions {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("--max-fpr", self.max_fpr),
            ("--min-query-cov", self.min_query_cov),
            ("--min-frags-prop", self.min_frags_prop),
            ("--min-hic-qcov", self.min_hic_qcov),
            ("--min-hic-prop", self.min_hic_prop),
            ("--max-qcov-gap", self.max_qcov_gap),
            ("--max-mismatch-err", self.max_mismatch_err),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Fraction { name, value }.into());
            }
        }
        Ok(())
    }
}

/// One parsed search-result row
#[derive(Clone, Debug)]
struct MatchRecord {
    query: String,
    q_len: u64,
    target: String,
    frag_idx: u32,
    frag_count: u32,
    k: u8,
    q_cov: f64,
}

/// Parses one TSV row of the search output
///
/// Returns `Ok(None)` for rows the profiler ignores by design (unmatched
/// placeholders) and `Err(())` for rows it cannot parse.
#[allow(clippy::result_unit_err)]
fn parse_record(line: &str) -> std::result::Result<Option<(MatchRecord, f64)>, ()> {
    let mut fields = line.split('\t');
    let mut next = || fields.next().ok_or(());

    let query = next()?;
    let q_len: u64 = next()?.parse().map_err(|_| ())?;
    let _q_kmers: u64 = next()?.parse().map_err(|_| ())?;
    let fpr: f64 = next()?.parse().map_err(|_| ())?;
    let _hits: u64 = next()?.parse().map_err(|_| ())?;
    let target = next()?;
    let frag_idx: i64 = next()?.parse().map_err(|_| ())?;
    let frag_count: u32 = next()?.parse().map_err(|_| ())?;
    let _t_len: u64 = next()?.parse().map_err(|_| ())?;
    let k: u8 = next()?.parse().map_err(|_| ())?;
    let _m_kmers: u64 = next()?.parse().map_err(|_| ())?;
    let q_cov: f64 = next()?.parse().map_err(|_| ())?;

    if target.is_empty() || frag_idx < 0 {
        // Unmatched placeholder row
        return Ok(None);
    }
    Ok(Some((
        MatchRecord {
            query: query.to_string(),
            q_len,
            target: target.to_string(),
            frag_idx: frag_idx as u32,
            frag_count,
            k,
            q_cov,
        },
        fpr,
    )))
}

/// Estimated per-base error of a read from its k-mer survival rate
///
/// A read with per-base error `e` keeps a fraction `(1 - e)^k` of its
/// k-mers, so `e = 1 - qcov^(1/k)`.
fn estimated_error(q_cov: f64, k: u8) -> f64 {
    1.0 - q_cov.powf(1.0 / f64::from(k.max(1)))
}

/// Per-reference accumulators
#[derive(Debug, Default)]
struct TargetStats {
    matches: Vec<f64>,
    uniq_matches: Vec<u64>,
    frag_lens: Vec<u64>,
    hic_ureads: u64,
}
impl TargetStats {
    fn ensure_frags(&mut self, frags: usize) {
        if self.matches.len() < frags {
            self.matches.resize(frags, 0.0);
            self.uniq_matches.resize(frags, 0);
            self.frag_lens.resize(frags, 0);
        }
    }
}

/// One surviving reference in the ranked profile
#[derive(Clone, Debug, PartialEq)]
pub struct TargetProfile {
    pub name: String,
    pub frags_prop: f64,
    pub mean_reads: f64,
    pub sum_uniq_reads: u64,
    /// Total bases of the reads credited to this reference
    pub total_bases: u64,
}

/// Streaming profiler over search results grouped by query
pub struct Profiler {
    opts: ProfileOptions,
    targets: HashMap<String, TargetStats>,
    pending: Vec<MatchRecord>,
    current_query: Option<String>,
    seen_queries: HashSet<u64>,
    lines: u64,
    skipped: u64,
}
impl Profiler {
    pub fn new(opts: ProfileOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            opts,
            targets: HashMap::new(),
            pending: Vec::new(),
            current_query: None,
            seen_queries: HashSet::new(),
            lines: 0,
            skipped: 0,
        })
    }

    /// Streams one search-result file into the accumulators
    ///
    /// Rows failing the FPR or coverage filters are ignored; rows that do
    /// not parse are counted and skipped. A query id reappearing after a
    /// different query is a protocol violation: the input is required to be
    /// grouped by query, which the search output guarantees.
    pub fn add_file<R: BufRead>(&mut self, reader: R) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            self.lines += 1;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (record, fpr) = match parse_record(&line) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(()) => {
                    self.skipped += 1;
                    continue;
                }
            };
            if fpr > self.opts.max_fpr || record.q_cov < self.opts.min_query_cov {
                continue;
            }
            if record.frag_count == 0 {
                return Err(ProfileError::ZeroFragments {
                    target: record.target,
                    line: self.lines,
                }
                .into());
            }

            if self.current_query.as_deref() != Some(record.query.as_str()) {
                self.flush_query();
                let fingerprint = hash_bytes(record.query.as_bytes());
                if !self.seen_queries.insert(fingerprint) {
                    return Err(ProfileError::NotGroupedByQuery {
                        query: record.query,
                        line: self.lines,
                    }
                    .into());
                }
                self.current_query = Some(record.query.clone());
            }
            self.pending.push(record);
        }
        Ok(())
    }

    /// Credits the buffered hits of one query to their targets
    ///
    /// Hits more than `max_qcov_gap` below the query's best coverage are
    /// dropped first; the rest share one read proportionally. A query left
    /// with a single hit counts as a unique read for its target.
    fn flush_query(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let best = self
            .pending
            .iter()
            .map(|r| r.q_cov)
            .fold(f64::MIN, f64::max);
        let gap = self.opts.max_qcov_gap;
        self.pending.retain(|r| best - r.q_cov <= gap);

        let share = 1.0 / self.pending.len() as f64;
        let unique = self.pending.len() == 1;
        for record in self.pending.drain(..) {
            let stats = self.targets.entry(record.target).or_default();
            let frags = (record.frag_count as usize).max(record.frag_idx as usize + 1);
            stats.ensure_frags(frags);
            let idx = record.frag_idx as usize;
            stats.matches[idx] += share;
            stats.frag_lens[idx] += record.q_len;
            if unique {
                stats.uniq_matches[idx] += 1;
                if record.q_cov >= self.opts.min_hic_qcov
                    && estimated_error(record.q_cov, record.k) <= self.opts.max_mismatch_err
                {
                    stats.hic_ureads += 1;
                }
            }
        }
    }

    /// Applies the reference-level filters and returns the ranked profile
    pub fn finish(mut self) -> Result<Vec<TargetProfile>> {
        self.flush_query();
        if self.skipped > 0 {
            warn!("skipped {} unparsable line(s)", self.skipped);
        }

        let opts = &self.opts;
        let mut profiles = Vec::new();
        for (name, stats) in self.targets {
            let frags = stats.matches.len() as f64;
            let matched_frags = stats
                .matches
                .iter()
                .filter(|&&c| c > opts.min_reads as f64)
                .count() as f64;
            let frags_prop = matched_frags / frags;
            if frags_prop < opts.min_frags_prop {
                continue;
            }

            let sum_uniq: u64 = stats.uniq_matches.iter().sum();
            if sum_uniq < opts.min_uniq_reads {
                continue;
            }

            // Two-stage precision gate over unique reads
            if stats.hic_ureads < opts.min_hic_ureads {
                continue;
            }
            if sum_uniq > 0 && (stats.hic_ureads as f64 / sum_uniq as f64) < opts.min_hic_prop {
                continue;
            }

            let mean_reads = match opts.norm_abund {
                NormAbund::Mean => stats.matches.iter().sum::<f64>() / frags,
                NormAbund::Min => stats.matches.iter().copied().fold(f64::MAX, f64::min),
                NormAbund::Max => stats.matches.iter().copied().fold(f64::MIN, f64::max),
            };
            profiles.push(TargetProfile {
                name,
                frags_prop,
                mean_reads,
                sum_uniq_reads: sum_uniq,
                total_bases: stats.frag_lens.iter().sum(),
            });
        }

        profiles.sort_by(|a, b| {
            b.frags_prop
                .partial_cmp(&a.frags_prop)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.mean_reads
                        .partial_cmp(&a.mean_reads)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(profiles)
    }
}

/// Serializes a ranked profile as TSV
pub fn write_profile<W: Write>(
    writer: &mut W,
    profiles: &[TargetProfile],
    name_map: Option<&HashMap<String, String>>,
) -> Result<()> {
    if name_map.is_some() {
        writeln!(writer, "name\tfragsProp\tmeanReads\tsumUReads\tannotation")?;
    } else {
        writeln!(writer, "name\tfragsProp\tmeanReads\tsumUReads")?;
    }
    for profile in profiles {
        match name_map {
            Some(map) => {
                let annotation = map.get(&profile.name).map_or("", String::as_str);
                writeln!(
                    writer,
                    "{}\t{:.2}\t{:.0}\t{}\t{}",
                    profile.name,
                    profile.frags_prop,
                    profile.mean_reads,
                    profile.sum_uniq_reads,
                    annotation
                )?;
            }
            None => {
                writeln!(
                    writer,
                    "{}\t{:.2}\t{:.0}\t{}",
                    profile.name, profile.frags_prop, profile.mean_reads, profile.sum_uniq_reads
                )?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod testing {
    use super::*;

    /// Builds one 15-column search-result row
    fn row(query: &str, target: &str, frag_idx: i64, frags: u32, q_cov: f64) -> String {
        format!(
            "{query}\t150\t100\t1.0e-4\t1\t{target}\t{frag_idx}\t{frags}\t5000\t21\t90\t{q_cov:.4}\t0.1\t0.05\t0"
        )
    }

    fn permissive() -> ProfileOptions {
        ProfileOptions {
            min_reads: 0,
            min_uniq_reads: 0,
            min_frags_prop: 0.0,
            min_hic_ureads: 0,
            min_hic_prop: 0.0,
            ..ProfileOptions::default()
        }
    }

    fn profile(opts: ProfileOptions, lines: &[String]) -> Result<Vec<TargetProfile>> {
        let input = lines.join("\n");
        let mut profiler = Profiler::new(opts)?;
        profiler.add_file(input.as_bytes())?;
        profiler.finish()
    }

    #[test]
    fn test_proportional_attribution() {
        // read1 -> {A, B}, read2 -> {A, C}, read3 -> {A}
        let lines = vec![
            row("read1", "A", 0, 1, 0.9),
            row("read1", "B", 0, 1, 0.9),
            row("read2", "A", 0, 1, 0.9),
            row("read2", "C", 0, 1, 0.9),
            row("read3", "A", 0, 1, 0.9),
        ];
        let profiles = profile(permissive(), &lines).unwrap();

        let by_name: HashMap<_, _> = profiles.iter().map(|p| (p.name.as_str(), p)).collect();
        assert!((by_name["A"].mean_reads - 2.0).abs() < 1e-9);
        assert!((by_name["B"].mean_reads - 0.5).abs() < 1e-9);
        assert!((by_name["C"].mean_reads - 0.5).abs() < 1e-9);
        assert_eq!(by_name["A"].sum_uniq_reads, 1);
        assert_eq!(by_name["B"].sum_uniq_reads, 0);
        assert_eq!(by_name["A"].total_bases, 3 * 150);
        assert_eq!(profiles[0].name, "A");
    }

    #[test]
    fn test_ungrouped_input_rejected() {
        let lines = vec![
            row("read1", "A", 0, 1, 0.9),
            row("read2", "A", 0, 1, 0.9),
            row("read1", "B", 0, 1, 0.9),
        ];
        let result = profile(permissive(), &lines);
        assert!(matches!(
            result,
            Err(crate::Error::ProfileError(
                ProfileError::NotGroupedByQuery { .. }
            ))
        ));
    }

    #[test]
    fn test_zero_fragments_rejected() {
        let lines = vec![row("read1", "A", 0, 0, 0.9)];
        let result = profile(permissive(), &lines);
        assert!(matches!(
            result,
            Err(crate::Error::ProfileError(ProfileError::ZeroFragments { .. }))
        ));
    }

    #[test]
    fn test_qcov_gap_drops_weak_hits() {
        // B sits 0.3 below the best hit; with a 0.2 gap the read becomes
        // unique to A
        let lines = vec![row("read1", "A", 0, 1, 0.9), row("read1", "B", 0, 1, 0.6)];
        let profiles = profile(permissive(), &lines).unwrap();

        let by_name: HashMap<_, _> = profiles.iter().map(|p| (p.name.as_str(), p)).collect();
        assert!((by_name["A"].mean_reads - 1.0).abs() < 1e-9);
        assert_eq!(by_name["A"].sum_uniq_reads, 1);
        assert!(!by_name.contains_key("B"));
    }

    #[test]
    fn test_fragment_proportion_filter() {
        // A: 2 of 2 fragments matched; B: 1 of 2
        let lines = vec![
            row("read1", "A", 0, 2, 0.9),
            row("read2", "A", 1, 2, 0.9),
            row("read3", "B", 0, 2, 0.9),
        ];
        let opts = ProfileOptions {
            min_frags_prop: 0.8,
            ..permissive()
        };
        let profiles = profile(opts, &lines).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "A");
        assert!((profiles[0].frags_prop - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_high_confidence_gate() {
        // Both references have one unique read; only A's reaches the
        // coverage the gate demands
        let lines = vec![row("read1", "A", 0, 1, 0.95), row("read2", "B", 0, 1, 0.6)];
        let opts = ProfileOptions {
            min_hic_ureads: 1,
            min_hic_qcov: 0.8,
            min_hic_prop: 0.1,
            ..permissive()
        };
        let profiles = profile(opts, &lines).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "A");
    }

    #[test]
    fn test_min_uniq_reads_filter() {
        let lines = vec![
            row("read1", "A", 0, 1, 0.9),
            row("read2", "A", 0, 1, 0.9),
            row("read3", "B", 0, 1, 0.9),
        ];
        let opts = ProfileOptions {
            min_uniq_reads: 2,
            ..permissive()
        };
        let profiles = profile(opts, &lines).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "A");
    }

    #[test]
    fn test_filters_skip_rows_without_failing() {
        let lines = vec![
            "# a header".to_string(),
            row("read1", "A", 0, 1, 0.9),
            "truncated\tline".to_string(),
            // High FPR: ignored
            "read2\t150\t100\t0.9\t1\tB\t0\t1\t5000\t21\t90\t0.9000\t0.1\t0.05\t1".to_string(),
            // Unmatched placeholder: ignored
            "read3\t150\t100\t1.0e-4\t0\t\t-1\t0\t0\t21\t0\t0\t0\t0\t2".to_string(),
        ];
        let profiles = profile(permissive(), &lines).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "A");
    }

    #[test]
    fn test_norm_abund_min_max() {
        let lines = vec![
            row("read1", "A", 0, 2, 0.9),
            row("read2", "A", 1, 2, 0.9),
            row("read3", "A", 1, 2, 0.9),
        ];
        for (norm, expected) in [(NormAbund::Min, 1.0), (NormAbund::Max, 2.0), (NormAbund::Mean, 1.5)] {
            let opts = ProfileOptions {
                norm_abund: norm,
                ..permissive()
            };
            let profiles = profile(opts, &lines).unwrap();
            assert!(
                (profiles[0].mean_reads - expected).abs() < 1e-9,
                "unexpected abundance for {norm:?}"
            );
        }
    }

    #[test]
    fn test_write_profile_with_annotations() {
        let profiles = vec![TargetProfile {
            name: "A".into(),
            frags_prop: 1.0,
            mean_reads: 12.4,
            sum_uniq_reads: 3,
            total_bases: 450,
        }];
        let map: HashMap<String, String> = [("A".to_string(), "Vibrio".to_string())].into();
        let mut out = Vec::new();
        write_profile(&mut out, &profiles, Some(&map)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("name\tfragsProp\tmeanReads\tsumUReads\tannotation\n"));
        assert!(text.contains("A\t1.00\t12\t3\tVibrio\n"));
    }

    #[test]
    fn test_estimated_error_monotone() {
        assert!(estimated_error(1.0, 21) < 1e-12);
        assert!(estimated_error(0.8, 21) < estimated_error(0.5, 21));
        // Defaults: a 0.8-coverage read at k=21 sits within the 5% budget
        assert!(estimated_error(0.8, 21) <= 0.05);
    }
}
