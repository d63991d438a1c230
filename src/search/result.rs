use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::error::{ConfigError, Result};

/// One query entering the search engine
///
/// Queries are pre-sketched: the engine never sees sequence, only the
/// 64-bit k-mer codes plus the parameters they were sketched with. `idx`
/// must be dense and increasing (0, 1, 2, ...) for order restoration.
#[derive(Clone, Debug)]
pub struct Query {
    /// Position of the query in the input stream
    pub idx: u64,
    /// Query identifier reported in the output
    pub id: String,
    /// Query length in bases
    pub len: u64,
    /// K-mer size the query was sketched with
    pub k: u8,
    /// Whether the query k-mers are canonical
    pub canonical: bool,
    /// Whether the query k-mers are pre-hashed
    pub hashed: bool,
    /// The query k-mer codes
    pub kmers: Vec<u64>,
}
impl Query {
    /// Loads a query from a k-mer set artifact
    ///
    /// The artifact's `seq_id` becomes the query id and its `genome_size`
    /// the query length.
    pub fn from_kms_path<P: AsRef<Path>>(path: P, idx: u64) -> Result<Self> {
        let mut reader = crate::kms::Reader::from_path(path)?;
        let header = reader.header();
        let meta = reader.metadata().clone();
        let kmers = reader.read_all()?;
        Ok(Self {
            idx,
            id: meta.seq_id,
            len: meta.genome_size,
            k: header.k,
            canonical: header.is_canonical(),
            hashed: header.is_hashed(),
            kmers,
        })
    }
}

/// One target passing all thresholds for a query
#[derive(Clone, Debug)]
pub struct Match {
    /// Target reference id
    pub target: String,
    /// Fragment index of the target column
    pub frag_idx: u32,
    /// Total fragments of the target reference
    pub frag_count: u32,
    /// Genome size of the target reference
    pub genome_size: u64,
    /// Number of matched k-mers
    pub matched: u64,
    /// Fraction of query k-mers present in the target
    pub q_cov: f64,
    /// Fraction of target k-mers covered by the query
    pub t_cov: f64,
    /// Jaccard estimate over the two sets
    pub jaccard: f64,
}

/// The outcome of searching one query
///
/// Tagged so downstream handling is exhaustive: a query either matched at
/// least one target or it did not (too short, empty, or below thresholds).
#[derive(Clone, Debug)]
pub enum QueryResult {
    Matched {
        idx: u64,
        id: String,
        len: u64,
        num_kmers: usize,
        fpr: f64,
        k: u8,
        matches: Vec<Match>,
    },
    Unmatched {
        idx: u64,
        id: String,
        len: u64,
        num_kmers: usize,
        fpr: f64,
        k: u8,
    },
}
impl QueryResult {
    /// The input-stream position of the query this result belongs to
    #[must_use]
    pub fn idx(&self) -> u64 {
        match self {
            Self::Matched { idx, .. } | Self::Unmatched { idx, .. } => *idx,
        }
    }

    #[must_use]
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// Score a query's matches are ranked by
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    /// Containment index (fraction of query k-mers matched)
    #[default]
    QCov,
    /// Target coverage
    TCov,
    /// Jaccard estimate
    Jaccard,
}
impl SortBy {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "qcov" => Ok(Self::QCov),
            "tcov" => Ok(Self::TCov),
            "jacc" => Ok(Self::Jaccard),
            other => Err(ConfigError::SortBy(other.to_string()).into()),
        }
    }

    #[must_use]
    pub fn key(&self, m: &Match) -> f64 {
        match self {
            Self::QCov => m.q_cov,
            Self::TCov => m.t_cov,
            Self::Jaccard => m.jaccard,
        }
    }
}

/// Sorts matches by the selected score, descending, ties broken by target
/// id for deterministic output
pub fn sort_matches(matches: &mut [Match], sort_by: SortBy) {
    matches.sort_by(|a, b| {
        sort_by
            .key(b)
            .partial_cmp(&sort_by.key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.target.cmp(&b.target))
            .then_with(|| a.frag_idx.cmp(&b.frag_idx))
    });
}

/// Truncates sorted matches to those carrying one of the top `n` distinct
/// score values
///
/// Ties survive together: the cut never splits a group of equal scores.
/// `n == 0` keeps everything.
pub fn keep_top_scores(matches: &mut Vec<Match>, sort_by: SortBy, n: usize) {
    if n == 0 || matches.is_empty() {
        return;
    }
    let mut distinct = 0;
    let mut last_score = f64::NAN;
    let mut keep = 0;
    for m in matches.iter() {
        let score = sort_by.key(m);
        if score != last_score {
            distinct += 1;
            if distinct > n {
                break;
            }
            last_score = score;
        }
        keep += 1;
    }
    matches.truncate(keep);
}

/// The search output header row
pub const TSV_HEADER: &str =
    "#query\tqLen\tqKmers\tFPR\thits\ttarget\tfragIdx\tfrags\ttLen\tkSize\tmKmers\tqCov\ttCov\tjacc\tqueryIdx\n";

/// Serializes one query result as TSV rows
///
/// Matched queries emit one row per match; unmatched queries emit a single
/// placeholder row (the caller decides whether to emit them at all). Target
/// ids are replaced through `name_map` when a mapping is present.
pub fn write_result<W: Write>(
    writer: &mut W,
    result: &QueryResult,
    name_map: Option<&HashMap<String, String>>,
) -> Result<()> {
    let mut itoa = itoa::Buffer::new();
    match result {
        QueryResult::Unmatched {
            idx,
            id,
            len,
            num_kmers,
            fpr,
            k,
        } => {
            writer.write_all(id.as_bytes())?;
            writer.write_all(b"\t")?;
            writer.write_all(itoa.format(*len).as_bytes())?;
            writer.write_all(b"\t")?;
            writer.write_all(itoa.format(*num_kmers).as_bytes())?;
            write!(writer, "\t{fpr:.4e}\t0\t\t-1\t0\t0\t")?;
            writer.write_all(itoa.format(*k).as_bytes())?;
            writer.write_all(b"\t0\t0\t0\t0\t")?;
            writer.write_all(itoa.format(*idx).as_bytes())?;
            writer.write_all(b"\n")?;
        }
        QueryResult::Matched {
            idx,
            id,
            len,
            num_kmers,
            fpr,
            k,
            matches,
        } => {
            for m in matches {
                let target = name_map
                    .and_then(|map| map.get(&m.target))
                    .unwrap_or(&m.target);
                writer.write_all(id.as_bytes())?;
                writer.write_all(b"\t")?;
                writer.write_all(itoa.format(*len).as_bytes())?;
                writer.write_all(b"\t")?;
                writer.write_all(itoa.format(*num_kmers).as_bytes())?;
                write!(writer, "\t{fpr:.4e}\t")?;
                writer.write_all(itoa.format(matches.len()).as_bytes())?;
                writer.write_all(b"\t")?;
                writer.write_all(target.as_bytes())?;
                writer.write_all(b"\t")?;
                writer.write_all(itoa.format(m.frag_idx).as_bytes())?;
                writer.write_all(b"\t")?;
                writer.write_all(itoa.format(m.frag_count).as_bytes())?;
                writer.write_all(b"\t")?;
                writer.write_all(itoa.format(m.genome_size).as_bytes())?;
                writer.write_all(b"\t")?;
                writer.write_all(itoa.format(*k).as_bytes())?;
                writer.write_all(b"\t")?;
                writer.write_all(itoa.format(m.matched).as_bytes())?;
                write!(
                    writer,
                    "\t{:.4}\t{:.4}\t{:.4}\t",
                    m.q_cov, m.t_cov, m.jaccard
                )?;
                writer.write_all(itoa.format(*idx).as_bytes())?;
                writer.write_all(b"\n")?;
            }
        }
    }
    Ok(())
}
