use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use log::{debug, info};
use parking_lot::Mutex;

use super::SearchOptions;
use super::result::{Match, Query, QueryResult, keep_top_scores, sort_matches};
use crate::db::{DB_VERSION, DbInfo, repetition_dirs};
use crate::error::{ConfigError, ReadError, Result, SearchError};
use crate::hash::{bloom_positions, mix64, query_fpr, single_position};
use crate::kbx::BlockReader;
use crate::sync::ReorderBuffer;

/// Bound on the in-flight query queue
const QUERY_QUEUE_CAPACITY: usize = 1024;

/// One loaded repetition: its descriptor plus its blocks in load order
pub struct Database {
    pub info: DbInfo,
    pub blocks: Vec<BlockReader>,
}
impl Database {
    /// Opens the descriptor and every block it lists
    pub fn open<P: AsRef<Path>>(rep_dir: P, low_mem: bool) -> Result<Self> {
        let rep_dir = rep_dir.as_ref();
        let info = DbInfo::read_from(rep_dir)?;
        if info.version != DB_VERSION {
            return Err(SearchError::UnsupportedDatabaseVersion(info.version).into());
        }
        let mut blocks = Vec::with_capacity(info.blocks.len());
        for name in &info.blocks {
            let path = rep_dir.join(name);
            if !path.is_file() {
                return Err(ReadError::MissingBlockFile(path).into());
            }
            blocks.push(BlockReader::open(path, low_mem)?);
        }
        Ok(Self { info, blocks })
    }
}

/// Counters over a finished search
#[derive(Clone, Copy, Debug, Default)]
pub struct SearchStats {
    pub queries: u64,
    pub matched: u64,
}

/// Per-worker scratch space, allocated once and reused across queries
#[derive(Default)]
struct Scratch {
    counts: Vec<u32>,
    row_buf: Vec<u8>,
    acc: Vec<u8>,
    positions: Vec<u64>,
}

/// Searches queries against one or more KMX databases
///
/// Blocks are opened once (memory-mapped unless `low_mem`) and shared
/// immutably by a pool of query workers. A single serializer restores
/// input order before handing results to the caller.
pub struct SearchEngine {
    databases: Vec<Database>,
    opts: SearchOptions,
    cancel: Arc<AtomicBool>,
}
impl SearchEngine {
    /// Loads every repetition of every database directory
    pub fn open(db_dirs: &[PathBuf], opts: SearchOptions) -> Result<Self> {
        opts.validate()?;
        let mut databases = Vec::new();
        for dir in db_dirs {
            for rep_dir in repetition_dirs(dir)? {
                let database = Database::open(&rep_dir, opts.low_mem)?;
                info!(
                    "loaded {} ({} blocks, k={}, fpr={})",
                    rep_dir.display(),
                    database.blocks.len(),
                    database.info.k,
                    database.info.fpr
                );
                databases.push(database);
            }
        }
        if databases.is_empty() {
            return Err(SearchError::NoDatabases.into());
        }
        for database in &databases {
            // Below the per-filter FPR the coverage threshold cannot
            // separate signal from Bloom noise
            if opts.min_query_cov <= database.info.fpr {
                return Err(ConfigError::QueryCovBelowFpr {
                    qcov: opts.min_query_cov,
                    fpr: database.info.fpr,
                }
                .into());
            }
        }
        Ok(Self {
            databases,
            opts,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn databases(&self) -> &[Database] {
        &self.databases
    }

    #[must_use]
    pub fn options(&self) -> &SearchOptions {
        &self.opts
    }

    /// The cooperative cancellation flag shared with callers
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Runs the full pipeline: feeder, worker pool, order-restoring
    /// serializer
    ///
    /// `queries` is drained on a feeder thread; results reach `on_result`
    /// on the calling thread. With `keep_order` (default) results arrive in
    /// query-index order; otherwise in completion order, each query's hits
    /// contiguous either way. Any engine-fatal error aborts the run.
    pub fn search<I, F>(&self, queries: I, mut on_result: F) -> Result<SearchStats>
    where
        I: IntoIterator<Item = Result<Query>>,
        I::IntoIter: Send,
        F: FnMut(QueryResult) -> Result<()>,
    {
        let threads = if self.opts.threads == 0 {
            num_cpus::get()
        } else {
            self.opts.threads
        };
        let queries = queries.into_iter();

        std::thread::scope(|scope| {
            let (query_tx, query_rx) = mpsc::sync_channel::<Query>(QUERY_QUEUE_CAPACITY);
            let query_rx = Arc::new(Mutex::new(query_rx));
            let (result_tx, result_rx) = mpsc::channel::<Result<QueryResult>>();

            let feeder = scope.spawn(move || -> Result<()> {
                for query in queries {
                    if self.cancelled() {
                        return Err(crate::Error::Cancelled);
                    }
                    if query_tx.send(query?).is_err() {
                        break;
                    }
                }
                Ok(())
            });

            for _ in 0..threads {
                let query_rx = query_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    let mut scratch = Scratch::default();
                    loop {
                        // Take the lock only for the dequeue, not the probe
                        let next = query_rx.lock().recv();
                        let Ok(query) = next else { break };
                        let result = self.search_one(query, &mut scratch);
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            let mut stats = SearchStats::default();
            let mut reorder = ReorderBuffer::new();
            let mut emit = |result: QueryResult, stats: &mut SearchStats| -> Result<()> {
                stats.queries += 1;
                if result.is_matched() {
                    stats.matched += 1;
                }
                on_result(result)
            };
            for result in result_rx {
                let result = match result {
                    Ok(result) => result,
                    Err(e) => {
                        // Block faults invalidate the whole run
                        self.cancel.store(true, Ordering::Relaxed);
                        return Err(e);
                    }
                };
                if self.opts.keep_order {
                    reorder.push(result.idx(), result);
                    while let Some(ready) = reorder.pop_ready() {
                        emit(ready, &mut stats)?;
                    }
                } else {
                    emit(result, &mut stats)?;
                }
            }
            for (_, result) in reorder.into_remaining() {
                emit(result, &mut stats)?;
            }

            feeder.join().expect("feeder thread panicked")?;
            debug!(
                "processed {} queries, {} matched",
                stats.queries, stats.matched
            );
            Ok(stats)
        })
    }

    /// Probes every block of every database with one query
    fn search_one(&self, query: Query, scratch: &mut Scratch) -> Result<QueryResult> {
        let Query {
            idx,
            id,
            len,
            k,
            canonical,
            hashed,
            mut kmers,
        } = query;

        // De-duplicate long queries; short ones keep their multiset
        if kmers.len() >= self.opts.dedup_threshold {
            kmers.sort_unstable();
            kmers.dedup();
        }
        let num_kmers = kmers.len();

        if len < self.opts.min_query_len || num_kmers == 0 {
            return Ok(QueryResult::Unmatched {
                idx,
                id,
                len,
                num_kmers,
                fpr: 0.0,
                k,
            });
        }

        let mut matches = Vec::new();
        let mut fpr: f64 = 0.0;
        for database in &self.databases {
            if database.info.hashed != hashed {
                continue;
            }
            let mut probed = false;
            for block in &database.blocks {
                let header = block.header();
                if header.k != k || header.is_canonical() != canonical {
                    continue;
                }
                probed = true;
                self.probe_block(block, &kmers, hashed, scratch)?;
                self.collect_matches(block, num_kmers, &scratch.counts, &mut matches);
            }
            if probed {
                fpr = fpr.max(query_fpr(database.info.fpr, num_kmers));
            }
        }

        if matches.is_empty() {
            return Ok(QueryResult::Unmatched {
                idx,
                id,
                len,
                num_kmers,
                fpr,
                k,
            });
        }
        if !self.opts.do_not_sort {
            sort_matches(&mut matches, self.opts.sort_by);
            keep_top_scores(&mut matches, self.opts.sort_by, self.opts.top_scores);
        }
        Ok(QueryResult::Matched {
            idx,
            id,
            len,
            num_kmers,
            fpr,
            k,
            matches,
        })
    }

    /// AND-accumulates rows at the query's hashed positions and tallies
    /// per-column popcounts
    fn probe_block(
        &self,
        block: &BlockReader,
        kmers: &[u64],
        hashed: bool,
        scratch: &mut Scratch,
    ) -> Result<()> {
        let header = block.header();
        let row_size = block.row_size();
        let mask = block.mask();

        scratch.counts.clear();
        scratch.counts.resize(row_size * 8, 0);
        scratch.row_buf.resize(row_size, 0);

        if header.h == 1 {
            for &code in kmers {
                let code = if hashed { code } else { mix64(code) };
                let row = block.row(single_position(code, mask), &mut scratch.row_buf)?;
                tally(row, &mut scratch.counts);
            }
        } else {
            scratch.positions.resize(header.h as usize, 0);
            scratch.acc.resize(row_size, 0);
            for &code in kmers {
                let code = if hashed { code } else { mix64(code) };
                bloom_positions(code, mask, &mut scratch.positions);

                let (first, rest) = scratch.positions.split_first().expect("h >= 1");
                let row = block.row(*first, &mut scratch.row_buf)?;
                scratch.acc.copy_from_slice(row);
                for &position in rest {
                    let row = block.row(position, &mut scratch.row_buf)?;
                    for (acc, byte) in scratch.acc.iter_mut().zip(row) {
                        *acc &= byte;
                    }
                    if scratch.acc.iter().all(|&b| b == 0) {
                        break;
                    }
                }
                tally(&scratch.acc, &mut scratch.counts);
            }
        }
        Ok(())
    }

    /// Converts per-column counters into thresholded matches
    fn collect_matches(
        &self,
        block: &BlockReader,
        num_kmers: usize,
        counts: &[u32],
        matches: &mut Vec<Match>,
    ) {
        for (col, info) in block.columns().iter().enumerate() {
            let count = u64::from(counts[col]);
            if count < self.opts.min_kmers {
                continue;
            }
            let q_cov = count as f64 / num_kmers as f64;
            if q_cov < self.opts.min_query_cov {
                continue;
            }
            let t_cov = count as f64 / info.kmer_count as f64;
            if t_cov < self.opts.min_target_cov {
                continue;
            }
            let jaccard = count as f64 / (num_kmers as f64 + info.kmer_count as f64 - count as f64);
            matches.push(Match {
                target: info.seq_id.clone(),
                frag_idx: info.frag_idx,
                frag_count: info.frag_count,
                genome_size: info.genome_size,
                matched: count,
                q_cov,
                t_cov,
                jaccard,
            });
        }
    }
}

/// Adds the set bits of one accumulator row to the per-column counters
#[inline]
fn tally(row: &[u8], counts: &mut [u32]) {
    for (j, &b) in row.iter().enumerate() {
        let mut b = b;
        while b != 0 {
            let lane = b.leading_zeros() as usize;
            counts[j * 8 + lane] += 1;
            b &= !(0x80 >> lane);
        }
    }
}
