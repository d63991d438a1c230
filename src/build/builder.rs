use std::fs;
use std::io::BufWriter;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;

use log::{debug, info, warn};

use super::batch::{Batch, SetInfo, assign_buckets, plan_batches};
use crate::db::{DB_VERSION, DbInfo, NAME_MAPPING_FILE};
use crate::error::{BuildError, ConfigError, HeaderError, Result};
use crate::hash::{achieved_fpr, bloom_positions, mix64, signature_size, single_position};
use crate::kbx::{self, BlockHeader, BlockWriter, ColumnInfo, MAX_COLUMNS, SIZE_HEADER};
use crate::kms;
use crate::sync::{ReorderBuffer, Semaphore};

/// How many codes a plane worker streams between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 1 << 16;

/// Configuration of an index build
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// Database output directory
    pub out_dir: PathBuf,
    /// Database alias; defaults to the output directory's base name
    pub alias: String,
    /// Target false positive rate of a single Bloom filter
    pub fpr: f64,
    /// Number of Bloom hash functions
    pub num_hashes: u8,
    /// Buckets per block; 0 picks `min(inputs / cores, 8)` rounded to 8
    pub block_size: usize,
    /// Buckets above this k-mer count are grouped at most eight per block
    pub max_kmers_t1: u64,
    /// Buckets above this k-mer count get a block of their own
    pub max_kmers_t2: u64,
    /// Cap on simultaneously open artifact files
    pub max_open_files: usize,
    /// Number of independent column shufflings (RAMBO); 1 writes one layout
    pub repetitions: usize,
    /// Buckets per repetition; 0 gives every artifact its own bucket
    pub buckets: usize,
    /// Seed for the repetition shuffles
    pub seed: u64,
    /// Worker threads; 0 uses all cores
    pub threads: usize,
    /// Compute and log block geometry without writing anything
    pub dry_run: bool,
    /// Replace an existing output directory
    pub force: bool,
}
impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("kmx-db"),
            alias: String::new(),
            fpr: 0.3,
            num_hashes: 1,
            block_size: 0,
            max_kmers_t1: 20_000_000,
            max_kmers_t2: 200_000_000,
            max_open_files: 256,
            repetitions: 1,
            buckets: 0,
            seed: 1,
            threads: 0,
            dry_run: false,
            force: false,
        }
    }
}
impl BuildConfig {
    fn validate(&self) -> Result<()> {
        if !(self.fpr > 0.0 && self.fpr < 1.0) {
            return Err(ConfigError::FalsePositiveRate(self.fpr).into());
        }
        if self.num_hashes == 0 {
            return Err(ConfigError::NumHashes(0).into());
        }
        if self.block_size > MAX_COLUMNS {
            return Err(ConfigError::BlockSizeExceedsColumns(self.block_size).into());
        }
        if self.buckets > 0 && self.block_size > self.buckets {
            return Err(ConfigError::BlockSizeExceedsBuckets {
                block_size: self.block_size,
                buckets: self.buckets,
            }
            .into());
        }
        if self.max_kmers_t1 >= self.max_kmers_t2 {
            return Err(ConfigError::ThresholdOrder {
                t1: self.max_kmers_t1,
                t2: self.max_kmers_t2,
            }
            .into());
        }
        Ok(())
    }

    fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    fn effective_block_size(&self, num_inputs: usize) -> usize {
        if self.block_size > 0 {
            return self.block_size;
        }
        let per_cpu = num_inputs / num_cpus::get().max(1);
        per_cpu.min(8).next_multiple_of(8).max(8)
    }

    fn effective_alias(&self) -> String {
        if !self.alias.is_empty() {
            return self.alias.clone();
        }
        self.out_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "kmx-db".to_string())
    }
}

/// Sketching parameters shared by every artifact of a database
#[derive(Clone, Copy, Debug)]
struct SetParams {
    k: u8,
    canonical: bool,
    hashed: bool,
    scaled: bool,
    scale: u32,
    minimizer_w: u32,
    syncmer_s: u32,
    split_size: u32,
    split_overlap: u32,
}

/// Geometry and size of one finished (or dry-run) block
#[derive(Clone, Debug)]
struct BlockSummary {
    file_name: String,
    columns: usize,
    rows: u64,
    bytes: u64,
    /// Per-filter false positive rate achieved at this block's geometry
    fpr: f64,
}

/// Outcome of a completed build
#[derive(Clone, Debug, Default)]
pub struct BuildSummary {
    /// Number of reference artifacts indexed
    pub num_sets: usize,
    /// Total k-mers across all artifacts
    pub total_kmers: u64,
    /// Blocks written across all repetitions
    pub num_blocks: usize,
    /// Bytes written (estimated under `dry_run`)
    pub bytes_written: u64,
}

/// Constructs a KMX database from k-mer set artifacts
///
/// The build is staged: artifacts are scanned once for their identities and
/// k-mer counts, bucketed and planned into batches, and each batch is turned
/// into one block by a worker that fills up to eight byte-planes in
/// parallel. Block files are written through temporary files and persisted
/// only when complete.
pub struct Builder {
    config: BuildConfig,
    cancel: Arc<AtomicBool>,
}
impl Builder {
    pub fn new(config: BuildConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The cooperative cancellation flag; setting it makes workers drain
    /// and the build return [`crate::Error::Cancelled`]
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Runs the build over the given artifact files
    pub fn run(&self, inputs: &[PathBuf]) -> Result<BuildSummary> {
        if inputs.is_empty() {
            return Err(BuildError::NoInputFiles.into());
        }
        let threads = self.config.effective_threads();
        let semaphore = Semaphore::new(self.config.max_open_files.max(1));

        info!("checking {} k-mer set file(s)", inputs.len());
        let (infos, params) = self.scan_sets(inputs, threads, &semaphore)?;
        if infos.is_empty() {
            return Err(BuildError::NoInputFiles.into());
        }
        let total_kmers: u64 = infos.iter().map(|i| i.kmers).sum();
        let block_size = self.config.effective_block_size(infos.len());
        info!(
            "indexing {} set(s), {} k-mers, fpr {}, {} hash(es), block size {}",
            infos.len(),
            total_kmers,
            self.config.fpr,
            self.config.num_hashes,
            block_size
        );

        if !self.config.dry_run {
            if self.config.out_dir.exists() {
                if !self.config.force {
                    return Err(BuildError::OutputExists(self.config.out_dir.clone()).into());
                }
                fs::remove_dir_all(&self.config.out_dir)?;
            }
            fs::create_dir_all(&self.config.out_dir)?;
        }

        let mut summary = BuildSummary {
            num_sets: infos.len(),
            total_kmers,
            ..BuildSummary::default()
        };

        for repetition in 0..self.config.repetitions {
            let rep_dir = self.config.out_dir.join(format!("r{:03}", repetition + 1));
            match self.build_repetition(
                &rep_dir,
                repetition,
                &infos,
                params,
                block_size,
                total_kmers,
                &semaphore,
                threads,
                &mut summary,
            ) {
                Ok(()) => {}
                Err(e) => {
                    if !self.config.dry_run {
                        let _ = fs::remove_dir_all(&rep_dir);
                    }
                    return Err(e);
                }
            }
        }

        if !self.config.dry_run {
            self.write_name_mapping(&infos)?;
        }
        info!(
            "kmx database with {} k-mers saved to {}",
            total_kmers,
            self.config.out_dir.display()
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_repetition(
        &self,
        rep_dir: &Path,
        repetition: usize,
        infos: &[SetInfo],
        params: SetParams,
        block_size: usize,
        total_kmers: u64,
        semaphore: &Semaphore,
        threads: usize,
        summary: &mut BuildSummary,
    ) -> Result<()> {
        let buckets = assign_buckets(infos, self.config.buckets, repetition, self.config.seed);
        if self.config.buckets > 0 && buckets.len() < self.config.buckets {
            warn!(
                "repetition {}: {} of {} buckets are empty",
                repetition + 1,
                self.config.buckets - buckets.len(),
                self.config.buckets
            );
        }
        for (idx, bucket) in buckets.iter().enumerate() {
            if bucket.sets.len() > MAX_COLUMNS {
                return Err(ConfigError::BucketExceedsColumns {
                    bucket: idx,
                    columns: bucket.sets.len(),
                }
                .into());
            }
        }

        let batches = plan_batches(
            buckets,
            block_size,
            self.config.max_kmers_t1,
            self.config.max_kmers_t2,
        );
        info!(
            "repetition {}/{}: {} block(s) planned",
            repetition + 1,
            self.config.repetitions,
            batches.len()
        );

        if !self.config.dry_run {
            fs::create_dir_all(rep_dir)?;
        }
        let block_summaries = self.build_blocks(rep_dir, &batches, params, semaphore, threads)?;

        let db_info = DbInfo {
            version: DB_VERSION,
            alias: self.config.effective_alias(),
            k: params.k,
            hashed: params.hashed,
            canonical: params.canonical,
            scaled: params.scaled,
            scale: params.scale,
            minimizer_w: params.minimizer_w,
            syncmer_s: params.syncmer_s,
            split_size: params.split_size,
            split_overlap: params.split_overlap,
            num_hashes: self.config.num_hashes,
            fpr: self.config.fpr,
            achieved_fpr: block_summaries.iter().map(|s| s.fpr).fold(0.0, f64::max),
            block_size,
            total_kmers,
            num_names: infos.len(),
            blocks: block_summaries.iter().map(|s| s.file_name.clone()).collect(),
        };
        if !self.config.dry_run {
            db_info.write_to(rep_dir)?;
        }

        summary.num_blocks += block_summaries.len();
        summary.bytes_written += block_summaries.iter().map(|s| s.bytes).sum::<u64>();
        Ok(())
    }

    /// Scans artifact headers in parallel, enforcing parameter agreement
    fn scan_sets(
        &self,
        inputs: &[PathBuf],
        threads: usize,
        semaphore: &Semaphore,
    ) -> Result<(Vec<SetInfo>, SetParams)> {
        type Scanned = (SetInfo, kms::FileHeader, kms::Metadata);

        let scan_one = |path: &PathBuf| -> Result<Scanned> {
            let _permit = semaphore.acquire();
            let reader = kms::Reader::from_path(path)?;
            let header = reader.header();
            let meta = reader.metadata().clone();
            let info = SetInfo {
                path: path.clone(),
                seq_id: meta.seq_id.clone(),
                frag_idx: meta.frag_idx,
                frag_count: meta.frag_count,
                genome_size: meta.genome_size,
                kmers: header.num_kmers,
            };
            Ok((info, header, meta))
        };

        let chunk_size = inputs.len().div_ceil(threads);
        let mut scanned: Vec<Scanned> = Vec::with_capacity(inputs.len());
        let scan_one = &scan_one;
        let results: Vec<Result<Vec<Scanned>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = inputs
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        let mut out = Vec::with_capacity(chunk.len());
                        for path in chunk {
                            out.push(scan_one(path)?);
                        }
                        Ok(out)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for result in results {
            scanned.extend(result?);
        }

        // Parameter agreement against the first artifact
        let (_, first_header, first_meta) = &scanned[0];
        let params = SetParams {
            k: first_header.k,
            canonical: first_header.is_canonical(),
            hashed: first_header.is_hashed(),
            scaled: first_header.is_scaled(),
            scale: first_header.scale,
            minimizer_w: first_meta.minimizer_w,
            syncmer_s: first_meta.syncmer_s,
            split_size: first_meta.split_size,
            split_overlap: first_meta.split_overlap,
        };

        let mut infos = Vec::with_capacity(scanned.len());
        let mut seen = std::collections::HashSet::with_capacity(scanned.len());
        for (info, header, _) in scanned {
            if !header.is_sorted() {
                return Err(HeaderError::NotSorted(info.path).into());
            }
            if header.k != params.k
                || header.is_canonical() != params.canonical
                || header.is_hashed() != params.hashed
            {
                return Err(HeaderError::ParameterMismatch {
                    expected_k: params.k,
                    found_k: header.k,
                    expected_canonical: params.canonical,
                    found_canonical: header.is_canonical(),
                    expected_hashed: params.hashed,
                    found_hashed: header.is_hashed(),
                    path: info.path,
                }
                .into());
            }
            if params.scaled && header.scale != params.scale {
                return Err(HeaderError::ScaleMismatch {
                    expected: params.scale,
                    found: header.scale,
                    path: info.path,
                }
                .into());
            }
            if info.kmers == 0 {
                warn!("skipping empty k-mer set file: {}", info.path.display());
                continue;
            }
            if !seen.insert((info.seq_id.clone(), info.frag_idx)) {
                warn!(
                    "duplicated reference identity: {} (fragment {})",
                    info.seq_id, info.frag_idx
                );
            }
            infos.push(info);
        }
        Ok((infos, params))
    }

    /// Runs batch workers over the planned batches and restores batch order
    fn build_blocks(
        &self,
        rep_dir: &Path,
        batches: &[Batch],
        params: SetParams,
        semaphore: &Semaphore,
        threads: usize,
    ) -> Result<Vec<BlockSummary>> {
        let next_batch = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(u64, Result<BlockSummary>)>();

        std::thread::scope(|scope| {
            let next_batch = &next_batch;
            for _ in 0..threads.min(batches.len()) {
                let tx = tx.clone();
                scope.spawn(move || {
                    loop {
                        if self.cancelled() {
                            break;
                        }
                        let idx = next_batch.fetch_add(1, Ordering::Relaxed);
                        if idx >= batches.len() {
                            break;
                        }
                        let result =
                            self.build_one_block(rep_dir, idx, &batches[idx], params, semaphore);
                        if tx.send((idx as u64, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            // Block workers finish out of order; summaries are logged and
            // listed in batch order
            let mut reorder = ReorderBuffer::new();
            let mut summaries = Vec::with_capacity(batches.len());
            let mut first_error = None;
            for (id, result) in rx {
                reorder.push(id, result);
                while let Some(result) = reorder.pop_ready() {
                    match result {
                        Ok(block) => {
                            info!(
                                "[block #{:03}] {} column(s), {} rows, {} bytes",
                                reorder.cursor(),
                                block.columns,
                                block.rows,
                                block.bytes
                            );
                            summaries.push(block);
                        }
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                            self.cancel.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None if self.cancelled() => Err(crate::Error::Cancelled),
                None => Ok(summaries),
            }
        })
    }

    /// Builds one block: fills its byte-planes in parallel, then interleaves
    /// them into a temporary file persisted on success
    fn build_one_block(
        &self,
        rep_dir: &Path,
        idx: usize,
        batch: &Batch,
        params: SetParams,
        semaphore: &Semaphore,
    ) -> Result<BlockSummary> {
        let columns = batch.columns();
        let cols = columns.len();
        let rows = signature_size(batch.max_kmers(), self.config.fpr)?;
        let mask = rows - 1;
        let block_fpr = achieved_fpr(rows, batch.max_kmers(), self.config.num_hashes);
        let file_name = format!("block{:03}.{}", idx + 1, kbx::EXTENSION);
        let col_infos: Vec<ColumnInfo> = columns.iter().map(|c| c.column()).collect();
        let table_len: usize = col_infos.iter().map(ColumnInfo::byte_len).sum();
        let bytes = (SIZE_HEADER + table_len) as u64 + rows * cols.div_ceil(8) as u64;

        debug!(
            "block #{:03}: {} column(s), max k-mers {}, {} rows",
            idx + 1,
            cols,
            batch.max_kmers(),
            rows
        );
        if self.config.dry_run {
            info!(
                "[dry run][block #{:03}] columns: {}, max k-mers: {}, rows: {}, file size: {} bytes",
                idx + 1,
                cols,
                batch.max_kmers(),
                rows,
                bytes
            );
            return Ok(BlockSummary {
                file_name,
                columns: cols,
                rows,
                bytes,
                fpr: block_fpr,
            });
        }

        // Plane workers own their plane exclusively; results are re-ordered
        // by plane id before interleaving
        let (tx, rx) = mpsc::channel::<(u64, Result<Vec<u8>>)>();
        let planes: Result<Vec<Vec<u8>>> = std::thread::scope(|scope| {
            for (plane_idx, plane_cols) in columns.chunks(8).enumerate() {
                let tx = tx.clone();
                scope.spawn(move || {
                    let result = self.fill_plane(plane_cols, rows, mask, params, semaphore);
                    let _ = tx.send((plane_idx as u64, result));
                });
            }
            drop(tx);

            let mut reorder = ReorderBuffer::new();
            let mut planes = Vec::with_capacity(cols.div_ceil(8));
            let mut first_error = None;
            for (id, result) in rx {
                reorder.push(id, result);
                while let Some(result) = reorder.pop_ready() {
                    match result {
                        Ok(plane) => planes.push(plane),
                        Err(e) if first_error.is_none() => first_error = Some(e),
                        Err(_) => {}
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(planes),
            }
        });
        let planes = planes?;
        if self.cancelled() {
            return Err(crate::Error::Cancelled);
        }

        let header = BlockHeader::new(
            rows,
            cols as u8,
            params.k,
            params.canonical,
            self.config.num_hashes,
        )?;
        let mut tmp = tempfile::NamedTempFile::new_in(rep_dir)?;
        {
            let buffered = BufWriter::new(tmp.as_file_mut());
            let mut writer = BlockWriter::new(buffered, header, &col_infos)?;
            writer.write_planes(&planes)?;
            writer.finish()?;
        }
        tmp.as_file_mut().flush()?;
        tmp.persist(rep_dir.join(&file_name)).map_err(|e| e.error)?;

        Ok(BlockSummary {
            file_name,
            columns: cols,
            rows,
            bytes,
            fpr: block_fpr,
        })
    }

    /// Streams up to eight artifacts into one byte-plane
    fn fill_plane(
        &self,
        sets: &[&SetInfo],
        rows: u64,
        mask: u64,
        params: SetParams,
        semaphore: &Semaphore,
    ) -> Result<Vec<u8>> {
        let mut plane = vec![0u8; rows as usize];
        let mut positions = vec![0u64; self.config.num_hashes as usize];
        let single_hash = self.config.num_hashes == 1;

        for (lane, set) in sets.iter().enumerate() {
            let bit = 0x80u8 >> lane;
            let _permit = semaphore.acquire();
            let mut reader = kms::Reader::from_path(&set.path)?;
            let mut streamed = 0u64;
            while let Some(code) = reader.next_code() {
                let code = code?;
                let code = if params.hashed { code } else { mix64(code) };
                if single_hash {
                    plane[single_position(code, mask) as usize] |= bit;
                } else {
                    bloom_positions(code, mask, &mut positions);
                    for &position in &positions {
                        plane[position as usize] |= bit;
                    }
                }
                streamed += 1;
                if streamed.is_multiple_of(CANCEL_CHECK_INTERVAL) && self.cancelled() {
                    return Err(crate::Error::Cancelled);
                }
            }
        }
        Ok(plane)
    }

    /// Writes the top-level identity mapping, one line per distinct seq_id
    fn write_name_mapping(&self, infos: &[SetInfo]) -> Result<()> {
        let path = self.config.out_dir.join(NAME_MAPPING_FILE);
        let mut writer = BufWriter::new(fs::File::create(path)?);
        let mut seen = std::collections::HashSet::new();
        for info in infos {
            if seen.insert(info.seq_id.as_str()) {
                writeln!(writer, "{}\t{}", info.seq_id, info.seq_id)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}
