use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::info;

use kmx::build::{BuildConfig, Builder};
use kmx::db::{self, NAME_MAPPING_FILE};
use kmx::profile::{NormAbund, ProfileOptions, Profiler, write_profile};
use kmx::search::{Query, SearchEngine, SearchOptions, SortBy, search_to_tsv};

#[derive(Parser)]
#[command(name = "kmx", version, about = "K-mer containment search over bit-sliced Bloom-filter matrices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Construct a database from k-mer set files
    Index(IndexArgs),
    /// Search k-mer sets against a database
    Search(SearchArgs),
    /// Generate a reference profile from search results
    Profile(ProfileArgs),
}

#[derive(clap::Args)]
struct IndexArgs {
    /// K-mer set files (.kms)
    inputs: Vec<PathBuf>,

    /// Directory to scan recursively for .kms files
    #[arg(short = 'I', long)]
    in_dir: Option<PathBuf>,

    /// Output directory [default: <in-dir>.kmx-db or kmx-db]
    #[arg(short = 'O', long)]
    out_dir: Option<PathBuf>,

    /// Database alias [default: base name of the output directory]
    #[arg(short, long, default_value = "")]
    alias: String,

    /// False positive rate of a single Bloom filter
    #[arg(short, long, default_value_t = 0.3)]
    fpr: f64,

    /// Number of Bloom hash functions
    #[arg(short = 'n', long, default_value_t = 1)]
    num_hash: u8,

    /// Block size in columns (max 64); 0 derives it from inputs and cores
    #[arg(short, long, default_value_t = 0)]
    block_size: usize,

    /// Above this many k-mers a reference is grouped at most 8 per block
    #[arg(short = 'm', long, default_value = "20M", value_parser = parse_kmer_count)]
    block_max_kmers_t1: u64,

    /// Above this many k-mers a reference gets its own block
    #[arg(short = 'M', long, default_value = "200M", value_parser = parse_kmer_count)]
    block_max_kmers_t2: u64,

    /// Maximum number of simultaneously open files
    #[arg(short = 'F', long, default_value_t = 256)]
    max_open_files: usize,

    /// Number of independent column shufflings (RAMBO)
    #[arg(short = 'R', long, default_value_t = 1)]
    repetitions: usize,

    /// Buckets per repetition; 0 for one bucket per input
    #[arg(short = 'B', long, default_value_t = 0)]
    buckets: usize,

    /// Seed for assigning inputs to buckets
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Worker threads; 0 for all cores
    #[arg(short = 'j', long, default_value_t = 0)]
    threads: usize,

    /// Log block geometry without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Overwrite the output directory
    #[arg(long)]
    force: bool,
}

#[derive(clap::Args)]
struct SearchArgs {
    /// Query k-mer set files (.kms)
    queries: Vec<PathBuf>,

    /// Database directories created by `kmx index`
    #[arg(short, long, required = true)]
    db_dir: Vec<PathBuf>,

    /// Output file, "-" for stdout
    #[arg(short, long, default_value = "-")]
    out_file: String,

    /// Minimal query length
    #[arg(short = 'm', long, default_value_t = 70)]
    min_query_len: u64,

    /// Minimal number of matched k-mers
    #[arg(short = 'c', long, default_value_t = 30)]
    min_kmers: u64,

    /// Minimal query coverage (matched / query k-mers)
    #[arg(short = 't', long, default_value_t = 0.55)]
    min_query_cov: f64,

    /// Minimal target coverage (matched / target k-mers)
    #[arg(short = 'T', long, default_value_t = 0.0)]
    min_target_cov: f64,

    /// De-duplicate k-mers of queries holding at least this many
    #[arg(short = 'u', long, default_value_t = 256)]
    kmer_dedup_threshold: usize,

    /// Keep matches with the top N distinct scores; 0 for all
    #[arg(short = 'n', long, default_value_t = 0)]
    keep_top_scores: usize,

    /// Sort matches by qcov, tcov, or jacc
    #[arg(short, long, default_value = "qcov")]
    sort_by: String,

    /// Do not sort matches
    #[arg(short = 'S', long)]
    do_not_sort: bool,

    /// Emit rows for unmatched queries
    #[arg(short = 'K', long)]
    keep_unmatched: bool,

    /// Do not print the header row
    #[arg(short = 'H', long)]
    no_header_row: bool,

    /// Two-column files mapping reference ids to display names
    #[arg(short = 'N', long)]
    name_map: Vec<PathBuf>,

    /// Load <db>/__name_mapping.tsv first
    #[arg(short = 'D', long)]
    default_name_map: bool,

    /// Fetch rows with positioned reads instead of memory maps
    #[arg(long)]
    low_mem: bool,

    /// Worker threads; 0 for all cores
    #[arg(short = 'j', long, default_value_t = 0)]
    threads: usize,
}

#[derive(clap::Args)]
struct ProfileArgs {
    /// Search result files, "-" for stdin
    inputs: Vec<String>,

    /// Output file, "-" for stdout
    #[arg(short, long, default_value = "-")]
    out_file: String,

    /// Maximal per-query false positive rate
    #[arg(short = 'f', long, default_value_t = 0.01)]
    max_fpr: f64,

    /// Minimal query coverage of a hit
    #[arg(short = 't', long, default_value_t = 0.55)]
    min_query_cov: f64,

    /// Reads above this count mark a fragment as matched
    #[arg(short = 'r', long, default_value_t = 50)]
    min_reads: u64,

    /// Minimal unique reads per reference
    #[arg(short = 'u', long, default_value_t = 20)]
    min_uniq_reads: u64,

    /// Minimal proportion of matched fragments
    #[arg(short = 'p', long, default_value_t = 0.8)]
    min_frags_prop: f64,

    /// High-confidence unique reads a reference must have
    #[arg(long, default_value_t = 1)]
    min_hic_ureads: u64,

    /// Query coverage a high-confidence unique read must reach
    #[arg(long, default_value_t = 0.8)]
    min_hic_qcov: f64,

    /// Minimal proportion of high-confidence reads among unique reads
    #[arg(long, default_value_t = 0.1)]
    min_hic_prop: f64,

    /// Abundance normalization: mean, min, or max
    #[arg(long, default_value = "mean")]
    norm_abund: String,

    /// Hits this far below a query's best coverage are discarded
    #[arg(long, default_value_t = 0.2)]
    max_qcov_gap: f64,

    /// Estimated per-base error a high-confidence read may carry
    #[arg(long, default_value_t = 0.05)]
    max_mismatch_err: f64,

    /// Two-column files mapping reference ids to annotations
    #[arg(short = 'N', long)]
    name_map: Vec<PathBuf>,
}

/// Parses a k-mer count with an optional K/M/G suffix
fn parse_kmer_count(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let (digits, scale) = match value.chars().last() {
        Some('K' | 'k') => (&value[..value.len() - 1], 1_000),
        Some('M') => (&value[..value.len() - 1], 1_000_000),
        Some('G' | 'g') => (&value[..value.len() - 1], 1_000_000_000),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n.saturating_mul(scale))
        .map_err(|_| format!("invalid k-mer count: {value}"))
}

fn open_output(path: &str) -> Result<Box<dyn Write>> {
    Ok(match path {
        "-" => Box::new(BufWriter::new(io::stdout())),
        path => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {path}"))?,
        )),
    })
}

/// Recursively collects .kms files below a directory, sorted
fn collect_kms_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_kms_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == kmx::kms::EXTENSION) {
            out.push(path);
        }
    }
    Ok(())
}

fn run_index(args: IndexArgs) -> Result<()> {
    let mut inputs = args.inputs.clone();
    if let Some(in_dir) = &args.in_dir {
        let mut found = Vec::new();
        collect_kms_files(in_dir, &mut found)?;
        found.sort();
        info!("{} .kms file(s) found in {}", found.len(), in_dir.display());
        inputs.extend(found);
    }
    if inputs.is_empty() {
        bail!("no input files; pass .kms files or -I/--in-dir");
    }

    let out_dir = args.out_dir.unwrap_or_else(|| match &args.in_dir {
        Some(in_dir) => {
            let mut name = in_dir.file_name().unwrap_or_default().to_os_string();
            name.push(".kmx-db");
            in_dir.with_file_name(name)
        }
        None => PathBuf::from("kmx-db"),
    });

    let config = BuildConfig {
        out_dir,
        alias: args.alias,
        fpr: args.fpr,
        num_hashes: args.num_hash,
        block_size: args.block_size,
        max_kmers_t1: args.block_max_kmers_t1,
        max_kmers_t2: args.block_max_kmers_t2,
        max_open_files: args.max_open_files,
        repetitions: args.repetitions,
        buckets: args.buckets,
        seed: args.seed,
        threads: args.threads,
        dry_run: args.dry_run,
        force: args.force,
    };
    let summary = Builder::new(config)?.run(&inputs)?;
    info!(
        "indexed {} set(s) ({} k-mers) into {} block(s), {} bytes",
        summary.num_sets, summary.total_kmers, summary.num_blocks, summary.bytes_written
    );
    Ok(())
}

fn run_search(args: SearchArgs) -> Result<()> {
    if args.queries.is_empty() {
        bail!("no query files given");
    }
    let opts = SearchOptions {
        threads: args.threads,
        low_mem: args.low_mem,
        dedup_threshold: args.kmer_dedup_threshold,
        min_query_len: args.min_query_len,
        min_kmers: args.min_kmers,
        min_query_cov: args.min_query_cov,
        min_target_cov: args.min_target_cov,
        sort_by: SortBy::parse(&args.sort_by)?,
        do_not_sort: args.do_not_sort,
        top_scores: args.keep_top_scores,
        keep_unmatched: args.keep_unmatched,
        keep_order: true,
    };

    let mut name_map: HashMap<String, String> = HashMap::new();
    if args.default_name_map {
        for dir in &args.db_dir {
            let path = dir.join(NAME_MAPPING_FILE);
            if path.is_file() {
                name_map.extend(db::read_name_map(&path)?);
            }
        }
    }
    name_map.extend(db::load_name_maps(&args.name_map)?);
    let name_map = (!name_map.is_empty()).then_some(&name_map);

    let engine = SearchEngine::open(&args.db_dir, opts)?;
    let queries = args
        .queries
        .into_iter()
        .enumerate()
        .map(|(idx, path)| Query::from_kms_path(path, idx as u64));

    let writer = open_output(&args.out_file)?;
    let stats = search_to_tsv(&engine, queries, writer, !args.no_header_row, name_map)?;
    info!(
        "{} of {} queries matched",
        stats.matched, stats.queries
    );
    Ok(())
}

fn run_profile(args: ProfileArgs) -> Result<()> {
    let opts = ProfileOptions {
        max_fpr: args.max_fpr,
        min_query_cov: args.min_query_cov,
        min_reads: args.min_reads,
        min_uniq_reads: args.min_uniq_reads,
        min_frags_prop: args.min_frags_prop,
        min_hic_ureads: args.min_hic_ureads,
        min_hic_qcov: args.min_hic_qcov,
        min_hic_prop: args.min_hic_prop,
        norm_abund: NormAbund::parse(&args.norm_abund)?,
        max_qcov_gap: args.max_qcov_gap,
        max_mismatch_err: args.max_mismatch_err,
    };

    let inputs = if args.inputs.is_empty() {
        vec!["-".to_string()]
    } else {
        args.inputs
    };
    let mut profiler = Profiler::new(opts)?;
    for input in &inputs {
        match input.as_str() {
            "-" => profiler.add_file(io::stdin().lock())?,
            path => {
                let reader: Box<dyn BufRead> = Box::new(BufReader::new(
                    File::open(path).with_context(|| format!("opening {path}"))?,
                ));
                profiler.add_file(reader)?;
            }
        }
    }
    let profiles = profiler.finish()?;

    let name_map = if args.name_map.is_empty() {
        None
    } else {
        Some(db::load_name_maps(&args.name_map)?)
    };
    let mut writer = open_output(&args.out_file)?;
    write_profile(&mut writer, &profiles, name_map.as_ref())?;
    info!("{} reference(s) reported", profiles.len());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    match Cli::parse().command {
        Command::Index(args) => run_index(args),
        Command::Search(args) => run_search(args),
        Command::Profile(args) => run_profile(args),
    }
}
