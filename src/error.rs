use std::path::PathBuf;

/// Custom Result type for kmx operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the kmx library, encompassing everything that can
/// go wrong while building, reading, or searching a KMX database.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Errors related to file and block headers
    #[error("Error processing header: {0}")]
    HeaderError(#[from] HeaderError),

    /// Errors that occur while reading artifacts or blocks
    #[error("Error reading file: {0}")]
    ReadError(#[from] ReadError),

    /// Errors that occur during write operations
    #[error("Error writing file: {0}")]
    WriteError(#[from] WriteError),

    /// Errors that occur while constructing an index
    #[error("Error building index: {0}")]
    BuildError(#[from] BuildError),

    /// Errors that occur inside the search engine
    #[error("Error searching index: {0}")]
    SearchError(#[from] SearchError),

    /// Errors that occur while profiling search results
    #[error("Error profiling matches: {0}")]
    ProfileError(#[from] ProfileError),

    /// Rejected configuration values or combinations
    #[error("Invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),

    /// Standard I/O errors
    #[error("Error with IO: {0}")]
    IoError(#[from] std::io::Error),

    /// UTF-8 conversion errors
    #[error("Error with UTF8: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),

    /// Metadata (de)serialization errors
    #[error("Error with metadata JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,
}
impl Error {
    /// Checks whether the error is fatal to a whole search engine rather
    /// than to a single query.
    ///
    /// Any block-level IO or header fault invalidates the database as a
    /// whole; per-query conditions (short queries, no matches) never
    /// surface as errors.
    #[must_use]
    pub fn is_engine_fatal(&self) -> bool {
        matches!(
            self,
            Self::IoError(_) | Self::ReadError(_) | Self::HeaderError(_)
        )
    }
}

/// Errors specific to processing and validating kmx file headers
#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    /// The magic number in the header does not match the expected value
    #[error("Invalid magic number: {0:?}")]
    InvalidMagicNumber([u8; 3]),

    /// The format version in the header is not supported
    #[error("Invalid format version: {0}")]
    InvalidFormatVersion(u8),

    /// The k-mer size is outside the supported range
    #[error("Invalid k-mer size in header: {0} - expecting 1..=64")]
    InvalidKmerSize(u8),

    /// A block row count that is not a power of two cannot be probed with
    /// masked hashing
    #[error("Block row count is not a power of two: {0}")]
    RowCountNotPowerOfTwo(u64),

    /// A block with zero or more than 64 reference columns
    #[error("Invalid number of columns in block: {0} - expecting 1..=64")]
    InvalidColumnCount(u8),

    /// The number of Bloom hash functions must be at least one
    #[error("Invalid number of hash functions: {0}")]
    InvalidHashCount(u8),

    /// Inconsistent parameters across the sources of one block, or between
    /// a database and its blocks
    #[error(
        "Mismatched parameters (k: {expected_k}/{found_k}, canonical: {expected_canonical}/{found_canonical}, hashed: {expected_hashed}/{found_hashed}) in {}", .path.display()
    )]
    ParameterMismatch {
        expected_k: u8,
        found_k: u8,
        expected_canonical: bool,
        found_canonical: bool,
        expected_hashed: bool,
        found_hashed: bool,
        path: PathBuf,
    },

    /// Scaled artifacts must agree on the down-sampling scale
    #[error("Mismatched down-sampling scale ({expected} vs {found}) in {}", .path.display())]
    ScaleMismatch {
        expected: u32,
        found: u32,
        path: PathBuf,
    },

    /// The index builder requires artifacts with sorted payloads
    #[error("K-mer set file is not flagged as sorted: {}", .0.display())]
    NotSorted(PathBuf),
}

/// Errors that can occur while reading k-mer artifacts or index blocks
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    /// The file being read is not a regular file
    #[error("File is not regular: {}", .0.display())]
    IncompatibleFile(PathBuf),

    /// The file is shorter than its header claims
    #[error("File shorter than expected - possibly truncated at byte pos {0}")]
    FileTruncation(usize),

    /// The k-mer payload of an artifact is not strictly increasing
    #[error("K-mer codes not sorted in {}: code at position {position} is not increasing", .path.display())]
    UnsortedCodes { path: PathBuf, position: u64 },

    /// A row index beyond the block's row count
    #[error("Requested row index ({requested_index}) is out of row range ({max_index})")]
    OutOfRange {
        requested_index: u64,
        max_index: u64,
    },

    /// A database directory without a recognizable descriptor
    #[error("Not a kmx database (no descriptor found): {}", .0.display())]
    MissingDescriptor(PathBuf),

    /// A block file referenced by the descriptor is absent
    #[error("Block file listed in descriptor is missing: {}", .0.display())]
    MissingBlockFile(PathBuf),

    /// End of stream was reached while reading
    #[error("End of stream reached")]
    EndOfStream,
}

/// Errors that can occur while writing k-mer artifacts or index blocks
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    /// Codes pushed to an artifact writer must be strictly increasing
    #[error("K-mer code {got} pushed after {prev} - codes must be strictly increasing")]
    NonIncreasingCode { prev: u64, got: u64 },

    /// The number of codes written does not match the header
    #[error("Wrote {got} k-mer codes but the header promised {expected}")]
    CodeCountMismatch { expected: u64, got: u64 },

    /// A plane buffer whose length disagrees with the block row count
    #[error("Plane length ({got}) does not match the block row count ({expected})")]
    UnexpectedPlaneLength { expected: u64, got: usize },

    /// More than eight planes cannot be interleaved into one block
    #[error("Too many planes for one block: {0} - expecting 1..=8")]
    TooManyPlanes(usize),

    /// Column descriptors and planes must agree on the column count
    #[error("Column table holds {columns} entries but {planes} planes were provided")]
    ColumnPlaneMismatch { columns: usize, planes: usize },
}

/// Errors that can occur while constructing an index
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// No input artifacts were given or matched
    #[error("No k-mer set files to index")]
    NoInputFiles,

    /// The required Bloom filter would exceed the addressable row range
    #[error("Required filter size ({0} bits) exceeds the supported maximum (2^42)")]
    FilterTooLarge(u64),

    /// The output directory exists and --force was not given
    #[error("Output directory already exists: {} (use --force to overwrite)", .0.display())]
    OutputExists(PathBuf),
}

/// Errors that can occur inside the search engine
#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    /// The database was built with a different format version
    #[error("Database version {0} is not supported")]
    UnsupportedDatabaseVersion(u32),

    /// The engine was constructed without any database
    #[error("No database loaded")]
    NoDatabases,

    /// A worker thread died without reporting a result
    #[error("Search worker panicked")]
    WorkerPanicked,
}

/// Errors that can occur while profiling search results
#[derive(thiserror::Error, Debug)]
pub enum ProfileError {
    /// Profile input must be grouped by query; interleaved queries indicate
    /// an unsorted or concatenated-by-column input
    #[error("Input not grouped by query: {query} reappears after other queries (line {line})")]
    NotGroupedByQuery { query: String, line: u64 },

    /// A credited hit names a target with zero fragments
    #[error("Target {target} reports zero fragments (line {line})")]
    ZeroFragments { target: String, line: u64 },
}

/// Rejected configuration values or combinations
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("False positive rate must be within (0, 1): {0}")]
    FalsePositiveRate(f64),

    #[error("Number of hash functions must be within 1..=255: {0}")]
    NumHashes(usize),

    #[error("Block size ({block_size}) may not exceed the number of buckets ({buckets})")]
    BlockSizeExceedsBuckets { block_size: usize, buckets: usize },

    #[error("Block size ({0}) may not exceed 64 columns")]
    BlockSizeExceedsColumns(usize),

    #[error("Bucket {bucket} collects {columns} columns, above the 64-column block limit; increase --num-buckets")]
    BucketExceedsColumns { bucket: usize, columns: usize },

    #[error("First k-mer threshold ({t1}) must be smaller than the second k-mer threshold ({t2})")]
    ThresholdOrder { t1: u64, t2: u64 },

    #[error("Value of --sort-by must be one of qcov/tcov/jacc: {0}")]
    SortBy(String),

    #[error("Value of --norm-abund must be one of mean/min/max: {0}")]
    NormAbund(String),

    #[error("Value of {name} must be within [0, 1]: {value}")]
    Fraction { name: &'static str, value: f64 },

    #[error("Query coverage threshold ({qcov}) should not be below the database FPR ({fpr})")]
    QueryCovBelowFpr { qcov: f64, fpr: f64 },
}
