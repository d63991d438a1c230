//! # KMX
//!
//! The `kmx` library builds and searches KMX databases: bit-sliced
//! Bloom-filter matrices answering large-scale k-mer containment queries
//! over tens of thousands of reference genomes.
//!
//! It offers:
//!
//! - The [`kms`] artifact format for per-reference k-mer sets (sorted 64-bit
//!   hash streams plus sketching metadata)
//! - The [`kbx`] block format: up to 64 reference columns bit-sliced into
//!   row-major Bloom rows, probed with one contiguous read per k-mer
//! - A parallel [`build`] pipeline grouping references into blocks by k-mer
//!   count so one oversized genome cannot inflate its neighbours' filters
//! - A [`search`] engine memory-mapping all blocks, AND-accumulating rows at
//!   hashed positions, and scoring per-target containment, target coverage,
//!   and Jaccard estimates
//! - A streaming [`profile`] stage aggregating per-read matches into ranked
//!   per-reference coverage and uniqueness statistics
//!
//! The index is approximate (no false negatives; tunable false positives),
//! build-once, and read-only after construction.
//!
//! # Example: build and search
//!
//! ```no_run
//! use kmx::build::{BuildConfig, Builder};
//! use kmx::search::{Query, SearchEngine, SearchOptions};
//! use kmx::Result;
//!
//! fn main() -> Result<()> {
//!     let config = BuildConfig {
//!         out_dir: "refs.kmx-db".into(),
//!         ..BuildConfig::default()
//!     };
//!     Builder::new(config)?.run(&["ref1.kms".into(), "ref2.kms".into()])?;
//!
//!     let engine = SearchEngine::open(&["refs.kmx-db".into()], SearchOptions::default())?;
//!     let query = Query::from_kms_path("query.kms", 0)?;
//!     engine.search([Ok(query)], |result| {
//!         println!("{result:?}");
//!         Ok(())
//!     })?;
//!     Ok(())
//! }
//! ```

/// Index construction from k-mer set artifacts
pub mod build;

/// Database descriptor and name mapping
pub mod db;

/// Error definitions
pub mod error;

/// Hashing primitives shared by writer and searcher
pub mod hash;

/// KBX - Bloom-matrix index blocks
pub mod kbx;

/// KMS - per-reference k-mer set artifacts
pub mod kms;

/// Profiler over search results
pub mod profile;

/// Search engine over KMX databases
pub mod search;

/// Coordination primitives (semaphore, order restoration)
pub mod sync;

pub use error::{Error, Result};
