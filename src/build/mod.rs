//! Index construction
//!
//! Turns a collection of k-mer set artifacts into a KMX database: artifacts
//! are scanned, assigned to buckets, planned into batches of similar k-mer
//! count, and each batch becomes one Bloom-matrix block written by a worker
//! pool.

mod batch;
mod builder;

pub use batch::{Batch, Bucket, SetInfo, assign_buckets, plan_batches};
pub use builder::{BuildConfig, BuildSummary, Builder};
