//! Database descriptor and name mapping
//!
//! A KMX database directory holds one sub-directory per repetition, each
//! with its block files and a JSON descriptor listing them in load order,
//! plus an optional tab-separated mapping from reference ids to display
//! names at the top level.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{ReadError, Result};

/// Name of the per-repetition descriptor file
pub const DB_INFO_FILE: &str = "__db.json";

/// Name of the optional top-level name-mapping file
pub const NAME_MAPPING_FILE: &str = "__name_mapping.tsv";

/// Current database layout version
pub const DB_VERSION: u32 = 1;

/// Database-wide descriptor, serialized as JSON per repetition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbInfo {
    pub version: u32,
    pub alias: String,
    pub k: u8,
    pub hashed: bool,
    pub canonical: bool,
    pub scaled: bool,
    pub scale: u32,
    #[serde(default)]
    pub minimizer_w: u32,
    #[serde(default)]
    pub syncmer_s: u32,
    #[serde(default)]
    pub split_size: u32,
    #[serde(default)]
    pub split_overlap: u32,
    pub num_hashes: u8,
    pub fpr: f64,
    /// Worst per-filter false positive rate actually achieved by any block
    /// (at or below the target `fpr` thanks to power-of-two rounding)
    #[serde(default)]
    pub achieved_fpr: f64,
    pub block_size: usize,
    pub total_kmers: u64,
    pub num_names: usize,
    /// Block file names relative to the descriptor, in load order
    pub blocks: Vec<String>,
}
impl DbInfo {
    /// Writes the descriptor next to the blocks it describes
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let path = dir.as_ref().join(DB_INFO_FILE);
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Reads the descriptor of one repetition directory
    pub fn read_from<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(DB_INFO_FILE);
        if !path.is_file() {
            return Err(ReadError::MissingDescriptor(dir.as_ref().to_path_buf()).into());
        }
        let reader = BufReader::new(File::open(path)?);
        let info: Self = serde_json::from_reader(reader)?;
        Ok(info)
    }
}

/// Finds the repetition directories of a database, sorted by name
///
/// A repetition directory is any direct sub-directory carrying a
/// descriptor file. An empty result means `dir` is not a KMX database.
pub fn repetition_dirs<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.is_dir() && path.join(DB_INFO_FILE).is_file() {
            dirs.push(path);
        }
    }
    if dirs.is_empty() {
        return Err(ReadError::MissingDescriptor(dir.as_ref().to_path_buf()).into());
    }
    dirs.sort();
    Ok(dirs)
}

/// Reads a two-column tab-separated name-mapping file
///
/// Lines with fewer than two columns are skipped with a warning; later
/// files and lines win over earlier ones when merged.
pub fn read_name_map<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let reader = BufReader::new(File::open(&path)?);
    let mut map = HashMap::new();
    let mut skipped = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match line.split_once('\t') {
            Some((key, value)) => {
                map.insert(key.to_string(), value.to_string());
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(
            "skipped {} malformed line(s) in name mapping file: {}",
            skipped,
            path.as_ref().display()
        );
    }
    Ok(map)
}

/// Loads and merges several name-mapping files, later files winning
pub fn load_name_maps(paths: &[PathBuf]) -> Result<HashMap<String, String>> {
    let mut merged = HashMap::new();
    for path in paths {
        merged.extend(read_name_map(path)?);
    }
    Ok(merged)
}
