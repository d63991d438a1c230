use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use super::{FILE_MAGIC, FILE_VERSION};
use crate::error::{HeaderError, Result};

/// K-mer codes are canonical (strand-collapsed)
pub const FLAG_CANONICAL: u8 = 1 << 0;

/// K-mer codes were passed through a 64-bit hash function
pub const FLAG_HASHED: u8 = 1 << 1;

/// K-mer codes were down-sampled by a scale factor
pub const FLAG_SCALED: u8 = 1 << 2;

/// K-mer codes are stored in strictly increasing order
pub const FLAG_SORTED: u8 = 1 << 3;

/// Size of the fixed artifact header in bytes
pub const SIZE_HEADER: usize = size_of::<FileHeader>();

/// Fixed header of a k-mer set artifact
///
/// The variable-length parts (the JSON metadata blob and the code payload)
/// follow immediately after; their lengths are `meta_len` and
/// `num_kmers * 8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct FileHeader {
    /// File magic number
    magic: [u8; 3],
    /// File version number
    pub version: u8,
    /// Sketching flags (canonical / hashed / scaled / sorted)
    pub flags: u8,
    /// K-mer size
    pub k: u8,
    /// Reserved for future use
    reserved: [u8; 2],
    /// Down-sampling scale (1 when unscaled)
    pub scale: u32,
    /// Length of the JSON metadata blob in bytes
    pub meta_len: u32,
    /// Number of 64-bit codes in the payload
    pub num_kmers: u64,
}
impl FileHeader {
    /// Creates a header for a sorted, canonical, hashed k-mer set
    ///
    /// These are the flags the index builder requires; writers producing
    /// other combinations clear them explicitly.
    pub fn new(k: u8) -> Result<Self> {
        if k == 0 || k > 64 {
            return Err(HeaderError::InvalidKmerSize(k).into());
        }
        Ok(Self {
            magic: *FILE_MAGIC,
            version: FILE_VERSION,
            flags: FLAG_CANONICAL | FLAG_HASHED | FLAG_SORTED,
            k,
            reserved: [0; 2],
            scale: 1,
            meta_len: 0,
            num_kmers: 0,
        })
    }

    pub fn set_canonical(&mut self, canonical: bool) {
        if canonical {
            self.flags |= FLAG_CANONICAL;
        } else {
            self.flags &= !FLAG_CANONICAL;
        }
    }
    pub fn set_hashed(&mut self, hashed: bool) {
        if hashed {
            self.flags |= FLAG_HASHED;
        } else {
            self.flags &= !FLAG_HASHED;
        }
    }
    pub fn set_scale(&mut self, scale: u32) {
        self.scale = scale.max(1);
        if scale > 1 {
            self.flags |= FLAG_SCALED;
        } else {
            self.flags &= !FLAG_SCALED;
        }
    }
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.flags & FLAG_CANONICAL != 0
    }
    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.flags & FLAG_HASHED != 0
    }
    #[must_use]
    pub fn is_scaled(&self) -> bool {
        self.flags & FLAG_SCALED != 0
    }
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.flags & FLAG_SORTED != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: Self = bytemuck::pod_read_unaligned(bytes);
        if header.magic != *FILE_MAGIC {
            return Err(HeaderError::InvalidMagicNumber(header.magic).into());
        }
        if header.version != FILE_VERSION {
            return Err(HeaderError::InvalidFormatVersion(header.version).into());
        }
        if header.k == 0 || header.k > 64 {
            return Err(HeaderError::InvalidKmerSize(header.k).into());
        }
        Ok(header)
    }
}

/// Reference metadata carried in the artifact's JSON blob
///
/// `seq_id` and `frag_idx` identify the column this artifact becomes in the
/// index; the remaining fields describe how the k-mer set was sketched and
/// flow through to the database descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub seq_id: String,
    #[serde(default)]
    pub frag_idx: u32,
    #[serde(default = "default_frag_count")]
    pub frag_count: u32,
    #[serde(default)]
    pub genome_size: u64,
    #[serde(default)]
    pub minimizer_w: u32,
    #[serde(default)]
    pub syncmer_s: u32,
    #[serde(default)]
    pub split_size: u32,
    #[serde(default)]
    pub split_overlap: u32,
}
impl Metadata {
    /// Creates metadata for an unfragmented reference
    #[must_use]
    pub fn new(seq_id: &str, genome_size: u64) -> Self {
        Self {
            seq_id: seq_id.to_string(),
            frag_idx: 0,
            frag_count: 1,
            genome_size,
            ..Self::default()
        }
    }

    /// Creates metadata for one fragment of a split reference
    #[must_use]
    pub fn fragment(seq_id: &str, frag_idx: u32, frag_count: u32, genome_size: u64) -> Self {
        Self {
            seq_id: seq_id.to_string(),
            frag_idx,
            frag_count,
            genome_size,
            ..Self::default()
        }
    }
}

fn default_frag_count() -> u32 {
    1
}
