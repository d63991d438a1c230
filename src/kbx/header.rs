use std::io::{Read, Write};

use bytemuck::{Pod, Zeroable};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{FILE_MAGIC, FILE_VERSION, MAX_COLUMNS};
use crate::error::{HeaderError, Result};

/// Size of the fixed block header in bytes
pub const SIZE_HEADER: usize = size_of::<BlockHeader>();

/// Fixed header of an index block
///
/// The column table and the row-major bit matrix follow immediately after.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct BlockHeader {
    /// File magic number
    magic: [u8; 3],
    /// File version number
    pub version: u8,
    /// Reserved for future use
    padding: [u8; 4],
    /// Number of rows (Bloom filter length in bits), always a power of two
    pub m: u64,
    /// Number of reference columns (1..=64)
    pub cols: u8,
    /// K-mer size the columns were sketched with
    pub k: u8,
    /// Whether the column k-mers are canonical (0/1)
    pub canonical: u8,
    /// Number of Bloom hash functions (1..=255)
    pub h: u8,
    /// Reserved for future use
    reserved: [u8; 4],
}
impl BlockHeader {
    pub fn new(m: u64, cols: u8, k: u8, canonical: bool, h: u8) -> Result<Self> {
        let header = Self {
            magic: *FILE_MAGIC,
            version: FILE_VERSION,
            padding: [0; 4],
            m,
            cols,
            k,
            canonical: u8::from(canonical),
            h,
            reserved: [0; 4],
        };
        header.validate()?;
        Ok(header)
    }

    /// Number of bytes per matrix row
    #[must_use]
    pub fn row_size(&self) -> usize {
        (self.cols as usize).div_ceil(8)
    }

    /// The bitmask reducing a 64-bit hash to a row index
    #[must_use]
    pub fn mask(&self) -> u64 {
        self.m - 1
    }

    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.canonical != 0
    }

    fn validate(&self) -> Result<()> {
        if self.magic != *FILE_MAGIC {
            return Err(HeaderError::InvalidMagicNumber(self.magic).into());
        }
        if self.version != FILE_VERSION {
            return Err(HeaderError::InvalidFormatVersion(self.version).into());
        }
        if !self.m.is_power_of_two() {
            return Err(HeaderError::RowCountNotPowerOfTwo(self.m).into());
        }
        if self.cols == 0 || self.cols as usize > MAX_COLUMNS {
            return Err(HeaderError::InvalidColumnCount(self.cols).into());
        }
        if self.h == 0 {
            return Err(HeaderError::InvalidHashCount(self.h).into());
        }
        if self.k == 0 || self.k > 64 {
            return Err(HeaderError::InvalidKmerSize(self.k).into());
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: Self = bytemuck::pod_read_unaligned(bytes);
        header.validate()?;
        Ok(header)
    }
}

/// Descriptor of one reference column in a block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Reference sequence identifier
    pub seq_id: String,
    /// Fragment index within the reference
    pub frag_idx: u32,
    /// Total number of fragments of the reference
    pub frag_count: u32,
    /// Genome (or fragment source) size in bases
    pub genome_size: u64,
    /// Number of k-mers inserted into this column's filter
    pub kmer_count: u64,
}
impl ColumnInfo {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.seq_id.len() as u16)?;
        writer.write_all(self.seq_id.as_bytes())?;
        writer.write_u32::<LittleEndian>(self.frag_idx)?;
        writer.write_u32::<LittleEndian>(self.frag_count)?;
        writer.write_u64::<LittleEndian>(self.genome_size)?;
        writer.write_u64::<LittleEndian>(self.kmer_count)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let name_len = reader.read_u16::<LittleEndian>()? as usize;
        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name)?;
        let seq_id = String::from_utf8(name)
            .map_err(|e| crate::Error::Utf8Error(e.utf8_error()))?;
        Ok(Self {
            seq_id,
            frag_idx: reader.read_u32::<LittleEndian>()?,
            frag_count: reader.read_u32::<LittleEndian>()?,
            genome_size: reader.read_u64::<LittleEndian>()?,
            kmer_count: reader.read_u64::<LittleEndian>()?,
        })
    }

    /// Serialized size of this descriptor in bytes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        2 + self.seq_id.len() + 4 + 4 + 8 + 8
    }
}

#[cfg(test)]
mod testing {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(SIZE_HEADER, 24);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = BlockHeader::new(1 << 20, 24, 31, true, 3).unwrap();
        let parsed = BlockHeader::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.row_size(), 3);
        assert_eq!(parsed.mask(), (1 << 20) - 1);
        assert!(parsed.is_canonical());
    }

    #[test]
    fn test_header_rejects_non_power_of_two() {
        assert!(BlockHeader::new(1000, 8, 21, true, 1).is_err());
        assert!(BlockHeader::new(1024, 8, 21, true, 1).is_ok());
    }

    #[test]
    fn test_header_rejects_bad_columns() {
        assert!(BlockHeader::new(1024, 0, 21, true, 1).is_err());
        assert!(BlockHeader::new(1024, 65, 21, true, 1).is_err());
        assert!(BlockHeader::new(1024, 64, 21, true, 1).is_ok());
    }

    #[test]
    fn test_header_rejects_zero_hashes() {
        assert!(BlockHeader::new(1024, 8, 21, true, 0).is_err());
    }

    #[test]
    fn test_column_info_roundtrip() {
        let info = ColumnInfo {
            seq_id: "NC_000913.3".to_string(),
            frag_idx: 2,
            frag_count: 10,
            genome_size: 4_641_652,
            kmer_count: 4_500_000,
        };
        let mut buf = Vec::new();
        info.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), info.byte_len());
        let parsed = ColumnInfo::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed, info);
    }
}
