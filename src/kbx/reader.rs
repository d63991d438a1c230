use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use super::{BlockHeader, ColumnInfo, SIZE_HEADER};
use crate::error::{ReadError, Result};

/// How matrix rows are fetched from disk
enum RowStore {
    /// Memory-mapped body shared read-only between all workers
    Mmap(Arc<Mmap>),
    /// Positioned reads against the open file (`low_mem` mode)
    Pread(File),
}

/// A reader for one index block
///
/// The header and column table are parsed eagerly at open; `row` exposes a
/// zero-copy view of a matrix row when memory-mapped, or fills the caller's
/// buffer with a positioned read in `low_mem` mode. All state is immutable
/// after open, so one reader is safely shared by every search worker.
pub struct BlockReader {
    /// Fixed block header
    header: BlockHeader,

    /// Per-column reference descriptors
    columns: Vec<ColumnInfo>,

    /// Byte offset of the matrix body within the file
    body_offset: usize,

    /// Bytes per matrix row
    row_size: usize,

    /// Row fetch backend
    store: RowStore,

    /// Source path, kept for error messages
    path: PathBuf,
}
impl BlockReader {
    /// Opens a block file, parsing and validating header and column table
    ///
    /// With `low_mem` the body is not mapped; every row fetch becomes a
    /// positioned read.
    pub fn open<P: AsRef<Path>>(path: P, low_mem: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        if !file.metadata()?.is_file() {
            return Err(ReadError::IncompatibleFile(path).into());
        }

        let mut reader = BufReader::new(&file);
        let mut header_buf = [0u8; SIZE_HEADER];
        reader.read_exact(&mut header_buf)?;
        let header = BlockHeader::from_bytes(&header_buf)?;

        let mut columns = Vec::with_capacity(header.cols as usize);
        for _ in 0..header.cols {
            columns.push(ColumnInfo::read_from(&mut reader)?);
        }
        let body_offset = reader.stream_position()? as usize;
        drop(reader);

        let row_size = header.row_size();
        let expected = body_offset + header.m as usize * row_size;
        let actual = file.metadata()?.len() as usize;
        if actual != expected {
            return Err(ReadError::FileTruncation(actual).into());
        }

        let store = if low_mem {
            RowStore::Pread(file)
        } else {
            // Safety: the block file is written once and never mutated
            let mmap = unsafe { Mmap::map(&file)? };
            RowStore::Mmap(Arc::new(mmap))
        };

        Ok(Self {
            header,
            columns,
            body_offset,
            row_size,
            store,
            path,
        })
    }

    #[must_use]
    pub fn header(&self) -> BlockHeader {
        self.header
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    #[must_use]
    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    /// Bytes per matrix row
    #[must_use]
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    /// The bitmask reducing a 64-bit hash to a row index
    #[must_use]
    pub fn mask(&self) -> u64 {
        self.header.mask()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetches row `idx`
    ///
    /// `buf` must be `row_size` bytes. When memory-mapped the returned slice
    /// points into the map and `buf` is untouched; in `low_mem` mode the row
    /// is read into `buf`.
    #[inline]
    pub fn row<'a>(&'a self, idx: u64, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        if idx >= self.header.m {
            return Err(ReadError::OutOfRange {
                requested_index: idx,
                max_index: self.header.m,
            }
            .into());
        }
        let offset = self.body_offset + idx as usize * self.row_size;
        match &self.store {
            RowStore::Mmap(mmap) => Ok(&mmap[offset..offset + self.row_size]),
            RowStore::Pread(file) => {
                file.read_exact_at(&mut buf[..self.row_size], offset as u64)?;
                Ok(&buf[..self.row_size])
            }
        }
    }
}
