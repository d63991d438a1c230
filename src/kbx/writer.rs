use std::io::Write;

use super::{BlockHeader, ColumnInfo};
use crate::error::{Result, WriteError};

/// Serializes one index block: header, column table, then the row-major
/// interleave of up to eight byte-planes
///
/// Planes are the unit of parallel filling during a build: plane `j` holds
/// one byte per row for columns `8j..8j+8`, with column `c` at bit
/// `7 - (c % 8)`. Interleaving plane bytes row by row produces the
/// contiguous per-row layout the searcher probes.
pub struct BlockWriter<W: Write> {
    /// The underlying writer for output
    inner: W,

    /// Fixed header as written
    header: BlockHeader,
}
impl<W: Write> BlockWriter<W> {
    /// Writes the header and column table, leaving the writer ready for the
    /// matrix body
    pub fn new(mut inner: W, header: BlockHeader, columns: &[ColumnInfo]) -> Result<Self> {
        if columns.len() != header.cols as usize {
            return Err(WriteError::ColumnPlaneMismatch {
                columns: columns.len(),
                planes: header.cols as usize,
            }
            .into());
        }
        inner.write_all(header.as_bytes())?;
        for column in columns {
            column.write_to(&mut inner)?;
        }
        Ok(Self { inner, header })
    }

    #[must_use]
    pub fn header(&self) -> BlockHeader {
        self.header
    }

    /// Writes the matrix body from per-plane byte buffers
    ///
    /// Each plane must hold exactly `m` bytes. With a single plane the body
    /// is the plane itself and is written in one call; otherwise rows are
    /// assembled in a chunk buffer to keep syscall counts down.
    pub fn write_planes(&mut self, planes: &[Vec<u8>]) -> Result<()> {
        let expected_planes = self.header.row_size();
        if planes.len() != expected_planes {
            return Err(WriteError::ColumnPlaneMismatch {
                columns: self.header.cols as usize,
                planes: planes.len(),
            }
            .into());
        }
        if planes.len() > 8 {
            return Err(WriteError::TooManyPlanes(planes.len()).into());
        }
        for plane in planes {
            if plane.len() != self.header.m as usize {
                return Err(WriteError::UnexpectedPlaneLength {
                    expected: self.header.m,
                    got: plane.len(),
                }
                .into());
            }
        }

        if planes.len() == 1 {
            self.inner.write_all(&planes[0])?;
            return Ok(());
        }

        // Interleave in chunks of rows rather than one write per row
        const ROWS_PER_CHUNK: usize = 8192;
        let row_size = planes.len();
        let m = self.header.m as usize;
        let mut chunk = vec![0u8; ROWS_PER_CHUNK * row_size];
        let mut row = 0;
        while row < m {
            let rows = ROWS_PER_CHUNK.min(m - row);
            for (j, plane) in planes.iter().enumerate() {
                for i in 0..rows {
                    chunk[i * row_size + j] = plane[row + i];
                }
            }
            self.inner.write_all(&chunk[..rows * row_size])?;
            row += rows;
        }
        Ok(())
    }

    /// Flushes and returns the inner writer
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::kbx::SIZE_HEADER;

    fn columns(n: usize) -> Vec<ColumnInfo> {
        (0..n)
            .map(|i| ColumnInfo {
                seq_id: format!("ref{i}"),
                frag_idx: 0,
                frag_count: 1,
                genome_size: 1000,
                kmer_count: 100,
            })
            .collect()
    }

    #[test]
    fn test_single_plane_body_is_verbatim() {
        let header = BlockHeader::new(64, 8, 21, true, 1).unwrap();
        let cols = columns(8);
        let mut writer = BlockWriter::new(Vec::new(), header, &cols).unwrap();

        let plane: Vec<u8> = (0..64).map(|i| i as u8).collect();
        writer.write_planes(std::slice::from_ref(&plane)).unwrap();
        let bytes = writer.finish().unwrap();

        let table_len: usize = cols.iter().map(ColumnInfo::byte_len).sum();
        assert_eq!(&bytes[SIZE_HEADER + table_len..], plane.as_slice());
    }

    #[test]
    fn test_two_planes_interleave_row_major() {
        let header = BlockHeader::new(64, 16, 21, true, 1).unwrap();
        let cols = columns(16);
        let mut writer = BlockWriter::new(Vec::new(), header, &cols).unwrap();

        let plane_a = vec![0xAAu8; 64];
        let plane_b = vec![0xBBu8; 64];
        writer.write_planes(&[plane_a, plane_b]).unwrap();
        let bytes = writer.finish().unwrap();

        let table_len: usize = cols.iter().map(ColumnInfo::byte_len).sum();
        let body = &bytes[SIZE_HEADER + table_len..];
        assert_eq!(body.len(), 128);
        for row in body.chunks(2) {
            assert_eq!(row, &[0xAA, 0xBB]);
        }
    }

    #[test]
    fn test_rejects_wrong_plane_length() {
        let header = BlockHeader::new(64, 8, 21, true, 1).unwrap();
        let mut writer = BlockWriter::new(Vec::new(), header, &columns(8)).unwrap();
        assert!(writer.write_planes(&[vec![0u8; 32]]).is_err());
    }

    #[test]
    fn test_rejects_wrong_plane_count() {
        let header = BlockHeader::new(64, 16, 21, true, 1).unwrap();
        let mut writer = BlockWriter::new(Vec::new(), header, &columns(16)).unwrap();
        assert!(writer.write_planes(&[vec![0u8; 64]]).is_err());
    }

    #[test]
    fn test_rejects_column_count_mismatch() {
        let header = BlockHeader::new(64, 8, 21, true, 1).unwrap();
        assert!(BlockWriter::new(Vec::new(), header, &columns(5)).is_err());
    }
}
