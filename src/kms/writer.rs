use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{FileHeader, Metadata};
use crate::error::{Result, WriteError};

/// A writer for k-mer set artifacts
///
/// The header and metadata blob are written up front, so the total number of
/// codes must be known when the writer is created. Codes are validated to be
/// strictly increasing as they are pushed.
pub struct Writer<W: Write> {
    /// The underlying writer for output
    inner: W,

    /// Header as written, with `meta_len` and `num_kmers` filled in
    header: FileHeader,

    /// Previously pushed code, for the ordering check
    prev: Option<u64>,

    /// Number of codes pushed so far
    written: u64,
}
impl Writer<BufWriter<File>> {
    /// Creates an artifact file and writes the header and metadata
    pub fn create<P: AsRef<Path>>(
        path: P,
        header: FileHeader,
        meta: &Metadata,
        num_kmers: u64,
    ) -> Result<Self> {
        let inner = BufWriter::new(File::create(path)?);
        Self::new(inner, header, meta, num_kmers)
    }
}
impl<W: Write> Writer<W> {
    /// Wraps any writer and emits the header and metadata blob
    pub fn new(mut inner: W, mut header: FileHeader, meta: &Metadata, num_kmers: u64) -> Result<Self> {
        let blob = serde_json::to_vec(meta)?;
        header.meta_len = blob.len() as u32;
        header.num_kmers = num_kmers;

        inner.write_all(header.as_bytes())?;
        inner.write_all(&blob)?;

        Ok(Self {
            inner,
            header,
            prev: None,
            written: 0,
        })
    }

    #[must_use]
    pub fn header(&self) -> FileHeader {
        self.header
    }

    /// Appends one code to the payload
    pub fn push(&mut self, code: u64) -> Result<()> {
        if let Some(prev) = self.prev
            && code <= prev
        {
            return Err(WriteError::NonIncreasingCode { prev, got: code }.into());
        }
        self.inner.write_u64::<LittleEndian>(code)?;
        self.prev = Some(code);
        self.written += 1;
        Ok(())
    }

    /// Appends a pre-sorted slice of codes
    pub fn write_sorted(&mut self, codes: &[u64]) -> Result<()> {
        for &code in codes {
            self.push(code)?;
        }
        Ok(())
    }

    /// Verifies the promised code count, flushes, and returns the inner
    /// writer
    pub fn finish(mut self) -> Result<W> {
        if self.written != self.header.num_kmers {
            return Err(WriteError::CodeCountMismatch {
                expected: self.header.num_kmers,
                got: self.written,
            }
            .into());
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Writes a complete artifact file in one call
///
/// Convenience wrapper used by tooling and tests: the codes must already be
/// sorted and deduplicated.
pub fn write_set<P: AsRef<Path>>(
    path: P,
    header: FileHeader,
    meta: &Metadata,
    codes: &[u64],
) -> Result<()> {
    let mut writer = Writer::create(path, header, meta, codes.len() as u64)?;
    writer.write_sorted(codes)?;
    writer.finish()?;
    Ok(())
}
