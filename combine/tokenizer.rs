// ========================================================================================
//
//                 Chunked gzip decoding, record reassembly and tokenizing
//
// ========================================================================================
//
// ### Purpose ###
//
// Matrix files can be many gigabytes once decompressed, and header lines alone can
// exceed any reasonable fixed buffer. The `ChunkTokenizer` therefore never reads a
// whole file or a whole "line" through a bounded API. It decompresses into one
// fixed-size chunk at a time and hands out records as slices:
//
// 1.  A record that lies entirely inside the current chunk is returned as a slice
//     of the chunk, with no copy.
// 2.  A record that straddles a chunk boundary is reassembled in the spill buffer,
//     which grows as needed. This is also what makes header reads length-unbounded.
//
// Memory use is one chunk plus the longest record seen, independent of file size.

use crate::error::CombineError;
use crossbeam_queue::ArrayQueue;
use flate2::read::MultiGzDecoder;
use log::warn;
use memchr::memchr;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Bytes treated as field separators: the C locale `isspace` set.
#[inline(always)]
pub fn is_field_separator(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Splits a record into maximal runs of non-separator bytes, left to right.
pub fn tokens(record: &[u8]) -> Tokens<'_> {
    Tokens { rest: record }
}

/// Iterator over the whitespace-delimited fields of one record.
#[derive(Clone, Debug)]
pub struct Tokens<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Tokens<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let Some(start) = self.rest.iter().position(|&b| !is_field_separator(b)) else {
            self.rest = &[];
            return None;
        };
        let remaining = &self.rest[start..];
        let len = remaining
            .iter()
            .position(|&b| is_field_separator(b))
            .unwrap_or(remaining.len());
        let (token, tail) = remaining.split_at(len);
        self.rest = tail;
        Some(token)
    }
}

/// True when a record holds no fields at all.
pub fn is_blank(record: &[u8]) -> bool {
    record.iter().all(|&b| is_field_separator(b))
}

/// Outcome of converting one token to a number. A failed parse carries a value of
/// zero so the caller can add it unconditionally and decide separately whether to
/// report it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParsedValue {
    pub value: f32,
    pub succeeded: bool,
}

/// Tolerant numeric conversion. Finite values beyond the `f32` range clamp to the
/// signed extreme; a literal infinity stays infinite.
pub fn parse_value(token: &[u8]) -> ParsedValue {
    match lexical_core::parse::<f64>(token) {
        Ok(wide) => {
            let value = wide as f32;
            let value = if value.is_infinite() && wide.is_finite() {
                if value.is_sign_negative() {
                    f32::MIN
                } else {
                    f32::MAX
                }
            } else {
                value
            };
            ParsedValue {
                value,
                succeeded: true,
            }
        }
        Err(_) => ParsedValue {
            value: 0.0,
            succeeded: false,
        },
    }
}

/// A pool of decompression chunks, so a worker processing several files in a row
/// reuses one allocation.
pub struct ChunkPool {
    pool: ArrayQueue<Vec<u8>>,
    chunk_size: usize,
}

impl ChunkPool {
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        Self {
            pool: ArrayQueue::new(capacity.max(1)),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Pops a chunk from the pool, allocating one when the pool is empty.
    pub fn pop(&self) -> Vec<u8> {
        self.pool
            .pop()
            .unwrap_or_else(|| vec![0u8; self.chunk_size])
    }

    /// Returns a chunk to the pool. Chunks beyond the pool capacity are dropped.
    pub fn push(&self, chunk: Vec<u8>) {
        let _ = self.pool.push(chunk);
    }
}

/// Streams records out of a (decompressed) byte source one chunk at a time.
pub struct ChunkTokenizer<R: Read> {
    source: R,
    path: PathBuf,
    chunk: Vec<u8>,
    cursor: usize,
    valid: usize,
    spill: Vec<u8>,
    spill_active: bool,
    bytes_decoded: u64,
    exhausted: bool,
}

impl ChunkTokenizer<MultiGzDecoder<File>> {
    /// Opens a gzip file (single or multi-member) for chunked reading.
    pub fn open(path: &Path, chunk: Vec<u8>) -> Result<Self, CombineError> {
        let file = File::open(path).map_err(|source| CombineError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(MultiGzDecoder::new(file), path, chunk))
    }
}

impl<R: Read> ChunkTokenizer<R> {
    /// Wraps an already-decoded byte source. The length of `chunk` is the chunk size.
    pub fn new(source: R, path: &Path, mut chunk: Vec<u8>) -> Self {
        if chunk.is_empty() {
            chunk.resize(1, 0);
        }
        Self {
            source,
            path: path.to_path_buf(),
            chunk,
            cursor: 0,
            valid: 0,
            spill: Vec::with_capacity(1024),
            spill_active: false,
            bytes_decoded: 0,
            exhausted: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gives the chunk back so it can be recycled.
    pub fn into_chunk(self) -> Vec<u8> {
        self.chunk
    }

    /// Reads the first record and splits it into owned field names.
    pub fn read_header(&mut self) -> Result<Vec<String>, CombineError> {
        match self.next_record()? {
            Some(record) => Ok(tokens(record)
                .map(|token| String::from_utf8_lossy(token).into_owned())
                .collect()),
            None => Err(CombineError::MissingHeader {
                path: self.path.clone(),
            }),
        }
    }

    /// Consumes the header record without materializing its fields.
    pub fn skip_header(&mut self) -> Result<(), CombineError> {
        match self.next_record()? {
            Some(_) => Ok(()),
            None => Err(CombineError::MissingHeader {
                path: self.path.clone(),
            }),
        }
    }

    /// Returns the next newline-terminated record, without its terminator. A final
    /// record with no trailing newline is still returned.
    pub fn next_record(&mut self) -> Result<Option<&[u8]>, CombineError> {
        if self.spill_active {
            self.spill.clear();
            self.spill_active = false;
        }

        loop {
            if self.cursor >= self.valid && !self.fill_chunk()? {
                if self.spill.is_empty() {
                    return Ok(None);
                }
                self.spill_active = true;
                return Ok(Some(&self.spill));
            }

            match memchr(b'\n', &self.chunk[self.cursor..self.valid]) {
                Some(rel_pos) => {
                    let start = self.cursor;
                    let line_end = start + rel_pos;
                    self.cursor = line_end + 1;
                    if self.spill.is_empty() {
                        return Ok(Some(&self.chunk[start..line_end]));
                    }
                    self.spill.extend_from_slice(&self.chunk[start..line_end]);
                    self.spill_active = true;
                    return Ok(Some(&self.spill));
                }
                None => {
                    self.spill
                        .extend_from_slice(&self.chunk[self.cursor..self.valid]);
                    self.cursor = self.valid;
                }
            }
        }
    }

    fn fill_chunk(&mut self) -> Result<bool, CombineError> {
        if self.exhausted {
            return Ok(false);
        }
        loop {
            match self.source.read(&mut self.chunk) {
                Ok(0) => {
                    self.exhausted = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.cursor = 0;
                    self.valid = n;
                    self.bytes_decoded += n as u64;
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) if self.bytes_decoded == 0 => {
                    return Err(CombineError::Read {
                        path: self.path.clone(),
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        "Read of {} failed after {} decompressed bytes; treating as end of stream: {e}",
                        self.path.display(),
                        self.bytes_decoded
                    );
                    self.exhausted = true;
                    return Ok(false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::read::GzDecoder;
    use flate2::write::GzEncoder;
    use std::io::{Cursor, Write};

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn collect_records<R: Read>(mut tokenizer: ChunkTokenizer<R>) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Some(record) = tokenizer.next_record().unwrap() {
            out.push(
                tokens(record)
                    .map(|t| String::from_utf8_lossy(t).into_owned())
                    .collect(),
            );
        }
        out
    }

    #[test]
    fn tokens_skip_any_whitespace_run() {
        let record = b"  RECIPIENT\tA \x0b B\r";
        let fields: Vec<&[u8]> = tokens(record).collect();
        assert_eq!(fields, vec![&b"RECIPIENT"[..], &b"A"[..], &b"B"[..]]);
        assert_eq!(tokens(b"   ").count(), 0);
        assert!(is_blank(b" \t\r"));
        assert!(!is_blank(b" x "));
    }

    #[test]
    fn records_are_identical_for_tiny_and_large_chunks() {
        let text = "RECIPIENT sample_with_a_long_name another_long_sample_name C\n\
                    sample_with_a_long_name 1.000001 22.5 -3.25e2\n\
                    another_long_sample_name 4 5 6\n\
                    C 7.125 8 9";
        let compressed = gzip(text);
        let path = Path::new("memory.gz");

        let tiny = ChunkTokenizer::new(GzDecoder::new(Cursor::new(compressed.clone())), path, vec![0; 16]);
        let large = ChunkTokenizer::new(GzDecoder::new(Cursor::new(compressed)), path, vec![0; 1 << 20]);

        let tiny_records = collect_records(tiny);
        let large_records = collect_records(large);
        assert_eq!(tiny_records, large_records);
        assert_eq!(tiny_records.len(), 4);
        assert_eq!(tiny_records[3], vec!["C", "7.125", "8", "9"]);
    }

    #[test]
    fn header_and_numbers_split_across_chunk_boundaries() {
        // With 7-byte chunks the header and "12.75" both straddle boundaries.
        let bytes = b"indnames colA colB\nrow1 12.75 0.5\n".to_vec();
        let mut tokenizer = ChunkTokenizer::new(Cursor::new(bytes), Path::new("raw"), vec![0; 7]);

        let header = tokenizer.read_header().unwrap();
        assert_eq!(header, vec!["indnames", "colA", "colB"]);

        let record = tokenizer.next_record().unwrap().unwrap();
        let fields: Vec<&[u8]> = tokens(record).collect();
        assert_eq!(fields, vec![&b"row1"[..], &b"12.75"[..], &b"0.5"[..]]);
        assert!(tokenizer.next_record().unwrap().is_none());
    }

    #[test]
    fn header_longer_than_chunk_is_read_whole() {
        let mut header = String::from("RECIPIENT");
        for i in 0..5000 {
            header.push_str(&format!(" s{i}"));
        }
        header.push('\n');
        let mut tokenizer =
            ChunkTokenizer::new(Cursor::new(header.into_bytes()), Path::new("raw"), vec![0; 64]);
        let names = tokenizer.read_header().unwrap();
        assert_eq!(names.len(), 5001);
        assert_eq!(names[5000], "s4999");
    }

    #[test]
    fn empty_stream_has_no_header() {
        let mut tokenizer = ChunkTokenizer::new(Cursor::new(Vec::new()), Path::new("empty"), vec![0; 8]);
        assert!(matches!(
            tokenizer.read_header(),
            Err(CombineError::MissingHeader { .. })
        ));
    }

    #[test]
    fn truncated_gzip_tail_ends_the_stream_after_decoded_records() {
        let mut bytes = gzip("RECIPIENT A B\nA 1 2\nB 3 4\n");
        // Drop the size field of the trailer; the deflate body stays intact.
        bytes.truncate(bytes.len() - 4);
        let mut tokenizer = ChunkTokenizer::new(
            MultiGzDecoder::new(Cursor::new(bytes)),
            Path::new("chr1.gz"),
            vec![0; 4096],
        );

        assert_eq!(tokenizer.read_header().unwrap(), vec!["RECIPIENT", "A", "B"]);
        assert_eq!(tokenizer.next_record().unwrap(), Some(&b"A 1 2"[..]));
        assert_eq!(tokenizer.next_record().unwrap(), Some(&b"B 3 4"[..]));
        assert!(tokenizer.next_record().unwrap().is_none());
        assert!(tokenizer.next_record().unwrap().is_none());
    }

    /// Yields its bytes, then fails every later read.
    struct FailsAtEnd(Cursor<Vec<u8>>);

    impl Read for FailsAtEnd {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf)? {
                0 => Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt deflate stream")),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn read_error_after_data_keeps_decoded_records() {
        let source = FailsAtEnd(Cursor::new(b"RECIPIENT A\nA 1\nA 2".to_vec()));
        let mut tokenizer = ChunkTokenizer::new(source, Path::new("chr2.gz"), vec![0; 5]);

        tokenizer.skip_header().unwrap();
        assert_eq!(tokenizer.next_record().unwrap(), Some(&b"A 1"[..]));
        // The partial record before the failure is still handed out.
        assert_eq!(tokenizer.next_record().unwrap(), Some(&b"A 2"[..]));
        assert!(tokenizer.next_record().unwrap().is_none());
    }

    #[test]
    fn read_error_before_any_data_is_fatal() {
        let mut tokenizer =
            ChunkTokenizer::new(FailsAtEnd(Cursor::new(Vec::new())), Path::new("chr3.gz"), vec![0; 8]);
        assert!(matches!(tokenizer.read_header(), Err(CombineError::Read { .. })));
    }

    #[test]
    fn tolerant_parse_reports_failures_and_clamps_overflow() {
        assert_eq!(
            parse_value(b"2.5"),
            ParsedValue {
                value: 2.5,
                succeeded: true
            }
        );
        assert_eq!(
            parse_value(b"oops"),
            ParsedValue {
                value: 0.0,
                succeeded: false
            }
        );
        assert_eq!(parse_value(b"1e39").value, f32::MAX);
        assert_eq!(parse_value(b"-1e39").value, f32::MIN);
        assert!(parse_value(b"-1e39").succeeded);
        assert_eq!(parse_value(b"inf").value, f32::INFINITY);
        assert_eq!(parse_value(b"-inf").value, f32::NEG_INFINITY);
        assert!(parse_value(b"inf").succeeded);
    }

    #[test]
    fn chunk_pool_recycles_buffers() {
        let pool = ChunkPool::new(2, 32);
        let chunk = pool.pop();
        assert_eq!(chunk.len(), 32);
        let ptr = chunk.as_ptr();
        pool.push(chunk);
        let recycled = pool.pop();
        assert_eq!(recycled.as_ptr(), ptr);
    }
}
