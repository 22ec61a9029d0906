// ========================================================================================
//
//                          Per-file accumulation into a matrix
//
// ========================================================================================
//
// Each input file moves through Opening -> HeaderSkip -> Streaming -> Closed. A
// failure to open, decompress, or obtain a header is fatal and propagates. Inside
// Streaming nothing is fatal: malformed numbers contribute zero, rows or fields
// past the matrix bounds are dropped, and a row count that differs from the
// reference is reported once the file is done.

use crate::error::CombineError;
use crate::matrix::Matrix;
use crate::tokenizer::{ChunkTokenizer, is_blank, parse_value, tokens};
use log::{debug, info, warn};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Records processed between checks of the cancellation flag.
pub const CANCEL_CHECK_INTERVAL: usize = 4096;

/// Malformed tokens reported individually at `warn` per file; later ones go to `debug`.
const MALFORMED_WARN_LIMIT: usize = 16;

/// Where the identity column sits and how large the destination matrix is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccumulatorLayout {
    pub remove_index: usize,
    pub nrows: usize,
    pub ncols: usize,
}

/// What one file contributed, including the recoverable problems seen on the way.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSummary {
    /// Data records found (blank records excluded).
    pub rows: usize,
    pub malformed_tokens: usize,
    /// Records beyond the expected row count, ignored.
    pub dropped_rows: usize,
    /// Fields beyond the expected column count, ignored.
    pub dropped_fields: usize,
}

impl FileSummary {
    pub fn row_count_matches(&self, nrows: usize) -> bool {
        self.rows == nrows
    }
}

/// Opens `path` and adds its values into `target`. Returns the chunk for reuse.
pub fn accumulate_file(
    path: &Path,
    layout: AccumulatorLayout,
    target: &mut Matrix,
    chunk: Vec<u8>,
    cancel: &AtomicBool,
) -> Result<(FileSummary, Vec<u8>), CombineError> {
    info!("Processing {}", path.display());
    let mut tokenizer = ChunkTokenizer::open(path, chunk)?;
    let summary = accumulate_records(&mut tokenizer, layout, target, cancel)?;
    info!("Finished {}  rows={}", path.display(), summary.rows);
    Ok((summary, tokenizer.into_chunk()))
}

/// Adds every record after the header into `target`, row by row.
pub fn accumulate_records<R: Read>(
    tokenizer: &mut ChunkTokenizer<R>,
    layout: AccumulatorLayout,
    target: &mut Matrix,
    cancel: &AtomicBool,
) -> Result<FileSummary, CombineError> {
    debug_assert_eq!((target.nrows(), target.ncols()), (layout.nrows, layout.ncols));
    let path = tokenizer.path().to_path_buf();
    tokenizer.skip_header()?;

    let mut summary = FileSummary::default();
    let mut line_number = 1usize;
    while let Some(record) = tokenizer.next_record()? {
        line_number += 1;
        if is_blank(record) {
            continue;
        }

        let row = summary.rows;
        summary.rows += 1;
        if row % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(CombineError::Cancelled);
        }
        if row >= layout.nrows {
            summary.dropped_rows += 1;
            continue;
        }

        let cells = target.row_mut(row);
        let mut out_col = 0usize;
        for (col, token) in tokens(record).enumerate() {
            if col == layout.remove_index {
                continue;
            }
            let parsed = parse_value(token);
            if !parsed.succeeded {
                summary.malformed_tokens += 1;
                let token_text = String::from_utf8_lossy(token);
                if summary.malformed_tokens <= MALFORMED_WARN_LIMIT {
                    warn!(
                        "Non-numeric value '{token_text}' in {} at line {line_number}, column {}; counted as 0",
                        path.display(),
                        col + 1
                    );
                } else {
                    debug!(
                        "Non-numeric value '{token_text}' in {} at line {line_number}, column {}",
                        path.display(),
                        col + 1
                    );
                }
            }
            match cells.get_mut(out_col) {
                Some(cell) => *cell += parsed.value,
                None => summary.dropped_fields += 1,
            }
            out_col += 1;
        }
    }

    if summary.malformed_tokens > MALFORMED_WARN_LIMIT {
        warn!(
            "{} contained {} non-numeric values in total",
            path.display(),
            summary.malformed_tokens
        );
    }
    if summary.dropped_fields > 0 {
        warn!(
            "{} has {} field(s) beyond the {} header columns; ignored",
            path.display(),
            summary.dropped_fields,
            layout.ncols
        );
    }
    if !summary.row_count_matches(layout.nrows) {
        warn!(
            "{} has {} rows (expected {})",
            path.display(),
            summary.rows,
            layout.nrows
        );
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run(text: &str, layout: AccumulatorLayout, chunk_size: usize) -> (Matrix, FileSummary) {
        let mut tokenizer = ChunkTokenizer::new(
            Cursor::new(text.as_bytes().to_vec()),
            Path::new("raw"),
            vec![0; chunk_size],
        );
        let mut target = Matrix::zeros(layout.nrows, layout.ncols).unwrap();
        let summary =
            accumulate_records(&mut tokenizer, layout, &mut target, &AtomicBool::new(false))
                .unwrap();
        (target, summary)
    }

    const SQUARE: &str = "RECIPIENT A B C\nA 1.0 2.0 3.0\nB 4.0 5.0 6.0\nC 7.0 8.0 9.0\n";
    const SQUARE_LAYOUT: AccumulatorLayout = AccumulatorLayout {
        remove_index: 0,
        nrows: 3,
        ncols: 3,
    };

    #[test]
    fn identity_column_is_skipped() {
        let (matrix, summary) = run(SQUARE, SQUARE_LAYOUT, 1 << 16);
        assert_eq!(
            matrix.as_slice(),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]
        );
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.malformed_tokens, 0);
    }

    #[test]
    fn chunk_size_does_not_change_the_result() {
        let (large, _) = run(SQUARE, SQUARE_LAYOUT, 1 << 16);
        for chunk_size in [1, 2, 5, 16] {
            let (small, _) = run(SQUARE, SQUARE_LAYOUT, chunk_size);
            assert_eq!(small, large, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn identity_in_the_middle_is_skipped() {
        let text = "h1 indnames h2\n0.5 ind1 1.5\n2.5 ind2 3.5\n";
        let layout = AccumulatorLayout {
            remove_index: 1,
            nrows: 2,
            ncols: 2,
        };
        let (matrix, _) = run(text, layout, 4);
        assert_eq!(matrix.as_slice(), &[0.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn malformed_tokens_contribute_zero_and_processing_continues() {
        let text = "RECIPIENT A B C\nA 1.0 oops 3.0\nB 4.0 5.0 6.0\nC 7.0 8.0 9.0\n";
        let (matrix, summary) = run(text, SQUARE_LAYOUT, 8);
        assert_eq!(matrix.row(0), &[1.0, 0.0, 3.0]);
        assert_eq!(matrix.row(2), &[7.0, 8.0, 9.0]);
        assert_eq!(summary.malformed_tokens, 1);
        assert_eq!(summary.rows, 3);
    }

    #[test]
    fn extra_rows_and_fields_are_dropped() {
        let text = "RECIPIENT A B\nA 1 2 99\nB 3 4\nZ 5 6\n";
        let layout = AccumulatorLayout {
            remove_index: 0,
            nrows: 2,
            ncols: 2,
        };
        let (matrix, summary) = run(text, layout, 16);
        assert_eq!(matrix.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.dropped_rows, 1);
        assert_eq!(summary.dropped_fields, 1);
        assert!(!summary.row_count_matches(2));
    }

    #[test]
    fn short_file_leaves_trailing_rows_untouched() {
        let text = "RECIPIENT A B C\nA 1 1 1\n";
        let (matrix, summary) = run(text, SQUARE_LAYOUT, 16);
        assert_eq!(summary.rows, 1);
        assert_eq!(matrix.row(1), &[0.0, 0.0, 0.0]);
        assert_eq!(matrix.row(2), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn cancellation_stops_before_the_first_row() {
        let mut tokenizer = ChunkTokenizer::new(
            Cursor::new(SQUARE.as_bytes().to_vec()),
            Path::new("raw"),
            vec![0; 64],
        );
        let mut target = Matrix::zeros(3, 3).unwrap();
        let result = accumulate_records(
            &mut tokenizer,
            SQUARE_LAYOUT,
            &mut target,
            &AtomicBool::new(true),
        );
        assert!(matches!(result, Err(CombineError::Cancelled)));
        assert!(target.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn missing_header_is_fatal() {
        let mut tokenizer =
            ChunkTokenizer::new(Cursor::new(Vec::new()), Path::new("raw"), vec![0; 64]);
        let mut target = Matrix::zeros(3, 3).unwrap();
        let result = accumulate_records(
            &mut tokenizer,
            SQUARE_LAYOUT,
            &mut target,
            &AtomicBool::new(false),
        );
        assert!(matches!(result, Err(CombineError::MissingHeader { .. })));
    }
}
