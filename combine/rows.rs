use crate::error::CombineError;
use crate::header::ColumnIndex;
use crate::tokenizer::{ChunkTokenizer, is_blank, tokens};
use log::{info, warn};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Upper bound on the label capacity reserved before a ragged scan.
pub const ROW_CAPACITY_CAP: usize = 4_000_000;

/// Rough compressed size of one matrix row, used to size the label buffer up front.
const ESTIMATED_COMPRESSED_BYTES_PER_ROW: u64 = 64;

/// Label written for a row whose record has no field at the identity position.
pub const MISSING_ROW_LABEL: &str = "NA";

/// Ordered row identities of the output matrix.
#[derive(Clone, Debug)]
pub struct RowCatalog {
    labels: Arc<[String]>,
}

impl RowCatalog {
    /// Square matrices: rows are the columns, sharing the same label storage.
    pub fn square(columns: &ColumnIndex) -> Self {
        Self {
            labels: columns.shared_names(),
        }
    }

    /// Ragged matrices: scans every record of `path` and keeps the identity field.
    pub fn discover(
        path: &Path,
        remove_index: usize,
        chunk: Vec<u8>,
    ) -> Result<(Self, Vec<u8>), CombineError> {
        let compressed_len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let mut tokenizer = ChunkTokenizer::open(path, chunk)?;
        let catalog = Self::discover_from(
            &mut tokenizer,
            remove_index,
            estimate_row_capacity(compressed_len),
        )?;
        info!(
            "Discovered {} rows in {}",
            catalog.nrows(),
            path.display()
        );
        Ok((catalog, tokenizer.into_chunk()))
    }

    /// Scans an open tokenizer positioned before the header. Duplicated identities
    /// are kept; row position alone addresses the matrix.
    pub fn discover_from<R: Read>(
        tokenizer: &mut ChunkTokenizer<R>,
        remove_index: usize,
        capacity: usize,
    ) -> Result<Self, CombineError> {
        tokenizer.skip_header()?;

        let mut labels = Vec::with_capacity(capacity);
        let mut unlabeled = 0usize;
        while let Some(record) = tokenizer.next_record()? {
            if is_blank(record) {
                continue;
            }
            // Only the identity field matters; the walk stops there.
            match tokens(record).nth(remove_index) {
                Some(identity) => labels.push(String::from_utf8_lossy(identity).into_owned()),
                None => {
                    unlabeled += 1;
                    labels.push(MISSING_ROW_LABEL.to_string());
                }
            }
        }

        if unlabeled > 0 {
            warn!(
                "{unlabeled} row(s) of {} have no field at identity position {remove_index}; labelled {MISSING_ROW_LABEL}",
                tokenizer.path().display()
            );
        }

        Ok(Self {
            labels: labels.into(),
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn nrows(&self) -> usize {
        self.labels.len()
    }
}

/// Label capacity to reserve for a reference file of `compressed_len` bytes.
pub fn estimate_row_capacity(compressed_len: u64) -> usize {
    let estimate = compressed_len / ESTIMATED_COMPRESSED_BYTES_PER_ROW;
    usize::try_from(estimate)
        .unwrap_or(ROW_CAPACITY_CAP)
        .clamp(1024, ROW_CAPACITY_CAP)
}
