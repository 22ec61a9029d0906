use crate::error::CombineError;
use crate::tokenizer::ChunkTokenizer;
use ahash::AHashSet;
use log::warn;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// The output column layout derived from a reference file's header.
#[derive(Clone, Debug)]
pub struct ColumnIndex {
    names: Arc<[String]>,
    remove_index: usize,
}

impl ColumnIndex {
    /// Reads the header of `path` and locates the identity column.
    pub fn from_reference(
        path: &Path,
        identity_label: &str,
        chunk: Vec<u8>,
    ) -> Result<(Self, Vec<u8>), CombineError> {
        let mut tokenizer = ChunkTokenizer::open(path, chunk)?;
        let index = Self::from_tokenizer(&mut tokenizer, identity_label)?;
        Ok((index, tokenizer.into_chunk()))
    }

    /// Reads the header record from an open tokenizer.
    pub fn from_tokenizer<R: Read>(
        tokenizer: &mut ChunkTokenizer<R>,
        identity_label: &str,
    ) -> Result<Self, CombineError> {
        let header = tokenizer.read_header()?;
        Self::from_header(header, identity_label, tokenizer.path())
    }

    /// Builds the index from already-split header fields. The first field equal to
    /// `identity_label` is the identity column.
    pub fn from_header(
        mut header: Vec<String>,
        identity_label: &str,
        path: &Path,
    ) -> Result<Self, CombineError> {
        let remove_index = header
            .iter()
            .position(|name| name == identity_label)
            .ok_or_else(|| CombineError::IdentityColumnMissing {
                label: identity_label.to_string(),
                path: path.to_path_buf(),
            })?;
        header.remove(remove_index);

        let duplicates = {
            let mut seen = AHashSet::with_capacity(header.len());
            let repeated = header
                .iter()
                .filter(|name| !seen.insert(name.as_str()))
                .count();
            repeated
        };
        if duplicates > 0 {
            warn!(
                "Header of {} repeats {duplicates} column name(s); columns are matched by position",
                path.display()
            );
        }

        Ok(Self {
            names: header.into(),
            remove_index,
        })
    }

    /// Output column names, identity column excluded, in header order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Shared handle to the names, for reuse as square-mode row labels.
    pub fn shared_names(&self) -> Arc<[String]> {
        Arc::clone(&self.names)
    }

    /// Position of the identity column in the original header.
    pub fn remove_index(&self) -> usize {
        self.remove_index
    }

    pub fn ncols(&self) -> usize {
        self.names.len()
    }
}
