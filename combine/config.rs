// ========================================================================================
//
//                       Run configuration and program types
//
// ========================================================================================
//
// A run is described by a `CombineConfig`. It is assembled from an optional TOML
// file and command-line overrides (both represented as a `PartialConfig`), then
// validated once before any matrix file is opened.

use crate::error::CombineError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Decompressed bytes processed per read. Large enough to amortize the per-chunk
/// bookkeeping, small enough that one chunk per worker stays cheap.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// The tool that produced the input matrices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
pub enum ProgramType {
    #[serde(rename = "pbwt")]
    #[value(name = "pbwt")]
    Pbwt,
    #[serde(rename = "chromopainter")]
    #[value(name = "chromopainter")]
    ChromoPainter,
    #[serde(rename = "SparsePainter")]
    #[value(name = "SparsePainter")]
    SparsePainter,
}

/// How the row set of the output matrix is determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowMode {
    /// Rows are the header columns, in header order.
    Square,
    /// Rows are discovered by scanning the identity column of a reference file.
    Ragged,
}

impl ProgramType {
    /// The header token that marks the identity column for this tool.
    pub fn identity_label(self) -> &'static str {
        match self {
            Self::Pbwt => "RECIPIENT",
            Self::ChromoPainter => "Recipient",
            Self::SparsePainter => "indnames",
        }
    }

    pub fn row_mode(self) -> RowMode {
        match self {
            Self::Pbwt | Self::ChromoPainter => RowMode::Square,
            Self::SparsePainter => RowMode::Ragged,
        }
    }
}

impl std::fmt::Display for ProgramType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pbwt => "pbwt",
            Self::ChromoPainter => "chromopainter",
            Self::SparsePainter => "SparsePainter",
        };
        f.write_str(name)
    }
}

/// Splits a comma-separated chromosome list, trimming whitespace around each entry
/// and dropping empty entries.
pub fn parse_chromosome_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// A fully specified, validated run.
#[derive(Clone, Debug)]
pub struct CombineConfig {
    pub pre_chr: String,
    pub post_chr: String,
    pub chromosome_ids: Vec<String>,
    pub output_path: PathBuf,
    pub program_type: ProgramType,
    /// Worker count; `None` means one per CPU, capped by the number of files.
    pub threads: Option<usize>,
    pub chunk_size: usize,
}

impl CombineConfig {
    pub fn new(
        pre_chr: impl Into<String>,
        post_chr: impl Into<String>,
        chromosome_ids: Vec<String>,
        output_path: impl Into<PathBuf>,
        program_type: ProgramType,
    ) -> Self {
        Self {
            pre_chr: pre_chr.into(),
            post_chr: post_chr.into(),
            chromosome_ids,
            output_path: output_path.into(),
            program_type,
            threads: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn validate(&self) -> Result<(), CombineError> {
        if self.chromosome_ids.is_empty() {
            return Err(CombineError::NoChromosomes);
        }
        Ok(())
    }

    /// `pre_chr + id + post_chr` for every chromosome, in the order given.
    pub fn input_paths(&self) -> Vec<PathBuf> {
        self.chromosome_ids
            .iter()
            .map(|id| PathBuf::from(format!("{}{}{}", self.pre_chr, id, self.post_chr)))
            .collect()
    }

    pub fn identity_label(&self) -> &'static str {
        self.program_type.identity_label()
    }
}

/// Configuration values from one source. Every field is optional so that a TOML
/// file and command-line flags can be layered.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub pre_chr: Option<String>,
    pub post_chr: Option<String>,
    pub chromosomes: Option<Vec<String>>,
    pub output: Option<PathBuf>,
    #[serde(rename = "type")]
    pub program_type: Option<ProgramType>,
    pub threads: Option<usize>,
    pub chunk_size: Option<usize>,
}

impl PartialConfig {
    /// Loads a run description from a TOML file.
    pub fn load(path: &Path) -> Result<Self, CombineError> {
        let text = fs::read_to_string(path).map_err(|source| CombineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let partial = toml::from_str(&text)?;
        Ok(partial)
    }

    /// Values set in `overrides` win over values in `self`.
    pub fn merge(self, overrides: PartialConfig) -> PartialConfig {
        PartialConfig {
            pre_chr: overrides.pre_chr.or(self.pre_chr),
            post_chr: overrides.post_chr.or(self.post_chr),
            chromosomes: overrides.chromosomes.or(self.chromosomes),
            output: overrides.output.or(self.output),
            program_type: overrides.program_type.or(self.program_type),
            threads: overrides.threads.or(self.threads),
            chunk_size: overrides.chunk_size.or(self.chunk_size),
        }
    }

    pub fn into_config(self) -> Result<CombineConfig, CombineError> {
        let chromosome_ids: Vec<String> = self
            .chromosomes
            .ok_or(CombineError::NoChromosomes)?
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        let output_path = self.output.ok_or(CombineError::MissingSetting("output"))?;
        let program_type = self
            .program_type
            .ok_or(CombineError::MissingSetting("type"))?;

        let config = CombineConfig {
            pre_chr: self.pre_chr.unwrap_or_default(),
            post_chr: self.post_chr.unwrap_or_default(),
            chromosome_ids,
            output_path,
            program_type,
            threads: self.threads.filter(|&n| n > 0),
            chunk_size: self.chunk_size.filter(|&n| n > 0).unwrap_or(DEFAULT_CHUNK_SIZE),
        };
        config.validate()?;
        Ok(config)
    }
}
