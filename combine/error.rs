use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal failures of a combine run.
///
/// Recoverable conditions (malformed numeric tokens, row-count mismatches) never
/// surface here; they are logged where they are detected and counted in the
/// run summary instead.
#[derive(Debug, Error)]
pub enum CombineError {
    #[error("no chromosomes specified")]
    NoChromosomes,
    #[error("missing required setting '{0}' (pass it on the command line or in the config file)")]
    MissingSetting(&'static str),
    #[error("could not read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse TOML config file: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("identity column '{label}' not found in header of {path}")]
    IdentityColumnMissing { label: String, path: PathBuf },
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("header read error in {path}: the stream contains no header line")]
    MissingHeader { path: PathBuf },
    #[error("cannot create output {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error writing output {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("memory allocation failed for matrix of size {nrows} x {ncols}")]
    Allocation { nrows: usize, ncols: usize },
    #[error(
        "matrix of size {nrows} x {ncols} needs {required_bytes} bytes but only {available_bytes} bytes are available"
    )]
    InsufficientMemory {
        nrows: usize,
        ncols: usize,
        required_bytes: u64,
        available_bytes: u64,
    },
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
    #[error("run cancelled after a fatal error in another worker")]
    Cancelled,
}

impl CombineError {
    /// True for errors raised before any matrix file is touched.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::NoChromosomes
                | Self::MissingSetting(_)
                | Self::ConfigRead { .. }
                | Self::ConfigParse(_)
                | Self::IdentityColumnMissing { .. }
        )
    }
}
