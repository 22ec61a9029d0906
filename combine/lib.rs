#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod accumulate;
pub mod config;
pub mod error;
pub mod header;
pub mod matrix;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod reduce;
pub mod rows;
pub mod tokenizer;

pub use config::{CombineConfig, PartialConfig, ProgramType, RowMode};
pub use error::CombineError;
pub use pipeline::{CombineSummary, run_combine};
