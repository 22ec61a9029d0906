// ========================================================================================
//
//                      The command-line front end of chromocombine
//
// ========================================================================================
//
// Parses arguments, layers them over an optional TOML run file, initializes logging,
// and hands a validated configuration to the library. Any fatal error is printed as
// one line and the process exits with status 1.

use chromocombine::config::parse_chromosome_list;
use chromocombine::progress::TerminalProgress;
use chromocombine::{CombineError, PartialConfig, ProgramType, run_combine};
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(
    name = "chromocombine",
    version,
    about = "Sums per-chromosome painting matrices (pbwt, ChromoPainter, SparsePainter) into one gzip matrix."
)]
struct Args {
    /// Path prefix placed before each chromosome identifier.
    #[clap(short = 'p', long = "pre_chr", alias = "pre-chr")]
    pre_chr: Option<String>,

    /// Path suffix placed after each chromosome identifier.
    #[clap(short = 'a', long = "post_chr", alias = "post-chr")]
    post_chr: Option<String>,

    /// Comma-separated chromosome identifiers, e.g. "1,2,3".
    #[clap(short = 'c', long = "chrs")]
    chrs: Option<String>,

    /// Output path for the combined gzip matrix.
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,

    /// Tool that produced the inputs.
    #[clap(short = 't', long = "type", value_enum)]
    program_type: Option<ProgramType>,

    /// Number of worker threads (defaults to the number of CPUs).
    #[clap(long)]
    threads: Option<usize>,

    /// TOML file with any of the settings above; flags take precedence.
    #[clap(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_partial(self) -> PartialConfig {
        PartialConfig {
            pre_chr: self.pre_chr,
            post_chr: self.post_chr,
            chromosomes: self.chrs.as_deref().map(parse_chromosome_list),
            output: self.output,
            program_type: self.program_type,
            threads: self.threads,
            chunk_size: None,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let start_time = Instant::now();

    let args = Args::parse();
    if let Err(e) = run(args) {
        if e.is_config_error() {
            eprintln!("Configuration error: {e}");
        } else {
            eprintln!("Error: {e}");
        }
        process::exit(1);
    }

    log::info!(
        "Finished in {:.2}s",
        start_time.elapsed().as_secs_f64()
    );
}

fn run(args: Args) -> Result<(), CombineError> {
    let file_config = match &args.config {
        Some(path) => PartialConfig::load(path)?,
        None => PartialConfig::default(),
    };
    let config = file_config.merge(args.into_partial()).into_config()?;

    log::info!(
        "pre_chr={}  post_chr={}  chrs={}  output={}  type={}",
        config.pre_chr,
        config.post_chr,
        config.chromosome_ids.join(","),
        config.output_path.display(),
        config.program_type
    );

    let mut progress = TerminalProgress::new();
    run_combine(&config, &mut progress)?;
    Ok(())
}
