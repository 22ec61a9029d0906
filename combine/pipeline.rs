// ========================================================================================
//
//                            The combine run, end to end
//
// ========================================================================================
//
// ### Phases ###
//
// 1.  Layout: the header of the first chromosome fixes the columns and the
//     identity position. Ragged inputs get one extra scan of that same file to
//     discover the rows. Both run once, sequentially, before anything is allocated.
//
// 2.  Resource planning: the total matrix is allocated fallibly, and the worker
//     count is reduced if the partials it implies would not fit in available memory.
//
// 3.  Accumulation: every chromosome file (the first one included) is streamed
//     by the parallel reducer into the total.
//
// 4.  Output: the total is written once, atomically.

use crate::accumulate::AccumulatorLayout;
use crate::config::{CombineConfig, RowMode};
use crate::error::CombineError;
use crate::header::ColumnIndex;
use crate::matrix::Matrix;
use crate::output::write_matrix;
use crate::progress::{CombineProgressObserver, CombineStage};
use crate::reduce::{ParallelReducer, partials_in_flight};
use crate::rows::RowCatalog;
use log::{info, warn};
use sysinfo::System;

/// What a finished run produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CombineSummary {
    pub nrows: usize,
    pub ncols: usize,
    pub files: usize,
    pub workers: usize,
    pub malformed_tokens: usize,
    /// Files whose row count differed from the reference.
    pub mismatched_files: usize,
}

/// Runs a complete combine as described by `config`.
pub fn run_combine(
    config: &CombineConfig,
    progress: &mut dyn CombineProgressObserver,
) -> Result<CombineSummary, CombineError> {
    config.validate()?;
    let paths = config.input_paths();
    let reference = &paths[0];
    let identity_label = config.identity_label();
    info!(
        "Combining {} chromosome file(s) of type {} into {}",
        paths.len(),
        config.program_type,
        config.output_path.display()
    );

    // --- Phase 1: Layout ---
    let chunk = vec![0u8; config.chunk_size.max(1)];
    let (columns, chunk) = ColumnIndex::from_reference(reference, identity_label, chunk)?;
    let (rows, chunk) = match config.program_type.row_mode() {
        RowMode::Square => (RowCatalog::square(&columns), chunk),
        RowMode::Ragged => {
            progress.on_stage_start(CombineStage::RowDiscovery, 1);
            let discovered = RowCatalog::discover(reference, columns.remove_index(), chunk)?;
            progress.on_stage_finish(CombineStage::RowDiscovery);
            discovered
        }
    };
    let nrows = rows.nrows();
    let ncols = columns.ncols();
    info!("Matrix size will be {nrows} rows x {ncols} cols");

    // --- Phase 2: Resource planning ---
    let requested_workers = config
        .threads
        .unwrap_or_else(num_cpus::get)
        .min(paths.len())
        .max(1);
    let workers = plan_workers(nrows, ncols, requested_workers, available_memory())?;
    let mut total = Matrix::zeros(nrows, ncols)?;
    let reducer = ParallelReducer::new(workers, config.chunk_size);
    reducer.chunk_pool().push(chunk);

    // --- Phase 3: Accumulation ---
    let layout = AccumulatorLayout {
        remove_index: columns.remove_index(),
        nrows,
        ncols,
    };
    let summaries = reducer.reduce(&paths, layout, &mut total, progress)?;
    info!("All chromosomes processed");

    // --- Phase 4: Output ---
    progress.on_stage_start(CombineStage::Output, 0);
    write_matrix(
        &config.output_path,
        identity_label,
        columns.names(),
        rows.labels(),
        &total,
    )?;
    progress.on_stage_finish(CombineStage::Output);

    let summary = CombineSummary {
        nrows,
        ncols,
        files: summaries.len(),
        workers,
        malformed_tokens: summaries.iter().map(|s| s.malformed_tokens).sum(),
        mismatched_files: summaries
            .iter()
            .filter(|s| !s.row_count_matches(nrows))
            .count(),
    };
    info!(
        "Done  ({}x{}, {} files, {} non-numeric values, {} row-count mismatches)",
        summary.nrows,
        summary.ncols,
        summary.files,
        summary.malformed_tokens,
        summary.mismatched_files
    );
    Ok(summary)
}

fn available_memory() -> Option<u64> {
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    (available > 0).then_some(available)
}

/// Chooses how many workers can run given the memory their partials need. The total
/// and the partials of a single worker must fit; beyond that each worker adds one
/// partial.
pub fn plan_workers(
    nrows: usize,
    ncols: usize,
    requested: usize,
    available_bytes: Option<u64>,
) -> Result<usize, CombineError> {
    let requested = requested.max(1);
    let Some(available_bytes) = available_bytes else {
        return Ok(requested);
    };
    let matrix_bytes = Matrix::required_bytes(nrows, ncols);
    let minimum_bytes = matrix_bytes.saturating_mul(1 + partials_in_flight(1) as u64);
    if minimum_bytes > available_bytes {
        return Err(CombineError::InsufficientMemory {
            nrows,
            ncols,
            required_bytes: minimum_bytes,
            available_bytes,
        });
    }
    if matrix_bytes == 0 {
        return Ok(requested);
    }

    let matrices_that_fit = available_bytes / matrix_bytes;
    let mut workers = requested;
    while workers > 1 && 1 + partials_in_flight(workers) as u64 > matrices_that_fit {
        workers -= 1;
    }
    if workers < requested {
        warn!(
            "Reducing workers from {requested} to {workers}: each partial matrix needs {matrix_bytes} bytes and {available_bytes} bytes are available"
        );
    }
    Ok(workers)
}
