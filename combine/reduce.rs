// ========================================================================================
//
//                    Parallel per-file accumulation and the reduction loop
//
// ========================================================================================
//
// ### Shape of the computation ###
//
// Every input file is one task on a bounded rayon pool. A task accumulates its file
// into a private partial matrix and sends it over a small bounded channel. The
// coordinating thread is the only code that touches the total: it receives partials
// as they complete, adds them in, clears them and returns them to a pool for the
// next task. The channel bound keeps at most `workers + 2` partials alive.
//
// The first fatal error raises a shared cancellation flag. Tasks check the flag
// before opening a file and periodically while streaming, so siblings wind down
// cleanly and the caller receives that first error alone.

use crate::accumulate::{AccumulatorLayout, FileSummary, accumulate_file};
use crate::error::CombineError;
use crate::matrix::Matrix;
use crate::progress::{CombineProgressObserver, CombineStage};
use crate::tokenizer::ChunkPool;
use crossbeam_queue::ArrayQueue;
use log::{debug, error};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

/// Partials held in flight per worker count: one per worker, one in the channel,
/// one being merged.
pub fn partials_in_flight(workers: usize) -> usize {
    workers + 2
}

/// Recycles zeroed partial matrices between tasks.
struct PartialPool {
    pool: ArrayQueue<Matrix>,
}

impl PartialPool {
    fn new(capacity: usize) -> Self {
        Self {
            pool: ArrayQueue::new(capacity.max(1)),
        }
    }

    fn pop(&self, layout: AccumulatorLayout) -> Result<Matrix, CombineError> {
        match self.pool.pop() {
            Some(partial) => Ok(partial),
            None => Matrix::zeros(layout.nrows, layout.ncols),
        }
    }

    fn push(&self, mut partial: Matrix) {
        partial.clear();
        let _ = self.pool.push(partial);
    }
}

/// Fans per-file accumulation out over a worker pool and merges the partials.
pub struct ParallelReducer {
    workers: usize,
    chunk_pool: ChunkPool,
}

impl ParallelReducer {
    pub fn new(workers: usize, chunk_size: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            chunk_pool: ChunkPool::new(workers + 1, chunk_size),
        }
    }

    /// Decompression chunks shared with the sequential header and row scans.
    pub fn chunk_pool(&self) -> &ChunkPool {
        &self.chunk_pool
    }

    /// Adds every file in `paths` into `total`. Summaries come back in input order.
    pub fn reduce(
        &self,
        paths: &[PathBuf],
        layout: AccumulatorLayout,
        total: &mut Matrix,
        progress: &mut dyn CombineProgressObserver,
    ) -> Result<Vec<FileSummary>, CombineError> {
        let workers = self.workers.min(paths.len()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("combine-worker-{i}"))
            .build()
            .map_err(|e| CombineError::WorkerPool(e.to_string()))?;

        let cancel = AtomicBool::new(false);
        let first_error: Mutex<Option<CombineError>> = Mutex::new(None);
        let partials = PartialPool::new(partials_in_flight(workers));
        let (merge_tx, merge_rx) = crossbeam_channel::bounded::<(usize, Matrix, FileSummary)>(1);
        let mut summaries: Vec<Option<FileSummary>> = vec![None; paths.len()];

        progress.on_stage_start(CombineStage::Accumulation, paths.len());
        debug!("Accumulating {} files on {workers} workers", paths.len());

        thread::scope(|s| {
            s.spawn(|| {
                pool.install(|| {
                    paths
                        .par_iter()
                        .enumerate()
                        .for_each_with(merge_tx, |merge_tx, (index, path)| {
                            if cancel.load(Ordering::Relaxed) {
                                return;
                            }
                            let outcome = partials.pop(layout).and_then(|mut partial| {
                                let chunk = self.chunk_pool.pop();
                                let (summary, chunk) =
                                    accumulate_file(path, layout, &mut partial, chunk, &cancel)?;
                                self.chunk_pool.push(chunk);
                                Ok((partial, summary))
                            });
                            match outcome {
                                Ok((partial, summary)) => {
                                    if merge_tx.send((index, partial, summary)).is_err() {
                                        cancel.store(true, Ordering::Relaxed);
                                    }
                                }
                                Err(CombineError::Cancelled) => {
                                    debug!("{} abandoned after cancellation", path.display());
                                }
                                Err(err) => {
                                    error!("Fatal error while processing {}: {err}", path.display());
                                    cancel.store(true, Ordering::Relaxed);
                                    let mut slot =
                                        first_error.lock().unwrap_or_else(PoisonError::into_inner);
                                    if slot.is_none() {
                                        *slot = Some(err);
                                    }
                                }
                            }
                        });
                });
            });

            // The loop ends once every task has finished and dropped its sender.
            for (index, partial, summary) in merge_rx.iter() {
                total.add_assign(&partial);
                progress.on_file_merged(&paths[index], &summary);
                summaries[index] = Some(summary);
                partials.push(partial);
            }
        });

        progress.on_stage_finish(CombineStage::Accumulation);

        if let Some(err) = first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(err);
        }
        Ok(summaries.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopCombineProgress;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    fn write_gz(path: &Path, text: &str) {
        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::fast());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    const LAYOUT: AccumulatorLayout = AccumulatorLayout {
        remove_index: 0,
        nrows: 2,
        ncols: 2,
    };

    #[test]
    fn partials_from_all_files_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..6 {
            let path = dir.path().join(format!("chr{i}.gz"));
            write_gz(&path, &format!("RECIPIENT A B\nA {i} 1\nB 2 {i}\n"));
            paths.push(path);
        }

        let reducer = ParallelReducer::new(3, 16);
        let mut total = Matrix::zeros(2, 2).unwrap();
        let summaries = reducer
            .reduce(&paths, LAYOUT, &mut total, &mut NoopCombineProgress)
            .unwrap();

        assert_eq!(summaries.len(), 6);
        assert!(summaries.iter().all(|s| s.rows == 2));
        assert_eq!(total.as_slice(), &[15.0, 6.0, 12.0, 15.0]);
    }

    #[test]
    fn missing_file_aborts_the_run_with_its_own_error() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("chr1.gz");
        write_gz(&good, "RECIPIENT A B\nA 1 1\nB 1 1\n");
        let missing = dir.path().join("chr2.gz");

        let reducer = ParallelReducer::new(2, 1024);
        let mut total = Matrix::zeros(2, 2).unwrap();
        let err = reducer
            .reduce(
                &[good, missing.clone()],
                LAYOUT,
                &mut total,
                &mut NoopCombineProgress,
            )
            .unwrap_err();
        match err {
            CombineError::Open { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn file_without_header_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("chr1.gz");
        write_gz(&empty, "");

        let reducer = ParallelReducer::new(1, 1024);
        let mut total = Matrix::zeros(2, 2).unwrap();
        let err = reducer
            .reduce(&[empty], LAYOUT, &mut total, &mut NoopCombineProgress)
            .unwrap_err();
        assert!(matches!(err, CombineError::MissingHeader { .. }));
    }
}
