use crate::accumulate::FileSummary;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;
use std::path::Path;

/// Stages reported during a combine run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CombineStage {
    RowDiscovery,
    Accumulation,
    Output,
}

impl CombineStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::RowDiscovery => "row discovery",
            Self::Accumulation => "matrix accumulation",
            Self::Output => "output writing",
        }
    }
}

impl fmt::Display for CombineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress. Calls arrive from the coordinating thread only.
pub trait CombineProgressObserver {
    fn on_stage_start(&mut self, stage: CombineStage, total_files: usize) {
        let _ = (stage, total_files);
    }
    fn on_file_merged(&mut self, path: &Path, summary: &FileSummary) {
        let _ = (path, summary);
    }
    fn on_stage_finish(&mut self, stage: CombineStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopCombineProgress;

impl CombineProgressObserver for NoopCombineProgress {}

/// A progress bar over merged files, drawn only when stderr is a terminal.
#[derive(Default)]
pub struct TerminalProgress {
    bar: Option<ProgressBar>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CombineProgressObserver for TerminalProgress {
    fn on_stage_start(&mut self, stage: CombineStage, total_files: usize) {
        if stage != CombineStage::Accumulation {
            return;
        }
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_files as u64), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(stage.describe());
        self.bar = Some(bar);
    }

    fn on_file_merged(&mut self, path: &Path, summary: &FileSummary) {
        if let Some(bar) = &self.bar {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            bar.set_message(format!("{name} ({} rows)", summary.rows));
            bar.inc(1);
        }
    }

    fn on_stage_finish(&mut self, stage: CombineStage) {
        if stage == CombineStage::Accumulation
            && let Some(bar) = self.bar.take()
        {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_lives_until_accumulation_finishes() {
        let mut progress = TerminalProgress::new();
        progress.on_stage_start(CombineStage::RowDiscovery, 1);
        assert!(progress.bar.is_none());

        progress.on_stage_start(CombineStage::Accumulation, 2);
        progress.on_file_merged(Path::new("chr1.gz"), &FileSummary::default());
        assert_eq!(progress.bar.as_ref().map(|bar| bar.position()), Some(1));

        progress.on_stage_finish(CombineStage::Output);
        assert!(progress.bar.is_some());
        progress.on_stage_finish(CombineStage::Accumulation);
        assert!(progress.bar.is_none());
    }
}
