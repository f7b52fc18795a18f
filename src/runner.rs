//! Resumable benchmark runner
//!
//! Coordinates resume tracking, batching, generation and result writing.
//!
//! ## Durability
//!
//! Each record moves through `Unseen -> InBatch -> Generated -> Written`.
//! Only `Unseen` and `Written` survive a crash: a batch is written and synced
//! as a whole after all of its generations succeeded, so a restart skips
//! every written index and regenerates the rest.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::batch::process_batch;
use crate::client::{GenerationParams, ModelClient};
use crate::output::ResultsWriter;
use crate::parser::ParseOptions;
use crate::prompt::PromptTemplate;
use crate::record::{Record, ScoredRecord};
use crate::resume::ResumeState;

const PROGRESS_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {pos} records ({per_sec}) {msg}";

/// Configuration for a benchmark run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Results CSV (appended to, created if missing)
    pub output_path: PathBuf,
    /// Records per generation batch
    pub batch_size: usize,
    /// Sampling parameters
    pub generation: GenerationParams,
    /// Output parsing options
    pub parse_options: ParseOptions,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("results/analobench/results.csv"),
            batch_size: 10,
            generation: GenerationParams::default(),
            parse_options: ParseOptions::default(),
            show_progress: false,
        }
    }
}

/// Last `/`-segment of a model id or path
pub fn model_name(model_id: &str) -> &str {
    let trimmed = model_id.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// `{dir}/T1{subset}-{model_name}-{date}.csv`
pub fn default_output_path(dir: &Path, subset: &str, model_id: &str, date: &str) -> PathBuf {
    dir.join(format!("T1{subset}-{}-{date}.csv", model_name(model_id)))
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Indices found in the results file before the run
    pub previously_processed: usize,
    /// Records read from the dataset
    pub seen: usize,
    /// Records skipped as already processed
    pub skipped: usize,
    /// Rows appended during this run
    pub written: usize,
    /// Batches written
    pub batches: usize,
    /// Appended rows with an extracted prediction
    pub extracted: usize,
}

/// Benchmark runner owning the model client
pub struct Runner<C: ModelClient> {
    config: RunConfig,
    client: C,
    template: PromptTemplate,
}

impl<C: ModelClient> Runner<C> {
    /// Create a runner with the AnaloBench prompt
    pub fn new(client: C, config: RunConfig) -> Self {
        Self::with_template(client, config, PromptTemplate::analobench())
    }

    pub fn with_template(client: C, config: RunConfig, template: PromptTemplate) -> Self {
        Self {
            config,
            client,
            template,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn into_client(self) -> C {
        self.client
    }

    /// Process every unprocessed record of `records`, in order
    ///
    /// Stops at the first dataset or generation error; everything written
    /// before that point is durable.
    pub fn run<I>(&mut self, records: I) -> Result<RunSummary>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        if self.config.batch_size == 0 {
            bail!("Batch size must be at least 1");
        }

        let path = self.config.output_path.clone();
        let state = ResumeState::scan(&path)?;
        let mut summary = RunSummary {
            previously_processed: state.len(),
            ..RunSummary::default()
        };
        if state.is_empty() {
            info!("Starting fresh results file {}", path.display());
        } else {
            info!(
                "Resuming. Found {} processed rows in {}",
                state.len(),
                path.display()
            );
        }

        let mut writer = ResultsWriter::open(&path, &state)?;
        let mut processed: HashSet<i64> = state.processed().clone();

        let progress = self.progress_bar();
        info!(
            "Starting processing with batch size {} using {}",
            self.config.batch_size,
            self.client.name()
        );

        let mut batch: Vec<Record> = Vec::with_capacity(self.config.batch_size);
        for record in records {
            let record = record.context("Failed to read dataset record")?;
            summary.seen += 1;
            progress.inc(1);

            if !processed.insert(record.index) {
                if state.contains(record.index) {
                    debug!("Skipping processed record {}", record.index);
                } else {
                    warn!("Skipping duplicate dataset index {}", record.index);
                }
                summary.skipped += 1;
                continue;
            }

            batch.push(record);
            if batch.len() >= self.config.batch_size {
                let full = std::mem::replace(
                    &mut batch,
                    Vec::with_capacity(self.config.batch_size),
                );
                self.flush_batch(full, &mut writer, &mut summary)?;
                progress.set_message(format!("{} written", summary.written));
                info!("Processed {} rows and wrote to {}", summary.written, path.display());
            }
        }

        if !batch.is_empty() {
            debug!("Processing the final batch of {} rows", batch.len());
            let rows = batch.len();
            self.flush_batch(batch, &mut writer, &mut summary)?;
            info!("Processed final {} rows and appended to {}", rows, path.display());
        }

        progress.finish_and_clear();
        info!(
            "Run complete: {} written, {} skipped, {} with predictions",
            summary.written, summary.skipped, summary.extracted
        );
        Ok(summary)
    }

    /// Generate a whole batch, then write and sync it
    fn flush_batch(
        &mut self,
        batch: Vec<Record>,
        writer: &mut ResultsWriter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let scored: Vec<ScoredRecord> = process_batch(
            batch,
            &self.template,
            &mut self.client,
            &self.config.generation,
            self.config.parse_options,
        )?;

        writer.write_batch(&scored)?;
        summary.written += scored.len();
        summary.batches += 1;
        summary.extracted += scored.iter().filter(|s| s.prediction.is_extracted()).count();
        Ok(())
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template(PROGRESS_TEMPLATE) {
            bar.set_style(style);
        }
        bar
    }
}
