// Pedantic clippy configuration
#![allow(clippy::cast_precision_loss)] // usize→f64 in summary ratios
#![allow(clippy::cast_possible_truncation)] // usize→u32 token ids
#![allow(clippy::module_name_repetitions)] // ModelClient in client.rs is fine
// Documentation pedantic:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! analobench-rs: resumable AnaloBench inference
//!
//! Runs a causal LM over the AnaloBench story-analogy benchmark, extracts
//! the `final` channel answer and the `analysis` channel reasoning from each
//! generation, and appends results to a CSV that a restarted run resumes.
//!
//! ## Architecture
//!
//! - `parser`: `<|channel|>...<|message|>...` segment extraction
//! - `record`: Dataset records, predictions and output rows
//! - `prompt`: Prompt template with `{target}`/`{options}` insertion points
//! - `client`: ModelClient trait and generation parameters
//! - `model`: Local candle model (Qwen2/LLaMA) implementing ModelClient
//! - `remote`: OpenAI-compatible completions client (harmony prompt)
//! - `dataset`: Hub parquet and local parquet/CSV/JSONL record streams
//! - `resume`: Processed-index scan and torn-tail detection
//! - `output`: Append-only, batch-synced results writer
//! - `batch`: Prompt, generate and parse one batch
//! - `runner`: Driver loop coordinating resume, batching and writing
//! - `slurm`: Dated log folders and submit script scaffolding

pub mod batch;
pub mod client;
pub mod dataset;
pub mod model;
pub mod output;
pub mod parser;
pub mod prompt;
pub mod record;
pub mod remote;
pub mod resume;
pub mod runner;
pub mod slurm;

pub use batch::process_batch;
pub use client::{GenerationParams, ModelClient};
pub use dataset::{DatasetSource, RecordStream, ANALOBENCH_REPO};
pub use model::{CausalModel, ModelArchitecture, ModelOptions};
pub use output::ResultsWriter;
pub use parser::{parse_message_pairs, parse_message_pairs_with, MessagePair, ParseOptions};
pub use prompt::{PromptTemplate, SYSTEM_INSTRUCTION};
pub use record::{Prediction, Record, ScoredRecord, OUTPUT_HEADER};
pub use remote::{harmony_prompt, CompletionsClient};
pub use resume::ResumeState;
pub use runner::{default_output_path, model_name, RunConfig, RunSummary, Runner};
pub use slurm::{
    ensure_dir, render_script, write_script, LogLayout, LogPaths, ScaffoldConfig, StampKind,
};
