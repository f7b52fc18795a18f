//! analobench CLI: resumable AnaloBench inference and SLURM helpers

use analobench_rs::{
    default_output_path, ensure_dir, model_name, render_script, write_script, CausalModel,
    CompletionsClient, DatasetSource, GenerationParams, LogLayout, ModelClient, ModelOptions,
    RunConfig, Runner, ScaffoldConfig, StampKind,
};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "analobench")]
#[command(about = "Resumable AnaloBench inference with channel-tagged outputs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the benchmark, appending to a resumable CSV
    Run(RunArgs),
    /// SLURM log folder and submit script helpers
    #[command(subcommand)]
    Slurm(SlurmCommand),
}

#[derive(Args)]
struct RunArgs {
    /// Model ID from `HuggingFace` or a local directory (e.g., "./models/gpt-oss-20b")
    #[arg(short, long)]
    model: String,

    /// AnaloBench subset (S10, S30, ...)
    #[arg(long, default_value = "S10")]
    subset: String,

    /// Records per batch
    #[arg(long, default_value_t = 10)]
    batch_size: usize,

    /// Maximum new tokens per generation
    #[arg(long, default_value_t = 256)]
    max_new_tokens: usize,

    /// Sampling temperature (greedy at 0)
    #[arg(long, default_value_t = 0.7)]
    temperature: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Read records from a local .parquet/.csv/.jsonl file instead of the hub
    #[arg(long)]
    dataset_file: Option<PathBuf>,

    /// Results CSV (default: {output_dir}/T1{subset}-{model_name}-{date}.csv)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for the default results file
    #[arg(long, default_value = "results/analobench")]
    output_dir: PathBuf,

    /// Date stamp for the default results file (default: today, MM-DD)
    #[arg(long)]
    date: Option<String>,

    /// OpenAI-compatible endpoint (e.g., "http://localhost:8000/v1"); loads the model locally when absent
    #[arg(long)]
    endpoint: Option<String>,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Sampling seed for local generation
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// `HuggingFace` cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Timeout for one remote completion request
    #[arg(long, default_value_t = 600)]
    request_timeout_secs: u64,
}

#[derive(Args)]
struct LayoutArgs {
    /// Root folder for logs
    #[arg(short, long, default_value = "slurm_jobs")]
    root: PathBuf,

    /// Stamp subfolder under the root
    #[arg(short, long, value_enum, default_value_t = StampKind::Date)]
    stamp: StampKind,

    /// Log file prefix
    #[arg(short, long, default_value = "run")]
    prefix: String,

    /// Output log extension
    #[arg(long, default_value = "out")]
    ext_out: String,

    /// Error log extension
    #[arg(long, default_value = "err")]
    ext_err: String,
}

impl From<LayoutArgs> for LogLayout {
    fn from(args: LayoutArgs) -> Self {
        Self {
            root: args.root,
            stamp: args.stamp,
            prefix: args.prefix,
            ext_out: args.ext_out,
            ext_err: args.ext_err,
        }
    }
}

#[derive(Subcommand)]
enum SlurmCommand {
    /// Print the absolute log folder
    Mkpath {
        #[command(flatten)]
        layout: LayoutArgs,
        /// Only print the path
        #[arg(long)]
        no_create: bool,
    },
    /// Print #SBATCH --output/--error lines
    SbatchLines {
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Write an executable submit script
    Scaffold {
        #[command(flatten)]
        layout: LayoutArgs,
        #[arg(short, long, default_value = "job")]
        job_name: String,
        #[arg(long, default_value = "submit.sbatch")]
        script: PathBuf,
        #[arg(long)]
        account: Option<String>,
        /// Repeat for several partitions
        #[arg(long)]
        partition: Vec<String>,
        #[arg(long, default_value = "gpu:1")]
        gres: String,
        #[arg(long, default_value = "100:00:00")]
        time: String,
        /// Command the job runs
        #[arg(long)]
        command: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let verbose = matches!(&cli.command, Command::Run(args) if args.verbose);
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Run(args) => run(args),
        Command::Slurm(command) => slurm(command),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let date = args
        .date
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("%m-%d").to_string());
    let output = args.output.clone().unwrap_or_else(|| {
        default_output_path(&args.output_dir, &args.subset, &args.model, &date)
    });
    let source = match &args.dataset_file {
        Some(path) => DatasetSource::File(path.clone()),
        None => DatasetSource::analobench(&args.subset, args.cache_dir.clone()),
    };

    println!("=== AnaloBench: {} ===", model_name(&args.model));
    println!("Model:   {}", args.model);
    println!("Dataset: {source}");
    println!("Output:  {}", output.display());
    if let Some(endpoint) = &args.endpoint {
        println!("Mode:    remote ({endpoint})");
    } else if args.cpu {
        println!("Mode:    CPU (forced)");
    }

    let client: Box<dyn ModelClient> = match &args.endpoint {
        Some(endpoint) => Box::new(CompletionsClient::new(
            endpoint,
            &args.model,
            Duration::from_secs(args.request_timeout_secs),
        )?),
        None => {
            info!("Loading model...");
            let options = ModelOptions {
                force_cpu: args.cpu,
                cache_dir: args.cache_dir.clone(),
                seed: args.seed,
                ..ModelOptions::default()
            };
            let model = CausalModel::from_pretrained(&args.model, &options)?;
            info!("Model: {:?} architecture", model.architecture());
            Box::new(model)
        }
    };

    let config = RunConfig {
        output_path: output.clone(),
        batch_size: args.batch_size,
        generation: GenerationParams {
            max_new_tokens: args.max_new_tokens,
            temperature: args.temperature,
        },
        show_progress: true,
        ..RunConfig::default()
    };

    let records = source.records()?;
    let mut runner = Runner::new(client, config);
    let summary = runner.run(records)?;

    println!("\n=== Results ===");
    println!("Previously processed: {}", summary.previously_processed);
    println!("Written:              {}", summary.written);
    println!("Skipped:              {}", summary.skipped);
    if summary.written > 0 {
        println!(
            "With prediction:      {} ({:.1}%)",
            summary.extracted,
            summary.extracted as f64 / summary.written as f64 * 100.0
        );
    }
    println!("Output: {}", output.display());

    Ok(())
}

fn slurm(command: SlurmCommand) -> Result<()> {
    let now = chrono::Local::now().naive_local();

    match command {
        SlurmCommand::Mkpath { layout, no_create } => {
            let layout = LogLayout::from(layout);
            let dir = ensure_dir(&layout.dir(now), !no_create)?;
            println!("{}", dir.display());
        }
        SlurmCommand::SbatchLines { layout } => {
            let paths = LogLayout::from(layout).paths(now);
            ensure_dir(&paths.dir, true)?;
            for line in paths.sbatch_lines() {
                println!("{line}");
            }
        }
        SlurmCommand::Scaffold {
            layout,
            job_name,
            script,
            account,
            partition,
            gres,
            time,
            command,
        } => {
            let paths = LogLayout::from(layout).paths(now);
            ensure_dir(&paths.dir, true)?;
            let mut config = ScaffoldConfig {
                job_name,
                account,
                partitions: partition,
                gres,
                time,
                ..ScaffoldConfig::default()
            };
            if let Some(command) = command {
                config.command = command;
            }
            write_script(&script, &render_script(&config, &paths))?;
            println!("Wrote {}", script.display());
            println!("Submit with: sbatch {}", script.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_slurm_short_flags() {
        let cli = Cli::try_parse_from([
            "analobench", "slurm", "scaffold", "-r", "logs", "-s", "none", "-p", "eval", "-j",
            "anabench",
        ])
        .unwrap();
        let Command::Slurm(SlurmCommand::Scaffold {
            layout,
            job_name,
            command,
            ..
        }) = cli.command
        else {
            panic!("expected scaffold");
        };
        assert_eq!(layout.root, PathBuf::from("logs"));
        assert_eq!(layout.stamp, StampKind::None);
        assert_eq!(layout.prefix, "eval");
        assert_eq!(job_name, "anabench");
        assert!(command.is_none());
    }

    #[test]
    fn test_mkpath_short_flags() {
        let cli =
            Cli::try_parse_from(["analobench", "slurm", "mkpath", "-s", "datetime", "--no-create"])
                .unwrap();
        let Command::Slurm(SlurmCommand::Mkpath { layout, no_create }) = cli.command else {
            panic!("expected mkpath");
        };
        assert_eq!(layout.stamp, StampKind::Datetime);
        assert!(no_create);
    }
}
