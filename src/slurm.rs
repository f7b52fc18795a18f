//! Dated SLURM log folders and submit script scaffolding
//!
//! Log files are named `%j_{prefix}.{ext}`; SLURM expands `%j` to the job
//! id at runtime. The timestamp is taken once by the caller and passed in.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::ValueEnum;

/// How the log folder is stamped
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StampKind {
    /// `YYYY-MM-DD`
    Date,
    /// `YYYY-MM-DD_HH-MM-SS`
    Datetime,
    /// No stamp folder
    None,
}

impl StampKind {
    /// Folder name for `now`, if any
    pub fn folder(self, now: NaiveDateTime) -> Option<String> {
        match self {
            StampKind::Date => Some(now.format("%Y-%m-%d").to_string()),
            StampKind::Datetime => Some(now.format("%Y-%m-%d_%H-%M-%S").to_string()),
            StampKind::None => None,
        }
    }
}

/// Where log files go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    pub root: PathBuf,
    pub stamp: StampKind,
    pub prefix: String,
    pub ext_out: String,
    pub ext_err: String,
}

impl Default for LogLayout {
    fn default() -> Self {
        Self {
            root: PathBuf::from("slurm_jobs"),
            stamp: StampKind::Date,
            prefix: "run".to_string(),
            ext_out: "out".to_string(),
            ext_err: "err".to_string(),
        }
    }
}

/// Resolved log folder and file patterns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub dir: PathBuf,
    pub output: PathBuf,
    pub error: PathBuf,
}

impl LogLayout {
    /// Stamped log folder
    pub fn dir(&self, now: NaiveDateTime) -> PathBuf {
        match self.stamp.folder(now) {
            Some(stamp) => self.root.join(stamp),
            None => self.root.clone(),
        }
    }

    /// Folder plus `%j_{prefix}` output and error file patterns
    pub fn paths(&self, now: NaiveDateTime) -> LogPaths {
        let dir = self.dir(now);
        LogPaths {
            output: dir.join(format!("%j_{}.{}", self.prefix, self.ext_out)),
            error: dir.join(format!("%j_{}.{}", self.prefix, self.ext_err)),
            dir,
        }
    }
}

impl LogPaths {
    /// `#SBATCH --output` / `--error` directives
    pub fn sbatch_lines(&self) -> [String; 2] {
        [
            format!("#SBATCH --output={}", self.output.display()),
            format!("#SBATCH --error={}", self.error.display()),
        ]
    }
}

/// Create `dir` (and parents) unless `create` is false; return its absolute form
pub fn ensure_dir(dir: &Path, create: bool) -> Result<PathBuf> {
    if create {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::path::absolute(dir).with_context(|| format!("Failed to resolve {}", dir.display()))
}

/// Contents of a generated submit script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffoldConfig {
    pub job_name: String,
    pub account: Option<String>,
    pub partitions: Vec<String>,
    pub nodes: u32,
    pub gres: String,
    pub time: String,
    pub command: String,
}

impl Default for ScaffoldConfig {
    fn default() -> Self {
        Self {
            job_name: "job".to_string(),
            account: None,
            partitions: Vec::new(),
            nodes: 1,
            gres: "gpu:1".to_string(),
            time: "100:00:00".to_string(),
            command: "analobench run --model ./models/gpt-oss-20b".to_string(),
        }
    }
}

/// Render a bash submit script that logs into `paths`
pub fn render_script(config: &ScaffoldConfig, paths: &LogPaths) -> String {
    let mut lines = vec![
        "#!/bin/bash -l".to_string(),
        "#SLURM SUBMIT SCRIPT".to_string(),
        format!("#SBATCH --job-name={}", config.job_name),
    ];
    if let Some(account) = &config.account {
        lines.push(format!("#SBATCH --account={account}"));
    }
    for partition in &config.partitions {
        lines.push(format!("#SBATCH --partition={partition}"));
    }
    lines.push(format!("#SBATCH --nodes={}", config.nodes));
    lines.push(format!("#SBATCH --gres={}", config.gres));
    lines.extend(paths.sbatch_lines());
    lines.push(format!("#SBATCH --time={}", config.time));

    let dir = paths.dir.display();
    lines.push(String::new());
    lines.push("# Log directory (idempotent)".to_string());
    lines.push(format!("mkdir -p \"{dir}\""));
    lines.push(String::new());
    lines.push("echo \"Job ID: $SLURM_JOB_ID\"".to_string());
    lines.push("echo \"Started at: $(date)\"".to_string());
    lines.push(String::new());
    lines.push("nvidia-smi".to_string());
    lines.push(String::new());
    lines.push(config.command.clone());
    lines.push(String::new());
    lines.push("echo \"Finished at: $(date)\"".to_string());

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

/// Write an executable script
pub fn write_script(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to make {} executable", path.display()))?;
    }
    Ok(())
}
