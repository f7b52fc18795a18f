//! AnaloBench dataset loading
//!
//! Records come either from the Hugging Face hub (the parquet conversion of
//! `jhu-clsp/AnaloBench`) or from a local `.parquet`, `.csv` or `.jsonl`
//! file. Records are streamed lazily in file order.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use csv::{ReaderBuilder, StringRecord, Trim};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use parquet::file::reader::SerializedFileReader;
use parquet::record::{Field, Row};
use tracing::info;

use crate::record::Record;

/// Hub repository of the benchmark
pub const ANALOBENCH_REPO: &str = "jhu-clsp/AnaloBench";
/// Revision holding the auto-converted parquet files
pub const PARQUET_REVISION: &str = "refs/convert/parquet";

/// Lazily read dataset records
pub type RecordStream = Box<dyn Iterator<Item = Result<Record>>>;

/// Hub config name for a sentence-length subset, e.g. `S10` -> `T1S10-Subset`
pub fn analobench_config(subset: &str) -> String {
    format!("T1{subset}-Subset")
}

/// Where records are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// Parquet conversion of a hub dataset
    Hub {
        repo_id: String,
        config: String,
        split: String,
        revision: String,
        cache_dir: Option<PathBuf>,
    },
    /// Local `.parquet`, `.csv` or `.jsonl` file
    File(PathBuf),
}

impl DatasetSource {
    /// Train split of an AnaloBench subset on the hub
    pub fn analobench(subset: &str, cache_dir: Option<PathBuf>) -> Self {
        Self::Hub {
            repo_id: ANALOBENCH_REPO.to_string(),
            config: analobench_config(subset),
            split: "train".to_string(),
            revision: PARQUET_REVISION.to_string(),
            cache_dir,
        }
    }

    /// Open the source as a record stream
    pub fn records(&self) -> Result<RecordStream> {
        match self {
            Self::Hub {
                repo_id,
                config,
                split,
                revision,
                cache_dir,
            } => {
                let files = download_parquet_split(repo_id, config, split, revision, cache_dir)?;
                Ok(parquet_records(files))
            }
            Self::File(path) => open_local(path),
        }
    }
}

impl std::fmt::Display for DatasetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub {
                repo_id,
                config,
                split,
                ..
            } => write!(f, "{repo_id} [{config}/{split}]"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Download the parquet shards of one config split, sorted by name
fn download_parquet_split(
    repo_id: &str,
    config: &str,
    split: &str,
    revision: &str,
    cache_dir: &Option<PathBuf>,
) -> Result<Vec<PathBuf>> {
    let mut builder = ApiBuilder::new().with_progress(true);
    if let Some(dir) = cache_dir {
        builder = builder.with_cache_dir(dir.clone());
    }
    let api = builder.build()?;
    let repo = api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Dataset,
        revision.to_string(),
    ));

    let prefix = format!("{config}/{split}/");
    let mut names: Vec<String> = repo
        .info()
        .with_context(|| format!("Failed to list {repo_id}@{revision}"))?
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .filter(|name| name.starts_with(&prefix) && name.ends_with(".parquet"))
        .collect();
    names.sort();

    if names.is_empty() {
        bail!("No parquet files for {config}/{split} in {repo_id}@{revision}");
    }

    info!("Downloading {} parquet file(s) for {}", names.len(), prefix);
    names
        .iter()
        .map(|name| {
            repo.get(name)
                .with_context(|| format!("Failed to download {name}"))
        })
        .collect()
}

fn open_local(path: &Path) -> Result<RecordStream> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "parquet" => Ok(parquet_records(vec![path.to_path_buf()])),
        "csv" => csv_records(path),
        "jsonl" | "ndjson" => jsonl_records(path),
        _ => bail!(
            "Unsupported dataset file {} (expected .parquet, .csv or .jsonl)",
            path.display()
        ),
    }
}

/// Stream rows of several parquet files, one file after the other
fn parquet_records(files: Vec<PathBuf>) -> RecordStream {
    Box::new(files.into_iter().flat_map(|path| -> RecordStream {
        let reader = File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))
            .and_then(|file| {
                SerializedFileReader::new(file)
                    .with_context(|| format!("Invalid parquet file {}", path.display()))
            });
        match reader {
            Ok(reader) => Box::new(reader.into_iter().map(|row| record_from_row(&row?))),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }))
}

/// Columns are matched like parquet and JSONL ones: case-insensitive, with
/// the index trimmed before parsing
fn csv_records(path: &Path) -> Result<RecordStream> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::Headers)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read CSV header of {}", path.display()))?
        .clone();

    Ok(Box::new(reader.into_records().enumerate().map(move |(n, row)| {
        let row = row.with_context(|| format!("Invalid CSV dataset row {}", n + 1))?;
        record_from_csv(&headers, &row).with_context(|| format!("Invalid record on row {}", n + 1))
    })))
}

fn record_from_csv(headers: &StringRecord, row: &StringRecord) -> Result<Record> {
    let mut fields = RecordFields::default();
    for (column, value) in headers.iter().zip(row.iter()) {
        if is_index_column(column) {
            let index = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid index {value:?}"))?;
            fields.index = Some(index);
        } else {
            fields.set_text(column, value.to_string());
        }
    }
    fields.into_record()
}

fn jsonl_records(path: &Path) -> Result<RecordStream> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(
        BufReader::new(file)
            .lines()
            .enumerate()
            .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
            .map(|(n, line)| {
                let line = line?;
                let value: serde_json::Value = serde_json::from_str(&line)
                    .with_context(|| format!("Invalid JSON on line {}", n + 1))?;
                record_from_json(&value).with_context(|| format!("Invalid record on line {}", n + 1))
            }),
    ))
}

/// Fields collected from a loosely typed row
#[derive(Default)]
struct RecordFields {
    index: Option<i64>,
    sentence: Option<String>,
    story: Option<String>,
    options: Option<String>,
    label: Option<String>,
}

impl RecordFields {
    fn set_text(&mut self, column: &str, text: String) {
        let slot = match column.to_ascii_lowercase().as_str() {
            "sentence" => &mut self.sentence,
            "story" => &mut self.story,
            "options" => &mut self.options,
            "label" => &mut self.label,
            _ => return,
        };
        *slot = Some(text);
    }

    fn into_record(self) -> Result<Record> {
        let missing = |name: &str| anyhow!("Dataset row is missing the `{name}` field");
        Ok(Record {
            index: self.index.ok_or_else(|| missing("Index"))?,
            sentence: self.sentence.ok_or_else(|| missing("Sentence"))?,
            story: self.story.unwrap_or_default(),
            options: self.options.ok_or_else(|| missing("Options"))?,
            label: self.label.ok_or_else(|| missing("Label"))?,
        })
    }
}

fn is_index_column(column: &str) -> bool {
    column.eq_ignore_ascii_case("index")
}

fn record_from_row(row: &Row) -> Result<Record> {
    let mut fields = RecordFields::default();
    for (column, field) in row.get_column_iter() {
        if is_index_column(column) {
            fields.index = Some(field_to_index(field)?);
        } else {
            fields.set_text(column, field_to_text(field));
        }
    }
    fields.into_record()
}

fn field_to_index(field: &Field) -> Result<i64> {
    let index = match field {
        Field::Byte(v) => i64::from(*v),
        Field::Short(v) => i64::from(*v),
        Field::Int(v) => i64::from(*v),
        Field::Long(v) => *v,
        Field::UByte(v) => i64::from(*v),
        Field::UShort(v) => i64::from(*v),
        Field::UInt(v) => i64::from(*v),
        Field::ULong(v) => i64::try_from(*v)?,
        Field::Str(s) => s.trim().parse()?,
        other => bail!("Unsupported index value {other}"),
    };
    Ok(index)
}

/// Render a parquet value as text; lists become JSON arrays of strings
fn field_to_text(field: &Field) -> String {
    match field {
        Field::Null => String::new(),
        Field::Str(s) => s.clone(),
        Field::ListInternal(list) => {
            let items: Vec<String> = list.elements().iter().map(field_to_text).collect();
            serde_json::to_string(&items).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

fn record_from_json(value: &serde_json::Value) -> Result<Record> {
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("Expected a JSON object"))?;

    let mut fields = RecordFields::default();
    for (column, value) in object {
        if is_index_column(column) {
            let index = match value {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            fields.index = Some(index.ok_or_else(|| anyhow!("Invalid index {value}"))?);
        } else {
            fields.set_text(column, json_to_text(value));
        }
    }
    fields.into_record()
}

fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(json_to_text).collect();
            serde_json::to_string(&items).unwrap_or_default()
        }
        other => other.to_string(),
    }
}
