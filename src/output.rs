//! Append-only results CSV writer

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use tracing::{debug, warn};

use crate::record::{ScoredRecord, OUTPUT_HEADER};
use crate::resume::ResumeState;

/// Exclusive writer for the results file
///
/// Rows are appended in submission order and every batch ends with a flush
/// to stable storage.
pub struct ResultsWriter {
    writer: Writer<File>,
    path: PathBuf,
    rows_written: usize,
}

impl ResultsWriter {
    /// Open `path` for appending, given the state scanned from it
    ///
    /// Creates missing parent directories, cuts off a partial last row and
    /// writes the header when the file is new or empty.
    pub fn open(path: &Path, state: &ResumeState) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if state.has_torn_tail() {
            warn!(
                "Truncating {} to {} bytes to drop a partial row",
                path.display(),
                state.durable_len()
            );
            file.set_len(state.durable_len())
                .context("Failed to truncate partial row")?;
        }

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if state.needs_header() {
            writer.write_record(OUTPUT_HEADER)?;
            debug!("Wrote CSV header to {}", path.display());
        }

        let mut results = Self {
            writer,
            path: path.to_path_buf(),
            rows_written: 0,
        };
        results.sync()?;
        Ok(results)
    }

    /// Append all rows of a batch, then flush and sync the file
    pub fn write_batch(&mut self, batch: &[ScoredRecord]) -> Result<()> {
        for scored in batch {
            self.writer
                .serialize(scored.row())
                .with_context(|| format!("Failed to write row {}", scored.record.index))?;
        }
        self.sync()?;
        self.rows_written += batch.len();
        Ok(())
    }

    /// Flush buffered rows and force them to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush results")?;
        self.writer
            .get_ref()
            .sync_data()
            .context("Failed to sync results to disk")?;
        Ok(())
    }

    /// Rows appended by this writer
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Prediction, Record};

    fn scored(index: i64, pred: Option<&str>) -> ScoredRecord {
        ScoredRecord::new(
            Record {
                index,
                sentence: "s".into(),
                story: String::new(),
                options: "o".into(),
                label: "l".into(),
            },
            Prediction {
                pred_y: pred.map(Into::into),
                reason: None,
            },
        )
    }

    #[test]
    fn test_new_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        let state = ResumeState::scan(&path).unwrap();
        let mut writer = ResultsWriter::open(&path, &state).unwrap();
        writer.write_batch(&[scored(1, Some("A"))]).unwrap();
        assert_eq!(writer.rows_written(), 1);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "Index,Sentence,Story,Options,Label,Pred_y,Reason\n1,s,,o,l,A,\n"
        );
    }

    #[test]
    fn test_reopen_does_not_repeat_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let state = ResumeState::scan(&path).unwrap();
            let mut writer = ResultsWriter::open(&path, &state).unwrap();
            writer.write_batch(&[scored(1, None)]).unwrap();
        }
        let state = ResumeState::scan(&path).unwrap();
        let mut writer = ResultsWriter::open(&path, &state).unwrap();
        writer.write_batch(&[scored(2, Some("B"))]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("Index,").count(), 1);
        assert!(content.ends_with("1,s,,o,l,,\n2,s,,o,l,B,\n"));
    }

    #[test]
    fn test_header_only_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "Index,Sentence,Story,Options,Label,Pred_y,Reason\n").unwrap();
        let state = ResumeState::scan(&path).unwrap();
        ResultsWriter::open(&path, &state).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_partial_row_is_cut() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(
            &path,
            "Index,Sentence,Story,Options,Label,Pred_y,Reason\n1,s,,o,l,A,\n2,s,,o",
        )
        .unwrap();
        let state = ResumeState::scan(&path).unwrap();
        let mut writer = ResultsWriter::open(&path, &state).unwrap();
        writer.write_batch(&[scored(2, Some("B"))]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "Index,Sentence,Story,Options,Label,Pred_y,Reason\n1,s,,o,l,A,\n2,s,,o,l,B,\n"
        );
    }
}
