//! Resume tracking over an existing results file
//!
//! A record counts as processed iff its index appears in a complete row of
//! the results CSV. Rows are only ever appended, so the set of processed
//! indices can be recovered by a single scan.
//!
//! ## Torn rows
//!
//! A crash in the middle of a write can leave a partial last row: one
//! without a trailing newline, with fewer fields than the header, or cut off
//! inside a quoted field. Such a row is not counted as processed, and
//! [`ResumeState::durable_len`] stops before it so the writer can cut it off
//! before appending.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use csv::{ByteRecord, ReaderBuilder};
use tracing::{debug, warn};

use crate::record::INDEX_COLUMN;

/// Processed indices recovered from a results file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    processed: HashSet<i64>,
    has_header: bool,
    durable_len: u64,
    file_len: u64,
}

/// Location of one parsed CSV row
struct ScannedRow {
    start: u64,
    fields: usize,
    index: Option<i64>,
}

impl ResumeState {
    /// Scan `path`; a missing file yields an empty state without header
    pub fn scan(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Self::from_bytes(&bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read results file {}", path.display()))
            }
        }
    }

    /// Scan the contents of an existing results file
    ///
    /// An empty file counts as having a header, matching a file that only
    /// holds the header row; [`Self::needs_header`] still reports that the
    /// header has to be written.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let file_len = bytes.len() as u64;
        if bytes.is_empty() {
            return Self {
                has_header: true,
                ..Self::default()
            };
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);

        let mut header: Option<(usize, Option<usize>)> = None;
        let mut rows: Vec<ScannedRow> = Vec::new();
        let mut record = ByteRecord::new();

        loop {
            let start = reader.position().byte();
            match reader.read_byte_record(&mut record) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => {
                    warn!("Stopping resume scan at byte {}: {}", start, e);
                    break;
                }
            }

            let Some((_, index_col)) = header else {
                let index_col = record.iter().position(|field| {
                    let field = field.strip_prefix("\u{feff}".as_bytes()).unwrap_or(field);
                    field.trim_ascii() == INDEX_COLUMN.as_bytes()
                });
                if index_col.is_none() {
                    warn!("Results file has no {} column", INDEX_COLUMN);
                }
                header = Some((record.len(), index_col));
                rows.push(ScannedRow {
                    start,
                    fields: record.len(),
                    index: None,
                });
                continue;
            };

            let index = index_col.and_then(|col| record.get(col)).and_then(parse_index);
            if index.is_none() {
                debug!("Ignoring row at byte {} without a usable index", start);
            }
            rows.push(ScannedRow {
                start,
                fields: record.len(),
                index,
            });
        }

        let header_fields = header.map_or(0, |(n, _)| n);
        let terminated = bytes.ends_with(b"\n");

        // Only the last row can be torn. An unclosed quote runs to EOF, so a
        // newline-terminated row can still be cut inside a quoted field.
        let torn = rows
            .last()
            .map(|last| {
                !terminated
                    || (rows.len() > 1 && last.fields < header_fields)
                    || has_open_quote(&bytes[last.start as usize..])
            })
            .unwrap_or(false);

        let (durable_rows, durable_len) = if torn {
            let last = rows.len() - 1;
            warn!(
                "Results file ends with a partial row at byte {}; it will be rewritten",
                rows[last].start
            );
            (&rows[..last], rows[last].start)
        } else if rows.is_empty() {
            // blank lines only
            (&rows[..], 0)
        } else {
            (&rows[..], file_len)
        };

        Self {
            processed: durable_rows.iter().filter_map(|r| r.index).collect(),
            has_header: !durable_rows.is_empty(),
            durable_len,
            file_len,
        }
    }

    /// Whether the record with `index` has already been written
    pub fn contains(&self, index: i64) -> bool {
        self.processed.contains(&index)
    }

    /// All processed indices
    pub fn processed(&self) -> &HashSet<i64> {
        &self.processed
    }

    /// Number of processed indices
    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    /// Whether the file already carries a header
    pub fn has_header(&self) -> bool {
        self.has_header
    }

    /// Whether the writer must emit the header row (new or empty file)
    pub fn needs_header(&self) -> bool {
        self.durable_len == 0
    }

    /// Length in bytes of the complete rows at the start of the file
    pub fn durable_len(&self) -> u64 {
        self.durable_len
    }

    /// Whether the file ends with a partial row past [`Self::durable_len`]
    pub fn has_torn_tail(&self) -> bool {
        self.durable_len < self.file_len
    }
}

/// Odd quote count: escaped quotes are doubled, so a closed row is even
fn has_open_quote(row: &[u8]) -> bool {
    row.iter().filter(|&&b| b == b'"').count() % 2 == 1
}

fn parse_index(field: &[u8]) -> Option<i64> {
    std::str::from_utf8(field).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Index,Sentence,Story,Options,Label,Pred_y,Reason\n";

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = ResumeState::scan(&dir.path().join("missing.csv")).unwrap();
        assert!(state.is_empty());
        assert!(!state.has_header());
        assert!(state.needs_header());
    }

    #[test]
    fn test_empty_file() {
        let state = ResumeState::from_bytes(b"");
        assert!(state.is_empty());
        assert!(state.has_header());
        assert!(state.needs_header());
        assert!(!state.has_torn_tail());
    }

    #[test]
    fn test_header_only() {
        let state = ResumeState::from_bytes(HEADER.as_bytes());
        assert!(state.is_empty());
        assert!(state.has_header());
        assert!(!state.needs_header());
        assert_eq!(state.durable_len(), HEADER.len() as u64);
    }

    #[test]
    fn test_collects_indices() {
        let content = format!("{HEADER}1,s,,o,l,A,\n3,s,,o,l,,\n5,s,st,o,l,B,why\n");
        let state = ResumeState::from_bytes(content.as_bytes());
        assert_eq!(state.len(), 3);
        assert!(state.contains(1) && state.contains(3) && state.contains(5));
        assert!(!state.contains(2));
        assert!(!state.has_torn_tail());
    }

    #[test]
    fn test_malformed_indices_are_ignored() {
        let content = format!("{HEADER}abc,s,,o,l,,\n,s,,o,l,,\n 7 ,s,,o,l,,\n2.5,s,,o,l,,\n");
        let state = ResumeState::from_bytes(content.as_bytes());
        assert_eq!(state.processed(), &HashSet::from([7]));
    }

    #[test]
    fn test_multiline_quoted_fields() {
        let content = format!("{HEADER}4,s,,o,l,A,\"line one\nline two\"\n6,s,,o,l,B,\n");
        let state = ResumeState::from_bytes(content.as_bytes());
        assert_eq!(state.processed(), &HashSet::from([4, 6]));
    }

    #[test]
    fn test_unterminated_last_row_is_torn() {
        let good = format!("{HEADER}1,s,,o,l,A,\n");
        let content = format!("{good}2,s,,o,l,B,partial reas");
        let state = ResumeState::from_bytes(content.as_bytes());
        assert_eq!(state.processed(), &HashSet::from([1]));
        assert!(state.has_torn_tail());
        assert_eq!(state.durable_len(), good.len() as u64);
    }

    #[test]
    fn test_short_last_row_is_torn() {
        let good = format!("{HEADER}1,s,,o,l,A,\n");
        let content = format!("{good}2,s,\n");
        let state = ResumeState::from_bytes(content.as_bytes());
        assert!(!state.contains(2));
        assert_eq!(state.durable_len(), good.len() as u64);
    }

    #[test]
    fn test_newline_inside_open_quote_is_torn() {
        let good = format!("{HEADER}1,s,,o,l,A,\n");
        let content = format!("{good}2,s,,o,l,B,\"line one\n");
        let state = ResumeState::from_bytes(content.as_bytes());
        assert!(!state.contains(2));
        assert_eq!(state.processed(), &HashSet::from([1]));
        assert!(state.has_torn_tail());
        assert_eq!(state.durable_len(), good.len() as u64);
    }

    #[test]
    fn test_open_quote_after_multiline_row_is_torn() {
        let good = format!("{HEADER}4,s,,o,l,A,\"line one\nline two\"\n");
        let content = format!("{good}6,s,,o,l,B,\"said \"\"hi\"\"\nand then\n");
        let state = ResumeState::from_bytes(content.as_bytes());
        assert_eq!(state.processed(), &HashSet::from([4]));
        assert_eq!(state.durable_len(), good.len() as u64);
    }

    #[test]
    fn test_escaped_quotes_are_not_torn() {
        let content = format!("{HEADER}3,s,,o,l,A,\"a \"\"quoted\"\"\nword\"\n");
        let state = ResumeState::from_bytes(content.as_bytes());
        assert!(state.contains(3));
        assert!(!state.has_torn_tail());
    }

    #[test]
    fn test_torn_header() {
        let state = ResumeState::from_bytes(b"Index,Sent");
        assert!(state.is_empty());
        assert!(!state.has_header());
        assert!(state.needs_header());
        assert!(state.has_torn_tail());
    }

    #[test]
    fn test_blank_file_gets_a_header() {
        let state = ResumeState::from_bytes(b"\n\n");
        assert!(state.needs_header());
        assert!(state.has_torn_tail());
    }

    #[test]
    fn test_no_index_column() {
        let state = ResumeState::from_bytes(b"id,text\n1,a\n2,b\n");
        assert!(state.is_empty());
        assert!(state.has_header());
    }

    #[test]
    fn test_byte_order_mark() {
        let state = ResumeState::from_bytes("\u{feff}Index,Sentence\n9,a\n".as_bytes());
        assert!(state.contains(9));
    }

    #[test]
    fn test_scan_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, format!("{HEADER}10,s,,o,l,A,\n")).unwrap();
        let state = ResumeState::scan(&path).unwrap();
        assert!(state.contains(10));
    }
}
