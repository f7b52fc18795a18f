//! Benchmark records and their predictions

use serde::{Deserialize, Serialize};

use crate::parser::{parse_message_pairs_with, MessagePair, ParseOptions};

/// Column names of the results CSV, in order
pub const OUTPUT_HEADER: [&str; 7] = [
    "Index", "Sentence", "Story", "Options", "Label", "Pred_y", "Reason",
];

/// Name of the resume key column
pub const INDEX_COLUMN: &str = "Index";

/// A single AnaloBench example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique, stable identifier (the resume key)
    #[serde(rename = "Index")]
    pub index: i64,
    /// Short-form target text
    #[serde(rename = "Sentence")]
    pub sentence: String,
    /// Long-form target text, may be empty
    #[serde(rename = "Story", default)]
    pub story: String,
    /// Serialized list of candidate analogies
    #[serde(rename = "Options")]
    pub options: String,
    /// Ground-truth answer
    #[serde(rename = "Label")]
    pub label: String,
}

impl Record {
    /// Text the model is asked about: the story, or the sentence when the
    /// story is empty
    pub fn target_text(&self) -> &str {
        if self.story.is_empty() {
            &self.sentence
        } else {
            &self.story
        }
    }
}

/// What was extracted from one generation
///
/// `None` means nothing could be extracted, which is distinct from an
/// extracted empty message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prediction {
    /// Message of the last pair
    pub pred_y: Option<String>,
    /// Message of the second-to-last pair
    pub reason: Option<String>,
}

impl Prediction {
    /// Adopt the last message as the answer and the one before it as the
    /// reasoning trace
    pub fn from_pairs(pairs: &[MessagePair]) -> Self {
        match pairs {
            [] => Self::default(),
            [only] => Self {
                pred_y: Some(only.message.clone()),
                reason: None,
            },
            [.., reason, last] => Self {
                pred_y: Some(last.message.clone()),
                reason: Some(reason.message.clone()),
            },
        }
    }

    /// Parse a raw generation and adopt its pairs
    pub fn from_generation(raw: &str, options: ParseOptions) -> Self {
        Self::from_pairs(&parse_message_pairs_with(raw, options))
    }

    /// Whether an answer was extracted
    pub fn is_extracted(&self) -> bool {
        self.pred_y.is_some()
    }
}

/// A source record paired with its prediction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredRecord {
    pub record: Record,
    pub prediction: Prediction,
}

impl ScoredRecord {
    pub fn new(record: Record, prediction: Prediction) -> Self {
        Self { record, prediction }
    }

    /// Borrowed CSV row view
    pub fn row(&self) -> OutputRow<'_> {
        OutputRow {
            index: self.record.index,
            sentence: &self.record.sentence,
            story: &self.record.story,
            options: &self.record.options,
            label: &self.record.label,
            pred_y: self.prediction.pred_y.as_deref(),
            reason: self.prediction.reason.as_deref(),
        }
    }
}

/// One row of the results CSV (absent fields become empty cells)
#[derive(Debug, Serialize)]
pub struct OutputRow<'a> {
    #[serde(rename = "Index")]
    pub index: i64,
    #[serde(rename = "Sentence")]
    pub sentence: &'a str,
    #[serde(rename = "Story")]
    pub story: &'a str,
    #[serde(rename = "Options")]
    pub options: &'a str,
    #[serde(rename = "Label")]
    pub label: &'a str,
    #[serde(rename = "Pred_y")]
    pub pred_y: Option<&'a str>,
    #[serde(rename = "Reason")]
    pub reason: Option<&'a str>,
}
