//! Batch processing: prompt, generate, parse
//!
//! Pure with respect to I/O. Generation failures propagate and abort the
//! whole batch, so a batch is either fully scored or not at all.

use anyhow::{Context, Result};
use tracing::debug;

use crate::client::{GenerationParams, ModelClient};
use crate::parser::ParseOptions;
use crate::prompt::PromptTemplate;
use crate::record::{Prediction, Record, ScoredRecord};

/// Score every record of a batch, in input order
pub fn process_batch(
    records: Vec<Record>,
    template: &PromptTemplate,
    client: &mut dyn ModelClient,
    params: &GenerationParams,
    parse_options: ParseOptions,
) -> Result<Vec<ScoredRecord>> {
    let mut scored = Vec::with_capacity(records.len());

    for record in records {
        let prompt = template.render(record.target_text(), &record.options);
        let raw = client
            .generate(&prompt, params.max_new_tokens, params.temperature)
            .with_context(|| format!("Generation failed for record {}", record.index))?;

        let prediction = Prediction::from_generation(&raw, parse_options);
        debug!(
            "Record {}: pred={:?} reason_len={}",
            record.index,
            prediction.pred_y,
            prediction.reason.as_ref().map_or(0, String::len)
        );
        scored.push(ScoredRecord::new(record, prediction));
    }

    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echoes the prompt inside a final channel and records calls
    struct EchoClient {
        prompts: Vec<String>,
        fail_on: Option<usize>,
    }

    impl ModelClient for EchoClient {
        fn generate(&mut self, prompt: &str, max_new_tokens: usize, temperature: f64) -> Result<String> {
            assert_eq!(max_new_tokens, 16);
            assert!((temperature - 0.5).abs() < f64::EPSILON);
            self.prompts.push(prompt.to_string());
            if self.fail_on == Some(self.prompts.len()) {
                anyhow::bail!("device lost");
            }
            Ok(format!(
                "<|channel|>analysis<|message|>n={}<|end|><|channel|>final<|message|>{}",
                self.prompts.len(),
                prompt
            ))
        }
    }

    fn record(index: i64, sentence: &str, story: &str) -> Record {
        Record {
            index,
            sentence: sentence.into(),
            story: story.into(),
            options: format!("opts{index}"),
            label: "0".into(),
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            max_new_tokens: 16,
            temperature: 0.5,
        }
    }

    #[test]
    fn test_scores_in_order_with_story_fallback() {
        let template = PromptTemplate::new("{target}/{options}").unwrap();
        let mut client = EchoClient {
            prompts: vec![],
            fail_on: None,
        };
        let out = process_batch(
            vec![record(4, "sent", ""), record(2, "sent", "story")],
            &template,
            &mut client,
            &params(),
            ParseOptions::default(),
        )
        .unwrap();

        assert_eq!(client.prompts, vec!["sent/opts4", "story/opts2"]);
        assert_eq!(out[0].record.index, 4);
        assert_eq!(out[0].prediction.pred_y.as_deref(), Some("sent/opts4"));
        assert_eq!(out[0].prediction.reason.as_deref(), Some("n=1"));
        assert_eq!(out[1].prediction.pred_y.as_deref(), Some("story/opts2"));
    }

    #[test]
    fn test_failure_aborts_batch() {
        let template = PromptTemplate::new("{target}/{options}").unwrap();
        let mut client = EchoClient {
            prompts: vec![],
            fail_on: Some(2),
        };
        let err = process_batch(
            vec![record(1, "a", ""), record(2, "b", ""), record(3, "c", "")],
            &template,
            &mut client,
            &params(),
            ParseOptions::default(),
        )
        .unwrap_err();

        assert!(format!("{err:#}").contains("record 2"));
        assert_eq!(client.prompts.len(), 2);
    }
}
