//! Model client abstraction
//!
//! The runner only needs one capability from a model: turn a prompt into the
//! raw decoded continuation. Local candle models ([`crate::model::CausalModel`])
//! and remote completion endpoints ([`crate::remote::CompletionsClient`])
//! both implement [`ModelClient`].

use anyhow::Result;

/// Sampling parameters for one generation call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_new_tokens: usize,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.7,
        }
    }
}

/// Blocking text generation
pub trait ModelClient {
    /// Generate a continuation for `prompt`
    ///
    /// The prompt is wrapped with the client's system instruction and chat
    /// template. The returned text is the decoded continuation only, with
    /// special tokens kept so channel markers survive.
    fn generate(&mut self, prompt: &str, max_new_tokens: usize, temperature: f64)
        -> Result<String>;

    /// Short identifier used in logs
    fn name(&self) -> &str {
        "model"
    }
}

impl<T: ModelClient + ?Sized> ModelClient for Box<T> {
    fn generate(
        &mut self,
        prompt: &str,
        max_new_tokens: usize,
        temperature: f64,
    ) -> Result<String> {
        (**self).generate(prompt, max_new_tokens, temperature)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
