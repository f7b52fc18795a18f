//! Local causal language model client
//!
//! Loads a model from the Hugging Face hub (or a local directory) with
//! candle and generates completions token by token with a KV-cache.
//! Supports Qwen2-family and LLaMA-family checkpoints behind a single
//! [`CausalBackend`] interface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{llama, qwen2};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::client::ModelClient;
use crate::prompt::SYSTEM_INSTRUCTION;

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// Qwen2 / Qwen2.5 (Alibaba)
    Qwen2,
    /// LLaMA 2 / LLaMA 3 (Meta)
    Llama,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        let model_lower = model_id.to_lowercase();
        if model_lower.contains("qwen") {
            ModelArchitecture::Qwen2
        } else if model_lower.contains("llama") {
            ModelArchitecture::Llama
        } else {
            info!(
                "Unknown model architecture for '{}', defaulting to Qwen2",
                model_id
            );
            ModelArchitecture::Qwen2
        }
    }

    /// Wrap a user prompt in this architecture's chat format
    pub fn chat_template(self, prompt: &str, system_prompt: &str) -> String {
        match self {
            ModelArchitecture::Qwen2 => format!(
                "<|im_start|>system\n{system_prompt}<|im_end|>\n<|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n"
            ),
            ModelArchitecture::Llama => format!(
                "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{system_prompt}<|eot_id|>\
                 <|start_header_id|>user<|end_header_id|>\n\n{prompt}<|eot_id|>\
                 <|start_header_id|>assistant<|end_header_id|>\n\n"
            ),
        }
    }
}

/// Tokens that end a generation, whichever the tokenizer knows
const STOP_TOKENS: [&str; 6] = [
    "<|im_end|>",
    "<|endoftext|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|return|>",
    "</s>",
];

/// Per-architecture forward pass with internal KV-cache
pub trait CausalBackend {
    /// Run `input_ids` (`[1, seq]`) starting at position `offset` and return
    /// the logits of the last position
    fn forward_step(&mut self, input_ids: &Tensor, offset: usize) -> Result<Tensor>;

    /// Drop cached keys/values before a new prompt
    fn reset(&mut self) -> Result<()>;
}

struct Qwen2Backend {
    model: qwen2::ModelForCausalLM,
}

impl CausalBackend for Qwen2Backend {
    fn forward_step(&mut self, input_ids: &Tensor, offset: usize) -> Result<Tensor> {
        Ok(self.model.forward(input_ids, offset)?)
    }

    fn reset(&mut self) -> Result<()> {
        self.model.clear_kv_cache();
        Ok(())
    }
}

struct LlamaBackend {
    model: llama::Llama,
    config: llama::Config,
    cache: llama::Cache,
    dtype: DType,
    device: Device,
}

impl CausalBackend for LlamaBackend {
    fn forward_step(&mut self, input_ids: &Tensor, offset: usize) -> Result<Tensor> {
        Ok(self.model.forward(input_ids, offset, &mut self.cache)?)
    }

    fn reset(&mut self) -> Result<()> {
        self.cache = llama::Cache::new(true, self.dtype, &self.config, &self.device)?;
        Ok(())
    }
}

/// Sharded safetensors index
#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Local paths of everything needed to build a model
#[derive(Debug, Clone)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Resolve a local directory or download from the hub
    fn resolve(model_id: &str, cache_dir: Option<&Path>) -> Result<Self> {
        let local = Path::new(model_id);
        if local.is_dir() {
            return Self::from_dir(local);
        }

        let mut builder = ApiBuilder::new().with_progress(true);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        let api = builder.build()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;

        // Check for sharded vs single safetensors
        let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let shard_names = read_shard_names(&index_path)?;
            info!("Downloading {} shard files...", shard_names.len());
            shard_names
                .iter()
                .map(|name| {
                    repo.get(name)
                        .with_context(|| format!("Failed to download {name}"))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    fn from_dir(dir: &Path) -> Result<Self> {
        let index_path = dir.join("model.safetensors.index.json");
        let weights = if index_path.is_file() {
            read_shard_names(&index_path)?
                .iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            vec![dir.join("model.safetensors")]
        };

        for path in &weights {
            if !path.is_file() {
                bail!("Missing weights file {}", path.display());
            }
        }

        Ok(Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights,
        })
    }
}

/// Unique shard filenames of a sharded checkpoint, sorted
fn read_shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index_str = std::fs::read_to_string(index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
    let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
    shard_names.sort();
    shard_names.dedup();
    Ok(shard_names)
}

/// Options for loading a local model
#[derive(Debug, Clone)]
pub struct ModelOptions {
    /// Force CPU even when CUDA is available
    pub force_cpu: bool,
    /// Hub cache directory (default: HF_HOME)
    pub cache_dir: Option<PathBuf>,
    /// Sampling seed
    pub seed: u64,
    /// System instruction placed in the chat template
    pub system_prompt: String,
    /// Override architecture detection
    pub architecture: Option<ModelArchitecture>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            force_cpu: false,
            cache_dir: None,
            seed: 42,
            system_prompt: SYSTEM_INSTRUCTION.to_string(),
            architecture: None,
        }
    }
}

/// Causal LM loaded with candle
pub struct CausalModel {
    backend: Box<dyn CausalBackend>,
    tokenizer: Tokenizer,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
    stop_tokens: Vec<u32>,
    system_prompt: String,
    rng: StdRng,
}

impl CausalModel {
    /// Load a model from HuggingFace or a local directory
    ///
    /// Tries CUDA (BF16) first and falls back to CPU (F32).
    pub fn from_pretrained(model_id: &str, options: &ModelOptions) -> Result<Self> {
        let architecture = options
            .architecture
            .unwrap_or_else(|| ModelArchitecture::from_model_id(model_id));

        let (device, dtype) = if options.force_cpu {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let files = ModelFiles::resolve(model_id, options.cache_dir.as_deref())?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        let config_bytes = std::fs::read(&files.config).context("Failed to read config")?;

        info!("Loading weights from {} file(s)...", files.weights.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };

        let backend: Box<dyn CausalBackend> = match architecture {
            ModelArchitecture::Qwen2 => {
                let config: qwen2::Config = serde_json::from_slice(&config_bytes)?;
                info!(
                    "Model config: {} layers, {} hidden, {} vocab",
                    config.num_hidden_layers, config.hidden_size, config.vocab_size
                );
                Box::new(Qwen2Backend {
                    model: qwen2::ModelForCausalLM::new(&config, vb)?,
                })
            }
            ModelArchitecture::Llama => {
                let config: llama::LlamaConfig = serde_json::from_slice(&config_bytes)?;
                let config = config.into_config(false);
                info!(
                    "Model config: {} layers, {} hidden, {} vocab",
                    config.num_hidden_layers, config.hidden_size, config.vocab_size
                );
                let model = llama::Llama::load(vb, &config)?;
                let cache = llama::Cache::new(true, dtype, &config, &device)?;
                Box::new(LlamaBackend {
                    model,
                    config,
                    cache,
                    dtype,
                    device: device.clone(),
                })
            }
        };

        let stop_tokens = stop_token_ids(&tokenizer);
        debug!("Stop tokens: {:?}", stop_tokens);

        Ok(Self {
            backend,
            tokenizer,
            device,
            architecture,
            model_id: model_id.to_string(),
            stop_tokens,
            system_prompt: options.system_prompt.clone(),
            rng: StdRng::seed_from_u64(options.seed),
        })
    }

    /// Get the model architecture
    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    /// Get the model ID
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Format a user prompt with the system instruction
    pub fn apply_chat_template(&self, prompt: &str) -> String {
        self.architecture.chat_template(prompt, &self.system_prompt)
    }

    /// Generate a chat completion and return only the continuation
    ///
    /// # Arguments
    /// * `prompt` - The user's prompt (chat template is applied here)
    /// * `max_tokens` - Maximum number of tokens to generate
    /// * `temperature` - Sampling temperature (0.0 = greedy)
    pub fn generate_chat(&mut self, prompt: &str, max_tokens: usize, temperature: f32) -> Result<String> {
        let formatted = self.apply_chat_template(prompt);
        let encoding = self
            .tokenizer
            .encode(formatted, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        let prompt_ids: Vec<u32> = encoding.get_ids().to_vec();

        let generated = self.generate_tokens(&prompt_ids, max_tokens, temperature)?;

        // Special tokens are kept: the channel markers live there
        self.tokenizer
            .decode(&generated, false)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    /// Autoregressive sampling with the backend's KV-cache
    fn generate_tokens(
        &mut self,
        prompt_ids: &[u32],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<Vec<u32>> {
        if prompt_ids.is_empty() {
            bail!("Empty prompt");
        }
        let mut generated = Vec::with_capacity(max_tokens);
        if max_tokens == 0 {
            return Ok(generated);
        }

        self.backend.reset()?;
        let prompt_tensor = Tensor::new(prompt_ids, &self.device)?.unsqueeze(0)?;
        let mut logits = self.backend.forward_step(&prompt_tensor, 0)?;
        let mut offset = prompt_ids.len();

        for step in 0..max_tokens {
            let next_token = sample_token(&logits, temperature, &mut self.rng)?;
            if self.stop_tokens.contains(&next_token) {
                break;
            }
            generated.push(next_token);
            if step + 1 == max_tokens {
                break;
            }

            let input_tensor = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
            logits = self.backend.forward_step(&input_tensor, offset)?;
            offset += 1;
        }

        debug!("Generated {} tokens", generated.len());
        Ok(generated)
    }
}

impl ModelClient for CausalModel {
    fn generate(&mut self, prompt: &str, max_new_tokens: usize, temperature: f64) -> Result<String> {
        self.generate_chat(prompt, max_new_tokens, temperature as f32)
    }

    fn name(&self) -> &str {
        &self.model_id
    }
}

/// Stop token IDs present in the tokenizer's vocabulary
fn stop_token_ids(tokenizer: &Tokenizer) -> Vec<u32> {
    let vocab = tokenizer.get_vocab(true);
    STOP_TOKENS
        .iter()
        .filter_map(|token| vocab.get(*token).copied())
        .collect()
}

/// Sample a token from logits
fn sample_token(logits: &Tensor, temperature: f32, rng: &mut impl Rng) -> Result<u32> {
    let logits_vec: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if temperature <= 0.0 {
        argmax(&logits_vec)
    } else {
        sample_with_temperature(&logits_vec, temperature, rng)
    }
}

/// Argmax sampling (greedy)
fn argmax(logits: &[f32]) -> Result<u32> {
    let (max_idx, _) = logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;

    Ok(max_idx as u32)
}

/// Temperature-based sampling
fn sample_with_temperature(logits: &[f32], temperature: f32, rng: &mut impl Rng) -> Result<u32> {
    if logits.is_empty() {
        bail!("Empty logits");
    }
    let scaled: Vec<f32> = logits.iter().map(|x| x / temperature).collect();

    // Softmax
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rng.gen::<f32>() * sum;
    let mut cumsum = 0.0;
    for (idx, &p) in exp_vals.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }

    // Fallback to last token
    Ok((exp_vals.len() - 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_detection() {
        assert_eq!(
            ModelArchitecture::from_model_id("Qwen/Qwen2.5-7B-Instruct"),
            ModelArchitecture::Qwen2
        );
        assert_eq!(
            ModelArchitecture::from_model_id("meta-llama/Llama-3.1-8B-Instruct"),
            ModelArchitecture::Llama
        );
        assert_eq!(
            ModelArchitecture::from_model_id("./models/unknown"),
            ModelArchitecture::Qwen2
        );
    }

    #[test]
    fn test_chat_templates() {
        let qwen = ModelArchitecture::Qwen2.chat_template("Q?", "SYS");
        assert!(qwen.starts_with("<|im_start|>system\nSYS<|im_end|>"));
        assert!(qwen.ends_with("<|im_start|>assistant\n"));

        let llama = ModelArchitecture::Llama.chat_template("Q?", "SYS");
        assert!(llama.contains("user<|end_header_id|>\n\nQ?<|eot_id|>"));
        assert!(llama.ends_with("assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_greedy_sampling() {
        let logits = Tensor::new(&[0.1f32, 2.0, -1.0], &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_token(&logits, 0.0, &mut rng).unwrap(), 1);
    }

    #[test]
    fn test_temperature_sampling_is_seeded() {
        let logits = vec![0.5f32, 0.4, 0.3, 0.2];
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..16)
                .map(|_| sample_with_temperature(&logits, 0.7, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(7), draw(7));
        assert!(draw(7).iter().all(|&t| t < 4));
    }

    #[test]
    fn test_peaked_distribution() {
        let logits = vec![0.0f32, 100.0, 0.0];
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            assert_eq!(sample_with_temperature(&logits, 1.0, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_shard_names_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors.index.json");
        std::fs::write(
            &path,
            r#"{"metadata": {}, "weight_map": {"a": "m-2.safetensors", "b": "m-1.safetensors", "c": "m-2.safetensors"}}"#,
        )
        .unwrap();
        assert_eq!(
            read_shard_names(&path).unwrap(),
            vec!["m-1.safetensors", "m-2.safetensors"]
        );
    }

    #[test]
    fn test_local_dir_requires_weights() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelFiles::from_dir(dir.path()).is_err());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_generate_from_hub() {
        let options = ModelOptions {
            force_cpu: true,
            ..ModelOptions::default()
        };
        let mut model = CausalModel::from_pretrained("Qwen/Qwen2.5-0.5B-Instruct", &options).unwrap();
        let out = model.generate("Say hi.", 8, 0.0).unwrap();
        assert!(!out.is_empty());
    }
}
