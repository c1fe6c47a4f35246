use super::loader::{require_model_type, ModelRepo};
use super::{
    as_text_batch, check_parameter_keys, float_parameter, usize_parameter, Pipeline, PipelineError,
    PipelineInput, Task,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use serde_json::{Map, Value, json};
use tokenizers::Tokenizer;

const DEFAULT_MAX_NEW_TOKENS: usize = 50;

/// Causal text generation for LLaMA-architecture checkpoints, sampling one
/// token at a time through a fresh KV cache per request.
pub struct TextGenerationPipeline {
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    eos_tokens: Vec<u32>,
    dtype: DType,
    device: Device,
}

impl TextGenerationPipeline {
    pub fn load(repo: &ModelRepo, config: &Value, device: &Device) -> Result<Self, PipelineError> {
        require_model_type(config, "llama", Task::TextGeneration)?;
        let llama_config: LlamaConfig = serde_json::from_value(config.clone())
            .map_err(|e| PipelineError::Model(format!("config.json: {e}")))?;
        let config = llama_config.into_config(false);
        let tokenizer = repo.tokenizer()?;
        let weights = repo.safetensors()?;
        let dtype = if device.is_cpu() {
            DType::F32
        } else {
            DType::F16
        };
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, device)? };
        let model = Llama::load(vb, &config)?;
        let eos_tokens = match &config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => tokenizer.token_to_id("</s>").into_iter().collect(),
        };
        Ok(Self {
            model,
            config,
            tokenizer,
            eos_tokens,
            dtype,
            device: device.clone(),
        })
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, PipelineError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        let mut tokens = encoding.get_ids().to_vec();
        if tokens.is_empty() {
            return Err(PipelineError::Inference(
                "cannot generate from an empty prompt".to_string(),
            ));
        }

        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut logits_processor =
            LogitsProcessor::new(params.seed, params.temperature, params.top_p);
        let mut index_pos = 0;
        for index in 0..params.max_new_tokens {
            let (context_size, context_index) = if index > 0 {
                (1, index_pos)
            } else {
                (tokens.len(), 0)
            };
            let context = &tokens[tokens.len().saturating_sub(context_size)..];
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, context_index, &mut cache)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            index_pos += context.len();

            let next_token = logits_processor.sample(&logits)?;
            if self.eos_tokens.contains(&next_token) {
                break;
            }
            tokens.push(next_token);
        }

        self.tokenizer
            .decode(&tokens, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))
    }
}

#[derive(Debug)]
struct GenerationParams {
    max_new_tokens: usize,
    temperature: Option<f64>,
    top_p: Option<f64>,
    seed: u64,
}

impl GenerationParams {
    fn from_map(parameters: &Map<String, Value>) -> Result<Self, PipelineError> {
        check_parameter_keys(
            parameters,
            &["max_new_tokens", "temperature", "top_p", "seed"],
            Task::TextGeneration,
        )?;
        let seed = match parameters.get("seed") {
            None => rand::random(),
            Some(v) => v.as_u64().ok_or_else(|| {
                PipelineError::InvalidParameter(
                    "parameter 'seed' must be a non-negative integer".to_string(),
                )
            })?,
        };
        Ok(Self {
            max_new_tokens: usize_parameter(parameters, "max_new_tokens", DEFAULT_MAX_NEW_TOKENS)?,
            temperature: float_parameter(parameters, "temperature")?,
            top_p: float_parameter(parameters, "top_p")?,
            seed,
        })
    }
}

impl Pipeline for TextGenerationPipeline {
    fn task(&self) -> Task {
        Task::TextGeneration
    }

    fn run(
        &self,
        input: PipelineInput,
        parameters: &Map<String, Value>,
    ) -> Result<Value, PipelineError> {
        let params = GenerationParams::from_map(parameters)?;
        let texts = as_text_batch(input, self.task())?;
        if texts.is_empty() {
            return Err(PipelineError::Inference("empty input batch".to_string()));
        }
        let results = texts
            .iter()
            .map(|prompt| {
                let generated = self.generate(prompt, &params)?;
                Ok(Value::Array(vec![json!({"generated_text": generated})]))
            })
            .collect::<Result<Vec<Value>, PipelineError>>()?;
        Ok(Value::Array(results))
    }
}
