use super::fill_mask::FillMaskPipeline;
use super::text_classification::TextClassificationPipeline;
use super::text_generation::TextGenerationPipeline;
use super::{DeviceRequest, Pipeline, PipelineError, Task};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Constructs pipelines for a `(model, task)` pair. The server holds a
/// `dyn PipelineLoader` so tests can substitute doubles.
pub trait PipelineLoader: Send + Sync {
    fn load(&self, model: &str, task: Option<&str>) -> Result<Arc<dyn Pipeline>, PipelineError>;
}

/// The stock loader: fetches checkpoints from the Hugging Face Hub and
/// builds candle-backed pipelines.
pub struct HubLoader {
    device: DeviceRequest,
}

impl HubLoader {
    pub fn new(device: DeviceRequest) -> Self {
        Self { device }
    }
}

impl PipelineLoader for HubLoader {
    fn load(&self, model: &str, task: Option<&str>) -> Result<Arc<dyn Pipeline>, PipelineError> {
        let repo = ModelRepo::open(model)?;
        let config = repo.config()?;
        let task = match task {
            Some(s) => s.parse()?,
            None => infer_task(&config)?,
        };
        let device = self.device.resolve()?;
        log::info!("building {task} pipeline for '{model}' on {device:?}");
        match task {
            Task::TextGeneration => Ok(Arc::new(TextGenerationPipeline::load(
                &repo, &config, &device,
            )?)),
            Task::TextClassification => Ok(Arc::new(TextClassificationPipeline::load(
                &repo, &config, &device,
            )?)),
            Task::FillMask => Ok(Arc::new(FillMaskPipeline::load(&repo, &config, &device)?)),
            other => Err(PipelineError::UnsupportedTask(other)),
        }
    }
}

/// A model repository on the hub, with the file lookups the task pipelines
/// share.
pub struct ModelRepo {
    repo: ApiRepo,
}

impl ModelRepo {
    pub fn open(model: &str) -> Result<Self, PipelineError> {
        let api = Api::new().map_err(|e| PipelineError::Hub(e.to_string()))?;
        Ok(Self {
            repo: api.repo(Repo::new(model.to_string(), RepoType::Model)),
        })
    }

    fn get(&self, filename: &str) -> Result<PathBuf, PipelineError> {
        self.repo
            .get(filename)
            .map_err(|e| PipelineError::Hub(format!("{filename}: {e}")))
    }

    pub fn config(&self) -> Result<Value, PipelineError> {
        let path = self.get("config.json")?;
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Hub(format!("config.json: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| PipelineError::Model(format!("config.json: {e}")))
    }

    pub fn tokenizer(&self) -> Result<tokenizers::Tokenizer, PipelineError> {
        let path = self.get("tokenizer.json")?;
        tokenizers::Tokenizer::from_file(path)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))
    }

    /// Resolve the checkpoint weights: a single `model.safetensors`, or every
    /// shard named by `model.safetensors.index.json`.
    pub fn safetensors(&self) -> Result<Vec<PathBuf>, PipelineError> {
        if let Ok(single) = self.repo.get("model.safetensors") {
            return Ok(vec![single]);
        }
        let index_path = self.get("model.safetensors.index.json")?;
        let raw = std::fs::read_to_string(index_path)
            .map_err(|e| PipelineError::Hub(format!("safetensors index: {e}")))?;
        let index: Value = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::Model(format!("safetensors index: {e}")))?;
        let weight_map = index
            .get("weight_map")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                PipelineError::Model("safetensors index has no weight_map".to_string())
            })?;
        let shards: BTreeSet<&str> = weight_map.values().filter_map(Value::as_str).collect();
        shards.into_iter().map(|shard| self.get(shard)).collect()
    }
}

/// Guard a task pipeline against checkpoints of the wrong family before any
/// weights are fetched.
pub(crate) fn require_model_type(
    config: &Value,
    expected: &str,
    task: Task,
) -> Result<(), PipelineError> {
    let model_type = config
        .get("model_type")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    if model_type != expected {
        return Err(PipelineError::UnsupportedArchitecture {
            architecture: model_type.to_string(),
            task,
        });
    }
    Ok(())
}

/// The Python library infers the task from the checkpoint when the caller
/// omits it; here that means the leading entry of `architectures`.
fn infer_task(config: &Value) -> Result<Task, PipelineError> {
    let architecture = config
        .get("architectures")
        .and_then(|a| a.get(0))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            PipelineError::Model(
                "config.json lists no architectures; pass an explicit task".to_string(),
            )
        })?;
    if architecture.ends_with("ForCausalLM") {
        Ok(Task::TextGeneration)
    } else if architecture.ends_with("ForSequenceClassification") {
        Ok(Task::TextClassification)
    } else if architecture.ends_with("ForMaskedLM") {
        Ok(Task::FillMask)
    } else {
        Err(PipelineError::Model(format!(
            "cannot infer task from architecture '{architecture}'; pass an explicit task"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_inferred_from_architectures() {
        let config = json!({"architectures": ["LlamaForCausalLM"]});
        assert_eq!(infer_task(&config).unwrap(), Task::TextGeneration);

        let config = json!({"architectures": ["BertForSequenceClassification"]});
        assert_eq!(infer_task(&config).unwrap(), Task::TextClassification);

        let config = json!({"architectures": ["BertForMaskedLM"]});
        assert_eq!(infer_task(&config).unwrap(), Task::FillMask);
    }

    #[test]
    fn unsupported_architecture_is_an_error() {
        let config = json!({"architectures": ["ViTForImageClassification"]});
        let err = infer_task(&config).unwrap_err();
        assert!(err.to_string().contains("ViTForImageClassification"));
    }

    #[test]
    fn missing_architectures_is_an_error() {
        let err = infer_task(&json!({})).unwrap_err();
        assert!(err.to_string().contains("no architectures"));
    }

    #[test]
    fn model_type_guard_names_the_offender() {
        let config = json!({"model_type": "gpt2"});
        let err = require_model_type(&config, "llama", Task::TextGeneration).unwrap_err();
        assert_eq!(
            err.to_string(),
            "model architecture 'gpt2' is not supported for text-generation"
        );
        require_model_type(&json!({"model_type": "llama"}), "llama", Task::TextGeneration)
            .unwrap();
    }
}
