use super::loader::{require_model_type, ModelRepo};
use super::{
    as_text_batch, check_parameter_keys, usize_parameter, Pipeline, PipelineError, PipelineInput,
    Task,
};
use candle_core::{D, Device, IndexOp, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear};
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use serde_json::{Map, Value, json};
use tokenizers::Tokenizer;

/// BERT sequence classification: encoder, pooled `[CLS]` state, linear head,
/// softmax over the checkpoint's `id2label`.
pub struct TextClassificationPipeline {
    model: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    labels: Vec<String>,
    device: Device,
}

impl TextClassificationPipeline {
    pub fn load(repo: &ModelRepo, config: &Value, device: &Device) -> Result<Self, PipelineError> {
        require_model_type(config, "bert", Task::TextClassification)?;
        let bert_config: Config = serde_json::from_value(config.clone())
            .map_err(|e| PipelineError::Model(format!("config.json: {e}")))?;
        let labels = labels_from_config(config);
        let tokenizer = repo.tokenizer()?;
        let weights = repo.safetensors()?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, DTYPE, device)? };
        // Fine-tuned checkpoints prefix the encoder with "bert."; raw encoder
        // exports do not.
        let model = BertModel::load(vb.pp("bert"), &bert_config)
            .or_else(|_| BertModel::load(vb.clone(), &bert_config))?;
        let hidden = bert_config.hidden_size;
        let pooler = linear(hidden, hidden, vb.pp("bert.pooler.dense"))
            .or_else(|_| linear(hidden, hidden, vb.pp("pooler.dense")))?;
        let classifier = linear(hidden, labels.len(), vb.pp("classifier"))?;
        Ok(Self {
            model,
            pooler,
            classifier,
            tokenizer,
            labels,
            device: device.clone(),
        })
    }

    /// Tokenize and pad a batch to its longest row, returning token ids,
    /// token type ids, and the attention mask.
    fn encode(&self, texts: &[String]) -> Result<(Tensor, Tensor, Tensor), PipelineError> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);
        let mut ids = Vec::with_capacity(encodings.len());
        let mut masks = Vec::with_capacity(encodings.len());
        for encoding in &encodings {
            let mut row = encoding.get_ids().to_vec();
            let mut mask = vec![1u32; row.len()];
            row.resize(max_len, 0);
            mask.resize(max_len, 0);
            ids.push(Tensor::new(row.as_slice(), &self.device)?);
            masks.push(Tensor::new(mask.as_slice(), &self.device)?);
        }
        let ids = Tensor::stack(&ids, 0)?;
        let type_ids = ids.zeros_like()?;
        let masks = Tensor::stack(&masks, 0)?;
        Ok((ids, type_ids, masks))
    }

    fn label(&self, index: usize) -> String {
        self.labels
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("LABEL_{index}"))
    }
}

impl Pipeline for TextClassificationPipeline {
    fn task(&self) -> Task {
        Task::TextClassification
    }

    fn run(
        &self,
        input: PipelineInput,
        parameters: &Map<String, Value>,
    ) -> Result<Value, PipelineError> {
        check_parameter_keys(parameters, &["top_k"], self.task())?;
        let top_k = usize_parameter(parameters, "top_k", 1)?;
        let texts = as_text_batch(input, self.task())?;
        if texts.is_empty() {
            return Err(PipelineError::Inference("empty input batch".to_string()));
        }

        let (ids, type_ids, masks) = self.encode(&texts)?;
        let hidden = self.model.forward(&ids, &type_ids, Some(&masks))?;
        let cls = hidden.i((.., 0))?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?;
        let probabilities = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;

        let results = probabilities
            .into_iter()
            .map(|row| {
                let mut scored: Vec<(usize, f32)> = row.into_iter().enumerate().collect();
                scored.sort_by(|a, b| b.1.total_cmp(&a.1));
                if top_k <= 1 {
                    let (index, score) = scored[0];
                    json!({"label": self.label(index), "score": score})
                } else {
                    Value::Array(
                        scored
                            .into_iter()
                            .take(top_k)
                            .map(|(index, score)| json!({"label": self.label(index), "score": score}))
                            .collect(),
                    )
                }
            })
            .collect();
        Ok(Value::Array(results))
    }
}

fn labels_from_config(config: &Value) -> Vec<String> {
    if let Some(map) = config.get("id2label").and_then(Value::as_object) {
        let mut pairs: Vec<(usize, String)> = map
            .iter()
            .filter_map(|(k, v)| Some((k.parse().ok()?, v.as_str()?.to_string())))
            .collect();
        pairs.sort_by_key(|(index, _)| *index);
        if !pairs.is_empty() {
            return pairs.into_iter().map(|(_, label)| label).collect();
        }
    }
    // The Python library defaults heads without a mapping to two labels.
    (0..2).map(|i| format!("LABEL_{i}")).collect()
}
