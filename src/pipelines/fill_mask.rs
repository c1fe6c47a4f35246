use super::loader::{require_model_type, ModelRepo};
use super::{
    as_text_batch, check_parameter_keys, usize_parameter, Pipeline, PipelineError, PipelineInput,
    Task,
};
use candle_core::{D, Device, Tensor};
use candle_nn::{LayerNorm, Linear, Module, VarBuilder, layer_norm, linear};
use candle_transformers::models::bert::{BertModel, Config, DTYPE, HiddenAct};
use serde_json::{Map, Value, json};
use tokenizers::Tokenizer;

/// BERT masked language modeling: encoder plus the `cls.predictions` head,
/// scoring the vocabulary at the `[MASK]` position.
pub struct FillMaskPipeline {
    model: BertModel,
    transform: Linear,
    transform_norm: LayerNorm,
    activation: HiddenAct,
    decoder: Linear,
    tokenizer: Tokenizer,
    mask_token_id: u32,
    device: Device,
}

impl FillMaskPipeline {
    pub fn load(repo: &ModelRepo, config: &Value, device: &Device) -> Result<Self, PipelineError> {
        require_model_type(config, "bert", Task::FillMask)?;
        let bert_config: Config = serde_json::from_value(config.clone())
            .map_err(|e| PipelineError::Model(format!("config.json: {e}")))?;
        let tokenizer = repo.tokenizer()?;
        let mask_token_id = tokenizer.token_to_id("[MASK]").ok_or_else(|| {
            PipelineError::Tokenizer("tokenizer defines no [MASK] token".to_string())
        })?;

        let weights = repo.safetensors()?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, DTYPE, device)? };
        let model = BertModel::load(vb.pp("bert"), &bert_config)
            .or_else(|_| BertModel::load(vb.clone(), &bert_config))?;

        let hidden = bert_config.hidden_size;
        let vocab = bert_config.vocab_size;
        let transform = linear(hidden, hidden, vb.pp("cls.predictions.transform.dense"))?;
        let transform_norm = layer_norm(
            hidden,
            bert_config.layer_norm_eps,
            vb.pp("cls.predictions.transform.LayerNorm"),
        )?;
        // Checkpoints with tied embeddings omit the decoder weight; fall back
        // to the word embedding matrix.
        let decoder_weight = vb
            .get((vocab, hidden), "cls.predictions.decoder.weight")
            .or_else(|_| vb.get((vocab, hidden), "bert.embeddings.word_embeddings.weight"))?;
        let decoder_bias = vb
            .get(vocab, "cls.predictions.bias")
            .or_else(|_| vb.get(vocab, "cls.predictions.decoder.bias"))?;
        let decoder = Linear::new(decoder_weight, Some(decoder_bias));

        Ok(Self {
            model,
            transform,
            transform_norm,
            activation: bert_config.hidden_act.clone(),
            decoder,
            tokenizer,
            mask_token_id,
            device: device.clone(),
        })
    }

    fn apply_activation(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
        match self.activation {
            HiddenAct::Relu => x.relu(),
            _ => x.gelu_erf(),
        }
    }

    fn predictions(&self, text: &str, top_k: usize) -> Result<Value, PipelineError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        let token_ids = encoding.get_ids().to_vec();
        let mask_positions: Vec<usize> = token_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == self.mask_token_id)
            .map(|(index, _)| index)
            .collect();
        if mask_positions.len() != 1 {
            return Err(PipelineError::Inference(format!(
                "expected exactly one [MASK] token, found {}",
                mask_positions.len()
            )));
        }
        let mask_position = mask_positions[0];

        let ids = Tensor::new(token_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let type_ids = ids.zeros_like()?;
        let hidden = self.model.forward(&ids, &type_ids, None)?;
        let state = hidden.narrow(1, mask_position, 1)?.squeeze(1)?;
        let state = self.apply_activation(&self.transform.forward(&state)?)?;
        let state = self.transform_norm.forward(&state)?;
        let logits = self.decoder.forward(&state)?;
        let probabilities = candle_nn::ops::softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1::<f32>()?;

        let mut scored: Vec<(usize, f32)> = probabilities.into_iter().enumerate().collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        let predictions = scored
            .into_iter()
            .take(top_k)
            .map(|(token, score)| {
                let token = token as u32;
                let mut filled = token_ids.clone();
                filled[mask_position] = token;
                let sequence = self
                    .tokenizer
                    .decode(&filled, true)
                    .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
                Ok(json!({
                    "score": score,
                    "token": token,
                    "token_str": self.tokenizer.id_to_token(token).unwrap_or_default(),
                    "sequence": sequence,
                }))
            })
            .collect::<Result<Vec<Value>, PipelineError>>()?;
        Ok(Value::Array(predictions))
    }
}

impl Pipeline for FillMaskPipeline {
    fn task(&self) -> Task {
        Task::FillMask
    }

    fn run(
        &self,
        input: PipelineInput,
        parameters: &Map<String, Value>,
    ) -> Result<Value, PipelineError> {
        check_parameter_keys(parameters, &["top_k"], self.task())?;
        let top_k = usize_parameter(parameters, "top_k", 5)?;
        let texts = as_text_batch(input, self.task())?;
        if texts.is_empty() {
            return Err(PipelineError::Inference("empty input batch".to_string()));
        }
        let results = texts
            .iter()
            .map(|text| self.predictions(text, top_k))
            .collect::<Result<Vec<Value>, PipelineError>>()?;
        Ok(Value::Array(results))
    }
}
