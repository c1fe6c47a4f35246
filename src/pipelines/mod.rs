//! Task-bound inference pipelines.
//!
//! A [`Pipeline`] is an opaque callable built for one `(model, task)` pair;
//! the stock [`HubLoader`] constructs them from Hugging Face Hub checkpoints
//! with candle. The server only ever sees the trait objects, so tests swap in
//! doubles through [`PipelineLoader`].

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod device;
pub mod fill_mask;
pub mod loader;
pub mod text_classification;
pub mod text_generation;

pub use device::DeviceRequest;
pub use loader::{HubLoader, PipelineLoader};

/// Task identifiers known to the pipeline layer.
///
/// Every identifier here is accepted by the `task` form field and listed by
/// `/supported_tasks`; only a subset is constructible by the stock loader.
/// Custom loaders may support more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    TextGeneration,
    TextClassification,
    FillMask,
    TokenClassification,
    QuestionAnswering,
    Summarization,
    Translation,
    ZeroShotClassification,
    FeatureExtraction,
    AutomaticSpeechRecognition,
    ImageClassification,
}

impl Task {
    pub const ALL: [Task; 11] = [
        Task::TextGeneration,
        Task::TextClassification,
        Task::FillMask,
        Task::TokenClassification,
        Task::QuestionAnswering,
        Task::Summarization,
        Task::Translation,
        Task::ZeroShotClassification,
        Task::FeatureExtraction,
        Task::AutomaticSpeechRecognition,
        Task::ImageClassification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::TextGeneration => "text-generation",
            Task::TextClassification => "text-classification",
            Task::FillMask => "fill-mask",
            Task::TokenClassification => "token-classification",
            Task::QuestionAnswering => "question-answering",
            Task::Summarization => "summarization",
            Task::Translation => "translation",
            Task::ZeroShotClassification => "zero-shot-classification",
            Task::FeatureExtraction => "feature-extraction",
            Task::AutomaticSpeechRecognition => "automatic-speech-recognition",
            Task::ImageClassification => "image-classification",
        }
    }

    /// Tasks whose pipelines take a batch of strings, so a plain string
    /// input gets wrapped in a single-element batch before invocation.
    pub fn wraps_plain_string(&self) -> bool {
        matches!(
            self,
            Task::TextGeneration | Task::TextClassification | Task::FillMask
        )
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Task::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| PipelineError::UnknownTask(s.to_string()))
    }
}

/// Decoded request input handed to a pipeline, decided once at the HTTP
/// boundary.
#[derive(Debug, Clone)]
pub enum PipelineInput {
    Text(String),
    TextBatch(Vec<String>),
    Json(Value),
    Image(image::RgbImage),
    Audio { samples: Vec<f32>, sampling_rate: u32 },
    Bytes(Vec<u8>),
}

impl PipelineInput {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineInput::Text(_) => "text",
            PipelineInput::TextBatch(_) => "text batch",
            PipelineInput::Json(_) => "json",
            PipelineInput::Image(_) => "image",
            PipelineInput::Audio { .. } => "audio",
            PipelineInput::Bytes(_) => "bytes",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("task '{0}' is not supported by this loader")]
    UnsupportedTask(Task),
    #[error("model architecture '{architecture}' is not supported for {task}")]
    UnsupportedArchitecture { architecture: String, task: Task },
    #[error("hub error: {0}")]
    Hub(String),
    #[error("{0}")]
    Model(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("{task} expects {expected} input, got {got}")]
    InvalidInput {
        task: Task,
        expected: &'static str,
        got: &'static str,
    },
    #[error("{0}")]
    InvalidParameter(String),
    #[error("{0}")]
    Inference(String),
}

impl From<candle_core::Error> for PipelineError {
    fn from(e: candle_core::Error) -> Self {
        PipelineError::Model(e.to_string())
    }
}

/// An opaque, task-bound callable. Implementations are `Send + Sync` so a
/// single loaded pipeline can be shared across request handlers for the
/// lifetime of the process.
pub trait Pipeline: Send + Sync {
    fn task(&self) -> Task;

    /// Run inference. `parameters` carries the request's decoded parameter
    /// object; unknown keys are rejected by each pipeline.
    fn run(
        &self,
        input: PipelineInput,
        parameters: &Map<String, Value>,
    ) -> Result<Value, PipelineError>;
}

impl fmt::Debug for dyn Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("task", &self.task())
            .finish()
    }
}

/// Coerce a pipeline input into a batch of strings. Accepts plain text, a
/// pre-wrapped batch, and JSON strings or string arrays; anything else is an
/// input-kind error for `task`.
pub(crate) fn as_text_batch(
    input: PipelineInput,
    task: Task,
) -> Result<Vec<String>, PipelineError> {
    let invalid = |got: &'static str| PipelineError::InvalidInput {
        task,
        expected: "text",
        got,
    };
    match input {
        PipelineInput::Text(s) => Ok(vec![s]),
        PipelineInput::TextBatch(batch) => Ok(batch),
        PipelineInput::Json(Value::String(s)) => Ok(vec![s]),
        PipelineInput::Json(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(invalid("json")),
            })
            .collect(),
        other => Err(invalid(other.kind())),
    }
}

/// Reject parameter keys outside `known`, naming the offender.
pub(crate) fn check_parameter_keys(
    parameters: &Map<String, Value>,
    known: &[&str],
    task: Task,
) -> Result<(), PipelineError> {
    for key in parameters.keys() {
        if !known.contains(&key.as_str()) {
            return Err(PipelineError::InvalidParameter(format!(
                "unexpected parameter '{key}' for {task}"
            )));
        }
    }
    Ok(())
}

pub(crate) fn usize_parameter(
    parameters: &Map<String, Value>,
    key: &str,
    default: usize,
) -> Result<usize, PipelineError> {
    match parameters.get(key) {
        None => Ok(default),
        Some(v) => v.as_u64().map(|n| n as usize).ok_or_else(|| {
            PipelineError::InvalidParameter(format!(
                "parameter '{key}' must be a non-negative integer"
            ))
        }),
    }
}

pub(crate) fn float_parameter(
    parameters: &Map<String, Value>,
    key: &str,
) -> Result<Option<f64>, PipelineError> {
    match parameters.get(key) {
        None => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| {
            PipelineError::InvalidParameter(format!("parameter '{key}' must be a number"))
        }),
    }
}
