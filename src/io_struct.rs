use crate::error::ApiError;
use actix_multipart::Multipart;
use bytes::Bytes;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Serialize, Deserialize)]
pub struct InferResponse {
    pub model: String,
    pub task: String,
    pub result: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SupportedTasksResponse {
    pub supported_tasks: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// The `/infer` multipart form, collected field by field. Uploads are fully
/// buffered in memory before processing.
#[derive(Debug, Default)]
pub struct InferForm {
    pub model_name: Option<String>,
    pub task: Option<String>,
    pub inputs: Option<String>,
    pub parameters: Option<String>,
    pub file: Option<UploadedFile>,
}

impl InferForm {
    pub async fn from_multipart(mut payload: Multipart) -> Result<Self, ApiError> {
        let mut form = InferForm::default();
        while let Some(mut field) = payload.try_next().await.map_err(bad_multipart)? {
            let name = field.name().unwrap_or("").to_string();
            let content_type = field.content_type().map(|mime| mime.to_string());
            let mut data = Vec::new();
            while let Some(chunk) = field.try_next().await.map_err(bad_multipart)? {
                data.extend_from_slice(&chunk);
            }
            match name.as_str() {
                "model_name" => form.model_name = Some(text_field("model_name", data)?),
                "task" => form.task = Some(text_field("task", data)?),
                "inputs" => form.inputs = Some(text_field("inputs", data)?),
                "parameters" => form.parameters = Some(text_field("parameters", data)?),
                "file" => {
                    form.file = Some(UploadedFile {
                        content_type,
                        data: Bytes::from(data),
                    })
                }
                // Unknown fields are ignored, not rejected.
                _ => {}
            }
        }
        Ok(form)
    }

    /// Whether a usable `inputs` field arrived; the empty string counts as
    /// absent.
    pub fn has_inputs(&self) -> bool {
        self.inputs.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// JSON-decode `inputs`, falling back to the raw string.
    pub fn parsed_inputs(&self) -> Option<Value> {
        let raw = self.inputs.as_deref().filter(|s| !s.is_empty())?;
        Some(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
    }

    /// Decode `parameters` into a JSON object. Blank means no parameters;
    /// anything unparsable (or not an object) is a client error.
    pub fn parsed_parameters(&self) -> Result<Map<String, Value>, ApiError> {
        let raw = match self.parameters.as_deref() {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Ok(Map::new()),
        };
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ApiError::BadRequest(format!("Invalid parameters JSON: {e}")))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ApiError::BadRequest(
                "Invalid parameters JSON: expected a JSON object".to_string(),
            )),
        }
    }
}

fn bad_multipart(e: actix_multipart::MultipartError) -> ApiError {
    ApiError::BadRequest(format!("Invalid multipart payload: {e}"))
}

fn text_field(name: &str, data: Vec<u8>) -> Result<String, ApiError> {
    String::from_utf8(data)
        .map_err(|_| ApiError::BadRequest(format!("Field '{name}' must be valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form_with(inputs: Option<&str>, parameters: Option<&str>) -> InferForm {
        InferForm {
            inputs: inputs.map(str::to_string),
            parameters: parameters.map(str::to_string),
            ..InferForm::default()
        }
    }

    #[test]
    fn inputs_json_decoded_when_valid() {
        let form = form_with(Some(r#"{"a": 1}"#), None);
        assert_eq!(form.parsed_inputs().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn inputs_fall_back_to_raw_string() {
        let form = form_with(Some("not json {"), None);
        assert_eq!(form.parsed_inputs().unwrap(), json!("not json {"));
    }

    #[test]
    fn empty_inputs_count_as_absent() {
        let form = form_with(Some(""), None);
        assert!(!form.has_inputs());
        assert!(form.parsed_inputs().is_none());
    }

    #[test]
    fn blank_parameters_mean_none() {
        assert!(form_with(None, None).parsed_parameters().unwrap().is_empty());
        assert!(
            form_with(None, Some("   "))
                .parsed_parameters()
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        let err = form_with(None, Some("{invalid json"))
            .parsed_parameters()
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid parameters JSON"));
    }

    #[test]
    fn non_object_parameters_are_rejected() {
        let err = form_with(None, Some("[1, 2]")).parsed_parameters().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid parameters JSON: expected a JSON object"
        );
    }
}
