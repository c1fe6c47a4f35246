use crate::cache::PipelineCache;
use crate::error::ApiError;
use crate::pipelines::{Pipeline, PipelineLoader};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Shared server state: the injected pipeline loader and the process-wide
/// pipeline cache it populates. Owned by the HTTP server and handed to
/// handlers through `web::Data`.
pub struct AppState {
    loader: Arc<dyn PipelineLoader>,
    cache: PipelineCache,
}

impl AppState {
    pub fn new(loader: Arc<dyn PipelineLoader>) -> Self {
        Self {
            loader,
            cache: PipelineCache::new(),
        }
    }

    /// Look up or construct the pipeline for `(model, task)`. Construction
    /// failures surface as the load error the caller sees.
    pub async fn resolve_pipeline(
        &self,
        model: &str,
        task: Option<&str>,
    ) -> Result<Arc<dyn Pipeline>, ApiError> {
        self.cache
            .get_or_load(self.loader.clone(), model, task)
            .await
            .map_err(|e| ApiError::ModelLoad {
                model: model.to_string(),
                reason: e.to_string(),
            })
    }
}
