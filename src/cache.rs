use crate::pipelines::{Pipeline, PipelineError, PipelineLoader};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Derive the memoization key for a `(model, task)` pair. A model requested
/// with and without an explicit task occupies two entries.
pub fn cache_key(model: &str, task: Option<&str>) -> String {
    match task {
        Some(task) => format!("{model}_{task}"),
        None => model.to_string(),
    }
}

/// Process-wide pipeline cache. Entries are created on first request for a
/// key and live for the lifetime of the process; there is no eviction and no
/// invalidation.
///
/// Each key holds a `OnceCell`, so concurrent first requests share a single
/// construction instead of racing. A failed construction leaves the cell
/// empty and the next request retries.
pub struct PipelineCache {
    entries: DashMap<String, Arc<OnceCell<Arc<dyn Pipeline>>>>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn get_or_load(
        &self,
        loader: Arc<dyn PipelineLoader>,
        model: &str,
        task: Option<&str>,
    ) -> Result<Arc<dyn Pipeline>, PipelineError> {
        let key = cache_key(model, task);
        let cell = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        if let Some(pipeline) = cell.get() {
            log::debug!("pipeline cache hit for '{key}'");
            return Ok(pipeline.clone());
        }

        let model = model.to_string();
        let task = task.map(str::to_string);
        let pipeline = cell
            .get_or_try_init(|| async {
                log::info!("pipeline cache miss for '{key}', constructing");
                // Construction mmaps weights and may download; keep it off
                // the async workers.
                tokio::task::spawn_blocking(move || loader.load(&model, task.as_deref()))
                    .await
                    .map_err(|e| {
                        PipelineError::Model(format!("pipeline construction panicked: {e}"))
                    })?
            })
            .await?;
        Ok(pipeline.clone())
    }
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new()
    }
}
