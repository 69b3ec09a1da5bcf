use std::sync::Arc;

use crate::application::compile::CompilationPipeline;

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<CompilationPipeline>,
    api_key: Arc<str>,
    max_body_bytes: usize,
}

impl AppState {
    pub fn new(
        pipeline: Arc<CompilationPipeline>,
        api_key: impl Into<Arc<str>>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            pipeline,
            api_key: api_key.into(),
            max_body_bytes,
        }
    }

    pub fn pipeline(&self) -> &CompilationPipeline {
        &self.pipeline
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }
}
