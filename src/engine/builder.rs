use crate::{
    config::EngineSettings,
    error::{EngineError, Result},
    resource::ModelHandle,
    types::InferenceParams,
};

use super::engine::InferenceEngine;

/// Builder for constructing an InferenceEngine instance
#[derive(Debug)]
pub struct EngineBuilder {
    settings: Option<EngineSettings>,
    model: Option<ModelHandle>,
}

impl EngineBuilder {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            settings: None,
            model: None,
        }
    }

    /// Set the engine settings
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Bind the engine to a loaded model
    pub fn with_model(mut self, model: ModelHandle) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_default_params(mut self, params: InferenceParams) -> Self {
        self.settings.get_or_insert_with(EngineSettings::default).default_params = params;
        self
    }

    /// Build the engine instance
    pub fn build(self) -> Result<InferenceEngine> {
        // Get settings or use default
        let settings = self.settings.unwrap_or_default();

        // Validate settings
        settings.validate()?;
        let violations = settings.default_params.sampling_violations();
        if !violations.is_empty() {
            return Err(EngineError::ConfigurationError { violations });
        }

        Ok(InferenceEngine::from_parts(self.model, settings))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
