//! Process-wide model handles.
//!
//! The Ollama client and chat model are built at most once per process and
//! are read-only afterwards. Every corpus and session shares them.

use std::sync::{Arc, OnceLock};

use langchain_rust::{
    embedding::OllamaEmbedder,
    llm::client::{GenerationOptions, Ollama, OllamaClient},
};
use reqwest::Url;

use crate::config::ModelSettings;
use crate::error::ChatError;

static SHARED: OnceLock<SharedModels> = OnceLock::new();

pub struct SharedModels {
    ollama_url: String,
    model: String,
    embed_model: String,
    client: Arc<OllamaClient>,
    llm: Ollama,
}

impl std::fmt::Debug for SharedModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedModels")
            .field("ollama_url", &self.ollama_url)
            .field("model", &self.model)
            .field("embed_model", &self.embed_model)
            .finish()
    }
}

impl SharedModels {
    /// Construct the shared models on first call; later calls return the
    /// same instance regardless of `settings`.
    pub fn init(settings: &ModelSettings) -> Result<&'static SharedModels, ChatError> {
        if let Some(models) = SHARED.get() {
            if !models.matches(settings) {
                log::warn!(
                    "models already loaded as {models:?}, ignoring model {} at {}",
                    settings.model,
                    settings.ollama_url
                );
            }
            return Ok(models);
        }

        let url = Url::parse(&settings.ollama_url).map_err(|e| {
            ChatError::EngineBuild(format!("invalid Ollama url '{}': {e}", settings.ollama_url))
        })?;

        Ok(SHARED.get_or_init(|| {
            log::info!(
                "loading model {} (embeddings {}) from {}",
                settings.model,
                settings.embed_model,
                settings.ollama_url
            );
            let client = Arc::new(OllamaClient::from_url(url));
            let llm = Ollama::new(
                client.clone(),
                &settings.model,
                Some(GenerationOptions::default()),
            );
            SharedModels {
                ollama_url: settings.ollama_url.clone(),
                model: settings.model.clone(),
                embed_model: settings.embed_model.clone(),
                client,
                llm,
            }
        }))
    }

    /// The shared models, if [`SharedModels::init`] has run.
    pub fn get() -> Option<&'static SharedModels> {
        SHARED.get()
    }

    pub fn llm(&self) -> Ollama {
        self.llm.clone()
    }

    /// Embedder over the shared client.
    pub fn embedder(&self) -> OllamaEmbedder {
        OllamaEmbedder::new(
            self.client.clone(),
            &self.embed_model,
            Some(GenerationOptions::default()),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn matches(&self, settings: &ModelSettings) -> bool {
        self.ollama_url == settings.ollama_url
            && self.model == settings.model
            && self.embed_model == settings.embed_model
    }
}
