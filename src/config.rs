use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
pub const DEFAULT_MODEL: &str = "llama3.1";
pub const DEFAULT_EMBED_MODEL: &str = "bge-large";
pub const DEFAULT_CORPUS: &str = "documents=./assets";
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_CHUNK_TOKENS: usize = 800;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
pub const PDF_EXTENSION: &str = "pdf";

pub const QA_PROMPT_EN: &str = "Context information is below.
---------------------
{{context}}
---------------------
Given the context information above I want you to think step by step to answer the query in a crisp manner, make sure to scan the context thoroughly, in case you don't know the answer say 'I don't know!'.
Query: {{question}}
Answer: ";

pub const QA_PROMPT_ES: &str = "Información de contexto se encuentra a continuación.
---------------------
{{context}}
---------------------
Dada la información de contexto anterior, por favor responde a la consulta de manera amable y conversacional. Asegúrate de entender que términos como 'Art', 'art' y 'artículo' se refieren al mismo concepto.
Ejemplo de equivalencias:
- 'Art' es igual a 'art'.
- 'Art' también se refiere a 'artículo' o 'Artículo'.
Si no sabes la respuesta, di '¡No lo sé!'.
Consulta: {{question}}
Respuesta: ";

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum PromptLanguage {
    En,
    Es,
}

impl PromptLanguage {
    pub fn template(self) -> &'static str {
        match self {
            PromptLanguage::En => QA_PROMPT_EN,
            PromptLanguage::Es => QA_PROMPT_ES,
        }
    }
}

/// Everything needed to reach the model servers and shape a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSettings {
    pub ollama_url: String,
    pub model: String,
    pub embed_model: String,
    pub qdrant_url: String,
    pub top_k: usize,
    pub chunk_tokens: usize,
    pub request_timeout: Duration,
    /// Extra attempts at opening a generation stream.
    pub retries: u32,
    pub language: PromptLanguage,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            qdrant_url: DEFAULT_QDRANT_URL.to_string(),
            top_k: DEFAULT_TOP_K,
            chunk_tokens: DEFAULT_CHUNK_TOKENS,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: 0,
            language: PromptLanguage::Es,
        }
    }
}

/// A named document collection, one per chat page: `laboral=/data/laboral`.
/// The name is also used as the vector store collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusProfile {
    pub name: String,
    pub dir: PathBuf,
}

impl FromStr for CorpusProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, dir) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=DIRECTORY, got '{s}'"))?;
        let name = name.trim();
        let dir = dir.trim();
        if name.is_empty() || dir.is_empty() {
            return Err(format!("expected NAME=DIRECTORY, got '{s}'"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!(
                "corpus name '{name}' may only contain letters, digits, '-' and '_'"
            ));
        }
        Ok(Self {
            name: name.to_string(),
            dir: PathBuf::from(dir),
        })
    }
}

/// Corpus names double as collection names, so each may appear once.
pub fn check_unique_names(corpora: &[CorpusProfile]) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for profile in corpora {
        if !seen.insert(profile.name.as_str()) {
            return Err(format!("corpus '{}' is given more than once", profile.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_corpus_profile() {
        let profile: CorpusProfile = "laboral=/data/laboral".parse().unwrap();
        assert_eq!(profile.name, "laboral");
        assert_eq!(profile.dir, PathBuf::from("/data/laboral"));

        let default: CorpusProfile = DEFAULT_CORPUS.parse().unwrap();
        assert_eq!(default.name, "documents");
    }

    #[test]
    fn test_reject_bad_corpus_profile() {
        assert!("laboral".parse::<CorpusProfile>().is_err());
        assert!("=/data".parse::<CorpusProfile>().is_err());
        assert!("laboral=".parse::<CorpusProfile>().is_err());
        assert!("dos palabras=/data".parse::<CorpusProfile>().is_err());
    }

    #[test]
    fn test_duplicate_corpus_names_rejected() {
        let corpora: Vec<CorpusProfile> = ["laboral=/data/a", "familiar=/data/b", "laboral=/data/c"]
            .into_iter()
            .map(|s| s.parse().unwrap())
            .collect();

        assert!(check_unique_names(&corpora[..2]).is_ok());
        let err = check_unique_names(&corpora).unwrap_err();
        assert!(err.contains("laboral"));
    }

    #[test]
    fn test_templates_have_placeholders() {
        for language in [PromptLanguage::En, PromptLanguage::Es] {
            let template = language.template();
            assert!(template.contains("{{context}}"));
            assert!(template.contains("{{question}}"));
        }
    }
}
