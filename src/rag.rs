use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use futures_util::StreamExt;
use langchain_rust::{
    chain::{Chain, LLMChain, LLMChainBuilder},
    fmt_template, message_formatter,
    prompt::HumanMessagePromptTemplate,
    prompt_args,
    schemas::{Document, Retriever as _},
    template_jinja2,
    vectorstore::{
        qdrant::{Qdrant, Store, StoreBuilder},
        Retriever, VecStoreOptions, VectorStore,
    },
};

use crate::config::{CorpusProfile, ModelSettings};
use crate::corpus::{load_corpus, split_documents, SOURCE_KEY};
use crate::engine::{FragmentStream, QueryEngine};
use crate::error::ChatError;
use crate::models::SharedModels;

/// Load, chunk and embed a corpus into a freshly recreated collection.
/// Returns the number of chunks stored.
pub async fn index_corpus(
    profile: &CorpusProfile,
    models: &SharedModels,
    settings: &ModelSettings,
) -> Result<usize, ChatError> {
    let documents = load_corpus(&profile.dir).await?;
    let chunks = split_documents(&documents, settings.chunk_tokens)?;
    log::info!(
        "corpus {}: {} parts split into {} chunks",
        profile.name,
        documents.len(),
        chunks.len()
    );

    let store = open_store(profile, models, settings, true).await?;
    store
        .add_documents(&chunks, &VecStoreOptions::default())
        .await
        .map_err(|e| ChatError::EngineBuild(format!("indexing {}: {e}", profile.name)))?;

    log::info!("corpus {} indexed", profile.name);
    Ok(chunks.len())
}

async fn open_store(
    profile: &CorpusProfile,
    models: &SharedModels,
    settings: &ModelSettings,
    recreate: bool,
) -> Result<Store, ChatError> {
    let client = Qdrant::from_url(&settings.qdrant_url)
        .build()
        .map_err(|e| ChatError::EngineBuild(format!("qdrant {}: {e}", settings.qdrant_url)))?;

    StoreBuilder::new()
        .embedder(models.embedder())
        .client(client)
        .collection_name(&profile.name)
        .recreate_collection(recreate)
        .build()
        .await
        .map_err(|e| ChatError::EngineBuild(format!("collection {}: {e}", profile.name)))
}

/// Full engine initialization for one corpus. With `reindex` the corpus is
/// loaded and embedded first, otherwise the existing collection is used.
pub async fn build_engine(
    profile: &CorpusProfile,
    settings: &ModelSettings,
    reindex: bool,
) -> Result<Arc<dyn QueryEngine>, ChatError> {
    let models = SharedModels::init(settings)?;
    if reindex {
        index_corpus(profile, models, settings).await?;
    }
    let store = open_store(profile, models, settings, false).await?;
    let engine = RagQueryEngine::new(store, models, settings)?;
    log::info!("corpus {}: chat ready", profile.name);
    Ok(Arc::new(engine))
}

/// Retrieves the closest passages and streams the model's answer to the
/// QA prompt built from them.
pub struct RagQueryEngine {
    retriever: Retriever,
    chain: LLMChain,
    timeout: Duration,
    retries: u32,
}

impl RagQueryEngine {
    pub fn new(
        store: Store,
        models: &SharedModels,
        settings: &ModelSettings,
    ) -> Result<Self, ChatError> {
        let template = template_jinja2!(settings.language.template(), "context", "question");
        let prompt = message_formatter![fmt_template!(HumanMessagePromptTemplate::new(template))];
        let chain = LLMChainBuilder::new()
            .prompt(prompt)
            .llm(models.llm())
            .build()
            .map_err(|e| ChatError::EngineBuild(format!("chain: {e}")))?;

        Ok(Self {
            retriever: Retriever::new(store, settings.top_k),
            chain,
            timeout: settings.request_timeout,
            retries: settings.retries,
        })
    }
}

#[async_trait]
impl QueryEngine for RagQueryEngine {
    async fn stream(&self, query: &str) -> Result<FragmentStream, ChatError> {
        let passages = self
            .retriever
            .get_relevant_documents(query)
            .await
            .map_err(|e| ChatError::Retrieval(format!("vector search: {e}")))?;
        log::debug!(
            "retrieved {} passages from {:?}",
            passages.len(),
            passages
                .iter()
                .filter_map(|p| p.metadata.get(SOURCE_KEY))
                .collect::<Vec<_>>()
        );
        let context = join_passages(&passages);

        let mut attempt = 0;
        let answer = loop {
            let input_variables = prompt_args! {
                "context" => context.clone(),
                "question" => query,
            };
            match self.chain.stream(input_variables).await {
                Ok(answer) => break answer,
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!("language model unavailable ({e}), retry {attempt}/{}", self.retries);
                }
                Err(e) => return Err(ChatError::Retrieval(format!("language model: {e}"))),
            }
        };

        let fragments = answer.map(|item| item.map(|data| data.content).map_err(|e| e.to_string()));
        Ok(bounded_fragments(fragments, self.timeout))
    }
}

fn join_passages(passages: &[Document]) -> String {
    passages
        .iter()
        .map(|p| p.page_content.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Adapt a model stream into fragments, failing when any single fragment
/// takes longer than `limit` to arrive. Nothing is yielded after an error.
fn bounded_fragments<S>(inner: S, limit: Duration) -> FragmentStream
where
    S: Stream<Item = Result<String, String>> + Send + Unpin + 'static,
{
    Box::pin(futures::stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(limit, inner.next()).await {
            Ok(Some(Ok(fragment))) => Some((Ok(fragment), Some(inner))),
            Ok(Some(Err(e))) => Some((Err(ChatError::Retrieval(format!("language model: {e}"))), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(ChatError::Retrieval(format!(
                    "no response from language model within {}s",
                    limit.as_secs_f32()
                ))),
                None,
            )),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_fragments_pass_through_in_order() {
        let inner = stream::iter(vec![Ok("Hola".to_string()), Ok(", mundo".to_string())]);

        let fragments: Vec<_> = bounded_fragments(inner, Duration::from_secs(1)).collect().await;

        assert_eq!(fragments, vec![Ok("Hola".to_string()), Ok(", mundo".to_string())]);
    }

    #[tokio::test]
    async fn test_stream_stops_after_error() {
        let inner = stream::iter(vec![
            Ok("Parcial".to_string()),
            Err("connection reset".to_string()),
            Ok("never".to_string()),
        ]);

        let fragments: Vec<_> = bounded_fragments(inner, Duration::from_secs(1)).collect().await;

        assert_eq!(fragments.len(), 2);
        assert_eq!(
            fragments[1],
            Err(ChatError::Retrieval("language model: connection reset".into()))
        );
    }

    #[tokio::test]
    async fn test_stalled_model_times_out() {
        let inner = stream::iter(vec![Ok("Parcial".to_string())]).chain(stream::pending());

        let fragments: Vec<_> = bounded_fragments(inner, Duration::from_millis(20)).collect().await;

        assert_eq!(fragments[0], Ok("Parcial".to_string()));
        assert!(matches!(fragments[1], Err(ChatError::Retrieval(ref m)) if m.contains("no response")));
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn test_join_passages() {
        let passages = vec![Document::new("  Art. 1 \n"), Document::new("Art. 2")];
        assert_eq!(join_passages(&passages), "Art. 1\n\nArt. 2");
    }
}
