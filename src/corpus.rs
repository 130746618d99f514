//! Document source: PDF discovery, text extraction and chunking.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use langchain_rust::{
    document_loaders::{pdf_extract_loader::PdfExtractLoader, Loader},
    schemas::Document,
};
use serde_json::Value;
use text_splitter::{ChunkConfig, TextSplitter};
use tiktoken_rs::cl100k_base;
use walkdir::WalkDir;

use crate::error::ChatError;

pub const SOURCE_KEY: &str = "source";

/// Every file under `directory` (recursively, following symlinks) whose
/// extension matches `extension`, ignoring case. Sorted for a stable
/// indexing order. Unreadable entries and symlink loops fail the walk
/// with one error listing all of them.
pub fn matching_files(directory: &Path, extension: &str) -> Result<Vec<PathBuf>, ChatError> {
    if !directory.is_dir() {
        return Err(ChatError::CorpusLoad(format!(
            "{} is not a directory",
            directory.display()
        )));
    }

    let mut found = Vec::new();
    let mut failures = Vec::new();
    for entry in WalkDir::new(directory).follow_links(true) {
        match entry {
            Ok(entry) => {
                let is_match = entry.file_type().is_file()
                    && entry
                        .path()
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
                if is_match {
                    found.push(entry.into_path());
                }
            }
            Err(e) => failures.push(e.to_string()),
        }
    }

    if !failures.is_empty() {
        return Err(ChatError::CorpusLoad(format!(
            "cannot walk {}: {}",
            directory.display(),
            failures.join("; ")
        )));
    }
    found.sort();
    Ok(found)
}

/// Extract the text of every PDF under `directory`.
///
/// Any unreadable file fails the whole load; the error names all of them.
pub async fn load_corpus(directory: &Path) -> Result<Vec<Document>, ChatError> {
    let files = matching_files(directory, crate::config::PDF_EXTENSION)?;
    if files.is_empty() {
        return Err(ChatError::CorpusLoad(format!(
            "no .pdf files in {}",
            directory.display()
        )));
    }

    let mut documents = Vec::new();
    let mut failures = Vec::new();
    for path in &files {
        match load_pdf(path).await {
            Ok(pages) => {
                log::info!("loaded {} ({} parts)", path.display(), pages.len());
                documents.extend(pages);
            }
            Err(e) => {
                log::warn!("failed to load {}: {e}", path.display());
                failures.push(format!("{}: {e}", path.display()));
            }
        }
    }

    if !failures.is_empty() {
        return Err(ChatError::CorpusLoad(format!(
            "{} of {} files failed: {}",
            failures.len(),
            files.len(),
            failures.join("; ")
        )));
    }
    Ok(documents)
}

async fn load_pdf(path: &Path) -> Result<Vec<Document>, String> {
    let loader = PdfExtractLoader::from_path(path).map_err(|e| e.to_string())?;
    let parts = loader
        .load()
        .await
        .map_err(|e| e.to_string())?
        .collect::<Vec<_>>()
        .await;

    let source = Value::String(path.display().to_string());
    parts
        .into_iter()
        .map(|part| {
            part.map(|mut doc| {
                doc.metadata.insert(SOURCE_KEY.to_string(), source.clone());
                doc
            })
            .map_err(|e| e.to_string())
        })
        .collect()
}

/// Split documents into chunks of at most `max_tokens` cl100k tokens.
/// Chunks inherit the metadata of the document they came from.
pub fn split_documents(
    documents: &[Document],
    max_tokens: usize,
) -> Result<Vec<Document>, ChatError> {
    let tokenizer =
        cl100k_base().map_err(|e| ChatError::EngineBuild(format!("tokenizer: {e}")))?;
    let splitter = TextSplitter::new(ChunkConfig::new(max_tokens).with_sizer(tokenizer));

    let chunks = documents
        .iter()
        .flat_map(|doc| {
            splitter
                .chunks(&doc.page_content)
                .map(|chunk| Document::new(chunk).with_metadata(doc.metadata.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    Ok(chunks)
}
