//! The fixed reference corpus that chat answers are grounded in.
//!
//! Entries are embedded once during startup and never change afterwards, so the
//! corpus is shared as `Arc<Corpus>` and read without locks.

use std::path::Path;

use common::{error::AppError, utils::embedding::Embedder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ranking::{is_usable_norm, l2_norm};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorpusEntry {
    pub id: u64,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Immutable, validated corpus with entry norms computed at load time.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    entries: Vec<CorpusEntry>,
    norms: Vec<f32>,
    dimension: usize,
}

impl Corpus {
    /// Validates entries and precomputes their norms.
    ///
    /// Every vector must share one dimensionality and have a finite, non-zero norm.
    pub fn new(entries: Vec<CorpusEntry>) -> Result<Self, AppError> {
        let Some(first) = entries.first() else {
            return Ok(Self::default());
        };
        let dimension = first.vector.len();
        if dimension == 0 {
            return Err(AppError::DegenerateVector(format!(
                "corpus entry {} has an empty vector",
                first.id
            )));
        }

        let mut norms = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.vector.len() != dimension {
                return Err(AppError::DegenerateVector(format!(
                    "corpus entry {} has {} dimensions, expected {dimension}",
                    entry.id,
                    entry.vector.len()
                )));
            }
            let norm = l2_norm(&entry.vector);
            if !is_usable_norm(norm) {
                return Err(AppError::DegenerateVector(format!(
                    "corpus entry {} has a zero or non-finite norm",
                    entry.id
                )));
            }
            norms.push(norm);
        }

        Ok(Self {
            entries,
            norms,
            dimension,
        })
    }

    /// Embeds `texts` in one batch and assigns ids `1..=n` in input order.
    pub async fn embed_texts(
        texts: Vec<String>,
        embedder: &dyn Embedder,
    ) -> Result<Self, AppError> {
        let count = texts.len();
        let vectors = embedder.embed_batch(texts.clone()).await?;
        if vectors.len() != count {
            return Err(AppError::InternalError(format!(
                "embedder returned {} vectors for {count} texts",
                vectors.len()
            )));
        }

        let entries = texts
            .into_iter()
            .zip(vectors)
            .zip(1_u64..)
            .map(|((text, vector), id)| CorpusEntry { id, text, vector })
            .collect();

        let corpus = Self::new(entries)?;
        info!(
            entries = corpus.len(),
            dimension = corpus.dimension(),
            "corpus embedded"
        );
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vector length shared by all entries. Zero for an empty corpus.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub(crate) fn scan(&self) -> impl Iterator<Item = (&CorpusEntry, f32)> + '_ {
        self.entries.iter().zip(self.norms.iter().copied())
    }
}

/// Reads corpus texts from a JSON file holding an array of strings.
pub async fn load_corpus_texts(path: impl AsRef<Path>) -> Result<Vec<String>, AppError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path).await?;
    let texts: Vec<String> = serde_json::from_str(&raw)?;

    if let Some(position) = texts.iter().position(|text| text.trim().is_empty()) {
        return Err(AppError::Config(format!(
            "corpus file {} has a blank entry at index {position}",
            path.display()
        )));
    }

    debug!(path = %path.display(), entries = texts.len(), "loaded corpus texts");
    Ok(texts)
}

/// Built-in reference lines used when no corpus file is configured.
pub fn default_corpus_texts() -> Vec<String> {
    [
        "Lumen loves rainy afternoons, a warm mug of cocoa and a good mystery novel.",
        "When someone is feeling down, Lumen suggests a short walk and a favourite song.",
        "Lumen is terrible at remembering birthdays but never forgets a good joke.",
        "Lumen thinks every problem looks smaller after a glass of water and a deep breath.",
        "Lumen collects odd facts about octopuses and will share one if asked nicely.",
        "Lumen's favourite time of day is the quiet hour right after sunrise.",
        "Lumen believes a tidy desk is overrated but a tidy to-do list is priceless.",
        "If asked about the stars, Lumen likes to talk about how old their light is.",
    ]
    .iter()
    .map(|text| (*text).to_string())
    .collect()
}
