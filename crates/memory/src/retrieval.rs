//! Retrieval Port: similarity search over a typed document corpus.
//!
//! The port owns embedding generation — callers pass raw query text and
//! never see a vector. A concrete backend (vector store + embedding model)
//! is out of scope here; [`RetrievalPort`] is the seam the Dialog Engine
//! programs against, and [`InMemoryRetrievalPort`] is a deterministic
//! substring-scored implementation suitable for tests and small corpora.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Category of an indexed or retrieved document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Question,
    Solution,
    Misconception,
    Concept,
    Hint,
}

/// A document as returned by a retrieval call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub content: String,
    pub category: ContentType,
    pub similarity: f32,
    pub metadata: HashMap<String, String>,
}

/// A document submitted for indexing. The port computes and owns its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexableContent {
    pub id: String,
    pub content: String,
    pub category: ContentType,
    pub metadata: HashMap<String, String>,
    /// Knowledge-node identifiers this document is tagged with, used by the
    /// knowledge-node filter in [`RetrievalContext`].
    pub knowledge_nodes: Vec<String>,
    /// For question documents, the question this content belongs to.
    pub question_id: Option<String>,
}

/// Filters applied on top of similarity ranking.
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    pub question_id: Option<String>,
    pub knowledge_nodes: Vec<String>,
    pub max_results: usize,
    pub min_similarity: f32,
}

impl RetrievalContext {
    pub fn new(max_results: usize, min_similarity: f32) -> Self {
        Self {
            question_id: None,
            knowledge_nodes: Vec::new(),
            max_results,
            min_similarity,
        }
    }

    pub fn with_question_id(mut self, question_id: impl Into<String>) -> Self {
        self.question_id = Some(question_id.into());
        self
    }

    pub fn with_knowledge_nodes(mut self, nodes: impl IntoIterator<Item = String>) -> Self {
        self.knowledge_nodes = nodes.into_iter().collect();
        self
    }
}

/// Result of a `retrieve` call: the truncated, filtered documents plus how
/// many matched before truncation.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub documents: Vec<RetrievedDocument>,
    pub total_found: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("retrieval backend unavailable: {0}")]
    Unavailable(String),
}

/// Abstracts similarity retrieval and indexing over the typed corpus.
#[async_trait]
pub trait RetrievalPort: Send + Sync {
    async fn retrieve(
        &self,
        query_text: &str,
        context: &RetrievalContext,
    ) -> Result<RetrievalResult, RetrievalError>;

    async fn upsert(&self, document: IndexableContent) -> Result<(), RetrievalError>;

    async fn upsert_batch(&self, documents: Vec<IndexableContent>) -> Result<(), RetrievalError>;
}

/// Typed helper: documents of category [`ContentType::Question`] sharing a
/// knowledge-node with `question_id`, excluding `question_id` itself.
pub async fn retrieve_similar_questions(
    port: &dyn RetrievalPort,
    question_id: &str,
    count: usize,
) -> Result<Vec<RetrievedDocument>, RetrievalError> {
    let context = RetrievalContext::new(count + 1, 0.0);
    let result = port.retrieve(question_id, &context).await?;
    Ok(result
        .documents
        .into_iter()
        .filter(|doc| doc.category == ContentType::Question && doc.id != question_id)
        .take(count)
        .collect())
}

/// Typed helper: misconception documents, optionally scoped to a question.
pub async fn retrieve_misconceptions(
    port: &dyn RetrievalPort,
    query: &str,
    question_id: Option<&str>,
    max: usize,
) -> Result<Vec<RetrievedDocument>, RetrievalError> {
    retrieve_by_category(port, query, question_id, max, ContentType::Misconception).await
}

/// Typed helper: solution documents, optionally scoped to a question.
pub async fn retrieve_solutions(
    port: &dyn RetrievalPort,
    query: &str,
    question_id: Option<&str>,
    max: usize,
) -> Result<Vec<RetrievedDocument>, RetrievalError> {
    retrieve_by_category(port, query, question_id, max, ContentType::Solution).await
}

async fn retrieve_by_category(
    port: &dyn RetrievalPort,
    query: &str,
    question_id: Option<&str>,
    max: usize,
    category: ContentType,
) -> Result<Vec<RetrievedDocument>, RetrievalError> {
    let mut context = RetrievalContext::new(max.max(1) * 4, 0.0);
    context.question_id = question_id.map(String::from);
    let result = port.retrieve(query, &context).await?;
    Ok(result
        .documents
        .into_iter()
        .filter(|doc| doc.category == category)
        .take(max)
        .collect())
}

/// Deterministic, dependency-free [`RetrievalPort`] backed by a Jaccard-style
/// token-overlap score. Good enough for tests and a small bundled corpus;
/// a production deployment swaps this for an embedding-backed store without
/// the Dialog Engine noticing.
#[derive(Debug, Default)]
pub struct InMemoryRetrievalPort {
    documents: tokio::sync::RwLock<Vec<IndexableContent>>,
}

impl InMemoryRetrievalPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(documents: impl IntoIterator<Item = IndexableContent>) -> Self {
        Self {
            documents: tokio::sync::RwLock::new(documents.into_iter().collect()),
        }
    }

    fn score(query_tokens: &[String], content: &str) -> f32 {
        if query_tokens.is_empty() {
            return 0.0;
        }
        let content_tokens: std::collections::HashSet<String> =
            tokenize(content).into_iter().collect();
        let overlap = query_tokens
            .iter()
            .filter(|t| content_tokens.contains(*t))
            .count();
        overlap as f32 / query_tokens.len() as f32
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

#[async_trait]
impl RetrievalPort for InMemoryRetrievalPort {
    async fn retrieve(
        &self,
        query_text: &str,
        context: &RetrievalContext,
    ) -> Result<RetrievalResult, RetrievalError> {
        let query_tokens = tokenize(query_text);
        let documents = self.documents.read().await;

        let mut scored: Vec<RetrievedDocument> = documents
            .iter()
            .filter(|doc| {
                let question_match = context
                    .question_id
                    .as_ref()
                    .is_none_or(|qid| doc.question_id.as_deref() == Some(qid.as_str()));
                let node_match = context.knowledge_nodes.is_empty()
                    || doc
                        .knowledge_nodes
                        .iter()
                        .any(|n| context.knowledge_nodes.contains(n));
                question_match && node_match
            })
            .map(|doc| RetrievedDocument {
                id: doc.id.clone(),
                content: doc.content.clone(),
                category: doc.category,
                similarity: Self::score(&query_tokens, &doc.content),
                metadata: doc.metadata.clone(),
            })
            .filter(|doc| doc.similarity >= context.min_similarity)
            .collect();

        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        let total_found = scored.len();
        scored.truncate(context.max_results);

        Ok(RetrievalResult {
            documents: scored,
            total_found,
        })
    }

    async fn upsert(&self, document: IndexableContent) -> Result<(), RetrievalError> {
        let mut documents = self.documents.write().await;
        documents.retain(|d| d.id != document.id);
        documents.push(document);
        Ok(())
    }

    async fn upsert_batch(&self, documents: Vec<IndexableContent>) -> Result<(), RetrievalError> {
        for document in documents {
            self.upsert(document).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str, category: ContentType, question_id: Option<&str>) -> IndexableContent {
        IndexableContent {
            id: id.to_string(),
            content: content.to_string(),
            category,
            metadata: HashMap::new(),
            knowledge_nodes: vec!["fractions".to_string()],
            question_id: question_id.map(String::from),
        }
    }

    #[tokio::test]
    async fn retrieve_sorts_by_similarity_descending_and_truncates() {
        let port = InMemoryRetrievalPort::seeded([
            doc("q1", "common denominator fraction addition", ContentType::Concept, None),
            doc("q2", "fraction addition needs common denominator first", ContentType::Concept, None),
            doc("q3", "completely unrelated trigonometry identity", ContentType::Concept, None),
        ]);

        let context = RetrievalContext::new(2, 0.0);
        let result = port.retrieve("common denominator fraction", &context).await.unwrap();

        assert_eq!(result.documents.len(), 2);
        assert!(result.documents[0].similarity >= result.documents[1].similarity);
        assert_eq!(result.total_found, 3);
    }

    #[tokio::test]
    async fn min_similarity_excludes_weak_matches() {
        let port = InMemoryRetrievalPort::seeded([doc(
            "q1",
            "completely unrelated text",
            ContentType::Concept,
            None,
        )]);
        let context = RetrievalContext::new(5, 0.5);
        let result = port.retrieve("fractions", &context).await.unwrap();
        assert!(result.documents.is_empty());
    }

    #[tokio::test]
    async fn retrieve_similar_questions_excludes_self() {
        let port = InMemoryRetrievalPort::seeded([
            doc("q1", "fraction word problem about pizza", ContentType::Question, None),
            doc("q2", "fraction word problem about ribbon", ContentType::Question, None),
        ]);
        let results = retrieve_similar_questions(&port, "q1", 5).await.unwrap();
        assert!(results.iter().all(|d| d.id != "q1"));
    }
}
