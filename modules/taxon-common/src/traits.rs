// Collaborator boundaries.
//
// The engine never talks to OpenSearch or Postgres directly: documents and
// targets come in through the read traits, results leave through the write
// traits. Production implementations live in taxon-store; in-memory ones in
// `testing` keep every stage testable without a network or database.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::run_log::RunLog;
use crate::types::{
    BatchOutcome, CategorizationRecord, DerivedTopic, Document, DocumentTopicAssignment,
    IndexFieldUpdate, TargetCatalog, TargetType,
};

// ---------------------------------------------------------------------------
// Read side (search index)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Every ingested document, with text and embedding already computed.
    async fn documents(&self) -> Result<Vec<Document>>;
}

#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn catalog(&self, target_type: TargetType) -> Result<TargetCatalog>;
}

/// A target variant returned by a k-NN query.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborHit {
    pub target_name: String,
    /// Backend score for cosine space, `(1 + cos) / 2`.
    pub score: f64,
}

#[async_trait]
pub trait NeighborSearch: Send + Sync {
    async fn nearest_targets(
        &self,
        target_type: TargetType,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<NeighborHit>>;
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Replace categorization arrays on indexed documents.
    async fn write_fields(&self, updates: &[IndexFieldUpdate]) -> Result<BatchOutcome>;
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert-or-replace keyed by `(document_id, target_name)` per target type.
    async fn upsert_categorizations(&self, records: &[CategorizationRecord])
        -> Result<BatchOutcome>;

    /// `(document_id, target_name)` for every row with `llm_belongs = Yes`.
    async fn accepted_categorizations(
        &self,
        target_type: TargetType,
    ) -> Result<Vec<(String, String)>>;

    /// Delete every derived topic and every document/derived-topic edge.
    async fn purge_derived_topics(&self) -> Result<()>;

    async fn insert_derived_topics(&self, topics: &[DerivedTopic]) -> Result<BatchOutcome>;

    async fn derived_topics(&self) -> Result<Vec<DerivedTopic>>;

    /// Insert-or-replace keyed by `(document_id, topic_name)`.
    async fn upsert_topic_assignments(
        &self,
        assignments: &[DocumentTopicAssignment],
    ) -> Result<BatchOutcome>;

    /// `(document_id, topic_name)` for every assignment with confidence > 0.
    async fn accepted_topic_assignments(&self) -> Result<Vec<(String, String)>>;

    async fn record_run(&self, log: &RunLog) -> Result<()>;
}

/// Which documents the derived-topic path has already seen.
#[async_trait]
pub trait IngestionLog: Send + Sync {
    /// The subset of `document_ids` not yet processed.
    async fn unprocessed(&self, document_ids: &[String]) -> Result<HashSet<String>>;

    async fn mark_processed(&self, document_ids: &[String]) -> Result<()>;
}
