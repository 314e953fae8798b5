//! Upsert coordinator.
//!
//! Writes results to the relational store first, then projects the accepted
//! rows, read back from the store, onto the search-index categorization
//! fields. The index therefore always mirrors what the relational store holds,
//! whichever run produced it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use taxon_common::{
    BatchOutcome, CategorizationField, CategorizationRecord, DerivedTopic,
    DocumentTopicAssignment, IndexFieldUpdate, IndexWriter, RelationalStore, RunLog, TargetType,
};

const RELATIONAL: &str = "relational";
const INDEX: &str = "search_index";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub relational: BatchOutcome,
    pub index: BatchOutcome,
}

impl PersistReport {
    pub fn failed(&self) -> usize {
        self.relational.failed + self.index.failed
    }
}

pub struct UpsertCoordinator {
    index: Arc<dyn IndexWriter>,
    store: Arc<dyn RelationalStore>,
}

impl UpsertCoordinator {
    pub fn new(index: Arc<dyn IndexWriter>, store: Arc<dyn RelationalStore>) -> Self {
        Self { index, store }
    }

    /// Upsert categorization rows and refresh the matching index field for
    /// every document touched.
    pub async fn persist_categorizations(
        &self,
        target_type: TargetType,
        records: &[CategorizationRecord],
        log: &mut RunLog,
    ) -> Result<PersistReport> {
        let relational = self.store.upsert_categorizations(records).await?;
        log.persisted(RELATIONAL, entity_name(target_type.index_field()), relational);
        if relational.failed > 0 {
            warn!(%target_type, failed = relational.failed, "Some categorization rows were not stored");
        }

        let touched: BTreeSet<String> = records.iter().map(|r| r.document_id.clone()).collect();
        let index = self
            .project(target_type.index_field(), &touched, log)
            .await?;

        Ok(PersistReport { relational, index })
    }

    /// Insert the topic catalog (retrain only, empty on predict), upsert the
    /// assignments and refresh the derived-topic index field.
    pub async fn persist_topics(
        &self,
        topics: &[DerivedTopic],
        assignments: &[DocumentTopicAssignment],
        log: &mut RunLog,
    ) -> Result<PersistReport> {
        let mut relational = BatchOutcome::default();
        if !topics.is_empty() {
            let inserted = self.store.insert_derived_topics(topics).await?;
            log.persisted(RELATIONAL, "derived_topics", inserted);
            relational = relational.merge(inserted);
        }

        let upserted = self.store.upsert_topic_assignments(assignments).await?;
        log.persisted(RELATIONAL, "documents_derived_topic", upserted);
        relational = relational.merge(upserted);
        if relational.failed > 0 {
            warn!(failed = relational.failed, "Some derived-topic rows were not stored");
        }

        let touched: BTreeSet<String> =
            assignments.iter().map(|a| a.document_id.clone()).collect();
        let index = self
            .project(CategorizationField::DerivedTopic, &touched, log)
            .await?;

        Ok(PersistReport { relational, index })
    }

    /// Rewrite every categorization field of `document_ids` from the stored
    /// rows, without recomputing anything.
    pub async fn reproject(
        &self,
        document_ids: &[String],
        log: &mut RunLog,
    ) -> Result<PersistReport> {
        let touched: BTreeSet<String> = document_ids.iter().cloned().collect();
        let mut index = BatchOutcome::default();
        for field in [
            CategorizationField::Mandate,
            CategorizationField::Topic,
            CategorizationField::DerivedTopic,
        ] {
            index = index.merge(self.project(field, &touched, log).await?);
        }
        info!(
            documents = touched.len(),
            succeeded = index.succeeded,
            failed = index.failed,
            "Re-projected categorizations"
        );
        Ok(PersistReport {
            relational: BatchOutcome::default(),
            index,
        })
    }

    async fn project(
        &self,
        field: CategorizationField,
        touched: &BTreeSet<String>,
        log: &mut RunLog,
    ) -> Result<BatchOutcome> {
        if touched.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let accepted = match field {
            CategorizationField::Mandate => {
                self.store.accepted_categorizations(TargetType::Mandate).await?
            }
            CategorizationField::Topic => {
                self.store.accepted_categorizations(TargetType::Topic).await?
            }
            CategorizationField::DerivedTopic => self.store.accepted_topic_assignments().await?,
        };

        let updates = field_updates(field, touched, accepted);
        let outcome = self.index.write_fields(&updates).await?;
        log.persisted(INDEX, field.as_str(), outcome);
        if outcome.failed > 0 {
            warn!(field = field.as_str(), failed = outcome.failed, "Some index fields were not updated");
        }
        Ok(outcome)
    }
}

fn entity_name(field: CategorizationField) -> &'static str {
    match field {
        CategorizationField::Mandate => "documents_mandates",
        CategorizationField::Topic => "documents_topics",
        CategorizationField::DerivedTopic => "documents_derived_topic",
    }
}

/// One update per touched document: its accepted names, sorted and unique.
/// A document with nothing accepted gets an empty array so stale names are
/// cleared.
fn field_updates(
    field: CategorizationField,
    touched: &BTreeSet<String>,
    accepted: Vec<(String, String)>,
) -> Vec<IndexFieldUpdate> {
    let mut names: BTreeMap<&str, BTreeSet<String>> =
        touched.iter().map(|id| (id.as_str(), BTreeSet::new())).collect();
    for (document_id, name) in accepted {
        if let Some(set) = names.get_mut(document_id.as_str()) {
            set.insert(name);
        }
    }

    names
        .into_iter()
        .map(|(document_id, values)| IndexFieldUpdate {
            document_id: document_id.to_string(),
            field,
            values: values.into_iter().collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxon_common::testing::{doc, MemoryIndex, MemoryStore};
    use taxon_common::{EventKind, MISCELLANEOUS};

    fn record(url: &str, name: &str, belongs: bool) -> CategorizationRecord {
        let document = doc(url, "text", vec![1.0], "Report");
        CategorizationRecord {
            document_id: document.document_id,
            url: document.url,
            target_type: TargetType::Mandate,
            target_name: name.into(),
            semantic_score: 0.5,
            llm_belongs: belongs,
            llm_score: 7,
            llm_explanation: "e".into(),
            is_primary: true,
        }
    }

    fn coordinator(index: &Arc<MemoryIndex>, store: &Arc<MemoryStore>) -> UpsertCoordinator {
        UpsertCoordinator::new(index.clone(), store.clone())
    }

    #[tokio::test]
    async fn projects_only_accepted_names() {
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryStore::new());
        let mut log = RunLog::new("t", "test");
        let records = vec![
            record("https://x/doc1", "Fisheries", true),
            record("https://x/doc1", "Conservation", true),
            record("https://x/doc1", "Shipping", false),
            record("https://x/doc2", "Shipping", false),
        ];

        let report = coordinator(&index, &store)
            .persist_categorizations(TargetType::Mandate, &records, &mut log)
            .await
            .unwrap();

        assert_eq!(report.relational, BatchOutcome::new(4, 0));
        assert_eq!(report.index, BatchOutcome::new(2, 0));
        assert_eq!(
            index.field(&records[0].document_id, CategorizationField::Mandate),
            Some(vec!["Conservation".to_string(), "Fisheries".to_string()])
        );
        assert_eq!(
            index.field(&records[3].document_id, CategorizationField::Mandate),
            Some(vec![])
        );
        assert_eq!(log.count(|k| matches!(k, EventKind::Persisted { .. })), 2);
    }

    #[tokio::test]
    async fn repeated_persist_is_idempotent() {
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryStore::new());
        let mut log = RunLog::new("t", "test");
        let records = vec![record("https://x/doc1", "Conservation", true)];
        let coordinator = coordinator(&index, &store);

        coordinator
            .persist_categorizations(TargetType::Mandate, &records, &mut log)
            .await
            .unwrap();
        coordinator
            .persist_categorizations(TargetType::Mandate, &records, &mut log)
            .await
            .unwrap();

        assert_eq!(store.categorizations().len(), 1);
        assert_eq!(
            index.field(&records[0].document_id, CategorizationField::Mandate),
            Some(vec!["Conservation".to_string()])
        );
    }

    #[tokio::test]
    async fn failed_rows_are_counted_not_raised() {
        let failing = doc("https://x/bad", "t", vec![1.0], "Report").document_id;
        let index = Arc::new(MemoryIndex::new().failing_on(&failing));
        let store = Arc::new(MemoryStore::new().failing_on(&failing));
        let mut log = RunLog::new("t", "test");
        let records = vec![
            record("https://x/doc1", "Conservation", true),
            record("https://x/bad", "Conservation", true),
        ];

        let report = coordinator(&index, &store)
            .persist_categorizations(TargetType::Mandate, &records, &mut log)
            .await
            .unwrap();

        assert_eq!(report.relational, BatchOutcome::new(1, 1));
        assert_eq!(report.index, BatchOutcome::new(1, 1));
        assert_eq!(report.failed(), 2);
    }

    #[tokio::test]
    async fn miscellaneous_is_not_projected() {
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryStore::new());
        let mut log = RunLog::new("t", "test");
        let d1 = doc("https://x/doc1", "t", vec![1.0], "Report");
        let d2 = doc("https://x/doc2", "t", vec![1.0], "Report");
        let topics = vec![DerivedTopic {
            topic_name: "Reef Health".into(),
            representation: vec!["reef".into(), "coral".into()],
            representative_docs: vec![],
        }];
        let assignments = vec![
            DocumentTopicAssignment::new(&d1, "Reef Health", 0.8),
            DocumentTopicAssignment::new(&d2, MISCELLANEOUS, 0.9),
        ];

        let report = coordinator(&index, &store)
            .persist_topics(&topics, &assignments, &mut log)
            .await
            .unwrap();

        assert_eq!(report.relational, BatchOutcome::new(3, 0));
        assert_eq!(
            index.field(&d1.document_id, CategorizationField::DerivedTopic),
            Some(vec!["Reef Health".to_string()])
        );
        assert_eq!(
            index.field(&d2.document_id, CategorizationField::DerivedTopic),
            Some(vec![])
        );
    }

    #[tokio::test]
    async fn reproject_rewrites_every_field_from_stored_rows() {
        let store = Arc::new(MemoryStore::new());
        let records = vec![record("https://x/doc1", "Conservation", true)];
        store.upsert_categorizations(&records).await.unwrap();
        let index = Arc::new(MemoryIndex::new());
        let mut log = RunLog::new("t", "html_only");

        let report = coordinator(&index, &store)
            .reproject(&[records[0].document_id.clone()], &mut log)
            .await
            .unwrap();

        assert_eq!(report.index, BatchOutcome::new(3, 0));
        assert_eq!(report.relational, BatchOutcome::default());
        assert_eq!(
            index.field(&records[0].document_id, CategorizationField::Mandate),
            Some(vec!["Conservation".to_string()])
        );
        assert_eq!(
            index.field(&records[0].document_id, CategorizationField::Topic),
            Some(vec![])
        );
    }
}
