use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use taxon_common::{
    CategorizationRecord, Document, EventKind, RunLog, Target, TargetCatalog,
};

use crate::classifier::{assemble_records, StructuredClassifier};
use crate::retriever::CandidateRetriever;

/// Per-run counters for one target type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategorizeStats {
    pub documents: usize,
    pub ranked: usize,
    pub classified: usize,
    pub skipped: usize,
    pub records: usize,
    pub accepted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CategorizationOutcome {
    pub records: Vec<CategorizationRecord>,
    pub stats: CategorizeStats,
}

/// Retrieval followed by one LLM judgment per document, in document order.
///
/// Calls are sequential so the LLM provider's rate limit is the only
/// throttle; a failed document never stops the batch.
pub struct Categorizer {
    retriever: Box<dyn CandidateRetriever>,
    classifier: StructuredClassifier,
}

impl Categorizer {
    pub fn new(retriever: Box<dyn CandidateRetriever>, classifier: StructuredClassifier) -> Self {
        Self {
            retriever,
            classifier,
        }
    }

    pub async fn categorize(
        &self,
        documents: &[Document],
        catalog: &TargetCatalog,
        log: &mut RunLog,
    ) -> Result<CategorizationOutcome> {
        let target_type = catalog.target_type;
        let mut outcome = CategorizationOutcome::default();
        outcome.stats.documents = documents.len();

        if catalog.is_empty() {
            warn!(%target_type, "Empty target catalog, nothing to categorize");
            return Ok(outcome);
        }

        let ranked = self.retriever.rank(documents, catalog, log).await?;
        outcome.stats.ranked = ranked.len();

        let by_id: HashMap<&str, &Document> = documents
            .iter()
            .map(|d| (d.document_id.as_str(), d))
            .collect();

        for candidates in &ranked {
            let Some(document) = by_id.get(candidates.document_id.as_str()) else {
                continue;
            };

            let targets: Vec<&Target> = candidates
                .names()
                .into_iter()
                .filter_map(|name| catalog.get(name))
                .collect();
            if targets.is_empty() {
                log.log(EventKind::ClassificationSkipped {
                    document_id: document.document_id.clone(),
                    target_type: target_type.to_string(),
                    reason: "no candidates".into(),
                });
                outcome.stats.skipped += 1;
                continue;
            }

            let Some(judgments) = self
                .classifier
                .classify(document, &targets, target_type, log)
                .await
            else {
                outcome.stats.skipped += 1;
                continue;
            };

            let records = assemble_records(document, &judgments, candidates, catalog, log);
            let accepted = records.iter().filter(|r| r.llm_belongs).count();
            log.log(EventKind::DocumentClassified {
                document_id: document.document_id.clone(),
                target_type: target_type.to_string(),
                accepted,
                rejected: records.len() - accepted,
            });

            outcome.stats.classified += 1;
            outcome.stats.accepted += accepted;
            outcome.records.extend(records);
        }

        outcome.stats.records = outcome.records.len();
        info!(%target_type, stats = ?outcome.stats, "Categorization complete");
        Ok(outcome)
    }
}
