//! Candidate retrieval: which targets are worth asking the LLM about.
//!
//! Two interchangeable backends rank targets for each document:
//!
//! - [`BatchMatrixRetriever`] scores every document against every target
//!   variant in one pass over the in-memory catalog.
//! - [`NeighborIndexRetriever`] asks the live k-NN index per document.
//!
//! Both return the same shape: per document, the top-N target names with a
//! score, best first, aggregated as the maximum over each target's variants.
//! The backend is picked once from configuration by [`build_retriever`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tracing::{debug, info};

use taxon_common::vector::{dot, normalized};
use taxon_common::{
    Config, Document, DocumentCandidates, EventKind, NeighborSearch, RunLog, ScoreTransform,
    ScoredCandidate, SimilarityBackend, TargetCatalog, TaxonError,
};

#[async_trait]
pub trait CandidateRetriever: Send + Sync {
    /// Documents without an embedding are left out of the result.
    async fn rank(
        &self,
        documents: &[Document],
        catalog: &TargetCatalog,
        log: &mut RunLog,
    ) -> Result<Vec<DocumentCandidates>>;

    fn backend(&self) -> SimilarityBackend;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalSettings {
    pub candidate_count: usize,
    /// Candidates scoring below this (after the transform) are dropped.
    pub similarity_threshold: f64,
    pub transform: ScoreTransform,
}

impl RetrievalSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            candidate_count: config.candidate_count,
            similarity_threshold: config.similarity_threshold,
            transform: config.score_transform,
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            candidate_count: 7,
            similarity_threshold: 0.0,
            transform: ScoreTransform::Identity,
        }
    }
}

pub fn build_retriever(
    backend: SimilarityBackend,
    settings: RetrievalSettings,
    search: Arc<dyn NeighborSearch>,
) -> Box<dyn CandidateRetriever> {
    match backend {
        SimilarityBackend::BatchMatrix => Box::new(BatchMatrixRetriever::new(settings)),
        SimilarityBackend::NearestNeighborIndex => {
            Box::new(NeighborIndexRetriever::new(settings, search))
        }
    }
}

/// Keep the best `candidate_count` targets at or above the threshold.
///
/// `scores` is indexed by catalog position, so the stable sort leaves exact
/// ties in catalog order.
fn select_top(
    catalog: &TargetCatalog,
    scores: &[f64],
    settings: &RetrievalSettings,
) -> Vec<ScoredCandidate> {
    let mut ranked: Vec<(usize, f64)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| s.is_finite() && *s >= settings.similarity_threshold)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(settings.candidate_count);
    ranked
        .into_iter()
        .map(|(i, score)| ScoredCandidate {
            target_name: catalog.targets[i].name.clone(),
            score,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Batch matrix
// ---------------------------------------------------------------------------

pub struct BatchMatrixRetriever {
    settings: RetrievalSettings,
}

impl BatchMatrixRetriever {
    pub fn new(settings: RetrievalSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl CandidateRetriever for BatchMatrixRetriever {
    async fn rank(
        &self,
        documents: &[Document],
        catalog: &TargetCatalog,
        log: &mut RunLog,
    ) -> Result<Vec<DocumentCandidates>> {
        // (catalog position, unit variant embedding)
        let variants: Vec<(usize, Vec<f32>)> = catalog
            .targets
            .iter()
            .enumerate()
            .flat_map(|(i, t)| t.variants.iter().map(move |v| (i, normalized(&v.embedding))))
            .collect();

        let mut ranked = Vec::with_capacity(documents.len());
        let mut skipped = 0usize;
        for document in documents {
            let Some(embedding) = document.embedding.as_deref() else {
                skipped += 1;
                continue;
            };
            let unit = normalized(embedding);

            let mut best = vec![f64::NEG_INFINITY; catalog.len()];
            for (idx, variant) in &variants {
                if variant.len() != unit.len() {
                    return Err(TaxonError::Retrieval(format!(
                        "embedding dimension mismatch for document {}: {} vs {} in '{}'",
                        document.document_id,
                        unit.len(),
                        variant.len(),
                        catalog.targets[*idx].name
                    ))
                    .into());
                }
                let score = self.settings.transform.apply(dot(&unit, variant));
                if score > best[*idx] {
                    best[*idx] = score;
                }
            }

            ranked.push(DocumentCandidates {
                document_id: document.document_id.clone(),
                candidates: select_top(catalog, &best, &self.settings),
            });
        }

        info!(
            target_type = %catalog.target_type,
            documents = ranked.len(),
            variants = variants.len(),
            skipped_without_embedding = skipped,
            "Ranked candidates (batch matrix)"
        );
        log.log(EventKind::CandidatesRanked {
            target_type: catalog.target_type.to_string(),
            documents: ranked.len(),
            skipped_without_embedding: skipped,
        });

        Ok(ranked)
    }

    fn backend(&self) -> SimilarityBackend {
        SimilarityBackend::BatchMatrix
    }
}

// ---------------------------------------------------------------------------
// Nearest-neighbor index
// ---------------------------------------------------------------------------

/// k-NN queries in flight at once.
const QUERY_CONCURRENCY: usize = 8;

pub struct NeighborIndexRetriever {
    settings: RetrievalSettings,
    search: Arc<dyn NeighborSearch>,
}

impl NeighborIndexRetriever {
    pub fn new(settings: RetrievalSettings, search: Arc<dyn NeighborSearch>) -> Self {
        Self { settings, search }
    }
}

#[async_trait]
impl CandidateRetriever for NeighborIndexRetriever {
    async fn rank(
        &self,
        documents: &[Document],
        catalog: &TargetCatalog,
        log: &mut RunLog,
    ) -> Result<Vec<DocumentCandidates>> {
        // Every variant is fetched so the per-name maximum matches the batch backend.
        let k = catalog
            .targets
            .iter()
            .map(|t| t.variants.len())
            .sum::<usize>()
            .max(1);
        let position: HashMap<&str, usize> = catalog
            .targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        let embedded: Vec<(&Document, &[f32])> = documents
            .iter()
            .filter_map(|d| d.embedding.as_deref().map(|e| (d, e)))
            .collect();
        let skipped = documents.len() - embedded.len();

        // Queries overlap, results stay in document order.
        let queries: Vec<_> = embedded
            .into_iter()
            .map(|(document, embedding)| {
                async move {
                    let hits = self
                        .search
                        .nearest_targets(catalog.target_type, embedding, k)
                        .await;
                    (document, hits)
                }
                .boxed()
            })
            .collect();
        let responses: Vec<_> = stream::iter(queries)
        .buffered(QUERY_CONCURRENCY)
        .collect()
        .await;

        let mut ranked = Vec::with_capacity(responses.len());
        for (document, hits) in responses {
            let hits = hits.map_err(|e| {
                TaxonError::Retrieval(format!(
                    "k-NN query failed for document {}: {e:#}",
                    document.document_id
                ))
            })?;

            let mut best = vec![f64::NEG_INFINITY; catalog.len()];
            for hit in hits {
                let Some(&idx) = position.get(hit.target_name.as_str()) else {
                    debug!(target_name = %hit.target_name, "k-NN hit outside catalog, ignoring");
                    continue;
                };
                let cosine = 2.0 * hit.score - 1.0;
                let score = self.settings.transform.apply(cosine);
                if score > best[idx] {
                    best[idx] = score;
                }
            }

            ranked.push(DocumentCandidates {
                document_id: document.document_id.clone(),
                candidates: select_top(catalog, &best, &self.settings),
            });
        }

        info!(
            target_type = %catalog.target_type,
            documents = ranked.len(),
            k,
            skipped_without_embedding = skipped,
            "Ranked candidates (k-NN index)"
        );
        log.log(EventKind::CandidatesRanked {
            target_type: catalog.target_type.to_string(),
            documents: ranked.len(),
            skipped_without_embedding: skipped,
        });

        Ok(ranked)
    }

    fn backend(&self) -> SimilarityBackend {
        SimilarityBackend::NearestNeighborIndex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxon_common::testing::{doc, target, MemoryIndex};
    use taxon_common::TargetType;

    fn catalog() -> TargetCatalog {
        TargetCatalog::new(
            TargetType::Mandate,
            vec![
                target(
                    "Conservation",
                    TargetType::Mandate,
                    vec![("habitats", vec![1.0, 0.0, 0.0]), ("species", vec![0.6, 0.8, 0.0])],
                ),
                target("Fisheries", TargetType::Mandate, vec![("stocks", vec![0.0, 1.0, 0.0])]),
                target("Shipping", TargetType::Mandate, vec![("vessels", vec![0.0, 0.0, 1.0])]),
            ],
        )
    }

    fn settings(candidate_count: usize) -> RetrievalSettings {
        RetrievalSettings {
            candidate_count,
            ..RetrievalSettings::default()
        }
    }

    #[tokio::test]
    async fn takes_max_variant_score_per_name() {
        let retriever = BatchMatrixRetriever::new(settings(3));
        let documents = vec![doc("https://x/a", "a", vec![0.0, 2.0, 0.0], "Report")];
        let mut log = RunLog::new("t", "test");

        let ranked = retriever.rank(&documents, &catalog(), &mut log).await.unwrap();

        let c = &ranked[0];
        assert_eq!(c.names(), vec!["Fisheries", "Conservation", "Shipping"]);
        // Conservation is represented by its "species" variant, not "habitats".
        assert!((c.score_for("Conservation").unwrap() - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn batch_scores_go_through_the_transform() {
        let retriever = BatchMatrixRetriever::new(RetrievalSettings {
            candidate_count: 3,
            similarity_threshold: 0.0,
            transform: ScoreTransform::Linear,
        });
        let documents = vec![doc("https://x/a", "a", vec![0.0, 2.0, 0.0], "Report")];
        let mut log = RunLog::new("t", "test");

        let ranked = retriever.rank(&documents, &catalog(), &mut log).await.unwrap();

        let c = &ranked[0];
        assert!((c.score_for("Fisheries").unwrap() - 1.0).abs() < 1e-6);
        assert!((c.score_for("Conservation").unwrap() - 0.9).abs() < 1e-6);
        assert!((c.score_for("Shipping").unwrap() - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn truncates_to_candidate_count() {
        let retriever = BatchMatrixRetriever::new(settings(1));
        let documents = vec![doc("https://x/a", "a", vec![0.1, 0.0, 0.9], "Report")];
        let mut log = RunLog::new("t", "test");

        let ranked = retriever.rank(&documents, &catalog(), &mut log).await.unwrap();
        assert_eq!(ranked[0].names(), vec!["Shipping"]);
    }

    #[tokio::test]
    async fn threshold_drops_weak_candidates() {
        let retriever = BatchMatrixRetriever::new(RetrievalSettings {
            candidate_count: 7,
            similarity_threshold: 0.5,
            transform: ScoreTransform::Identity,
        });
        let documents = vec![doc("https://x/a", "a", vec![1.0, 0.0, 0.0], "Report")];
        let mut log = RunLog::new("t", "test");

        let ranked = retriever.rank(&documents, &catalog(), &mut log).await.unwrap();
        assert_eq!(ranked[0].names(), vec!["Conservation"]);
    }

    #[tokio::test]
    async fn documents_without_embedding_are_excluded() {
        let retriever = BatchMatrixRetriever::new(settings(3));
        let documents = vec![
            doc("https://x/a", "a", vec![1.0, 0.0, 0.0], "Report"),
            Document::new("https://x/b", "b", None, "Report"),
        ];
        let mut log = RunLog::new("t", "test");

        let ranked = retriever.rank(&documents, &catalog(), &mut log).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].document_id, documents[0].document_id);
        assert_eq!(
            log.events()[0].kind,
            EventKind::CandidatesRanked {
                target_type: "mandate".into(),
                documents: 1,
                skipped_without_embedding: 1,
            }
        );
    }

    #[tokio::test]
    async fn dimension_mismatch_is_a_retrieval_error() {
        let retriever = BatchMatrixRetriever::new(settings(3));
        let documents = vec![doc("https://x/a", "a", vec![1.0, 0.0], "Report")];
        let mut log = RunLog::new("t", "test");

        let err = retriever.rank(&documents, &catalog(), &mut log).await.unwrap_err();
        let err = err.downcast_ref::<TaxonError>().unwrap();
        assert!(matches!(err, TaxonError::Retrieval(_)));
    }

    #[tokio::test]
    async fn backends_agree_on_ranking_and_scores() {
        let index = Arc::new(MemoryIndex::new().with_catalog(catalog()));
        let documents = vec![
            doc("https://x/a", "a", vec![0.2, 0.9, 0.1], "Report"),
            doc("https://x/b", "b", vec![0.7, 0.1, 0.5], "Report"),
        ];

        for transform in [ScoreTransform::Identity, ScoreTransform::Linear, ScoreTransform::Angular] {
            let settings = RetrievalSettings {
                candidate_count: 2,
                similarity_threshold: 0.0,
                transform,
            };
            let batch = build_retriever(SimilarityBackend::BatchMatrix, settings, index.clone());
            let knn = build_retriever(
                SimilarityBackend::NearestNeighborIndex,
                settings,
                index.clone(),
            );
            let mut log = RunLog::new("t", "test");

            let a = batch.rank(&documents, &catalog(), &mut log).await.unwrap();
            let b = knn.rank(&documents, &catalog(), &mut log).await.unwrap();

            for (x, y) in a.iter().zip(b.iter()) {
                assert_eq!(x.names(), y.names());
                for (cx, cy) in x.candidates.iter().zip(y.candidates.iter()) {
                    assert!((cx.score - cy.score).abs() < 1e-5);
                }
            }
        }
    }

    #[tokio::test]
    async fn unreachable_index_is_fatal() {
        let index = Arc::new(MemoryIndex::new().with_catalog(catalog()).unreachable());
        let retriever = NeighborIndexRetriever::new(settings(3), index);
        let documents = vec![doc("https://x/a", "a", vec![1.0, 0.0, 0.0], "Report")];
        let mut log = RunLog::new("t", "test");

        let err = retriever.rank(&documents, &catalog(), &mut log).await.unwrap_err();
        let err = err.downcast_ref::<TaxonError>().unwrap();
        assert!(err.is_fatal());
    }
}
