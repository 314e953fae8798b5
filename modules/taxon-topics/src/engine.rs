//! Derived-topic discovery.
//!
//! `retrain` rebuilds everything from scratch:
//!
//! 1. purge persisted derived topics and assignments
//! 2. fit the primary model on every document except the excluded type
//! 3. fit a secondary model on the primary outliers, if there are enough
//! 4. label excluded-type documents by inference against both models
//! 5. check that every input document was placed exactly once
//! 6. name every cluster with the LLM
//! 7. hand back topics and assignments, save the models
//!
//! `predict` loads the saved models, infers topics for documents the
//! ingestion log has not seen and maps clusters back to persisted names by
//! keyword signature. It never creates or renames topics; a cluster whose
//! signature matches nothing is filed under "Miscellaneous".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use ai_client::truncate_to_char_boundary;
use taxon_common::{
    keyword_signature, Config, DerivedTopic, Document, DocumentTopicAssignment, EventKind,
    IngestionLog, RelationalStore, RunLog, TaxonError, MISCELLANEOUS,
};

use crate::artifacts::{ModelSlot, ModelStore};
use crate::identity::IdentityResolver;
use crate::keywords::{class_keywords, TOP_KEYWORDS};
use crate::labeler::{LabelBook, TopicLabeler};
use crate::model::{ModelSettings, TopicModel};

const MISC_REPRESENTATIVE_DOCS: usize = 3;
const MISC_DOC_BYTES: usize = 600;

#[derive(Debug, Clone, PartialEq)]
pub struct TopicSettings {
    /// Document type kept out of training and labelled by inference only.
    pub excluded_document_type: String,
    /// Fewer primary outliers than this skips the secondary model.
    pub min_outlier_cluster_size: usize,
    pub model: ModelSettings,
}

impl TopicSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            excluded_document_type: config.excluded_document_type.clone(),
            min_outlier_cluster_size: config.min_outlier_cluster_size,
            model: ModelSettings {
                cluster_count: config.topic_cluster_count,
                min_cluster_size: config.topic_min_cluster_size,
                min_similarity: config.topic_min_similarity,
                ..ModelSettings::default()
            },
        }
    }
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            excluded_document_type: "Proceedings".into(),
            min_outlier_cluster_size: 100,
            model: ModelSettings::default(),
        }
    }
}

/// Where a document landed. Ids are only meaningful within their model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterRef {
    Primary(i32),
    Secondary(i32),
    Unclustered,
}

#[derive(Debug, Clone, Copy)]
struct Placement<'a> {
    document: &'a Document,
    cluster: ClusterRef,
    confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopicStats {
    pub documents: usize,
    pub primary_topics: usize,
    pub secondary_topics: usize,
    pub primary_outliers: usize,
    pub outliers_reassigned: usize,
    pub excluded_labeled: usize,
    pub unclustered: usize,
    pub labels_generated: usize,
    pub unresolved_clusters: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TopicRunOutcome {
    /// Catalog rows to insert. Always empty after `predict`.
    pub topics: Vec<DerivedTopic>,
    pub assignments: Vec<DocumentTopicAssignment>,
    /// Documents to mark in the ingestion log once persisted.
    pub processed: Vec<String>,
    pub stats: TopicStats,
}

pub struct TopicEngine {
    store: Arc<dyn RelationalStore>,
    ingestion: Arc<dyn IngestionLog>,
    models: Arc<dyn ModelStore>,
    labeler: TopicLabeler,
    settings: TopicSettings,
}

impl TopicEngine {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        ingestion: Arc<dyn IngestionLog>,
        models: Arc<dyn ModelStore>,
        labeler: TopicLabeler,
        settings: TopicSettings,
    ) -> Self {
        Self {
            store,
            ingestion,
            models,
            labeler,
            settings,
        }
    }

    // -----------------------------------------------------------------------
    // Retrain
    // -----------------------------------------------------------------------

    /// Full refit. Purges persisted topics first; concurrent retrains against
    /// the same store must be serialized by the caller.
    pub async fn retrain(
        &self,
        documents: &[Document],
        log: &mut RunLog,
    ) -> Result<TopicRunOutcome> {
        let mut stats = TopicStats {
            documents: documents.len(),
            ..TopicStats::default()
        };

        self.store.purge_derived_topics().await?;
        stage(log, "purge_persisted", 0, "derived topics and assignments deleted");

        let (excluded, regular): (Vec<&Document>, Vec<&Document>) = documents
            .iter()
            .partition(|d| d.is_type(&self.settings.excluded_document_type));

        // Primary
        let (primary, primary_members) = TopicModel::fit(&regular, self.settings.model);
        stats.primary_topics = primary.topics.len();

        let mut placements: Vec<Placement> = Vec::with_capacity(documents.len());
        let mut outliers: Vec<&Document> = Vec::new();
        for (&document, membership) in regular.iter().zip(&primary_members) {
            if membership.is_outlier() {
                outliers.push(document);
            } else {
                placements.push(Placement {
                    document,
                    cluster: ClusterRef::Primary(membership.topic),
                    confidence: membership.confidence(),
                });
            }
        }
        let primary_placed = placements.len();
        stats.primary_outliers = outliers.len();
        stage(
            log,
            "train_primary",
            regular.len(),
            &format!("{} topics, {} outliers", primary.topics.len(), outliers.len()),
        );

        // Outliers
        let secondary = if outliers.len() < self.settings.min_outlier_cluster_size {
            stage(
                log,
                "handle_outliers",
                outliers.len(),
                &format!(
                    "below minimum of {}, labelled {MISCELLANEOUS}",
                    self.settings.min_outlier_cluster_size
                ),
            );
            placements.extend(outliers.iter().map(|&document| Placement {
                document,
                cluster: ClusterRef::Unclustered,
                confidence: 0.0,
            }));
            None
        } else {
            let (model, members) = TopicModel::fit(&outliers, self.settings.model);
            for (&document, membership) in outliers.iter().zip(&members) {
                placements.push(if membership.is_outlier() {
                    Placement {
                        document,
                        cluster: ClusterRef::Unclustered,
                        confidence: 0.0,
                    }
                } else {
                    stats.outliers_reassigned += 1;
                    Placement {
                        document,
                        cluster: ClusterRef::Secondary(membership.topic),
                        confidence: membership.confidence(),
                    }
                });
            }
            stage(
                log,
                "handle_outliers",
                outliers.len(),
                &format!(
                    "secondary model: {} topics, {} reassigned",
                    model.topics.len(),
                    stats.outliers_reassigned
                ),
            );
            (!model.is_empty()).then_some(model)
        };
        stats.secondary_topics = secondary.as_ref().map_or(0, |m| m.topics.len());

        // Excluded type
        let excluded_placements = place_by_inference(&excluded, &primary, secondary.as_ref());
        stats.excluded_labeled = excluded_placements.len();
        stage(
            log,
            "label_excluded_type",
            excluded.len(),
            &self.settings.excluded_document_type,
        );
        placements.extend(excluded_placements);

        // Partition
        let primary_outlier_count = primary_members.iter().filter(|m| m.is_outlier()).count();
        if outliers.len() != primary_outlier_count {
            return Err(TaxonError::Invariant(format!(
                "{} outliers collected but primary model reported {}",
                outliers.len(),
                primary_outlier_count
            ))
            .into());
        }
        let placed = primary_placed + outliers.len() + stats.excluded_labeled;
        if placed != documents.len() || placements.len() != documents.len() {
            return Err(TaxonError::Invariant(format!(
                "{} documents in, {} placed ({} primary + {} outliers + {} excluded type)",
                documents.len(),
                placements.len(),
                primary_placed,
                outliers.len(),
                stats.excluded_labeled
            ))
            .into());
        }
        stage(log, "combine", placements.len(), "partition complete");

        // Names
        let mut book = LabelBook::new();
        let mut names: HashMap<ClusterRef, String> = HashMap::new();
        let mut topics: Vec<DerivedTopic> = Vec::new();
        let models = [
            (ModelSlot::Primary, Some(&primary)),
            (ModelSlot::Secondary, secondary.as_ref()),
        ];
        for (slot, model) in models {
            let Some(model) = model else { continue };
            for cluster in &model.topics {
                let name = book.claim(&self.labeler.label(slot.as_str(), cluster, log).await);
                log.log(EventKind::TopicLabeled {
                    model: slot.as_str().to_string(),
                    topic_id: cluster.id,
                    topic_name: name.clone(),
                });
                let key = match slot {
                    ModelSlot::Primary => ClusterRef::Primary(cluster.id),
                    ModelSlot::Secondary => ClusterRef::Secondary(cluster.id),
                };
                names.insert(key, name.clone());
                topics.push(DerivedTopic {
                    topic_name: name,
                    representation: cluster.representation.clone(),
                    representative_docs: cluster.representative_docs.clone(),
                });
            }
        }
        stats.labels_generated = topics.len();

        let unclustered: Vec<&Document> = placements
            .iter()
            .filter(|p| p.cluster == ClusterRef::Unclustered)
            .map(|p| p.document)
            .collect();
        stats.unclustered = unclustered.len();
        if !unclustered.is_empty() {
            topics.push(miscellaneous_topic(&placements, &unclustered));
        }

        let assignments = placements
            .iter()
            .map(|p| {
                let name = names.get(&p.cluster).map_or(MISCELLANEOUS, String::as_str);
                DocumentTopicAssignment::new(p.document, name, p.confidence)
            })
            .collect();

        self.models.save(ModelSlot::Primary, &primary).await?;
        match &secondary {
            Some(model) => self.models.save(ModelSlot::Secondary, model).await?,
            None => self.models.remove(ModelSlot::Secondary).await?,
        }

        info!(stats = ?stats, "Topic retrain complete");
        Ok(TopicRunOutcome {
            topics,
            assignments,
            processed: documents.iter().map(|d| d.document_id.clone()).collect(),
            stats,
        })
    }

    // -----------------------------------------------------------------------
    // Predict
    // -----------------------------------------------------------------------

    pub async fn predict(
        &self,
        documents: &[Document],
        log: &mut RunLog,
    ) -> Result<TopicRunOutcome> {
        let primary = self
            .models
            .load(ModelSlot::Primary)
            .await
            .map_err(model_error)?
            .ok_or_else(|| {
                TaxonError::Model("no primary topic model saved; run retrain first".into())
            })?;
        let secondary = self
            .models
            .load(ModelSlot::Secondary)
            .await
            .map_err(model_error)?
            .filter(|m| !m.is_empty());
        stage(
            log,
            "load_models",
            0,
            &format!(
                "primary {} topics, secondary {}",
                primary.topics.len(),
                secondary
                    .as_ref()
                    .map_or("absent".to_string(), |m| format!("{} topics", m.topics.len()))
            ),
        );

        let ids: Vec<String> = documents.iter().map(|d| d.document_id.clone()).collect();
        let unprocessed = self.ingestion.unprocessed(&ids).await?;
        let fresh: Vec<&Document> = documents
            .iter()
            .filter(|d| unprocessed.contains(&d.document_id))
            .collect();
        stage(
            log,
            "select_new_documents",
            fresh.len(),
            &format!("{} already processed", documents.len() - fresh.len()),
        );

        let mut stats = TopicStats {
            documents: fresh.len(),
            primary_topics: primary.topics.len(),
            secondary_topics: secondary.as_ref().map_or(0, |m| m.topics.len()),
            ..TopicStats::default()
        };
        if fresh.is_empty() {
            info!("No new documents for topic prediction");
            return Ok(TopicRunOutcome {
                stats,
                ..TopicRunOutcome::default()
            });
        }

        let (excluded, regular): (Vec<&Document>, Vec<&Document>) = fresh
            .iter()
            .copied()
            .partition(|d| d.is_type(&self.settings.excluded_document_type));

        let mut placements = place_by_inference(&regular, &primary, secondary.as_ref());
        stats.primary_outliers = placements
            .iter()
            .filter(|p| !matches!(p.cluster, ClusterRef::Primary(_)))
            .count();
        stats.outliers_reassigned = placements
            .iter()
            .filter(|p| matches!(p.cluster, ClusterRef::Secondary(_)))
            .count();
        stage(log, "infer", regular.len(), &format!("{} primary outliers", stats.primary_outliers));

        let excluded_placements = place_by_inference(&excluded, &primary, secondary.as_ref());
        stats.excluded_labeled = excluded_placements.len();
        stage(
            log,
            "label_excluded_type",
            excluded.len(),
            &self.settings.excluded_document_type,
        );
        placements.extend(excluded_placements);

        // Identity
        let persisted = self.store.derived_topics().await?;
        let resolver = IdentityResolver::new(&persisted);
        let mut resolved: HashMap<ClusterRef, Option<String>> = HashMap::new();
        for placement in &placements {
            if placement.cluster == ClusterRef::Unclustered
                || resolved.contains_key(&placement.cluster)
            {
                continue;
            }
            let (slot, cluster) = match placement.cluster {
                ClusterRef::Primary(id) => (ModelSlot::Primary, primary.topic(id)),
                ClusterRef::Secondary(id) => (
                    ModelSlot::Secondary,
                    secondary.as_ref().and_then(|m| m.topic(id)),
                ),
                ClusterRef::Unclustered => continue,
            };
            let name = cluster.and_then(|c| resolver.resolve(c)).map(str::to_string);
            if name.is_none() {
                let members = placements.iter().filter(|p| p.cluster == placement.cluster).count();
                let signature = cluster
                    .map(|c| keyword_signature(&c.representation))
                    .unwrap_or_default();
                let topic_id = match placement.cluster {
                    ClusterRef::Primary(id) | ClusterRef::Secondary(id) => id,
                    ClusterRef::Unclustered => continue,
                };
                warn!(
                    error = %TaxonError::IdentityUnresolved(signature.clone()),
                    model = slot.as_str(),
                    topic_id,
                    documents = members,
                    "Filing cluster under {MISCELLANEOUS}"
                );
                log.log(EventKind::IdentityUnresolved {
                    model: slot.as_str().to_string(),
                    topic_id,
                    signature,
                    documents: members,
                });
                stats.unresolved_clusters += 1;
            }
            resolved.insert(placement.cluster, name);
        }
        stage(
            log,
            "resolve_topic_identity",
            placements.len(),
            &format!(
                "{} clusters, {} unresolved",
                resolved.len(),
                stats.unresolved_clusters
            ),
        );

        let assignments: Vec<DocumentTopicAssignment> = placements
            .iter()
            .map(|p| match resolved.get(&p.cluster).and_then(|n| n.as_deref()) {
                Some(name) => DocumentTopicAssignment::new(p.document, name, p.confidence),
                None => DocumentTopicAssignment::new(p.document, MISCELLANEOUS, 0.0),
            })
            .collect();
        stats.unclustered = assignments
            .iter()
            .filter(|a| a.topic_name == MISCELLANEOUS)
            .count();

        info!(stats = ?stats, "Topic prediction complete");
        Ok(TopicRunOutcome {
            topics: Vec::new(),
            assignments,
            processed: fresh.iter().map(|d| d.document_id.clone()).collect(),
            stats,
        })
    }

    /// Record documents as seen by the derived-topic path. Call only after
    /// the outcome has been persisted.
    pub async fn mark_processed(&self, outcome: &TopicRunOutcome) -> Result<()> {
        if outcome.processed.is_empty() {
            return Ok(());
        }
        self.ingestion.mark_processed(&outcome.processed).await
    }
}

fn stage(log: &mut RunLog, stage: &str, documents: usize, detail: &str) {
    info!(stage, documents, detail, "Topic stage");
    log.log(EventKind::TopicStage {
        stage: stage.to_string(),
        documents,
        detail: detail.to_string(),
    });
}

fn model_error(e: anyhow::Error) -> TaxonError {
    match e.downcast::<TaxonError>() {
        Ok(err @ TaxonError::Model(_)) => err,
        Ok(other) => TaxonError::Model(other.to_string()),
        Err(e) => TaxonError::Model(format!("{e:#}")),
    }
}

/// Primary inference, then secondary inference for the primary outliers.
fn place_by_inference<'a>(
    documents: &[&'a Document],
    primary: &TopicModel,
    secondary: Option<&TopicModel>,
) -> Vec<Placement<'a>> {
    let primary_members = primary.infer(documents);
    let mut placements = Vec::with_capacity(documents.len());
    let mut outliers = Vec::new();
    for (&document, membership) in documents.iter().zip(&primary_members) {
        if membership.is_outlier() {
            outliers.push(document);
        } else {
            placements.push(Placement {
                document,
                cluster: ClusterRef::Primary(membership.topic),
                confidence: membership.confidence(),
            });
        }
    }

    let secondary_members = match secondary {
        Some(model) => model.infer(&outliers),
        None => Vec::new(),
    };
    for (i, document) in outliers.into_iter().enumerate() {
        placements.push(match secondary_members.get(i) {
            Some(m) if !m.is_outlier() => Placement {
                document,
                cluster: ClusterRef::Secondary(m.topic),
                confidence: m.confidence(),
            },
            _ => Placement {
                document,
                cluster: ClusterRef::Unclustered,
                confidence: 0.0,
            },
        });
    }
    placements
}

/// Catalog row for the outlier bucket: keywords that set the unclustered
/// documents apart from the clustered ones.
fn miscellaneous_topic(placements: &[Placement], unclustered: &[&Document]) -> DerivedTopic {
    let unclustered_ids: HashSet<&str> = unclustered.iter().map(|d| d.document_id.as_str()).collect();
    let clustered: Vec<&str> = placements
        .iter()
        .filter(|p| !unclustered_ids.contains(p.document.document_id.as_str()))
        .map(|p| p.document.text.as_str())
        .collect();
    let outlying: Vec<&str> = unclustered.iter().map(|d| d.text.as_str()).collect();
    let representation = class_keywords(&[clustered, outlying], TOP_KEYWORDS)
        .pop()
        .unwrap_or_default();

    DerivedTopic {
        topic_name: MISCELLANEOUS.to_string(),
        representation,
        representative_docs: unclustered
            .iter()
            .take(MISC_REPRESENTATIVE_DOCS)
            .map(|d| truncate_to_char_boundary(d.text.trim(), MISC_DOC_BYTES).to_string())
            .collect(),
    }
}
