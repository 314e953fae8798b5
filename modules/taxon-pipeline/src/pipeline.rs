//! One run of the categorization pipeline.
//!
//! | mode          | stages                                                   |
//! |---------------|----------------------------------------------------------|
//! | `full_update` | mandate + topic categorization, then derived topics      |
//! | `topics_only` | derived topics                                           |
//! | `html_only`   | re-project stored rows into the search index             |
//!
//! Every run owns one [`RunLog`]; it is persisted at the end whether the run
//! succeeded or not.

use std::sync::Arc;

use ai_client::LanguageModel;
use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use taxon_categorize::{
    build_retriever, CategorizeStats, Categorizer, RetrievalSettings, StructuredClassifier,
};
use taxon_common::{
    Config, Document, DocumentSource, IndexWriter, IngestionLog, NeighborSearch, PipelineMode,
    RelationalStore, RunLog, SimilarityBackend, TargetSource, TargetType, TopicModellingMode,
};
use taxon_store::{PersistReport, UpsertCoordinator};
use taxon_topics::{ModelStore, TopicEngine, TopicLabeler, TopicSettings, TopicStats};

/// Everything a run reads from or writes to.
pub struct Collaborators {
    pub documents: Arc<dyn DocumentSource>,
    pub targets: Arc<dyn TargetSource>,
    pub neighbors: Arc<dyn NeighborSearch>,
    pub index: Arc<dyn IndexWriter>,
    pub store: Arc<dyn RelationalStore>,
    pub ingestion: Arc<dyn IngestionLog>,
    pub models: Arc<dyn ModelStore>,
    pub llm: Arc<dyn LanguageModel>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub similarity_backend: SimilarityBackend,
    pub retrieval: RetrievalSettings,
    pub repair_attempts: usize,
    pub topic_mode: TopicModellingMode,
    pub topics: TopicSettings,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            similarity_backend: config.similarity_backend,
            retrieval: RetrievalSettings::from_config(config),
            repair_attempts: config.repair_attempts,
            topic_mode: config.topic_modelling_mode,
            topics: TopicSettings::from_config(config),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            similarity_backend: SimilarityBackend::BatchMatrix,
            retrieval: RetrievalSettings::default(),
            repair_attempts: 3,
            topic_mode: TopicModellingMode::Predict,
            topics: TopicSettings::default(),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub documents: usize,
    pub mandates: Option<CategorizeStats>,
    pub topics: Option<CategorizeStats>,
    pub derived_topics: Option<TopicStats>,
    pub relational_written: usize,
    pub relational_failed: usize,
    pub index_written: usize,
    pub index_failed: usize,
}

impl RunStats {
    fn add(&mut self, report: PersistReport) {
        self.relational_written += report.relational.succeeded;
        self.relational_failed += report.relational.failed;
        self.index_written += report.index.succeeded;
        self.index_failed += report.index.failed;
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub stats: RunStats,
    pub log: RunLog,
}

pub struct Pipeline {
    documents: Arc<dyn DocumentSource>,
    targets: Arc<dyn TargetSource>,
    store: Arc<dyn RelationalStore>,
    categorizer: Categorizer,
    topics: TopicEngine,
    coordinator: UpsertCoordinator,
    topic_mode: TopicModellingMode,
}

impl Pipeline {
    pub fn new(deps: Collaborators, settings: PipelineSettings) -> Self {
        let retriever = build_retriever(
            settings.similarity_backend,
            settings.retrieval,
            deps.neighbors.clone(),
        );
        let classifier = StructuredClassifier::new(deps.llm.clone(), settings.repair_attempts);
        let topics = TopicEngine::new(
            deps.store.clone(),
            deps.ingestion.clone(),
            deps.models.clone(),
            TopicLabeler::new(deps.llm.clone()),
            settings.topics,
        );

        Self {
            documents: deps.documents,
            targets: deps.targets,
            store: deps.store.clone(),
            categorizer: Categorizer::new(retriever, classifier),
            topics,
            coordinator: UpsertCoordinator::new(deps.index, deps.store),
            topic_mode: settings.topic_mode,
        }
    }

    pub async fn run(&self, mode: PipelineMode) -> Result<RunReport> {
        let mut log = RunLog::start(mode.as_str());
        info!(run_id = %log.run_id, mode = mode.as_str(), "Run started");

        let mut stats = RunStats::default();
        let result = self.execute(mode, &mut stats, &mut log).await;

        if let Err(e) = self.store.record_run(&log).await {
            warn!(run_id = %log.run_id, error = %e, "Failed to record run log");
        }

        match result {
            Ok(()) => {
                info!(
                    run_id = %log.run_id,
                    documents = stats.documents,
                    relational_written = stats.relational_written,
                    relational_failed = stats.relational_failed,
                    index_written = stats.index_written,
                    index_failed = stats.index_failed,
                    "Run finished"
                );
                Ok(RunReport { stats, log })
            }
            Err(e) => {
                error!(run_id = %log.run_id, error = %e, "Run aborted");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        mode: PipelineMode,
        stats: &mut RunStats,
        log: &mut RunLog,
    ) -> Result<()> {
        let documents = self.documents.documents().await?;
        stats.documents = documents.len();

        match mode {
            PipelineMode::FullUpdate => {
                let mandates = self.categorize(TargetType::Mandate, &documents, stats, log).await?;
                stats.mandates = Some(mandates);
                let topics = self.categorize(TargetType::Topic, &documents, stats, log).await?;
                stats.topics = Some(topics);
                let derived = self.derive_topics(&documents, stats, log).await?;
                stats.derived_topics = Some(derived);
            }
            PipelineMode::TopicsOnly => {
                let derived = self.derive_topics(&documents, stats, log).await?;
                stats.derived_topics = Some(derived);
            }
            PipelineMode::HtmlOnly => {
                let ids: Vec<String> = documents.iter().map(|d| d.document_id.clone()).collect();
                let report = self.coordinator.reproject(&ids, log).await?;
                stats.add(report);
            }
        }
        Ok(())
    }

    async fn categorize(
        &self,
        target_type: TargetType,
        documents: &[Document],
        stats: &mut RunStats,
        log: &mut RunLog,
    ) -> Result<CategorizeStats> {
        let catalog = self.targets.catalog(target_type).await?;
        let outcome = self.categorizer.categorize(documents, &catalog, log).await?;
        info!(
            %target_type,
            classified = outcome.stats.classified,
            skipped = outcome.stats.skipped,
            accepted = outcome.stats.accepted,
            "Categorization complete"
        );

        let report = self
            .coordinator
            .persist_categorizations(target_type, &outcome.records, log)
            .await?;
        stats.add(report);
        Ok(outcome.stats)
    }

    async fn derive_topics(
        &self,
        documents: &[Document],
        stats: &mut RunStats,
        log: &mut RunLog,
    ) -> Result<TopicStats> {
        let outcome = match self.topic_mode {
            TopicModellingMode::Retrain => self.topics.retrain(documents, log).await?,
            TopicModellingMode::Predict => self.topics.predict(documents, log).await?,
        };

        let report = self
            .coordinator
            .persist_topics(&outcome.topics, &outcome.assignments, log)
            .await?;
        stats.add(report);
        self.topics.mark_processed(&outcome).await?;

        info!(
            mode = self.topic_mode.as_str(),
            topics = outcome.topics.len(),
            assignments = outcome.assignments.len(),
            "Derived topics complete"
        );
        Ok(outcome.stats)
    }
}
