// Test doubles for the collaborator traits.
//
// - ScriptedModel (LanguageModel): queued replies, records every prompt
// - MemoryIndex (DocumentSource + TargetSource + NeighborSearch + IndexWriter)
// - MemoryStore (RelationalStore): rows keyed like the Postgres tables
// - MemoryIngestionLog (IngestionLog)
//
// Plus builders for documents and targets.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use ai_client::LanguageModel;
use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::run_log::RunLog;
use crate::traits::{
    DocumentSource, IndexWriter, IngestionLog, NeighborHit, NeighborSearch, RelationalStore,
    TargetSource,
};
use crate::types::{
    BatchOutcome, CategorizationField, CategorizationRecord, DerivedTopic, Document,
    DocumentTopicAssignment, IndexFieldUpdate, Target, TargetCatalog, TargetType, TargetVariant,
    MISCELLANEOUS,
};
use crate::vector::cosine_similarity;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn doc(url: &str, text: &str, embedding: Vec<f32>, document_type: &str) -> Document {
    Document::new(url, text, Some(embedding), document_type)
}

/// A target whose variants are `(description, embedding)` pairs.
pub fn target(name: &str, target_type: TargetType, variants: Vec<(&str, Vec<f32>)>) -> Target {
    let total = variants.len();
    Target {
        name: name.to_string(),
        target_type,
        parent: None,
        variants: variants
            .into_iter()
            .enumerate()
            .map(|(i, (description, embedding))| TargetVariant {
                description: description.to_string(),
                embedding,
                label: format!("{}/{}", i + 1, total),
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// ScriptedModel
// ---------------------------------------------------------------------------

/// Replies are consumed in order; once the queue is empty every call gets
/// the fallback reply (or an error if none was set).
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Err(message.into()));
        self
    }

    pub fn always(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => bail!("ScriptedModel: {message}"),
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => bail!("ScriptedModel: no reply queued"),
            },
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// MemoryIndex
// ---------------------------------------------------------------------------

pub struct MemoryIndex {
    documents: Vec<Document>,
    catalogs: HashMap<TargetType, TargetCatalog>,
    fields: Mutex<BTreeMap<(String, CategorizationField), Vec<String>>>,
    failing_documents: HashSet<String>,
    unreachable: bool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            documents: Vec::new(),
            catalogs: HashMap::new(),
            fields: Mutex::new(BTreeMap::new()),
            failing_documents: HashSet::new(),
            unreachable: false,
        }
    }

    pub fn with_documents(mut self, documents: Vec<Document>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_catalog(mut self, catalog: TargetCatalog) -> Self {
        self.catalogs.insert(catalog.target_type, catalog);
        self
    }

    /// Field writes for this document are reported as failed.
    pub fn failing_on(mut self, document_id: &str) -> Self {
        self.failing_documents.insert(document_id.to_string());
        self
    }

    /// Every read errors, as if the cluster were down.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn field(&self, document_id: &str, field: CategorizationField) -> Option<Vec<String>> {
        self.fields
            .lock()
            .unwrap()
            .get(&(document_id.to_string(), field))
            .cloned()
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentSource for MemoryIndex {
    async fn documents(&self) -> Result<Vec<Document>> {
        if self.unreachable {
            bail!("MemoryIndex: unreachable");
        }
        Ok(self.documents.clone())
    }
}

#[async_trait]
impl TargetSource for MemoryIndex {
    async fn catalog(&self, target_type: TargetType) -> Result<TargetCatalog> {
        if self.unreachable {
            bail!("MemoryIndex: unreachable");
        }
        Ok(self
            .catalogs
            .get(&target_type)
            .cloned()
            .unwrap_or_else(|| TargetCatalog::new(target_type, Vec::new())))
    }
}

#[async_trait]
impl NeighborSearch for MemoryIndex {
    async fn nearest_targets(
        &self,
        target_type: TargetType,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<NeighborHit>> {
        if self.unreachable {
            bail!("MemoryIndex: unreachable");
        }
        let Some(catalog) = self.catalogs.get(&target_type) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<NeighborHit> = catalog
            .targets
            .iter()
            .flat_map(|t| {
                t.variants.iter().map(move |v| NeighborHit {
                    target_name: t.name.clone(),
                    score: (1.0 + cosine_similarity(embedding, &v.embedding)) / 2.0,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }
}

#[async_trait]
impl IndexWriter for MemoryIndex {
    async fn write_fields(&self, updates: &[IndexFieldUpdate]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut fields = self.fields.lock().unwrap();
        for update in updates {
            if self.failing_documents.contains(&update.document_id) {
                outcome.failed += 1;
                continue;
            }
            fields.insert(
                (update.document_id.clone(), update.field),
                update.values.clone(),
            );
            outcome.succeeded += 1;
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

type CategorizationKey = (TargetType, String, String);

pub struct MemoryStore {
    categorizations: Mutex<BTreeMap<CategorizationKey, CategorizationRecord>>,
    derived_topics: Mutex<BTreeMap<String, DerivedTopic>>,
    assignments: Mutex<BTreeMap<(String, String), DocumentTopicAssignment>>,
    runs: Mutex<Vec<RunLog>>,
    failing_documents: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            categorizations: Mutex::new(BTreeMap::new()),
            derived_topics: Mutex::new(BTreeMap::new()),
            assignments: Mutex::new(BTreeMap::new()),
            runs: Mutex::new(Vec::new()),
            failing_documents: HashSet::new(),
        }
    }

    /// Rows for this document are rejected, as a constraint violation would.
    pub fn failing_on(mut self, document_id: &str) -> Self {
        self.failing_documents.insert(document_id.to_string());
        self
    }

    pub fn seed_derived_topics(&self, topics: Vec<DerivedTopic>) {
        let mut stored = self.derived_topics.lock().unwrap();
        for topic in topics {
            stored.insert(topic.topic_name.clone(), topic);
        }
    }

    pub fn categorizations(&self) -> Vec<CategorizationRecord> {
        self.categorizations.lock().unwrap().values().cloned().collect()
    }

    pub fn assignments(&self) -> Vec<DocumentTopicAssignment> {
        self.assignments.lock().unwrap().values().cloned().collect()
    }

    pub fn runs(&self) -> Vec<RunLog> {
        self.runs.lock().unwrap().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn upsert_categorizations(
        &self,
        records: &[CategorizationRecord],
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut rows = self.categorizations.lock().unwrap();
        for record in records {
            if self.failing_documents.contains(&record.document_id) {
                outcome.failed += 1;
                continue;
            }
            rows.insert(
                (
                    record.target_type,
                    record.document_id.clone(),
                    record.target_name.clone(),
                ),
                record.clone(),
            );
            outcome.succeeded += 1;
        }
        Ok(outcome)
    }

    async fn accepted_categorizations(
        &self,
        target_type: TargetType,
    ) -> Result<Vec<(String, String)>> {
        Ok(self
            .categorizations
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.target_type == target_type && r.llm_belongs)
            .map(|r| (r.document_id.clone(), r.target_name.clone()))
            .collect())
    }

    async fn purge_derived_topics(&self) -> Result<()> {
        self.derived_topics.lock().unwrap().clear();
        self.assignments.lock().unwrap().clear();
        Ok(())
    }

    async fn insert_derived_topics(&self, topics: &[DerivedTopic]) -> Result<BatchOutcome> {
        self.seed_derived_topics(topics.to_vec());
        Ok(BatchOutcome::new(topics.len(), 0))
    }

    async fn derived_topics(&self) -> Result<Vec<DerivedTopic>> {
        Ok(self.derived_topics.lock().unwrap().values().cloned().collect())
    }

    async fn upsert_topic_assignments(
        &self,
        assignments: &[DocumentTopicAssignment],
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut rows = self.assignments.lock().unwrap();
        for assignment in assignments {
            if self.failing_documents.contains(&assignment.document_id) {
                outcome.failed += 1;
                continue;
            }
            rows.insert(
                (
                    assignment.document_id.clone(),
                    assignment.topic_name.clone(),
                ),
                assignment.clone(),
            );
            outcome.succeeded += 1;
        }
        Ok(outcome)
    }

    async fn accepted_topic_assignments(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .assignments
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.is_accepted() && a.topic_name != MISCELLANEOUS)
            .map(|a| (a.document_id.clone(), a.topic_name.clone()))
            .collect())
    }

    async fn record_run(&self, log: &RunLog) -> Result<()> {
        self.runs.lock().unwrap().push(log.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryIngestionLog
// ---------------------------------------------------------------------------

pub struct MemoryIngestionLog {
    processed: Mutex<HashSet<String>>,
}

impl MemoryIngestionLog {
    pub fn new() -> Self {
        Self {
            processed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_processed(self, document_ids: &[String]) -> Self {
        self.processed
            .lock()
            .unwrap()
            .extend(document_ids.iter().cloned());
        self
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }
}

impl Default for MemoryIngestionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestionLog for MemoryIngestionLog {
    async fn unprocessed(&self, document_ids: &[String]) -> Result<HashSet<String>> {
        let processed = self.processed.lock().unwrap();
        Ok(document_ids
            .iter()
            .filter(|id| !processed.contains(*id))
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, document_ids: &[String]) -> Result<()> {
        self.processed
            .lock()
            .unwrap()
            .extend(document_ids.iter().cloned());
        Ok(())
    }
}
