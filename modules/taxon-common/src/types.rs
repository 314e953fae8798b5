use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name every unclustered or unresolved document is filed under.
pub const MISCELLANEOUS: &str = "Miscellaneous";

/// Cluster id reserved for "did not fit any discovered cluster".
pub const OUTLIER_TOPIC: i32 = -1;

/// Content hash of a canonical URL. Used as the primary key for every
/// document-keyed row in both the search index and the relational store.
pub fn document_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

// --- Documents ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub url: String,
    pub text: String,
    /// `None` when the ingestion stage has not embedded the document yet.
    pub embedding: Option<Vec<f32>>,
    pub document_type: String,
    pub language: Option<String>,
    pub year: Option<i32>,
}

impl Document {
    pub fn new(
        url: impl Into<String>,
        text: impl Into<String>,
        embedding: Option<Vec<f32>>,
        document_type: impl Into<String>,
    ) -> Self {
        let url = url.into();
        Self {
            document_id: document_id(&url),
            url,
            text: text.into(),
            embedding,
            document_type: document_type.into(),
            language: None,
            year: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn is_type(&self, document_type: &str) -> bool {
        self.document_type.eq_ignore_ascii_case(document_type)
    }
}

// --- Targets ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Mandate,
    Topic,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Mandate => "mandate",
            TargetType::Topic => "topic",
        }
    }

    pub fn index_field(&self) -> CategorizationField {
        match self {
            TargetType::Mandate => CategorizationField::Mandate,
            TargetType::Topic => CategorizationField::Topic,
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One embedded description of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetVariant {
    pub description: String,
    pub embedding: Vec<f32>,
    /// Positional label, "i/N".
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub target_type: TargetType,
    /// Parent tag in the taxonomy hierarchy. Root entries are primary.
    pub parent: Option<String>,
    pub variants: Vec<TargetVariant>,
}

impl Target {
    pub fn is_primary(&self) -> bool {
        self.parent.is_none()
    }

    /// All variant descriptions, in variant order.
    pub fn description(&self) -> String {
        self.variants
            .iter()
            .map(|v| v.description.trim())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A flat (name, description, embedding) row as the taxonomy index stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub name: String,
    pub parent: Option<String>,
    pub description: String,
    pub embedding: Vec<f32>,
}

/// All targets of one type, in catalog order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCatalog {
    pub target_type: TargetType,
    pub targets: Vec<Target>,
}

impl TargetCatalog {
    pub fn new(target_type: TargetType, targets: Vec<Target>) -> Self {
        Self {
            target_type,
            targets,
        }
    }

    /// Group variant rows by name. Catalog order is the order in which each
    /// name first appears; variants are labelled "i/N" within their name.
    pub fn from_rows(target_type: TargetType, rows: Vec<TargetRow>) -> Self {
        let mut targets: Vec<Target> = Vec::new();
        for row in rows {
            let variant = TargetVariant {
                description: row.description,
                embedding: row.embedding,
                label: String::new(),
            };
            match targets.iter_mut().find(|t| t.name == row.name) {
                Some(target) => {
                    if target.parent.is_none() {
                        target.parent = row.parent;
                    }
                    target.variants.push(variant);
                }
                None => targets.push(Target {
                    name: row.name,
                    target_type,
                    parent: row.parent,
                    variants: vec![variant],
                }),
            }
        }

        for target in &mut targets {
            let total = target.variants.len();
            for (i, variant) in target.variants.iter_mut().enumerate() {
                variant.label = format!("{}/{}", i + 1, total);
            }
        }

        Self::new(target_type, targets)
    }

    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}

// --- Categorization ---

/// A target proposed for a document by the candidate retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub target_name: String,
    pub score: f64,
}

/// Top-N candidates for one document, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCandidates {
    pub document_id: String,
    pub candidates: Vec<ScoredCandidate>,
}

impl DocumentCandidates {
    pub fn names(&self) -> Vec<&str> {
        self.candidates
            .iter()
            .map(|c| c.target_name.as_str())
            .collect()
    }

    pub fn score_for(&self, target_name: &str) -> Option<f64> {
        self.candidates
            .iter()
            .find(|c| c.target_name == target_name)
            .map(|c| c.score)
    }
}

/// Edge between a document and a curated target, keyed by
/// `(document_id, target_type, target_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationRecord {
    pub document_id: String,
    pub url: String,
    pub target_type: TargetType,
    pub target_name: String,
    pub semantic_score: f64,
    pub llm_belongs: bool,
    /// 0..=10
    pub llm_score: u8,
    pub llm_explanation: String,
    pub is_primary: bool,
}

impl CategorizationRecord {
    pub fn belongs_label(&self) -> &'static str {
        if self.llm_belongs {
            "Yes"
        } else {
            "No"
        }
    }
}

// --- Derived topics ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTopic {
    pub topic_name: String,
    /// Top keywords, most distinctive first.
    pub representation: Vec<String>,
    pub representative_docs: Vec<String>,
}

impl DerivedTopic {
    pub fn signature(&self) -> String {
        keyword_signature(&self.representation)
    }
}

/// Ordered keywords joined into the string used to match clusters across runs.
pub fn keyword_signature(keywords: &[String]) -> String {
    keywords.join(", ")
}

/// Edge between a document and a derived topic. Construct through
/// [`DocumentTopicAssignment::new`] so the score invariants hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTopicAssignment {
    pub document_id: String,
    pub url: String,
    pub topic_name: String,
    pub confidence_score: f64,
}

impl DocumentTopicAssignment {
    pub fn new(document: &Document, topic_name: impl Into<String>, confidence: f64) -> Self {
        let topic_name = topic_name.into();
        let confidence_score = if topic_name == MISCELLANEOUS || !confidence.is_finite() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            document_id: document.document_id.clone(),
            url: document.url.clone(),
            topic_name,
            confidence_score,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.confidence_score > 0.0
    }
}

// --- Search index projection ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CategorizationField {
    Mandate,
    Topic,
    DerivedTopic,
}

impl CategorizationField {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategorizationField::Mandate => "mandate_categorization",
            CategorizationField::Topic => "topic_categorization",
            CategorizationField::DerivedTopic => "derived_topic_categorization",
        }
    }
}

/// Replacement value for one array-of-string field on one indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFieldUpdate {
    pub document_id: String,
    pub field: CategorizationField,
    pub values: Vec<String>,
}

/// Aggregate result of a batch write. Partial failure is an outcome, not an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn new(succeeded: usize, failed: usize) -> Self {
        Self { succeeded, failed }
    }

    pub fn merge(self, other: BatchOutcome) -> Self {
        Self {
            succeeded: self.succeeded + other.succeeded,
            failed: self.failed + other.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, description: &str) -> TargetRow {
        TargetRow {
            name: name.to_string(),
            parent: None,
            description: description.to_string(),
            embedding: vec![1.0, 0.0],
        }
    }

    #[test]
    fn document_id_is_stable_hex_sha256() {
        let a = document_id("https://x/doc1");
        let b = document_id("https://x/doc1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, document_id("https://x/doc2"));
    }

    #[test]
    fn catalog_groups_variants_in_first_appearance_order() {
        let catalog = TargetCatalog::from_rows(
            TargetType::Mandate,
            vec![
                row("Conservation", "protect habitats"),
                row("Fisheries", "stock management"),
                row("Conservation", "biodiversity"),
            ],
        );

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.targets[0].name, "Conservation");
        assert_eq!(catalog.targets[1].name, "Fisheries");

        let labels: Vec<&str> = catalog.targets[0]
            .variants
            .iter()
            .map(|v| v.label.as_str())
            .collect();
        assert_eq!(labels, vec!["1/2", "2/2"]);
        assert_eq!(catalog.targets[0].description(), "protect habitats biodiversity");
    }

    #[test]
    fn assignment_clips_confidence() {
        let doc = Document::new("https://x/a", "text", None, "Report");
        assert_eq!(DocumentTopicAssignment::new(&doc, "Fish", 1.7).confidence_score, 1.0);
        assert_eq!(DocumentTopicAssignment::new(&doc, "Fish", -0.2).confidence_score, 0.0);
        assert_eq!(DocumentTopicAssignment::new(&doc, "Fish", f64::NAN).confidence_score, 0.0);
    }

    #[test]
    fn miscellaneous_assignment_has_zero_confidence() {
        let doc = Document::new("https://x/a", "text", None, "Report");
        let assignment = DocumentTopicAssignment::new(&doc, MISCELLANEOUS, 0.93);
        assert_eq!(assignment.confidence_score, 0.0);
        assert!(!assignment.is_accepted());
    }

    #[test]
    fn signature_preserves_keyword_order() {
        let topic = DerivedTopic {
            topic_name: "Fish stocks".into(),
            representation: vec!["stock".into(), "quota".into(), "fish".into()],
            representative_docs: vec![],
        };
        assert_eq!(topic.signature(), "stock, quota, fish");
        assert_ne!(
            topic.signature(),
            keyword_signature(&["fish".into(), "quota".into(), "stock".into()])
        );
    }
}
