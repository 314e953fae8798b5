use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TaxonError;

// --- Enumerated options ---

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Mandate + topic categorization, then derived topics.
    FullUpdate,
    /// Derived topics only.
    TopicsOnly,
    /// Re-project stored categorizations into the search index; no recomputation.
    HtmlOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicModellingMode {
    Retrain,
    Predict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityBackend {
    BatchMatrix,
    NearestNeighborIndex,
}

/// Scalar remap applied to raw cosine similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTransform {
    #[default]
    Identity,
    /// `(c + 1) / 2`
    Linear,
    /// `1 - acos(c) / π`
    Angular,
}

impl ScoreTransform {
    pub fn apply(&self, cosine: f64) -> f64 {
        let c = cosine.clamp(-1.0, 1.0);
        match self {
            ScoreTransform::Identity => c,
            ScoreTransform::Linear => (c + 1.0) / 2.0,
            ScoreTransform::Angular => 1.0 - c.acos() / std::f64::consts::PI,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Anthropic,
    OpenAi,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::FullUpdate => "full_update",
            PipelineMode::TopicsOnly => "topics_only",
            PipelineMode::HtmlOnly => "html_only",
        }
    }
}

impl TopicModellingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicModellingMode::Retrain => "retrain",
            TopicModellingMode::Predict => "predict",
        }
    }
}

fn normalize_option(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace('-', "_")
}

impl FromStr for PipelineMode {
    type Err = TaxonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_option(s).as_str() {
            "full_update" => Ok(Self::FullUpdate),
            "topics_only" => Ok(Self::TopicsOnly),
            "html_only" => Ok(Self::HtmlOnly),
            other => Err(TaxonError::Config(format!("unknown pipeline_mode '{other}'"))),
        }
    }
}

impl FromStr for TopicModellingMode {
    type Err = TaxonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_option(s).as_str() {
            "retrain" => Ok(Self::Retrain),
            "predict" => Ok(Self::Predict),
            other => Err(TaxonError::Config(format!(
                "unknown topic_modelling_mode '{other}'"
            ))),
        }
    }
}

impl FromStr for SimilarityBackend {
    type Err = TaxonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_option(s).as_str() {
            "batch_matrix" | "numpy" => Ok(Self::BatchMatrix),
            "nearest_neighbor_index" | "opensearch" => Ok(Self::NearestNeighborIndex),
            other => Err(TaxonError::Config(format!(
                "unknown similarity_backend '{other}'"
            ))),
        }
    }
}

impl FromStr for ScoreTransform {
    type Err = TaxonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_option(s).as_str() {
            "identity" | "cosine" => Ok(Self::Identity),
            "linear" => Ok(Self::Linear),
            "angular" => Ok(Self::Angular),
            other => Err(TaxonError::Config(format!("unknown score_transform '{other}'"))),
        }
    }
}

impl FromStr for LlmProvider {
    type Err = TaxonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_option(s).as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(TaxonError::Config(format!("unknown llm_provider '{other}'"))),
        }
    }
}

// --- Config ---

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Stores
    pub database_url: String,
    pub search_url: String,
    pub search_username: Option<String>,
    pub search_password: Option<String>,
    pub documents_index: String,
    pub mandates_index: String,
    pub topics_index: String,

    // LLM
    pub llm_provider: LlmProvider,
    pub llm_api_key: String,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,

    // Modes
    pub pipeline_mode: PipelineMode,
    pub topic_modelling_mode: TopicModellingMode,
    pub similarity_backend: SimilarityBackend,
    pub score_transform: ScoreTransform,

    // Categorization
    pub candidate_count: usize,
    pub similarity_threshold: f64,
    pub repair_attempts: usize,

    // Topic discovery
    pub excluded_document_type: String,
    pub min_outlier_cluster_size: usize,
    pub topic_cluster_count: usize,
    pub topic_min_cluster_size: usize,
    pub topic_min_similarity: f64,
    pub model_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let llm_provider: LlmProvider = parsed_env("LLM_PROVIDER", LlmProvider::Anthropic)?;
        let key_var = match llm_provider {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenAi => "OPENAI_API_KEY",
        };

        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            search_url: required_env("SEARCH_URL")?,
            search_username: env::var("SEARCH_USERNAME").ok(),
            search_password: env::var("SEARCH_PASSWORD").ok(),
            documents_index: env::var("DOCUMENTS_INDEX").unwrap_or_else(|_| "documents".into()),
            mandates_index: env::var("MANDATES_INDEX").unwrap_or_else(|_| "mandates".into()),
            topics_index: env::var("TOPICS_INDEX").unwrap_or_else(|_| "topics".into()),
            llm_provider,
            llm_api_key: required_env(key_var)?,
            llm_model: env::var("LLM_MODEL").ok(),
            llm_base_url: env::var("LLM_BASE_URL").ok(),
            pipeline_mode: parsed_env("PIPELINE_MODE", PipelineMode::FullUpdate)?,
            topic_modelling_mode: parsed_env("TOPIC_MODELLING_MODE", TopicModellingMode::Predict)?,
            similarity_backend: parsed_env("SIMILARITY_BACKEND", SimilarityBackend::BatchMatrix)?,
            score_transform: parsed_env("SCORE_TRANSFORM", ScoreTransform::Identity)?,
            candidate_count: parsed_env("CANDIDATE_COUNT", 7)?,
            similarity_threshold: parsed_env("SIMILARITY_THRESHOLD", 0.0)?,
            repair_attempts: parsed_env("REPAIR_ATTEMPTS", 3)?,
            excluded_document_type: env::var("EXCLUDED_DOCUMENT_TYPE")
                .unwrap_or_else(|_| "Proceedings".into()),
            min_outlier_cluster_size: parsed_env("MIN_OUTLIER_CLUSTER_SIZE", 100)?,
            topic_cluster_count: parsed_env("TOPIC_CLUSTER_COUNT", 40)?,
            topic_min_cluster_size: parsed_env("TOPIC_MIN_CLUSTER_SIZE", 10)?,
            topic_min_similarity: parsed_env("TOPIC_MIN_SIMILARITY", 0.35)?,
            model_dir: env::var("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./models")),
        })
    }

    /// Log the effective configuration without credentials.
    pub fn log_redacted(&self) {
        info!(
            search_url = %self.search_url,
            documents_index = %self.documents_index,
            llm_provider = ?self.llm_provider,
            llm_model = ?self.llm_model,
            pipeline_mode = ?self.pipeline_mode,
            topic_modelling_mode = ?self.topic_modelling_mode,
            similarity_backend = ?self.similarity_backend,
            score_transform = ?self.score_transform,
            candidate_count = self.candidate_count,
            similarity_threshold = self.similarity_threshold,
            min_outlier_cluster_size = self.min_outlier_cluster_size,
            model_dir = %self.model_dir.display(),
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| {
        TaxonError::Config(format!("{key} environment variable is required")).into()
    })
}

fn parsed_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| TaxonError::Config(format!("{key}: {e}")).into()),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enumerated_options() {
        assert_eq!("full_update".parse::<PipelineMode>().unwrap(), PipelineMode::FullUpdate);
        assert_eq!("Topics-Only".parse::<PipelineMode>().unwrap(), PipelineMode::TopicsOnly);
        assert_eq!("RETRAIN".parse::<TopicModellingMode>().unwrap(), TopicModellingMode::Retrain);
        assert_eq!(
            "nearest_neighbor_index".parse::<SimilarityBackend>().unwrap(),
            SimilarityBackend::NearestNeighborIndex
        );
        assert!("sometimes".parse::<PipelineMode>().is_err());
    }

    #[test]
    fn score_transforms_map_cosine_range() {
        assert_eq!(ScoreTransform::Identity.apply(0.5), 0.5);
        assert_eq!(ScoreTransform::Linear.apply(-1.0), 0.0);
        assert_eq!(ScoreTransform::Linear.apply(1.0), 1.0);
        assert!((ScoreTransform::Angular.apply(1.0) - 1.0).abs() < 1e-12);
        assert!(ScoreTransform::Angular.apply(-1.0).abs() < 1e-12);
        assert!((ScoreTransform::Angular.apply(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn transforms_preserve_ordering() {
        for transform in [ScoreTransform::Identity, ScoreTransform::Linear, ScoreTransform::Angular] {
            assert!(transform.apply(0.9) > transform.apply(0.2));
        }
    }
}
