use std::collections::HashSet;
use std::sync::Arc;

use ai_client::{slice_between, strip_code_blocks, truncate_to_char_boundary, LanguageModel};
use anyhow::{anyhow, Result};
use tracing::warn;

use taxon_common::{EventKind, RunLog, MISCELLANEOUS};

use crate::model::TopicCluster;

const MAX_LABEL_CHARS: usize = 80;
const DOC_EXCERPT_BYTES: usize = 400;

/// Short human-readable names for discovered clusters.
pub struct TopicLabeler {
    model: Arc<dyn LanguageModel>,
}

impl TopicLabeler {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Label from the model, or the keyword fallback if the call fails or
    /// returns nothing usable. Never errors.
    pub async fn label(&self, model_name: &str, cluster: &TopicCluster, log: &mut RunLog) -> String {
        log.log(EventKind::LlmCall {
            document_id: format!("{model_name}:{}", cluster.id),
            purpose: "label_topic".into(),
        });
        match self.request_label(cluster).await {
            Ok(label) => label,
            Err(e) => {
                warn!(model = model_name, topic_id = cluster.id, error = %e, "Topic labelling failed, using keywords");
                fallback_label(cluster)
            }
        }
    }

    async fn request_label(&self, cluster: &TopicCluster) -> Result<String> {
        let docs = cluster
            .representative_docs
            .iter()
            .map(|d| format!("- {}", truncate_to_char_boundary(d, DOC_EXCERPT_BYTES)))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"These documents were grouped by semantic similarity. No categories were predefined.

Top keywords: {keywords}

Representative documents:
{docs}

Give this group a specific topic label of at most six words that distinguishes it from other groups.

Respond in this exact JSON format:
{{"label": "..."}}"#,
            keywords = cluster.representation.join(", "),
        );

        let response = self.model.invoke(&prompt).await?;
        parse_label(&response).ok_or_else(|| anyhow!("no usable label in response"))
    }
}

/// `{"label": ...}` if present, otherwise the first non-empty line.
fn parse_label(response: &str) -> Option<String> {
    let cleaned = strip_code_blocks(response);
    let raw = slice_between(cleaned, '{', '}')
        .and_then(|obj| serde_json::from_str::<serde_json::Value>(obj).ok())
        .and_then(|v| v["label"].as_str().map(str::to_string))
        .or_else(|| cleaned.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string))?;

    let label: String = raw
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
        .chars()
        .take(MAX_LABEL_CHARS)
        .collect();
    let label = label.trim().to_string();
    (!label.is_empty()).then_some(label)
}

/// `"{id}_{kw1}_{kw2}_{kw3}"`.
pub fn fallback_label(cluster: &TopicCluster) -> String {
    let mut parts = vec![cluster.id.to_string()];
    parts.extend(cluster.representation.iter().take(3).cloned());
    parts.join("_")
}

/// Hands out names unique within one run. "Miscellaneous" is reserved for
/// the outlier bucket, so a real cluster given that name is suffixed too.
#[derive(Debug)]
pub struct LabelBook {
    used: HashSet<String>,
}

impl LabelBook {
    pub fn new() -> Self {
        let mut used = HashSet::new();
        used.insert(MISCELLANEOUS.to_string());
        Self { used }
    }

    pub fn claim(&mut self, label: &str) -> String {
        if self.used.insert(label.to_string()) {
            return label.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{label} ({n})");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

impl Default for LabelBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxon_common::testing::ScriptedModel;

    fn cluster() -> TopicCluster {
        TopicCluster {
            id: 3,
            centroid: vec![1.0],
            size: 12,
            representation: vec!["stock".into(), "quota".into(), "fish".into(), "catch".into()],
            representative_docs: vec!["Quota advice for cod".into()],
        }
    }

    #[tokio::test]
    async fn uses_model_label() {
        let model = Arc::new(ScriptedModel::new().reply(r#"{"label": "Fish stock quotas"}"#));
        let labeler = TopicLabeler::new(model.clone());
        let mut log = RunLog::new("t", "test");

        assert_eq!(labeler.label("primary", &cluster(), &mut log).await, "Fish stock quotas");
        assert!(model.prompts()[0].contains("stock, quota, fish, catch"));
    }

    #[tokio::test]
    async fn falls_back_to_keywords_on_failure() {
        let model = Arc::new(ScriptedModel::new().fail("timeout"));
        let labeler = TopicLabeler::new(model);
        let mut log = RunLog::new("t", "test");

        assert_eq!(labeler.label("primary", &cluster(), &mut log).await, "3_stock_quota_fish");
    }

    #[test]
    fn parses_plain_text_label() {
        assert_eq!(parse_label("\"Coastal shipping.\"\n"), Some("Coastal shipping".into()));
        assert_eq!(parse_label("  \n "), None);
    }

    #[test]
    fn label_book_suffixes_duplicates_and_reserved_name() {
        let mut book = LabelBook::new();
        assert_eq!(book.claim("Fisheries"), "Fisheries");
        assert_eq!(book.claim("Fisheries"), "Fisheries (2)");
        assert_eq!(book.claim("Fisheries"), "Fisheries (3)");
        assert_eq!(book.claim(MISCELLANEOUS), "Miscellaneous (2)");
    }
}
