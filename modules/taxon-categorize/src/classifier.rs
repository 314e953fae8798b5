use std::collections::HashSet;
use std::sync::Arc;

use ai_client::{slice_between, strip_code_blocks, truncate_to_char_boundary, LanguageModel};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use taxon_common::{
    CategorizationRecord, Document, DocumentCandidates, EventKind, RunLog, Target, TargetCatalog,
    TargetType,
};

/// Longest document excerpt sent to the model.
const MAX_DOCUMENT_BYTES: usize = 16_000;

/// Shape the model is asked to produce, one per candidate. Only used to
/// render the schema into the prompt; replies are validated by hand so that
/// near-misses ("8", "yes") are coerced instead of failing the whole array.
#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct JudgmentSchema {
    /// Exact target name as listed.
    name: String,
    /// "Yes" or "No".
    belongs: String,
    /// Integer from 0 (unrelated) to 10 (central).
    relevance: u8,
    /// One or two sentences.
    explanation: String,
}

/// One validated element of the model's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub name: String,
    pub belongs: bool,
    pub relevance: u8,
    pub explanation: String,
}

pub struct StructuredClassifier {
    model: Arc<dyn LanguageModel>,
    repair_attempts: usize,
}

impl StructuredClassifier {
    pub fn new(model: Arc<dyn LanguageModel>, repair_attempts: usize) -> Self {
        Self {
            model,
            repair_attempts,
        }
    }

    /// Ask the model to judge `candidates` for `document`.
    ///
    /// Returns `None` when no parseable answer could be obtained, in which
    /// case the (document, target type) pair is skipped. Otherwise returns
    /// the elements that passed validation, possibly none.
    pub async fn classify(
        &self,
        document: &Document,
        candidates: &[&Target],
        target_type: TargetType,
        log: &mut RunLog,
    ) -> Option<Vec<Judgment>> {
        let prompt = build_prompt(document, candidates, target_type);

        log.log(EventKind::LlmCall {
            document_id: document.document_id.clone(),
            purpose: format!("classify_{target_type}"),
        });
        let response = match self.model.invoke(&prompt).await {
            Ok(r) => r,
            Err(e) => {
                warn!(document_id = %document.document_id, %target_type, error = %e, "Classification call failed");
                log.log(EventKind::ClassificationSkipped {
                    document_id: document.document_id.clone(),
                    target_type: target_type.to_string(),
                    reason: format!("llm call failed: {e}"),
                });
                return None;
            }
        };

        let Some(elements) = self.parse_with_repair(&document.document_id, response, log).await
        else {
            warn!(
                document_id = %document.document_id,
                %target_type,
                attempts = self.repair_attempts,
                "Unparseable classification after repair attempts, skipping"
            );
            log.log(EventKind::ClassificationSkipped {
                document_id: document.document_id.clone(),
                target_type: target_type.to_string(),
                reason: "unparseable response".into(),
            });
            return None;
        };

        let mut seen = HashSet::new();
        let mut judgments = Vec::with_capacity(elements.len());
        for element in &elements {
            match validate_element(element) {
                Ok(judgment) => {
                    if seen.insert(judgment.name.clone()) {
                        judgments.push(judgment);
                    } else {
                        debug!(name = %judgment.name, "Duplicate judgment, keeping the first");
                    }
                }
                Err(reason) => {
                    warn!(document_id = %document.document_id, %reason, "Dropping classification element");
                    log.log(EventKind::ElementRejected {
                        document_id: document.document_id.clone(),
                        reason,
                    });
                }
            }
        }
        Some(judgments)
    }

    /// Parse the response; on failure send it back for reformatting, at most
    /// `repair_attempts` times.
    async fn parse_with_repair(
        &self,
        document_id: &str,
        response: String,
        log: &mut RunLog,
    ) -> Option<Vec<Value>> {
        if let Some(elements) = parse_elements(&response) {
            return Some(elements);
        }

        let mut latest = response;
        for attempt in 1..=self.repair_attempts {
            debug!(document_id, attempt, "Repairing malformed classification");
            log.log(EventKind::RepairAttempt {
                document_id: document_id.to_string(),
                attempt,
            });
            match self.model.invoke(&repair_prompt(&latest)).await {
                Ok(repaired) => {
                    if let Some(elements) = parse_elements(&repaired) {
                        return Some(elements);
                    }
                    latest = repaired;
                }
                Err(e) => {
                    warn!(document_id, attempt, error = %e, "Repair call failed");
                }
            }
        }
        None
    }
}

// --- Prompts ---

fn schema_json() -> String {
    let schema = schemars::schema_for!(Vec<JudgmentSchema>);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

pub fn build_prompt(document: &Document, candidates: &[&Target], target_type: TargetType) -> String {
    let listing = candidates
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description()))
        .collect::<Vec<_>>()
        .join("\n");
    let text = truncate_to_char_boundary(&document.text, MAX_DOCUMENT_BYTES);

    format!(
        "You are categorizing a document against a fixed list of {kind}s.\n\n\
         ## {kind}s\n{listing}\n\n\
         ## Document\n{text}\n\n\
         For every {kind} listed above, decide whether the document belongs to it.\n\
         Respond with a JSON array only, one object per {kind}, using the exact names above.\n\
         \"belongs\" must be \"Yes\" or \"No\"; \"relevance\" is an integer from 0 to 10.\n\n\
         Schema:\n{schema}",
        kind = target_type,
        schema = schema_json(),
    )
}

fn repair_prompt(malformed: &str) -> String {
    format!(
        "The text below was supposed to be a JSON array of objects with the fields \
         \"name\", \"belongs\", \"relevance\" and \"explanation\". \
         Reformat it as valid JSON. Return only the JSON, no commentary.\n\n{malformed}"
    )
}

// --- Parsing ---

/// Extract the array of judgment objects from a model reply: the whole text
/// first, then the outermost `[...]`, then the outermost `{...}`.
pub fn parse_elements(text: &str) -> Option<Vec<Value>> {
    let cleaned = strip_code_blocks(text);

    if let Some(elements) = parse_value(cleaned) {
        return Some(elements);
    }
    if let Some(elements) = slice_between(cleaned, '[', ']').and_then(parse_value) {
        return Some(elements);
    }
    let object = slice_between(cleaned, '{', '}')?;
    // A run of objects without the enclosing brackets is common enough.
    parse_value(object).or_else(|| parse_value(&format!("[{object}]")))
}

fn parse_value(text: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Array(items) => Some(items),
        Value::Object(map) if map.contains_key("name") => Some(vec![Value::Object(map)]),
        // {"results": [...]} and similar wrappers
        Value::Object(map) => map.into_iter().find_map(|(_, v)| match v {
            Value::Array(items) => Some(items),
            _ => None,
        }),
        _ => None,
    }
}

// --- Validation ---

pub fn validate_element(element: &Value) -> Result<Judgment, String> {
    let obj = element
        .as_object()
        .ok_or_else(|| format!("element is not an object: {element}"))?;

    let field = |key: &str| obj.get(key).ok_or_else(|| format!("missing field '{key}'"));

    let name = field("name")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("'name' must be a non-empty string")?
        .to_string();

    let belongs = match field("belongs")?.as_str().map(str::trim) {
        Some(s) if s.eq_ignore_ascii_case("yes") => true,
        Some(s) if s.eq_ignore_ascii_case("no") => false,
        _ => return Err(format!("'belongs' must be Yes or No, got {}", obj["belongs"])),
    };

    let relevance = coerce_relevance(field("relevance")?)
        .ok_or_else(|| format!("'relevance' must be an integer 0-10, got {}", obj["relevance"]))?;

    let explanation = field("explanation")?
        .as_str()
        .ok_or("'explanation' must be a string")?
        .trim()
        .to_string();

    Ok(Judgment {
        name,
        belongs,
        relevance,
        explanation,
    })
}

fn coerce_relevance(value: &Value) -> Option<u8> {
    let n = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i as f64,
            None => n.as_f64()?,
        },
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if n.fract() != 0.0 || !(0.0..=10.0).contains(&n) {
        return None;
    }
    Some(n as u8)
}

// --- Records ---

/// Turn validated judgments into rows. The semantic score is the retriever's
/// score for that name, or 0.0 if the model named a catalog target it was not
/// offered. Names outside the catalog are dropped.
pub fn assemble_records(
    document: &Document,
    judgments: &[Judgment],
    candidates: &DocumentCandidates,
    catalog: &TargetCatalog,
    log: &mut RunLog,
) -> Vec<CategorizationRecord> {
    let mut records = Vec::with_capacity(judgments.len());
    for j in judgments {
        let Some(target) = catalog.get(&j.name) else {
            warn!(
                document_id = %document.document_id,
                name = %j.name,
                target_type = %catalog.target_type,
                "Dropping judgment for unknown target"
            );
            log.log(EventKind::ElementRejected {
                document_id: document.document_id.clone(),
                reason: format!("unknown {} '{}'", catalog.target_type, j.name),
            });
            continue;
        };
        records.push(CategorizationRecord {
            document_id: document.document_id.clone(),
            url: document.url.clone(),
            target_type: catalog.target_type,
            target_name: j.name.clone(),
            semantic_score: candidates.score_for(&j.name).unwrap_or(0.0),
            llm_belongs: j.belongs,
            llm_score: j.relevance,
            llm_explanation: j.explanation.clone(),
            is_primary: target.is_primary(),
        });
    }
    records
}
