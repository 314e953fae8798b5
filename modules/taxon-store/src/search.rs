// Search-index client (OpenSearch-compatible REST API).
// Reads documents and taxonomy targets, runs k-NN queries against target
// embeddings, writes categorization fields back with the bulk API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use taxon_common::{
    BatchOutcome, Config, Document, DocumentSource, IndexFieldUpdate, IndexWriter, NeighborHit,
    NeighborSearch, TargetCatalog, TargetRow, TargetSource, TargetType, TaxonError,
};

const PAGE_SIZE: usize = 500;
const BULK_CHUNK: usize = 500;
const SCROLL_KEEPALIVE: &str = "2m";

#[derive(Debug, Deserialize)]
struct SearchResponse<T> {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: Hits<T>,
}

#[derive(Debug, Deserialize)]
struct Hits<T> {
    hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
struct Hit<T> {
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: T,
}

#[derive(Debug, Deserialize)]
struct DocumentHit {
    #[serde(alias = "html_url")]
    url: String,
    #[serde(default)]
    text: String,
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    document_type: String,
    language: Option<String>,
    year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct TargetHit {
    name: String,
    parent: Option<String>,
    #[serde(default)]
    description: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct NameHit {
    name: String,
}

#[derive(Debug, Clone)]
pub struct IndexNames {
    pub documents: String,
    pub mandates: String,
    pub topics: String,
}

impl IndexNames {
    pub fn for_targets(&self, target_type: TargetType) -> &str {
        match target_type {
            TargetType::Mandate => &self.mandates,
            TargetType::Topic => &self.topics,
        }
    }
}

pub struct SearchIndex {
    base_url: String,
    credentials: Option<(String, String)>,
    indexes: IndexNames,
    client: reqwest::Client,
}

impl SearchIndex {
    pub fn new(base_url: &str, indexes: IndexNames) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
            indexes,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .context("Failed to build HTTP client")?,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut index = Self::new(
            &config.search_url,
            IndexNames {
                documents: config.documents_index.clone(),
                mandates: config.mandates_index.clone(),
                topics: config.topics_index.clone(),
            },
        )?;
        if let (Some(user), Some(pass)) = (&config.search_username, &config.search_password) {
            index.credentials = Some((user.clone(), pass.clone()));
        }
        Ok(index)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.credentials {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let resp = builder.send().await.context("search index request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("search index returned {status}: {body}");
        }
        resp.json().await.context("Failed to parse search index response")
    }

    /// Every `_source` in `index`, via the scroll API.
    async fn scan<T: DeserializeOwned>(&self, index: &str, query: Value) -> Result<Vec<T>> {
        let mut page: SearchResponse<T> = self
            .send_json(
                self.request(reqwest::Method::POST, &format!("{index}/_search"))
                    .query(&[("scroll", SCROLL_KEEPALIVE)])
                    .json(&json!({ "size": PAGE_SIZE, "query": query })),
            )
            .await?;

        let mut out = Vec::new();
        loop {
            let done = page.hits.hits.len() < PAGE_SIZE;
            out.extend(page.hits.hits.into_iter().map(|h| h.source));
            let Some(scroll_id) = page.scroll_id else { break };
            if done {
                let cleared = self
                    .request(reqwest::Method::DELETE, "_search/scroll")
                    .json(&json!({ "scroll_id": scroll_id }))
                    .send()
                    .await;
                if let Err(e) = cleared {
                    debug!(error = %e, "Failed to clear scroll context");
                }
                break;
            }
            page = self
                .send_json(
                    self.request(reqwest::Method::POST, "_search/scroll")
                        .json(&json!({ "scroll": SCROLL_KEEPALIVE, "scroll_id": scroll_id })),
                )
                .await?;
        }
        debug!(index, count = out.len(), "Scanned index");
        Ok(out)
    }
}

#[async_trait]
impl DocumentSource for SearchIndex {
    async fn documents(&self) -> Result<Vec<Document>> {
        let hits: Vec<DocumentHit> = self
            .scan(&self.indexes.documents, json!({ "match_all": {} }))
            .await
            .map_err(|e| TaxonError::Retrieval(format!("reading documents: {e:#}")))?;

        let documents: Vec<Document> = hits
            .into_iter()
            .map(|h| {
                let mut d = Document::new(h.url, h.text, h.embedding, h.document_type);
                d.language = h.language;
                d.year = h.year;
                d
            })
            .collect();
        info!(count = documents.len(), "Loaded documents");
        Ok(documents)
    }
}

#[async_trait]
impl TargetSource for SearchIndex {
    async fn catalog(&self, target_type: TargetType) -> Result<TargetCatalog> {
        let index = self.indexes.for_targets(target_type);
        let hits: Vec<TargetHit> = self
            .scan(index, json!({ "match_all": {} }))
            .await
            .map_err(|e| TaxonError::Retrieval(format!("reading {target_type} catalog: {e:#}")))?;

        let rows = hits
            .into_iter()
            .map(|h| TargetRow {
                name: h.name,
                parent: h.parent.filter(|p| !p.trim().is_empty()),
                description: h.description,
                embedding: h.embedding,
            })
            .collect();
        let catalog = TargetCatalog::from_rows(target_type, rows);
        info!(%target_type, targets = catalog.len(), "Loaded target catalog");
        Ok(catalog)
    }
}

pub(crate) fn knn_query(embedding: &[f32], k: usize) -> Value {
    json!({
        "size": k,
        "_source": ["name"],
        "query": {
            "knn": {
                "embedding": { "vector": embedding, "k": k }
            }
        }
    })
}

#[async_trait]
impl NeighborSearch for SearchIndex {
    async fn nearest_targets(
        &self,
        target_type: TargetType,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<NeighborHit>> {
        let index = self.indexes.for_targets(target_type);
        let resp: SearchResponse<NameHit> = self
            .send_json(
                self.request(reqwest::Method::POST, &format!("{index}/_search"))
                    .json(&knn_query(embedding, k)),
            )
            .await
            .map_err(|e| TaxonError::Retrieval(format!("k-NN on {index}: {e:#}")))?;

        Ok(resp
            .hits
            .hits
            .into_iter()
            .map(|h| NeighborHit {
                target_name: h.source.name,
                score: h.score.unwrap_or(0.0),
            })
            .collect())
    }
}

/// NDJSON body for `_bulk`: one partial-document upsert per field update.
pub(crate) fn bulk_body(index: &str, updates: &[IndexFieldUpdate]) -> String {
    let mut body = String::new();
    for update in updates {
        let action = json!({ "update": { "_index": index, "_id": update.document_id } });
        let doc = json!({
            "doc": { update.field.as_str(): update.values },
            "doc_as_upsert": true
        });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&doc.to_string());
        body.push('\n');
    }
    body
}

/// Per-item outcome of a `_bulk` response.
pub(crate) fn count_bulk_items(response: &Value) -> BatchOutcome {
    let items = response["items"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    let mut outcome = BatchOutcome::default();
    for item in items {
        let result = item
            .as_object()
            .and_then(|o| o.values().next())
            .cloned()
            .unwrap_or(Value::Null);
        let status = result["status"].as_u64().unwrap_or(0);
        if result.get("error").is_some() || !(200..300).contains(&status) {
            warn!(id = %result["_id"], error = %result["error"], "Index update failed");
            outcome.failed += 1;
        } else {
            outcome.succeeded += 1;
        }
    }
    outcome
}

#[async_trait]
impl IndexWriter for SearchIndex {
    async fn write_fields(&self, updates: &[IndexFieldUpdate]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for chunk in updates.chunks(BULK_CHUNK) {
            let sent = self
                .send_json::<Value>(
                    self.request(reqwest::Method::POST, "_bulk")
                        .header("Content-Type", "application/x-ndjson")
                        .body(bulk_body(&self.indexes.documents, chunk)),
                )
                .await;
            match sent {
                Ok(resp) => {
                    let counted = count_bulk_items(&resp);
                    // Items missing from the response were not applied.
                    let missing = chunk.len().saturating_sub(counted.total());
                    outcome = outcome.merge(counted).merge(BatchOutcome::new(0, missing));
                }
                Err(e) => {
                    warn!(error = %e, updates = chunk.len(), "Bulk update request failed");
                    outcome.failed += chunk.len();
                }
            }
        }
        info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Index fields written"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxon_common::CategorizationField;

    #[test]
    fn bulk_body_is_ndjson_upserts() {
        let updates = vec![IndexFieldUpdate {
            document_id: "abc".into(),
            field: CategorizationField::Mandate,
            values: vec!["Conservation".into()],
        }];
        let body = bulk_body("documents", &updates);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["update"]["_id"], "abc");
        let doc: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["doc"]["mandate_categorization"], json!(["Conservation"]));
        assert_eq!(doc["doc_as_upsert"], true);
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn counts_bulk_item_failures() {
        let response = json!({
            "errors": true,
            "items": [
                { "update": { "_id": "a", "status": 200 } },
                { "update": { "_id": "b", "status": 404, "error": { "type": "document_missing_exception" } } },
                { "update": { "_id": "c", "status": 201 } }
            ]
        });
        assert_eq!(count_bulk_items(&response), BatchOutcome::new(2, 1));
    }

    #[test]
    fn knn_query_requests_k_neighbours() {
        let q = knn_query(&[0.5, 0.25], 14);
        assert_eq!(q["size"], 14);
        assert_eq!(q["query"]["knn"]["embedding"]["k"], 14);
        assert_eq!(q["query"]["knn"]["embedding"]["vector"], json!([0.5, 0.25]));
    }

    #[test]
    fn document_hits_accept_legacy_url_field() {
        let hit: DocumentHit = serde_json::from_value(json!({
            "html_url": "https://x/doc1",
            "text": "t",
            "embedding": [1.0],
            "document_type": "Report"
        }))
        .unwrap();
        assert_eq!(hit.url, "https://x/doc1");
        assert_eq!(hit.year, None);
    }
}
