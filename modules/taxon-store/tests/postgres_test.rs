//! Integration tests for PgStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use sqlx::PgPool;
use taxon_common::{
    BatchOutcome, CategorizationRecord, DerivedTopic, Document, DocumentTopicAssignment,
    EventKind, IngestionLog, RelationalStore, RunLog, TargetType, MISCELLANEOUS,
};
use taxon_store::PgStore;

/// Get a migrated store, or skip if no test DB is available.
async fn test_store() -> Option<PgStore> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    let store = PgStore::new(pool);
    store.migrate().await.ok()?;
    Some(store)
}

/// A document with a URL no other test run shares.
fn fresh_document() -> Document {
    let url = format!("https://test.invalid/{}", uuid::Uuid::new_v4());
    Document::new(url, "text", Some(vec![1.0, 0.0]), "Report")
}

fn record(
    document: &Document,
    target_type: TargetType,
    name: &str,
    belongs: bool,
    score: u8,
) -> CategorizationRecord {
    CategorizationRecord {
        document_id: document.document_id.clone(),
        url: document.url.clone(),
        target_type,
        target_name: name.into(),
        semantic_score: 0.83,
        llm_belongs: belongs,
        llm_score: score,
        llm_explanation: "matches the habitat survey".into(),
        is_primary: true,
    }
}

// =========================================================================
// Categorization rows
// =========================================================================

#[tokio::test]
async fn mandate_row_round_trips() {
    let Some(store) = test_store().await else {
        return;
    };
    let document = fresh_document();

    let outcome = store
        .upsert_categorizations(&[record(&document, TargetType::Mandate, "Conservation", true, 8)])
        .await
        .unwrap();
    assert_eq!(outcome, BatchOutcome::new(1, 0));

    let (url, belongs, score, semantic) = sqlx::query_as::<_, (String, String, i16, f64)>(
        "SELECT html_url, llm_belongs, llm_score, semantic_score FROM documents_mandates \
         WHERE document_id = $1 AND mandate_name = 'Conservation'",
    )
    .bind(&document.document_id)
    .fetch_one(store.pool())
    .await
    .unwrap();

    assert_eq!(url, document.url);
    assert_eq!(belongs, "Yes");
    assert_eq!(score, 8);
    assert!((semantic - 0.83).abs() < 1e-9);
}

#[tokio::test]
async fn repeated_upsert_overwrites_in_place() {
    let Some(store) = test_store().await else {
        return;
    };
    let document = fresh_document();

    store
        .upsert_categorizations(&[record(&document, TargetType::Topic, "Oceans", true, 6)])
        .await
        .unwrap();
    store
        .upsert_categorizations(&[record(&document, TargetType::Topic, "Oceans", false, 2)])
        .await
        .unwrap();

    let rows = sqlx::query_as::<_, (String, i16)>(
        "SELECT llm_belongs, llm_score FROM documents_topics WHERE document_id = $1",
    )
    .bind(&document.document_id)
    .fetch_all(store.pool())
    .await
    .unwrap();

    assert_eq!(rows, vec![("No".to_string(), 2)]);
    let accepted = store.accepted_categorizations(TargetType::Topic).await.unwrap();
    assert!(!accepted.iter().any(|(id, _)| id == &document.document_id));
}

// =========================================================================
// Derived topics
// =========================================================================

#[tokio::test]
async fn derived_topics_purge_and_reload() {
    let Some(store) = test_store().await else {
        return;
    };
    let document = fresh_document();
    let topic = DerivedTopic {
        topic_name: "Fish Stock Quotas".into(),
        representation: vec!["stock".into(), "quota".into(), "fish".into()],
        representative_docs: vec!["Quota advice for 2024".into()],
    };

    store.purge_derived_topics().await.unwrap();
    store.insert_derived_topics(&[topic.clone()]).await.unwrap();
    store
        .upsert_topic_assignments(&[
            DocumentTopicAssignment::new(&document, "Fish Stock Quotas", 0.9),
            DocumentTopicAssignment::new(&document, MISCELLANEOUS, 0.0),
        ])
        .await
        .unwrap();

    let topics = store.derived_topics().await.unwrap();
    assert_eq!(topics, vec![topic]);
    assert_eq!(topics[0].signature(), "stock, quota, fish");

    let accepted = store.accepted_topic_assignments().await.unwrap();
    assert_eq!(
        accepted,
        vec![(document.document_id.clone(), "Fish Stock Quotas".to_string())]
    );

    store.purge_derived_topics().await.unwrap();
    assert!(store.derived_topics().await.unwrap().is_empty());
    assert!(store.accepted_topic_assignments().await.unwrap().is_empty());
}

// =========================================================================
// Ingestion log and runs
// =========================================================================

#[tokio::test]
async fn ingestion_log_tracks_processed_documents() {
    let Some(store) = test_store().await else {
        return;
    };
    let seen = fresh_document().document_id;
    let fresh = fresh_document().document_id;

    store.mark_processed(&[seen.clone()]).await.unwrap();
    store.mark_processed(&[seen.clone()]).await.unwrap();

    let pending = store.unprocessed(&[seen, fresh.clone()]).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending.contains(&fresh));
}

#[tokio::test]
async fn run_log_is_recorded() {
    let Some(store) = test_store().await else {
        return;
    };
    let mut log = RunLog::start("full_update");
    log.log(EventKind::TopicStage {
        stage: "fit_primary".into(),
        documents: 3,
        detail: "2 topics".into(),
    });

    store.record_run(&log).await.unwrap();

    let (mode, events) = sqlx::query_as::<_, (String, serde_json::Value)>(
        "SELECT mode, events FROM taxon_runs WHERE run_id = $1",
    )
    .bind(&log.run_id)
    .fetch_one(store.pool())
    .await
    .unwrap();

    assert_eq!(mode, "full_update");
    assert_eq!(events[0]["type"], "topic_stage");
    assert_eq!(events[0]["stage"], "fit_primary");
}
