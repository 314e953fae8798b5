// Postgres relational store: categorization rows, derived topics, topic
// assignments, the topic ingestion log and run history.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{info, warn};

use taxon_common::{
    BatchOutcome, CategorizationRecord, DerivedTopic, DocumentTopicAssignment, IngestionLog,
    RelationalStore, RunLog, TargetType, TaxonError,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TaxonError::Persistence(format!("migrations failed: {e}")))?;
        Ok(())
    }

    async fn upsert_categorization(&self, r: &CategorizationRecord) -> sqlx::Result<()> {
        let query = match r.target_type {
            TargetType::Mandate => sqlx::query(
                r#"
                INSERT INTO documents_mandates
                    (document_id, html_url, mandate_name, llm_belongs, llm_score,
                     llm_explanation, semantic_score)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (document_id, mandate_name) DO UPDATE
                    SET html_url = EXCLUDED.html_url,
                        llm_belongs = EXCLUDED.llm_belongs,
                        llm_score = EXCLUDED.llm_score,
                        llm_explanation = EXCLUDED.llm_explanation,
                        semantic_score = EXCLUDED.semantic_score,
                        updated_at = now()
                "#,
            ),
            TargetType::Topic => sqlx::query(
                r#"
                INSERT INTO documents_topics
                    (document_id, html_url, topic_name, llm_belongs, llm_score,
                     llm_explanation, semantic_score, is_primary)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (document_id, topic_name) DO UPDATE
                    SET html_url = EXCLUDED.html_url,
                        llm_belongs = EXCLUDED.llm_belongs,
                        llm_score = EXCLUDED.llm_score,
                        llm_explanation = EXCLUDED.llm_explanation,
                        semantic_score = EXCLUDED.semantic_score,
                        is_primary = EXCLUDED.is_primary,
                        updated_at = now()
                "#,
            ),
        };

        let query = query
            .bind(&r.document_id)
            .bind(&r.url)
            .bind(&r.target_name)
            .bind(r.belongs_label())
            .bind(i16::from(r.llm_score))
            .bind(&r.llm_explanation)
            .bind(r.semantic_score);
        let query = match r.target_type {
            TargetType::Topic => query.bind(r.is_primary),
            TargetType::Mandate => query,
        };
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_assignment(&self, a: &DocumentTopicAssignment) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents_derived_topic (document_id, html_url, topic_name, confidence_score)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (document_id, topic_name) DO UPDATE
                SET html_url = EXCLUDED.html_url,
                    confidence_score = EXCLUDED.confidence_score,
                    updated_at = now()
            "#,
        )
        .bind(&a.document_id)
        .bind(&a.url)
        .bind(&a.topic_name)
        .bind(a.confidence_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn upsert_categorizations(
        &self,
        records: &[CategorizationRecord],
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for record in records {
            match self.upsert_categorization(record).await {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    warn!(
                        document_id = %record.document_id,
                        target = %record.target_name,
                        error = %e,
                        "Failed to upsert categorization"
                    );
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn accepted_categorizations(
        &self,
        target_type: TargetType,
    ) -> Result<Vec<(String, String)>> {
        let sql = match target_type {
            TargetType::Mandate => {
                "SELECT document_id, mandate_name FROM documents_mandates \
                 WHERE llm_belongs = 'Yes' ORDER BY document_id, mandate_name"
            }
            TargetType::Topic => {
                "SELECT document_id, topic_name FROM documents_topics \
                 WHERE llm_belongs = 'Yes' ORDER BY document_id, topic_name"
            }
        };
        let rows = sqlx::query_as::<_, (String, String)>(sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn purge_derived_topics(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let edges = sqlx::query("DELETE FROM documents_derived_topic")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let topics = sqlx::query("DELETE FROM derived_topics")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        info!(topics, edges, "Purged derived topics");
        Ok(())
    }

    async fn insert_derived_topics(&self, topics: &[DerivedTopic]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for topic in topics {
            let result = sqlx::query(
                r#"
                INSERT INTO derived_topics (topic_name, representation, representative_docs)
                VALUES ($1, $2, $3)
                ON CONFLICT (topic_name) DO UPDATE
                    SET representation = EXCLUDED.representation,
                        representative_docs = EXCLUDED.representative_docs
                "#,
            )
            .bind(&topic.topic_name)
            .bind(Json(&topic.representation))
            .bind(Json(&topic.representative_docs))
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => outcome.succeeded += 1,
                Err(e) => {
                    warn!(topic = %topic.topic_name, error = %e, "Failed to insert derived topic");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn derived_topics(&self) -> Result<Vec<DerivedTopic>> {
        let rows = sqlx::query_as::<_, (String, Json<Vec<String>>, Json<Vec<String>>)>(
            "SELECT topic_name, representation, representative_docs FROM derived_topics \
             ORDER BY created_at, topic_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(topic_name, representation, docs)| DerivedTopic {
                topic_name,
                representation: representation.0,
                representative_docs: docs.0,
            })
            .collect())
    }

    async fn upsert_topic_assignments(
        &self,
        assignments: &[DocumentTopicAssignment],
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for assignment in assignments {
            match self.upsert_assignment(assignment).await {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    warn!(
                        document_id = %assignment.document_id,
                        topic = %assignment.topic_name,
                        error = %e,
                        "Failed to upsert topic assignment"
                    );
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn accepted_topic_assignments(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT document_id, topic_name FROM documents_derived_topic \
             WHERE confidence_score > 0 AND topic_name <> 'Miscellaneous' \
             ORDER BY document_id, topic_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_run(&self, log: &RunLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO taxon_runs (run_id, mode, started_at, finished_at, events)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id) DO UPDATE
                SET finished_at = EXCLUDED.finished_at,
                    events = EXCLUDED.events
            "#,
        )
        .bind(&log.run_id)
        .bind(&log.mode)
        .bind(log.started_at)
        .bind(Utc::now())
        .bind(Json(log.events()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IngestionLog for PgStore {
    async fn unprocessed(&self, document_ids: &[String]) -> Result<HashSet<String>> {
        let seen: HashSet<String> = sqlx::query_as::<_, (String,)>(
            "SELECT document_id FROM topic_ingestion_log WHERE document_id = ANY($1)",
        )
        .bind(document_ids)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(id,)| id)
        .collect();

        Ok(document_ids
            .iter()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, document_ids: &[String]) -> Result<()> {
        if document_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO topic_ingestion_log (document_id)
            SELECT * FROM UNNEST($1::text[])
            ON CONFLICT (document_id) DO UPDATE SET processed_at = now()
            "#,
        )
        .bind(document_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
