use std::sync::Arc;

use ai_client::{Claude, LanguageModel, OpenAi};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use taxon_common::{Config, LlmProvider, PipelineMode, SimilarityBackend, TopicModellingMode};
use taxon_pipeline::{Collaborators, Pipeline, PipelineSettings};
use taxon_store::{PgStore, SearchIndex};
use taxon_topics::FsModelStore;

#[derive(Parser)]
#[command(name = "taxon", about = "Categorize documents and discover derived topics")]
struct Cli {
    /// full_update, topics_only or html_only. Overrides PIPELINE_MODE.
    #[arg(long)]
    pipeline_mode: Option<PipelineMode>,

    /// retrain or predict. Overrides TOPIC_MODELLING_MODE.
    #[arg(long)]
    topic_mode: Option<TopicModellingMode>,

    /// batch_matrix or nearest_neighbor_index. Overrides SIMILARITY_BACKEND.
    #[arg(long)]
    similarity_backend: Option<SimilarityBackend>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,taxon=info,ai_client=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn language_model(config: &Config) -> Arc<dyn LanguageModel> {
    match config.llm_provider {
        LlmProvider::Anthropic => {
            let model = config
                .llm_model
                .clone()
                .unwrap_or_else(|| ai_client::claude::DEFAULT_MODEL.to_string());
            let mut claude = Claude::new(config.llm_api_key.clone(), model);
            if let Some(url) = &config.llm_base_url {
                claude = claude.with_base_url(url.clone());
            }
            Arc::new(claude)
        }
        LlmProvider::OpenAi => {
            let model = config
                .llm_model
                .clone()
                .unwrap_or_else(|| ai_client::openai::DEFAULT_MODEL.to_string());
            let mut openai = OpenAi::new(config.llm_api_key.clone(), model);
            if let Some(url) = &config.llm_base_url {
                openai = openai.with_base_url(url.clone());
            }
            Arc::new(openai)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(mode) = cli.pipeline_mode {
        config.pipeline_mode = mode;
    }
    if let Some(mode) = cli.topic_mode {
        config.topic_modelling_mode = mode;
    }
    if let Some(backend) = cli.similarity_backend {
        config.similarity_backend = backend;
    }
    config.log_redacted();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));
    store.migrate().await?;
    tracing::info!("Migrations complete");

    let index = Arc::new(SearchIndex::from_config(&config)?);
    let deps = Collaborators {
        documents: index.clone(),
        targets: index.clone(),
        neighbors: index.clone(),
        index,
        store: store.clone(),
        ingestion: store,
        models: Arc::new(FsModelStore::new(config.model_dir.clone())),
        llm: language_model(&config),
    };

    let pipeline = Pipeline::new(deps, PipelineSettings::from_config(&config));
    let report = pipeline.run(config.pipeline_mode).await?;

    tracing::info!(
        run_id = %report.log.run_id,
        events = report.log.events().len(),
        stats = %serde_json::to_string(&report.stats).unwrap_or_default(),
        "Done"
    );
    Ok(())
}
