pub mod config;
pub mod error;
pub mod run_log;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod types;
pub mod vector;

pub use config::{
    Config, LlmProvider, PipelineMode, ScoreTransform, SimilarityBackend, TopicModellingMode,
};
pub use error::TaxonError;
pub use run_log::{EventKind, RunEvent, RunLog};
pub use traits::*;
pub use types::*;
