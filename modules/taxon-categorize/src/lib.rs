pub mod classifier;
pub mod retriever;
pub mod runner;

pub use classifier::{Judgment, StructuredClassifier};
pub use retriever::{
    build_retriever, BatchMatrixRetriever, CandidateRetriever, NeighborIndexRetriever,
    RetrievalSettings,
};
pub use runner::{CategorizationOutcome, CategorizeStats, Categorizer};
