use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaxonError {
    /// LLM structured output still malformed after the repair attempts.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Target catalog or embedding index unreachable.
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Topic model artifacts missing or unusable.
    #[error("Model error: {0}")]
    Model(String),

    #[error("No persisted topic matches cluster signature \"{0}\"")]
    IdentityUnresolved(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline invariant was broken; nothing from the batch is persisted.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl TaxonError {
    /// Whether this error aborts the run rather than being absorbed into
    /// per-entity statistics.
    pub fn is_fatal(&self) -> bool {
        match self {
            TaxonError::Retrieval(_)
            | TaxonError::Model(_)
            | TaxonError::Config(_)
            | TaxonError::Invariant(_)
            | TaxonError::Anyhow(_) => true,
            TaxonError::Validation(_)
            | TaxonError::IdentityUnresolved(_)
            | TaxonError::Persistence(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infra_errors_are_fatal() {
        assert!(TaxonError::Retrieval("index down".into()).is_fatal());
        assert!(TaxonError::Model("primary.json missing".into()).is_fatal());
        assert!(TaxonError::Invariant("partition".into()).is_fatal());
    }

    #[test]
    fn per_entity_errors_are_absorbed() {
        assert!(!TaxonError::Validation("bad json".into()).is_fatal());
        assert!(!TaxonError::Persistence("row failed".into()).is_fatal());
        assert!(!TaxonError::IdentityUnresolved("a, b".into()).is_fatal());
    }
}
