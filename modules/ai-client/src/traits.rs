use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// LanguageModel Trait
// =============================================================================

/// Single-turn text completion. Callers must tolerate replies that are not
/// (or only partially) the format they asked for.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String>;

    /// Identifier logged alongside calls.
    fn model_name(&self) -> &str;
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for Arc<T> {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        (**self).invoke(prompt).await
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}
