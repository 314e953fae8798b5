use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use taxon_common::TaxonError;

use crate::model::TopicModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSlot {
    /// Fitted over all documents except the excluded type.
    Primary,
    /// Fitted over the primary model's outliers, when there were enough.
    Secondary,
}

impl ModelSlot {
    pub fn file_name(&self) -> &'static str {
        match self {
            ModelSlot::Primary => "primary.json",
            ModelSlot::Secondary => "secondary.json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSlot::Primary => "primary",
            ModelSlot::Secondary => "secondary",
        }
    }
}

/// Durable storage for fitted topic models.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn save(&self, slot: ModelSlot, model: &TopicModel) -> Result<()>;

    /// `Ok(None)` when nothing was saved in `slot`. A stored artifact that
    /// cannot be read is an error.
    async fn load(&self, slot: ModelSlot) -> Result<Option<TopicModel>>;

    async fn remove(&self, slot: ModelSlot) -> Result<()>;
}

/// JSON files under one directory.
pub struct FsModelStore {
    dir: PathBuf,
}

impl FsModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, slot: ModelSlot) -> PathBuf {
        self.dir.join(slot.file_name())
    }
}

#[async_trait]
impl ModelStore for FsModelStore {
    async fn save(&self, slot: ModelSlot, model: &TopicModel) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating model dir {}", self.dir.display()))?;

        let path = self.path(slot);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(model)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;

        info!(slot = slot.as_str(), path = %path.display(), topics = model.topics.len(), "Saved topic model");
        Ok(())
    }

    async fn load(&self, slot: ModelSlot) -> Result<Option<TopicModel>> {
        let path = self.path(slot);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TaxonError::Model(format!("reading {}: {e}", path.display())).into())
            }
        };
        let model = serde_json::from_slice(&bytes).map_err(|e| {
            TaxonError::Model(format!("decoding {}: {e}", path.display()))
        })?;
        Ok(Some(model))
    }

    async fn remove(&self, slot: ModelSlot) -> Result<()> {
        match tokio::fs::remove_file(self.path(slot)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {} model", slot.as_str())),
        }
    }
}
