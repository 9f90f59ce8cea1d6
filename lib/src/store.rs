//! Where campaign results end up. The [`FileStore`] keeps one directory per campaign:
//! `summary.toml` plus a `crash-<fingerprint>.toml` for every unique crash.
use crate::aggregate::CampaignRunSummary;
use crate::dedup::CrashRecord;
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not serialize: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[async_trait]
pub trait CampaignStore: Send + Sync + Debug {
    async fn write_summary(&self, summary: &CampaignRunSummary) -> Result<(), StoreError>;
    async fn write_crash(&self, campaign_id: &str, record: &CrashRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn campaign_dir(&self, campaign_id: &str) -> PathBuf {
        self.root.join(campaign_id)
    }

    pub fn crash_path(&self, campaign_id: &str, record: &CrashRecord) -> PathBuf {
        self.campaign_dir(campaign_id)
            .join(format!("crash-{}.toml", record.fingerprint))
    }

    async fn write(&self, path: &Path, contents: String) -> Result<(), StoreError> {
        let io = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io)?;
        }
        fs::write(path, contents).await.map_err(io)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    pub async fn read_crash(path: impl AsRef<Path>) -> color_eyre::Result<CrashRecord> {
        let content = fs::read_to_string(path).await?;
        Ok(toml::from_str(&content)?)
    }
}

#[async_trait]
impl CampaignStore for FileStore {
    async fn write_summary(&self, summary: &CampaignRunSummary) -> Result<(), StoreError> {
        let path = self.campaign_dir(&summary.campaign_id).join("summary.toml");
        self.write(&path, toml::to_string(summary)?).await
    }

    async fn write_crash(&self, campaign_id: &str, record: &CrashRecord) -> Result<(), StoreError> {
        let path = self.crash_path(campaign_id, record);
        self.write(&path, toml::to_string(record)?).await
    }
}
