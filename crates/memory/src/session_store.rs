use crate::context_manager::{ContextConfig, ContextManager};
use crate::loop_detector::{LoopConfig, LoopDetector};
use crate::session::SessionState;
use crate::types::{Message, MessageId, TokenUsage, SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use keel_policy::ApprovalPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Checkpoint not found: {0}")]
    NotFound(String),
    #[error("Invalid checkpoint id: {0}")]
    InvalidId(String),
}

/// Error type of [`CheckpointStore`] operations.
pub type StoreError = MemoryError;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Durable snapshot of a session. Unknown fields are ignored and missing
/// ones take defaults, so checkpoints written by newer versions still load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub checkpoint_id: String,
    pub session_id: String,
    #[serde(default)]
    pub turn: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub session_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub policy: ApprovalPolicy,
    #[serde(default)]
    pub next_message_id: MessageId,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Checkpoint {
    pub fn from_state(state: &SessionState, checkpoint_id: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            checkpoint_id,
            session_id: state.session_id.clone(),
            turn: state.turn,
            created_at: Utc::now(),
            session_created_at: Some(state.created_at),
            policy: state.policy,
            next_message_id: state.context.next_id(),
            token_usage: state.token_usage,
            messages: state.context.messages().to_vec(),
        }
    }

    /// Rebuild live state. Configuration is not persisted and comes from the caller.
    pub fn into_state(self, context: ContextConfig, loops: LoopConfig) -> SessionState {
        SessionState {
            session_id: self.session_id,
            policy: self.policy,
            turn: self.turn,
            token_usage: self.token_usage,
            created_at: self.session_created_at.unwrap_or(self.created_at),
            context: ContextManager::restore(context, self.messages, self.next_message_id),
            loop_detector: LoopDetector::new(loops),
        }
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: self.checkpoint_id.clone(),
            session_id: self.session_id.clone(),
            turn: self.turn,
            created_at: self.created_at,
            message_count: self.messages.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub session_id: String,
    pub turn: u64,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

/// One JSON file per checkpoint, published atomically.
pub struct CheckpointStore {
    base_path: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub async fn initialize(&self) -> Result<(), MemoryError> {
        fs::create_dir_all(&self.base_path).await?;
        info!("Checkpoint store initialized at {:?}", self.base_path);
        Ok(())
    }

    /// Persist `state` and return the new checkpoint id.
    pub async fn save(&self, state: &SessionState) -> Result<String, MemoryError> {
        let checkpoint_id = format!(
            "{}_{}_{}",
            state.session_id,
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let checkpoint = Checkpoint::from_state(state, checkpoint_id);
        self.write(&checkpoint).await?;
        Ok(checkpoint.checkpoint_id)
    }

    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<(), MemoryError> {
        let path = self.checkpoint_path(&checkpoint.checkpoint_id)?;
        fs::create_dir_all(&self.base_path).await?;

        // Atomic write: hidden temp file, fsync, then rename over the final name
        let temp_path = self
            .base_path
            .join(format!(".{}.json.tmp", checkpoint.checkpoint_id));
        let content = serde_json::to_vec_pretty(checkpoint)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        sync_dir(&self.base_path).await?;

        debug!(
            "Saved checkpoint {} ({} messages)",
            checkpoint.checkpoint_id,
            checkpoint.messages.len()
        );
        Ok(())
    }

    pub async fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint, MemoryError> {
        let path = self.checkpoint_path(checkpoint_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MemoryError::NotFound(checkpoint_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        if checkpoint.schema_version > SCHEMA_VERSION {
            warn!(
                "Checkpoint {} has newer schema version {} (current {})",
                checkpoint_id, checkpoint.schema_version, SCHEMA_VERSION
            );
        }
        Ok(checkpoint)
    }

    pub async fn load(
        &self,
        checkpoint_id: &str,
        context: ContextConfig,
        loops: LoopConfig,
    ) -> Result<SessionState, MemoryError> {
        let checkpoint = self.load_checkpoint(checkpoint_id).await?;
        info!(
            "Restored session {} from checkpoint {} (turn {})",
            checkpoint.session_id, checkpoint_id, checkpoint.turn
        );
        Ok(checkpoint.into_state(context, loops))
    }

    /// All readable checkpoints, newest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<CheckpointSummary>, MemoryError> {
        let mut summaries = Vec::new();
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let id = name.trim_end_matches(".json");
            match self.load_checkpoint(id).await {
                Ok(checkpoint) => summaries.push(checkpoint.summary()),
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", name, e),
            }
        }

        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.checkpoint_id.cmp(&a.checkpoint_id))
        });
        Ok(summaries)
    }

    pub async fn latest_for(&self, session_id: &str) -> Result<Option<CheckpointSummary>, MemoryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|s| s.session_id == session_id))
    }

    pub async fn delete(&self, checkpoint_id: &str) -> Result<(), MemoryError> {
        let path = self.checkpoint_path(checkpoint_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted checkpoint {}", checkpoint_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MemoryError::NotFound(checkpoint_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn checkpoint_path(&self, checkpoint_id: &str) -> Result<PathBuf, MemoryError> {
        if checkpoint_id.is_empty()
            || checkpoint_id.starts_with('.')
            || checkpoint_id.contains("..")
            || checkpoint_id.contains('/')
            || checkpoint_id.contains('\\')
        {
            return Err(MemoryError::InvalidId(checkpoint_id.to_string()));
        }
        Ok(self.base_path.join(format!("{}.json", checkpoint_id)))
    }
}

/// Persist the directory entry created by a rename.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), MemoryError> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), MemoryError> {
    Ok(())
}
