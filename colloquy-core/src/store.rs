//! Session persistence
//!
//! Sessions are saved as [`SessionSnapshot`]s through a [`SessionStore`].
//! Two backends are provided:
//!
//! - [`JsonFileStore`]: one `<id>.json` file per session in a directory
//! - [`InMemoryStore`]: a map, for tests and throwaway sessions

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::client::ClientIdentity;
use crate::error::{EngineError, Result};
use crate::session::Session;
use crate::timeline::{DEFAULT_EVENT_BUFFER, Timeline, TimelineItem};

/// Version of the snapshot layout
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable image of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub items: Vec<TimelineItem>,
    #[serde(default)]
    pub tokens_consumed: u64,
    #[serde(default)]
    pub total_price: f64,
    #[serde(default)]
    pub default_client: Option<ClientIdentity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub topic: String,
    pub items: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&SessionSnapshot> for SessionSummary {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            topic: snapshot.topic.clone(),
            items: snapshot.items.len(),
            updated_at: snapshot.updated_at,
        }
    }
}

impl Session {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            schema_version: SNAPSHOT_VERSION,
            id: self.id().to_string(),
            topic: self.topic().to_string(),
            system_prompt: self.system_prompt().map(str::to_string),
            items: self.items().to_vec(),
            tokens_consumed: self.tokens_consumed(),
            total_price: self.total_price(),
            default_client: self.default_client().cloned(),
            created_at: self.created_at(),
            updated_at: self.updated_at(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild a session; the responding counter always starts at zero
    pub fn from_snapshot(snapshot: SessionSnapshot, event_buffer: usize) -> Result<Self> {
        if snapshot.schema_version != SNAPSHOT_VERSION {
            return Err(EngineError::Storage(format!(
                "session {} has unsupported snapshot version {}",
                snapshot.id, snapshot.schema_version
            )));
        }

        let mut session = Session::with_id(snapshot.id, snapshot.topic)
            .with_timeline(Timeline::from_items(snapshot.items, event_buffer))
            .with_totals(snapshot.tokens_consumed, snapshot.total_price)
            .with_timestamps(snapshot.created_at, snapshot.updated_at);
        if let Some(prompt) = snapshot.system_prompt {
            session = session.with_system_prompt(prompt);
        }
        if let Some(client) = snapshot.default_client {
            session = session.with_default_client(client);
        }
        Ok(session)
    }
}

/// Storage backend for sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save (create or overwrite) a session
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Load a session by id
    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>>;

    /// List stored sessions, most recently updated first
    async fn list(&self) -> Result<Vec<SessionSummary>>;

    /// Delete a session; returns whether it existed
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Load a session and rebuild it
    async fn open(&self, id: &str) -> Result<Option<Session>> {
        match self.load(id).await? {
            Some(snapshot) => Session::from_snapshot(snapshot, DEFAULT_EVENT_BUFFER).map(Some),
            None => Ok(None),
        }
    }
}

/// Directory of JSON files, one per session
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open a store, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(dir = %dir.display(), "Session store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(EngineError::Storage(format!("invalid session id: {:?}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.id)?;
        let temp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(snapshot)?;

        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, &path).await?;
        tracing::debug!(session_id = %snapshot.id, path = %path.display(), "Session saved");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.path_for(id)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_slice(&data).map_err(|e| {
            EngineError::Storage(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(snapshot))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to read session file: {}", e);
                    continue;
                }
            };
            match serde_json::from_slice::<SessionSnapshot>(&data) {
                Ok(snapshot) => summaries.push(SessionSummary::from(&snapshot)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping malformed session file: {}", e);
                }
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(session_id = %id, "Session deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map-backed store for tests and ephemeral use
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, SessionSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(SessionSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }
}
