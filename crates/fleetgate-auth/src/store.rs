//! Session snapshot persistence
//!
//! The session manager keeps live sessions in memory and mirrors each one to
//! a `SessionSnapshotStore` so they survive a restart.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::types::Session;

/// Durable copy of live sessions
#[async_trait]
pub trait SessionSnapshotStore: Send + Sync {
    /// Insert or replace the snapshot for `session.id`
    async fn put(&self, session: &Session) -> AuthResult<()>;

    /// Remove a snapshot; missing ids are not an error
    async fn delete(&self, session_id: &str) -> AuthResult<()>;

    /// Every stored snapshot
    async fn load_all(&self) -> AuthResult<Vec<Session>>;
}

/// In-memory snapshot store
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<String, Session>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.snapshots.contains_key(session_id)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.snapshots.get(session_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl SessionSnapshotStore for MemorySnapshotStore {
    async fn put(&self, session: &Session) -> AuthResult<()> {
        self.snapshots.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> AuthResult<()> {
        self.snapshots.remove(session_id);
        Ok(())
    }

    async fn load_all(&self) -> AuthResult<Vec<Session>> {
        Ok(self.snapshots.iter().map(|e| e.value().clone()).collect())
    }
}

/// One `<id>.json` file per session in a directory
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    dir: PathBuf,
}

impl JsonFileSnapshotStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl AsRef<Path>) -> AuthResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> AuthResult<PathBuf> {
        // Session ids are base64url; anything else could escape the directory
        let safe = !session_id.is_empty()
            && session_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !safe {
            return Err(AuthError::Storage(format!(
                "invalid session id for snapshot: {session_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl SessionSnapshotStore for JsonFileSnapshotStore {
    async fn put(&self, session: &Session) -> AuthResult<()> {
        let path = self.path_for(&session.id)?;
        // One temp file per write, so concurrent puts of the same id never share it
        let tmp = self.dir.join(format!(".{}.{}.tmp", session.id, Uuid::new_v4()));
        let bytes = serde_json::to_vec(session)?;

        if let Err(e) = write_synced(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(
            session_id = %session.id,
            path = %path.display(),
            "Session snapshot written"
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> AuthResult<()> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> AuthResult<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable session snapshot"
                    );
                }
            }
        }

        Ok(sessions)
    }
}

/// Write and fsync, so the rename only ever publishes complete contents
async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}
