//! Durable node state: one JSON document per node, rewritten atomically via
//! write-temp-then-rename on every durability-requiring event.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::LogEntry;
use crate::error::Result;

pub const STATE_FILE_NAME: &str = "raft_state.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        StateFile {
            path: dir.as_ref().join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent file means a node that has never persisted: zero state.
    pub async fn load(&self) -> Result<PersistentState> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(PersistentState::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, state: &PersistentState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?).await?;
        // Rename is atomic on the target filesystem; readers see either the
        // old document or the new one, never a partial write.
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn absent_file_loads_zero_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path());
        let state = file.load().await.unwrap();
        assert_eq!(state, PersistentState::default());
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path());
        let state = PersistentState {
            current_term: 4,
            voted_for: Some("127.0.0.1:9001".into()),
            log: vec![
                LogEntry {
                    term: 2,
                    command: json!({"action": "PUT", "filename": "a.txt", "data_b64": "aGk="}),
                },
                LogEntry {
                    term: 4,
                    command: json!({"k": "x", "v": 1}),
                },
            ],
        };
        file.save(&state).await.unwrap();
        assert_eq!(file.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn second_save_replaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path());
        file.save(&PersistentState {
            current_term: 1,
            voted_for: None,
            log: vec![],
        })
        .await
        .unwrap();
        let newer = PersistentState {
            current_term: 2,
            voted_for: Some("n2".into()),
            log: vec![LogEntry {
                term: 2,
                command: json!({"k": "y"}),
            }],
        };
        file.save(&newer).await.unwrap();
        assert_eq!(file.load().await.unwrap(), newer);
        // No stray temp file left behind.
        assert!(!file.path().with_extension("json.tmp").exists());
    }
}
