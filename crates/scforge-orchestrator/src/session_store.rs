//! Append-only session audit store
//!
//! One JSON-lines file per session under the store directory. Records are
//! only ever appended: an `opened` header, one `attempt` line per finished
//! attempt, and a `closed` footer once the session is terminal.

use chrono::{DateTime, Utc};
use scforge_core::{
    BuildAttempt, BuildSession, ContractSpecification, ForgeError, Result, SessionId,
    SessionStatus,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One line of a session file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum StoreRecord {
    Opened {
        session_id: SessionId,
        specification: ContractSpecification,
        max_attempts: u32,
        created_at: DateTime<Utc>,
    },
    Attempt {
        attempt: BuildAttempt,
    },
    Closed {
        status: SessionStatus,
        program_id: Option<String>,
        abort_reason: Option<String>,
        finished_at: Option<DateTime<Utc>>,
    },
}

/// Summary row for `list`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    pub attempts: usize,
    pub max_attempts: u32,
    pub program_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&BuildSession> for SessionSummary {
    fn from(session: &BuildSession) -> Self {
        Self {
            id: session.id,
            name: session.specification.name.clone(),
            status: session.status,
            attempts: session.attempts.len(),
            max_attempts: session.max_attempts,
            program_id: session.program_id.clone(),
            created_at: session.created_at,
        }
    }
}

/// File-backed session history
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", id))
    }

    async fn append(&self, id: SessionId, record: &StoreRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let path = self.session_path(id);

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ForgeError::Store(format!("Failed to create {}: {}", self.dir.display(), e)))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ForgeError::Store(format!("Failed to open {}: {}", path.display(), e)))?;

        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| ForgeError::Store(format!("Failed to append to {}: {}", path.display(), e)))?;

        Ok(())
    }

    pub async fn open_session(&self, session: &BuildSession) -> Result<()> {
        debug!("Opening session record {}", session.id);
        self.append(
            session.id,
            &StoreRecord::Opened {
                session_id: session.id,
                specification: session.specification.clone(),
                max_attempts: session.max_attempts,
                created_at: session.created_at,
            },
        )
        .await
    }

    pub async fn append_attempt(&self, id: SessionId, attempt: &BuildAttempt) -> Result<()> {
        debug!("Appending attempt {} to session {}", attempt.sequence, id);
        self.append(
            id,
            &StoreRecord::Attempt {
                attempt: attempt.clone(),
            },
        )
        .await
    }

    pub async fn close_session(&self, session: &BuildSession) -> Result<()> {
        debug!("Closing session record {} as {}", session.id, session.status);
        self.append(
            session.id,
            &StoreRecord::Closed {
                status: session.status,
                program_id: session.program_id.clone(),
                abort_reason: session.abort_reason.clone(),
                finished_at: session.finished_at,
            },
        )
        .await
    }

    /// Rebuild a session from its file
    ///
    /// A session without a `closed` record is reported as still running.
    pub async fn load(&self, id: SessionId) -> Result<BuildSession> {
        let path = self.session_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ForgeError::SessionNotFound(id.to_string()));
            }
            Err(e) => {
                return Err(ForgeError::Store(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut session: Option<BuildSession> = None;

        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let record: StoreRecord = serde_json::from_str(line).map_err(|e| {
                ForgeError::Store(format!("{}:{}: {}", path.display(), index + 1, e))
            })?;

            let out_of_order =
                || ForgeError::Store(format!("{}:{}: record out of order", path.display(), index + 1));

            match record {
                StoreRecord::Opened {
                    session_id,
                    specification,
                    max_attempts,
                    created_at,
                } => {
                    if session.is_some() {
                        return Err(out_of_order());
                    }
                    let mut opened = BuildSession::with_id(session_id, specification, max_attempts);
                    opened.created_at = created_at;
                    session = Some(opened);
                }
                StoreRecord::Attempt { attempt } => {
                    session.as_mut().ok_or_else(out_of_order)?.attempts.push(attempt);
                }
                StoreRecord::Closed {
                    status,
                    program_id,
                    abort_reason,
                    finished_at,
                } => {
                    let open = session.as_mut().ok_or_else(out_of_order)?;
                    open.status = status;
                    open.program_id = program_id;
                    open.abort_reason = abort_reason;
                    open.finished_at = finished_at;
                }
            }
        }

        session.ok_or_else(|| ForgeError::Store(format!("{} has no opened record", path.display())))
    }

    /// Every stored session, newest first
    ///
    /// Unreadable files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ForgeError::Store(format!("Failed to list sessions: {}", e))),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "jsonl") {
                continue;
            }

            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<SessionId>().ok())
            else {
                continue;
            };

            match self.load(id).await {
                Ok(session) => summaries.push(SessionSummary::from(&session)),
                Err(e) => tracing::warn!("Skipping session file {:?}: {}", path, e),
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scforge_core::{AttemptOutcome, ContractKind, GenerationMode};
    use tempfile::TempDir;

    fn attempt(sequence: u32, outcome: AttemptOutcome) -> BuildAttempt {
        let now = Utc::now();
        BuildAttempt {
            sequence,
            mode: GenerationMode::Generate,
            source: format!("// {}", sequence),
            raw_output: String::new(),
            exit_code: Some(0),
            diagnostics: vec![],
            outcome,
            tool_error: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));

        let mut session = BuildSession::new(
            ContractSpecification::new(ContractKind::Escrow, "Test Escrow"),
            3,
        );
        store.open_session(&session).await.unwrap();

        let first = attempt(1, AttemptOutcome::Failed);
        session.record_attempt(first.clone()).unwrap();
        store.append_attempt(session.id, &first).await.unwrap();

        let second = attempt(2, AttemptOutcome::Succeeded);
        session.record_attempt(second.clone()).unwrap();
        store.append_attempt(session.id, &second).await.unwrap();

        session.succeed("Prog1111").unwrap();
        store.close_session(&session).await.unwrap();

        let loaded = store.load(session.id).await.unwrap();
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn test_unclosed_session_is_running() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let session = BuildSession::new(ContractSpecification::new(ContractKind::Custom, "x"), 2);

        store.open_session(&session).await.unwrap();
        let loaded = store.load(session.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Running);
        assert!(loaded.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_missing_session() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let err = store.load(SessionId::new()).await.unwrap_err();
        assert!(matches!(err, ForgeError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_out_of_order_file_is_store_error() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let id = SessionId::new();

        store
            .append_attempt(id, &attempt(1, AttemptOutcome::Failed))
            .await
            .unwrap();
        let err = store.load(id).await.unwrap_err();
        assert!(matches!(err, ForgeError::Store(_)));
    }

    #[tokio::test]
    async fn test_list_newest_first_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());

        let older = BuildSession::new(ContractSpecification::new(ContractKind::Escrow, "old"), 1);
        let mut newer = BuildSession::new(ContractSpecification::new(ContractKind::Escrow, "new"), 1);
        newer.created_at = older.created_at + chrono::Duration::seconds(5);

        store.open_session(&older).await.unwrap();
        store.open_session(&newer).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::fs::write(
            dir.path().join(format!("{}.jsonl", SessionId::new())),
            "not json\n",
        )
        .unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, "new");
        assert_eq!(summaries[1].name, "old");
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
