use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event_log::{HistoryEntry, HistoryLog, HistoryRecord};
use crate::schema::{Interaction, Thread, ThreadSummary};
use crate::search::{self, SearchHit};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("thread {0} not found")]
    ThreadNotFound(Uuid),
    #[error("history log {0} is held by another daemon")]
    Locked(PathBuf),
}

struct ThreadState {
    thread: Thread,
    last_activity: DateTime<Utc>,
    /// Monotonic activity counter; the highest value is the most recent thread.
    activity_seq: u64,
}

impl ThreadState {
    fn summary(&self) -> ThreadSummary {
        ThreadSummary {
            id: self.thread.id,
            created_at: self.thread.created_at,
            last_activity: self.last_activity,
            interaction_count: self.thread.interactions.len(),
        }
    }
}

#[derive(Default)]
struct Index {
    threads: HashMap<Uuid, ThreadState>,
    next_seq: u64,
}

impl Index {
    fn apply(&mut self, record: HistoryRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        match record.entry {
            HistoryEntry::ThreadCreated { thread_id } => {
                self.threads.entry(thread_id).or_insert_with(|| ThreadState {
                    thread: Thread {
                        id: thread_id,
                        created_at: record.occurred_at,
                        interactions: Vec::new(),
                    },
                    last_activity: record.occurred_at,
                    activity_seq: seq,
                });
            }
            HistoryEntry::InteractionAppended {
                thread_id,
                interaction,
            } => {
                let state = self.threads.entry(thread_id).or_insert_with(|| {
                    warn!(%thread_id, "interaction for unknown thread; creating it");
                    ThreadState {
                        thread: Thread {
                            id: thread_id,
                            created_at: record.occurred_at,
                            interactions: Vec::new(),
                        },
                        last_activity: record.occurred_at,
                        activity_seq: seq,
                    }
                });
                state.thread.interactions.push(interaction);
                state.last_activity = record.occurred_at;
                state.activity_seq = seq;
            }
        }
    }

    fn latest(&self) -> Option<&ThreadState> {
        self.threads.values().max_by_key(|state| state.activity_seq)
    }
}

/// Append-only thread store backed by a JSONL log.
///
/// Single writer: callers serialize appends (the daemon's run loop does).
/// Reads can happen from anywhere and never change state.
pub struct HistoryStore {
    log: Option<HistoryLog>,
    index: RwLock<Index>,
    // Held for the store's lifetime; released on drop.
    _lock: Option<File>,
}

impl HistoryStore {
    /// Open (or create) the log at `path` and replay it.  Takes an exclusive
    /// lock so a second daemon cannot share the same history.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(HistoryError::Locked(path.to_path_buf()));
        }

        let log = HistoryLog::new(path);
        log.repair_tail()?;
        let records = log.load()?;
        let mut index = Index::default();
        let record_count = records.len();
        for record in records {
            index.apply(record);
        }
        info!(
            path = %path.display(),
            records = record_count,
            threads = index.threads.len(),
            "history store opened"
        );

        Ok(Self {
            log: Some(log),
            index: RwLock::new(index),
            _lock: Some(lock),
        })
    }

    /// Replay the log at `path` without taking the writer lock.  The result
    /// is a point-in-time copy; appends to it stay in memory.
    pub fn snapshot(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let log = HistoryLog::new(path.as_ref());
        let mut index = Index::default();
        for record in log.load()? {
            index.apply(record);
        }
        Ok(Self {
            log: None,
            index: RwLock::new(index),
            _lock: None,
        })
    }

    /// Store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            log: None,
            index: RwLock::new(Index::default()),
            _lock: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.log.as_ref().map(HistoryLog::path)
    }

    async fn commit(&self, index: &mut Index, record: HistoryRecord) -> Result<(), HistoryError> {
        if let Some(log) = &self.log {
            log.append(&record).await?;
        }
        index.apply(record);
        Ok(())
    }

    pub async fn create_thread(&self) -> Result<Uuid, HistoryError> {
        let thread_id = Uuid::new_v4();
        let mut index = self.index.write().await;
        self.commit(&mut index, HistoryRecord::new(HistoryEntry::ThreadCreated { thread_id }))
            .await?;
        info!(%thread_id, "thread created");
        Ok(thread_id)
    }

    /// Most recent thread, creating one when the store is empty.
    pub async fn resume_latest(&self) -> Result<Uuid, HistoryError> {
        if let Some(thread_id) = self.latest_thread().await {
            debug!(%thread_id, "resuming latest thread");
            return Ok(thread_id);
        }
        self.create_thread().await
    }

    pub async fn latest_thread(&self) -> Option<Uuid> {
        self.index.read().await.latest().map(|state| state.thread.id)
    }

    pub async fn contains(&self, thread_id: Uuid) -> bool {
        self.index.read().await.threads.contains_key(&thread_id)
    }

    pub async fn append_interaction(
        &self,
        thread_id: Uuid,
        interaction: Interaction,
    ) -> Result<(), HistoryError> {
        let mut index = self.index.write().await;
        if !index.threads.contains_key(&thread_id) {
            return Err(HistoryError::ThreadNotFound(thread_id));
        }
        let interaction_id = interaction.id;
        self.commit(
            &mut index,
            HistoryRecord::new(HistoryEntry::InteractionAppended {
                thread_id,
                interaction,
            }),
        )
        .await?;
        debug!(%thread_id, %interaction_id, "interaction appended");
        Ok(())
    }

    /// Thread summaries, most recently active first.
    pub async fn list_threads(&self) -> Vec<ThreadSummary> {
        let index = self.index.read().await;
        let mut states: Vec<&ThreadState> = index.threads.values().collect();
        states.sort_by(|a, b| b.activity_seq.cmp(&a.activity_seq));
        states.into_iter().map(ThreadState::summary).collect()
    }

    /// The most recent `limit` interactions of a thread, oldest first.
    pub async fn recent(
        &self,
        thread_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Interaction>, HistoryError> {
        let index = self.index.read().await;
        let state = index
            .threads
            .get(&thread_id)
            .ok_or(HistoryError::ThreadNotFound(thread_id))?;
        let interactions = &state.thread.interactions;
        let skip = interactions.len().saturating_sub(limit);
        Ok(interactions[skip..].to_vec())
    }

    pub async fn thread(&self, thread_id: Uuid) -> Result<Thread, HistoryError> {
        let index = self.index.read().await;
        index
            .threads
            .get(&thread_id)
            .map(|state| state.thread.clone())
            .ok_or(HistoryError::ThreadNotFound(thread_id))
    }

    /// Lexical search over every thread's user and final messages.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let index = self.index.read().await;
        let candidates = index.threads.values().flat_map(|state| {
            state
                .thread
                .interactions
                .iter()
                .map(move |interaction| (state.thread.id, interaction))
        });
        search::rank(query, candidates, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Message, Step, StepResult};
    use serde_json::json;
    use tempfile::TempDir;

    fn interaction(user: &str, reply: &str) -> Interaction {
        Interaction::new(Message::user(user), Vec::new(), Message::assistant(reply))
    }

    #[tokio::test]
    async fn resume_latest_creates_when_empty_then_reuses() {
        let store = HistoryStore::in_memory();
        assert!(store.latest_thread().await.is_none());
        let first = store.resume_latest().await.unwrap();
        let again = store.resume_latest().await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.list_threads().await.len(), 1);
    }

    #[tokio::test]
    async fn latest_follows_last_append() {
        let store = HistoryStore::in_memory();
        let a = store.create_thread().await.unwrap();
        let b = store.create_thread().await.unwrap();
        assert_eq!(store.latest_thread().await, Some(b));

        store.append_interaction(a, interaction("hi", "hello")).await.unwrap();
        assert_eq!(store.latest_thread().await, Some(a));

        let listed: Vec<Uuid> = store.list_threads().await.iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![a, b]);
    }

    #[tokio::test]
    async fn recent_returns_tail_oldest_first() {
        let store = HistoryStore::in_memory();
        let thread = store.create_thread().await.unwrap();
        for i in 0..5 {
            store
                .append_interaction(thread, interaction(&format!("q{i}"), &format!("a{i}")))
                .await
                .unwrap();
        }

        let recent = store.recent(thread, 2).await.unwrap();
        let users: Vec<&str> = recent.iter().map(|i| i.user_message.content.as_str()).collect();
        assert_eq!(users, vec!["q3", "q4"]);

        assert_eq!(store.recent(thread, 50).await.unwrap().len(), 5);
        assert!(store.recent(thread, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_is_idempotent_without_appends() {
        let store = HistoryStore::in_memory();
        let thread = store.create_thread().await.unwrap();
        store.append_interaction(thread, interaction("a", "b")).await.unwrap();
        let first = store.recent(thread, 3).await.unwrap();
        let second = store.recent(thread, 3).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_thread_is_an_error() {
        let store = HistoryStore::in_memory();
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.recent(missing, 1).await,
            Err(HistoryError::ThreadNotFound(id)) if id == missing
        ));
        assert!(matches!(
            store.append_interaction(missing, interaction("a", "b")).await,
            Err(HistoryError::ThreadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn persisted_history_survives_reopen_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let now = Utc::now();
        let stored = Interaction::new(
            Message::user("list files ✓"),
            vec![Step {
                tool_call_id: "call-1".into(),
                tool_name: "shell".into(),
                arguments: json!({"command": "ls -la"}),
                result: StepResult::Result(json!({"stdout": "Cargo.toml\nsrc\n", "exit_code": 0})),
                started_at: now,
                ended_at: now,
                assistant_message: Some(Message::assistant("Let me look.")),
            }],
            Message::assistant("Two entries: Cargo.toml and src."),
        );

        let thread = {
            let store = HistoryStore::open(&path).unwrap();
            let thread = store.create_thread().await.unwrap();
            store.append_interaction(thread, stored.clone()).await.unwrap();
            thread
        };

        let reopened = HistoryStore::open(&path).unwrap();
        assert_eq!(reopened.latest_thread().await, Some(thread));
        let recent = reopened.recent(thread, 5).await.unwrap();
        assert_eq!(recent, vec![stored]);
    }

    #[tokio::test]
    async fn commit_after_torn_tail_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let thread = {
            let store = HistoryStore::open(&path).unwrap();
            store.create_thread().await.unwrap()
        };
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"record_id\":\"trunc").unwrap();
        }

        {
            let store = HistoryStore::open(&path).unwrap();
            store
                .append_interaction(thread, interaction("after crash", "still here"))
                .await
                .unwrap();
        }

        let reopened = HistoryStore::open(&path).unwrap();
        let recent = reopened.recent(thread, 5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].user_message.content, "after crash");
    }

    #[tokio::test]
    async fn second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let _first = HistoryStore::open(&path).unwrap();
        assert!(matches!(
            HistoryStore::open(&path),
            Err(HistoryError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_reads_while_writer_holds_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let writer = HistoryStore::open(&path).unwrap();
        let thread = writer.create_thread().await.unwrap();
        writer
            .append_interaction(thread, interaction("hello", "hi"))
            .await
            .unwrap();

        let snapshot = HistoryStore::snapshot(&path).unwrap();
        assert!(snapshot.path().is_none());
        assert_eq!(snapshot.recent(thread, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_finds_matching_turns() {
        let store = HistoryStore::in_memory();
        let thread = store.create_thread().await.unwrap();
        store
            .append_interaction(thread, interaction("what is the weather in Oslo", "Rainy."))
            .await
            .unwrap();
        store
            .append_interaction(thread, interaction("list rust crates", "serde, tokio"))
            .await
            .unwrap();

        let hits = store.search("oslo weather", 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].thread_id, thread);
        assert_eq!(hits[0].assistant, "Rainy.");
    }
}
