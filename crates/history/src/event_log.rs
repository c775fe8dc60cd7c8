use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::schema::Interaction;

/// What changed.  Records are never rewritten; replaying them in order
/// reproduces the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    ThreadCreated {
        thread_id: Uuid,
    },
    InteractionAppended {
        thread_id: Uuid,
        interaction: Interaction,
    },
}

impl HistoryEntry {
    pub fn thread_id(&self) -> Uuid {
        match self {
            Self::ThreadCreated { thread_id } | Self::InteractionAppended { thread_id, .. } => {
                *thread_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub record_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: HistoryEntry,
}

impl HistoryRecord {
    pub fn new(entry: HistoryEntry) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            entry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &HistoryRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        // Flush userspace buffers and fsync so a committed interaction
        // survives a crash immediately after append.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read every record.  Corrupt lines are skipped and copied to a
    /// `.corrupt` sidecar next to the log.  A final line with no newline is
    /// an append still in flight (or torn by a crash): it is used when it
    /// parses and otherwise skipped without quarantine.
    pub fn load(&self) -> io::Result<Vec<HistoryRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let (complete, tail) = split_tail(&bytes);
        let mut records = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, raw) in complete.split(|b| *b == b'\n').enumerate() {
            let parsed = std::str::from_utf8(raw)
                .map_err(|err| err.to_string())
                .and_then(|line| {
                    if line.trim().is_empty() {
                        return Ok(None);
                    }
                    serde_json::from_str::<HistoryRecord>(line)
                        .map(Some)
                        .map_err(|err| err.to_string())
                });
            match parsed {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt history record; skipping line"
                    );
                    self.quarantine(&String::from_utf8_lossy(raw));
                }
            }
        }

        if !tail.is_empty() {
            match serde_json::from_slice::<HistoryRecord>(tail) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(
                    bytes = tail.len(),
                    error = %err,
                    path = %self.path.display(),
                    "unterminated history tail; skipping"
                ),
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "history loaded with skipped corrupt lines; inspect .corrupt sidecar"
            );
        }

        Ok(records)
    }

    /// Make the log end on a record boundary before appending to it.  A tail
    /// that parses gets its missing newline; anything else is quarantined and
    /// cut off.  Only the lock holder may call this.
    pub fn repair_tail(&self) -> io::Result<bool> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        let (complete, tail) = split_tail(&bytes);
        if tail.is_empty() {
            return Ok(false);
        }

        if serde_json::from_slice::<HistoryRecord>(tail).is_ok() {
            let mut file = fs::OpenOptions::new().append(true).open(&self.path)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            tracing::info!(path = %self.path.display(), "terminated unterminated history record");
            return Ok(true);
        }

        tracing::warn!(
            bytes = tail.len(),
            path = %self.path.display(),
            "truncating torn history tail; moved to .corrupt sidecar"
        );
        self.quarantine(&String::from_utf8_lossy(tail));
        let file = fs::OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(complete.len() as u64)?;
        file.sync_all()?;
        Ok(true)
    }

    fn corrupt_path(&self) -> PathBuf {
        self.path.with_extension("jsonl.corrupt")
    }

    fn quarantine(&self, line: &str) {
        let sidecar = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.corrupt_path());
        match sidecar {
            Ok(mut file) => {
                let _ = writeln!(file, "{line}");
            }
            Err(err) => tracing::warn!(?err, "could not open corrupt-record sidecar"),
        }
    }
}

/// Split `bytes` after its last newline.
fn split_tail(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().rposition(|b| *b == b'\n') {
        Some(pos) => bytes.split_at(pos + 1),
        None => bytes.split_at(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Message;
    use tempfile::TempDir;

    fn interaction(text: &str) -> Interaction {
        Interaction::new(Message::user(text), Vec::new(), Message::assistant("ok"))
    }

    #[tokio::test]
    async fn append_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("history.jsonl"));
        let thread_id = Uuid::new_v4();
        log.append(&HistoryRecord::new(HistoryEntry::ThreadCreated { thread_id }))
            .await
            .unwrap();
        log.append(&HistoryRecord::new(HistoryEntry::InteractionAppended {
            thread_id,
            interaction: interaction("hello"),
        }))
        .await
        .unwrap();

        let records = log.load().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].entry, HistoryEntry::ThreadCreated { .. }));
        match &records[1].entry {
            HistoryEntry::InteractionAppended { interaction, .. } => {
                assert_eq!(interaction.user_message.content, "hello");
            }
            other => panic!("unexpected entry {other:?}"),
        }
        assert!(records.iter().all(|r| r.entry.thread_id() == thread_id));
    }

    #[test]
    fn record_json_is_flat_and_tagged() {
        let thread_id = Uuid::new_v4();
        let record = HistoryRecord::new(HistoryEntry::ThreadCreated { thread_id });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "thread_created");
        assert_eq!(json["thread_id"], thread_id.to_string());
        assert!(json.get("record_id").is_some());
    }

    #[test]
    fn load_nonexistent_returns_empty() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("missing.jsonl"));
        assert!(log.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_skips_corrupt_lines_and_quarantines_them() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let log = HistoryLog::new(&path);
        log.append(&HistoryRecord::new(HistoryEntry::ThreadCreated {
            thread_id: Uuid::new_v4(),
        }))
        .await
        .unwrap();
        {
            let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{invalid json garbage").unwrap();
        }
        log.append(&HistoryRecord::new(HistoryEntry::ThreadCreated {
            thread_id: Uuid::new_v4(),
        }))
        .await
        .unwrap();

        let records = log.load().unwrap();
        assert_eq!(records.len(), 2);
        let sidecar = fs::read_to_string(path.with_extension("jsonl.corrupt")).unwrap();
        assert!(sidecar.contains("invalid json garbage"));
    }

    fn thread_record() -> HistoryRecord {
        HistoryRecord::new(HistoryEntry::ThreadCreated {
            thread_id: Uuid::new_v4(),
        })
    }

    #[tokio::test]
    async fn non_utf8_line_is_quarantined_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let log = HistoryLog::new(&path);
        log.append(&thread_record()).await.unwrap();
        {
            let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"record_id\":\"\xe2\x82\n").unwrap();
        }
        log.append(&thread_record()).await.unwrap();

        assert_eq!(log.load().unwrap().len(), 2);
        assert!(path.with_extension("jsonl.corrupt").exists());
    }

    #[tokio::test]
    async fn torn_tail_is_cut_and_later_appends_survive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let log = HistoryLog::new(&path);
        log.append(&thread_record()).await.unwrap();
        {
            let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"record_id\":\"trunc").unwrap();
        }

        assert_eq!(log.load().unwrap().len(), 1);
        assert!(log.repair_tail().unwrap());
        assert!(!log.repair_tail().unwrap());
        log.append(&thread_record()).await.unwrap();

        assert_eq!(log.load().unwrap().len(), 2);
        assert!(fs::read(&path).unwrap().ends_with(b"\n"));
        let sidecar = fs::read_to_string(path.with_extension("jsonl.corrupt")).unwrap();
        assert!(sidecar.contains("trunc"));
    }

    #[tokio::test]
    async fn complete_record_missing_newline_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let log = HistoryLog::new(&path);
        fs::write(&path, serde_json::to_vec(&thread_record()).unwrap()).unwrap();

        assert_eq!(log.load().unwrap().len(), 1);
        assert!(log.repair_tail().unwrap());
        log.append(&thread_record()).await.unwrap();
        assert_eq!(log.load().unwrap().len(), 2);
    }
}
