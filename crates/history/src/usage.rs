//! Per-run token usage, one JSONL record per completed run.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub model: String,
    pub request_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        run_id: Uuid,
        thread_id: Uuid,
        model: impl Into<String>,
        request_tokens: u64,
        response_tokens: u64,
    ) -> Self {
        Self {
            run_id,
            thread_id,
            model: model.into(),
            request_tokens,
            response_tokens,
            total_tokens: request_tokens + response_tokens,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub request_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
    pub runs: usize,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.request_tokens += record.request_tokens;
        self.response_tokens += record.response_tokens;
        self.total_tokens += record.total_tokens;
        self.runs += 1;
    }
}

/// Totals overall, per model and for the heaviest threads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub since: Option<DateTime<Utc>>,
    pub total: UsageTotals,
    /// Heaviest first.
    pub by_model: Vec<(String, UsageTotals)>,
    /// Heaviest first, at most `thread_limit` entries.
    pub by_thread: Vec<(Uuid, UsageTotals)>,
}

impl UsageReport {
    pub fn build(records: &[UsageRecord], since: Option<DateTime<Utc>>, thread_limit: usize) -> Self {
        let mut total = UsageTotals::default();
        let mut by_model: HashMap<&str, UsageTotals> = HashMap::new();
        let mut by_thread: HashMap<Uuid, UsageTotals> = HashMap::new();

        for record in records
            .iter()
            .filter(|record| since.is_none_or(|since| record.created_at >= since))
        {
            total.add(record);
            by_model.entry(&record.model).or_default().add(record);
            by_thread.entry(record.thread_id).or_default().add(record);
        }

        let mut by_model: Vec<(String, UsageTotals)> = by_model
            .into_iter()
            .map(|(model, totals)| (model.to_string(), totals))
            .collect();
        by_model.sort_by(|a, b| b.1.total_tokens.cmp(&a.1.total_tokens).then_with(|| a.0.cmp(&b.0)));

        let mut by_thread: Vec<(Uuid, UsageTotals)> = by_thread.into_iter().collect();
        by_thread.sort_by(|a, b| b.1.total_tokens.cmp(&a.1.total_tokens).then_with(|| a.0.cmp(&b.0)));
        by_thread.truncate(thread_limit);

        Self {
            since,
            total,
            by_model,
            by_thread,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsageLog {
    path: PathBuf,
}

impl UsageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, record: &UsageRecord) -> io::Result<()> {
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
        file.flush().await
    }

    /// Every readable record; bad lines are logged and skipped.
    pub fn load(&self) -> io::Result<Vec<UsageRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut records = Vec::new();
        for (line_idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<UsageRecord>(raw) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(
                    line = line_idx + 1,
                    error = %err,
                    path = %self.path.display(),
                    "skipping unreadable usage record"
                ),
            }
        }
        Ok(records)
    }
}
