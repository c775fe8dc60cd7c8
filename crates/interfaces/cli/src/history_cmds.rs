use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use chrono::{Duration, Local, Utc};
use uuid::Uuid;

use shellbot_config::AppConfig;
use shellbot_history::{
    HistoryStore, Interaction, StepResult, ThreadSummary, UsageLog, UsageReport,
};

const PREVIEW_CHARS: usize = 160;

fn open_snapshot(config: &AppConfig) -> Result<HistoryStore> {
    let path = config.history_path();
    HistoryStore::snapshot(&path).with_context(|| format!("failed to read history {}", path.display()))
}

pub(crate) async fn run_threads(config: &AppConfig) -> Result<()> {
    let store = open_snapshot(config)?;
    let threads = store.list_threads().await;
    if threads.is_empty() {
        println!("no threads yet");
        return Ok(());
    }
    let mut out = io::stdout().lock();
    write_threads(&mut out, &threads)?;
    Ok(())
}

pub(crate) async fn run_history(config: &AppConfig, thread: Option<Uuid>, limit: usize) -> Result<()> {
    let store = open_snapshot(config)?;
    let thread_id = match thread {
        Some(id) => id,
        None => match store.latest_thread().await {
            Some(id) => id,
            None => {
                println!("no threads yet");
                return Ok(());
            }
        },
    };
    if !store.contains(thread_id).await {
        bail!("unknown thread {thread_id}");
    }
    let interactions = store.recent(thread_id, limit).await?;
    let mut out = io::stdout().lock();
    writeln!(out, "thread {thread_id}")?;
    write_interactions(&mut out, &interactions)?;
    Ok(())
}

pub(crate) fn run_usage(config: &AppConfig, since_days: Option<u32>, threads: usize) -> Result<()> {
    let log = UsageLog::new(config.usage_path());
    let records = log
        .load()
        .with_context(|| format!("failed to read usage log {}", log.path().display()))?;
    let since = since_days.map(|days| Utc::now() - Duration::days(i64::from(days)));
    let report = UsageReport::build(&records, since, threads);
    let mut out = io::stdout().lock();
    write_usage(&mut out, &report)?;
    Ok(())
}

fn write_threads(out: &mut impl Write, threads: &[ThreadSummary]) -> io::Result<()> {
    writeln!(out, "── threads ──────────────────────────────────────────────")?;
    for summary in threads {
        writeln!(
            out,
            "{}  {:>4} turns  last {}",
            summary.id,
            summary.interaction_count,
            summary.last_activity.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        )?;
    }
    Ok(())
}

fn write_interactions(out: &mut impl Write, interactions: &[Interaction]) -> io::Result<()> {
    for interaction in interactions {
        writeln!(
            out,
            "\n[{}] you: {}",
            interaction.created_at().with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            preview(&interaction.user_message.content)
        )?;
        for step in &interaction.steps {
            let status = match &step.result {
                StepResult::Result(_) => "ok".to_string(),
                StepResult::Error(err) => err.kind.clone(),
            };
            writeln!(out, "  → {} ({status})", step.tool_name)?;
        }
        writeln!(out, "  bot: {}", preview(&interaction.final_message.content))?;
    }
    Ok(())
}

fn write_usage(out: &mut impl Write, report: &UsageReport) -> io::Result<()> {
    let window = match report.since {
        Some(since) => format!("since {}", since.with_timezone(&Local).format("%Y-%m-%d %H:%M")),
        None => "all time".to_string(),
    };
    writeln!(out, "── token usage ({window}) ─────────────────────────────")?;
    writeln!(out, "runs             {:>12}", report.total.runs)?;
    writeln!(out, "request tokens   {:>12}", report.total.request_tokens)?;
    writeln!(out, "response tokens  {:>12}", report.total.response_tokens)?;
    writeln!(out, "total tokens     {:>12}", report.total.total_tokens)?;

    if !report.by_model.is_empty() {
        writeln!(out, "\nby model")?;
        for (model, totals) in &report.by_model {
            writeln!(out, "  {model:<32} {:>12} tokens  ({} runs)", totals.total_tokens, totals.runs)?;
        }
    }
    if !report.by_thread.is_empty() {
        writeln!(out, "\ntop threads")?;
        for (thread_id, totals) in &report.by_thread {
            writeln!(out, "  {thread_id}  {:>12} tokens  ({} runs)", totals.total_tokens, totals.runs)?;
        }
    }
    Ok(())
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}…")
}
