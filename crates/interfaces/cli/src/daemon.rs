use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::watch;
use tracing::{info, warn};

use shellbot_config::AppConfig;
use shellbot_history::{HistoryStore, UsageLog};
use shellbot_llm::{Model, OllamaModel};
use shellbot_runtime::{Daemon, EventBus, RunEngine, RunSettings, build_registry};

fn build_model(config: &AppConfig) -> Result<Arc<dyn Model>> {
    match config.llm.provider.to_lowercase().as_str() {
        "ollama" => {
            let model = OllamaModel::new(
                &config.llm.base_url,
                &config.llm.model,
                Duration::from_secs(config.llm.request_timeout_secs),
            )?;
            Ok(Arc::new(model))
        }
        other => bail!("unsupported llm provider `{other}`; only `ollama` is available"),
    }
}

pub(crate) async fn run_foreground(config: AppConfig) -> Result<()> {
    config.validate()?;

    let history_path = config.history_path();
    let history = Arc::new(
        HistoryStore::open(&history_path)
            .with_context(|| format!("failed to open history {}", history_path.display()))?,
    );
    let registry = Arc::new(build_registry(&config, history.clone()));
    let model = build_model(&config)?;
    info!(
        agent = %config.agent.name,
        provider = %config.llm.provider,
        model = %config.llm.model,
        tools = registry.len(),
        "starting daemon"
    );

    let engine = RunEngine::new(
        model,
        registry,
        history,
        EventBus::default(),
        RunSettings::from_config(&config),
    )
    .with_usage_log(Arc::new(UsageLog::new(config.usage_path())));
    let daemon = Daemon::bind(&config.daemon, engine).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received; shutting down"),
            Err(err) => warn!(error = %err, "cannot listen for ctrl-c; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    daemon.serve(shutdown_rx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_provider() {
        let mut config = AppConfig::default();
        config.llm.provider = "openrouter".into();
        assert!(build_model(&config).is_err());

        config.llm.provider = "Ollama".into();
        let model = build_model(&config).unwrap();
        assert_eq!(model.name(), "llama3.1:8b");
    }
}
