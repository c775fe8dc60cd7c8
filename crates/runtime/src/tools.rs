//! Tools that need the daemon's own state, and registry assembly.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use shellbot_config::AppConfig;
use shellbot_history::HistoryStore;
use shellbot_tools::{
    ParamType, ReaderTool, ShellTool, Tool, ToolError, ToolParam, ToolRegistry, ToolSpec,
    discover_plugins, optional_u64, required_str,
};

const DEFAULT_SEARCH_LIMIT: u64 = 5;
const MAX_SEARCH_LIMIT: u64 = 25;

/// Lexical search over past conversations in every thread.
pub struct ConversationSearchTool {
    history: Arc<HistoryStore>,
}

impl ConversationSearchTool {
    pub fn new(history: Arc<HistoryStore>) -> Self {
        Self { history }
    }
}

#[async_trait]
impl Tool for ConversationSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "conversation_search".to_string(),
            description: "Search earlier conversations for turns matching a query. \
                Returns the user message and final reply of each match."
                .to_string(),
            params: vec![
                ToolParam::required("query", "Words to look for"),
                ToolParam::optional(
                    "limit",
                    format!("Maximum matches to return (default: {DEFAULT_SEARCH_LIMIT})"),
                )
                .of_type(ParamType::Integer),
            ],
        }
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let query = required_str(args, "query")?;
        if query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("`query` must not be empty".into()));
        }
        let limit = optional_u64(args, "limit")?
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT) as usize;

        let hits = self.history.search(query, limit).await;
        let hits: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "thread_id": hit.thread_id,
                    "created_at": hit.created_at,
                    "user": hit.user,
                    "assistant": hit.assistant,
                    "score": hit.score,
                })
            })
            .collect();
        Ok(json!({ "query": query, "hits": hits }))
    }
}

/// Built-ins, then plugins from `tools.plugin_dir`, filtered by
/// `tools.enabled`.  A plugin with a built-in's name replaces it.
pub fn build_registry(config: &AppConfig, history: Arc<HistoryStore>) -> ToolRegistry {
    let workspace = PathBuf::from(&config.agent.workspace_path);
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(
        ShellTool::new(&workspace)
            .with_limits(config.tools.shell_timeout_secs, config.tools.max_output_bytes)
            .with_max_timeout(config.tools.shell_max_timeout_secs),
    ));
    registry.register(Box::new(ReaderTool::new(&workspace)));
    registry.register(Box::new(ConversationSearchTool::new(history)));

    if !config.tools.plugin_dir.trim().is_empty() {
        for plugin in discover_plugins(&PathBuf::from(&config.tools.plugin_dir)) {
            registry.register(Box::new(plugin));
        }
    }

    registry.retain_enabled(&config.tools.enabled);
    info!(tools = ?registry.names(), "tool registry ready");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use shellbot_history::{Interaction, Message};
    use tempfile::TempDir;

    #[tokio::test]
    async fn search_tool_returns_ranked_hits() {
        let history = Arc::new(HistoryStore::in_memory());
        let thread = history.create_thread().await.unwrap();
        history
            .append_interaction(
                thread,
                Interaction::new(
                    Message::user("how do I restart nginx"),
                    Vec::new(),
                    Message::assistant("Run systemctl restart nginx."),
                ),
            )
            .await
            .unwrap();

        let tool = ConversationSearchTool::new(history);
        let out = tool.invoke(&json!({"query": "nginx restart"})).await.unwrap();
        let hits = out["hits"].as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["thread_id"], thread.to_string());
        assert_eq!(hits[0]["assistant"], "Run systemctl restart nginx.");

        let none = tool.invoke(&json!({"query": "kubernetes"})).await.unwrap();
        assert!(none["hits"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_tool_requires_query() {
        let tool = ConversationSearchTool::new(Arc::new(HistoryStore::in_memory()));
        let err = tool.invoke(&json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }

    #[test]
    fn registry_has_builtins_and_honours_enabled_list() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.agent.workspace_path = dir.path().display().to_string();

        let history = Arc::new(HistoryStore::in_memory());
        let all = build_registry(&config, history.clone());
        let mut names = all.names();
        names.sort();
        assert_eq!(names, vec!["conversation_search", "reader", "shell"]);

        config.tools.enabled = vec!["reader".into()];
        let only_reader = build_registry(&config, history);
        assert_eq!(only_reader.names(), vec!["reader"]);
    }

    #[test]
    fn registry_loads_plugins_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("echo.toml"),
            "name = \"echo\"\ndescription = \"Echo stdin\"\ncommand = \"cat\"\n",
        )
        .unwrap();
        let mut config = AppConfig::default();
        config.agent.workspace_path = dir.path().display().to_string();
        config.tools.plugin_dir = dir.path().display().to_string();

        let registry = build_registry(&config, Arc::new(HistoryStore::in_memory()));
        assert!(registry.names().contains(&"echo".to_string()));
        assert_eq!(registry.len(), 4);
    }
}
