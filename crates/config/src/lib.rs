use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid TOML in config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// System instructions sent ahead of every model request.
    pub instructions: String,
    /// Directory holding the history log, logs, and the presence marker.
    pub data_dir: String,
    /// Working directory for `shell` and `reader`.
    pub workspace_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Shellbot".to_string(),
            instructions: "You are a friendly assistant".to_string(),
            data_dir: ".shellbot".to_string(),
            workspace_path: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3.1:8b".to_string(),
            base_url: "http://localhost:11434".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Ingress endpoint (`tcp://HOST:PORT` or `ipc:///path`).
    pub input_address: String,
    /// Egress endpoint (`tcp://HOST:PORT` or `ipc:///path`).
    pub output_address: String,
    /// Input messages buffered while a run is active.
    pub queue_capacity: usize,
    /// Longest accepted ingress line; longer lines are discarded.
    pub max_line_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            input_address: "tcp://127.0.0.1:5555".to_string(),
            output_address: "tcp://127.0.0.1:5556".to_string(),
            queue_capacity: 64,
            max_line_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// File name of the JSONL log inside `agent.data_dir`.
    pub file_name: String,
    /// Number of stored interactions fed to compaction before each run.
    pub recent_messages_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            file_name: "history.jsonl".to_string(),
            recent_messages_limit: 5,
        }
    }
}

// ── Compaction ───────────────────────────────────────────────────────────────

/// Knobs for the backward-scanning burden compaction.
///
/// | Knob                  | Effect                                                  |
/// |-----------------------|---------------------------------------------------------|
/// | `burden_threshold`    | burden at which truncation switches on                  |
/// | `base_weight`         | burden weight of the newest interaction                 |
/// | `weight_growth`       | per-interaction growth factor, `w = base * (1+g)^k`     |
/// | `interior_min_length` | step / assistant content shorter than this is kept      |
/// | `final_min_length`    | final messages shorter than this are kept               |
/// | `preserve_head_chars` | chars kept before the marker                            |
/// | `preserve_tail_chars` | chars kept after the marker                             |
/// | `truncation_marker`   | text spliced between head and tail                      |
/// | `max_total_length`    | total budget; oldest interactions dropped beyond it     |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub burden_threshold: f64,
    pub base_weight: f64,
    pub weight_growth: f64,
    pub interior_min_length: usize,
    pub final_min_length: usize,
    pub preserve_head_chars: usize,
    pub preserve_tail_chars: usize,
    pub truncation_marker: String,
    pub max_total_length: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            burden_threshold: 80_000.0,
            base_weight: 1.0,
            weight_growth: 0.35,
            interior_min_length: 700,
            final_min_length: 3500,
            preserve_head_chars: 240,
            preserve_tail_chars: 240,
            truncation_marker: "\n\n... message truncated ...\n\n".to_string(),
            max_total_length: 60_000,
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.burden_threshold.is_finite() || self.burden_threshold <= 0.0 {
            return Err(ConfigError::invalid(
                "compaction.burden_threshold",
                format!("must be a positive number, got {}", self.burden_threshold),
            ));
        }
        if !self.base_weight.is_finite() || self.base_weight <= 0.0 {
            return Err(ConfigError::invalid(
                "compaction.base_weight",
                format!("must be a positive number, got {}", self.base_weight),
            ));
        }
        // A negative growth would make older interactions weigh less and break
        // the monotonic truncation guarantee.
        if !self.weight_growth.is_finite() || self.weight_growth < 0.0 {
            return Err(ConfigError::invalid(
                "compaction.weight_growth",
                format!("must be zero or positive, got {}", self.weight_growth),
            ));
        }
        if self.final_min_length < self.interior_min_length {
            return Err(ConfigError::invalid(
                "compaction.final_min_length",
                format!(
                    "must be at least interior_min_length ({}), got {}",
                    self.interior_min_length, self.final_min_length
                ),
            ));
        }
        if self.max_total_length == 0 {
            return Err(ConfigError::invalid(
                "compaction.max_total_length",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound on model passes per run.  The last pass is sent without
    /// tools so the model has to answer in text.
    pub max_tool_rounds: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { max_tool_rounds: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tool names exposed to the model.  Empty means every registered tool.
    pub enabled: Vec<String>,
    /// Directory scanned once at startup for `*.toml` plugin manifests.
    /// Empty disables plugin discovery.
    pub plugin_dir: String,
    pub shell_timeout_secs: u64,
    /// Ceiling on a `timeout_secs` requested by the model.
    pub shell_max_timeout_secs: u64,
    /// Cap on captured `shell` / `reader` output.
    pub max_output_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: Vec::new(),
            plugin_dir: String::new(),
            shell_timeout_secs: 30,
            shell_max_timeout_secs: 300,
            max_output_bytes: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub daemon: DaemonConfig,
    pub history: HistoryConfig,
    pub compaction: CompactionConfig,
    pub run: RunConfig,
    pub tools: ToolsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from `path`, falling back to defaults when the file is absent,
    /// then apply environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = non_empty_env("SHELLBOT_INPUT_ADDRESS") {
            self.daemon.input_address = value;
        }
        if let Some(value) = non_empty_env("SHELLBOT_OUTPUT_ADDRESS") {
            self.daemon.output_address = value;
        }
        if let Some(value) = non_empty_env("OLLAMA_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = non_empty_env("SHELLBOT_MODEL") {
            self.llm.model = value;
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks everything the daemon relies on before it binds its endpoints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compaction.validate()?;
        for (field, address) in [
            ("daemon.input_address", &self.daemon.input_address),
            ("daemon.output_address", &self.daemon.output_address),
        ] {
            if !(address.starts_with("tcp://") || address.starts_with("ipc://")) {
                return Err(ConfigError::invalid(
                    field,
                    format!("expected tcp://HOST:PORT or ipc:///path, got `{address}`"),
                ));
            }
        }
        if self.daemon.input_address == self.daemon.output_address {
            return Err(ConfigError::invalid(
                "daemon.output_address",
                "must differ from daemon.input_address",
            ));
        }
        if self.daemon.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "daemon.queue_capacity",
                "must be greater than zero",
            ));
        }
        if self.daemon.max_line_bytes == 0 {
            return Err(ConfigError::invalid(
                "daemon.max_line_bytes",
                "must be greater than zero",
            ));
        }
        if self.tools.shell_max_timeout_secs < self.tools.shell_timeout_secs {
            return Err(ConfigError::invalid(
                "tools.shell_max_timeout_secs",
                format!(
                    "must be at least shell_timeout_secs ({}), got {}",
                    self.tools.shell_timeout_secs, self.tools.shell_max_timeout_secs
                ),
            ));
        }
        if self.run.max_tool_rounds == 0 {
            return Err(ConfigError::invalid(
                "run.max_tool_rounds",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.agent.data_dir)
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir().join(&self.history.file_name)
    }

    /// Marker held by a direct `ask` session so `watch` does not echo it.
    pub fn presence_marker_path(&self) -> PathBuf {
        self.data_dir().join("ask.presence")
    }

    /// Per-run token usage records.
    pub fn usage_path(&self) -> PathBuf {
        self.data_dir().join("usage.jsonl")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.daemon.input_address, "tcp://127.0.0.1:5555");
        assert_eq!(cfg.daemon.output_address, "tcp://127.0.0.1:5556");
        assert_eq!(cfg.history.recent_messages_limit, 5);
        assert_eq!(cfg.compaction.burden_threshold, 80_000.0);
        assert_eq!(cfg.compaction.weight_growth, 0.35);
        assert_eq!(cfg.compaction.interior_min_length, 700);
        assert_eq!(cfg.compaction.final_min_length, 3500);
        assert_eq!(cfg.compaction.max_total_length, 60_000);
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.agent.name, "Shellbot");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shellbot.toml");
        fs::write(
            &path,
            "[compaction]\ninterior_min_length = 10\nfinal_min_length = 1000\n",
        )
        .unwrap();
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.compaction.interior_min_length, 10);
        assert_eq!(cfg.compaction.final_min_length, 1000);
        assert_eq!(cfg.compaction.preserve_head_chars, 240);
        assert_eq!(cfg.llm.provider, "ollama");
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[compaction\nburden_threshold = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("shellbot.toml");
        let mut cfg = AppConfig::default();
        cfg.agent.instructions = "Be terse.".to_string();
        cfg.tools.enabled = vec!["shell".to_string()];
        cfg.save_to(&path).unwrap();

        let back = AppConfig::load_from(&path).unwrap();
        assert_eq!(back.agent.instructions, "Be terse.");
        assert_eq!(back.tools.enabled, vec!["shell".to_string()]);
        assert_eq!(back.compaction, cfg.compaction);
    }

    #[test]
    fn compaction_rejects_non_positive_threshold() {
        let cfg = CompactionConfig {
            burden_threshold: 0.0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("burden_threshold"));

        let cfg = CompactionConfig {
            burden_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn compaction_rejects_negative_growth() {
        let cfg = CompactionConfig {
            weight_growth: -0.1,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("weight_growth"));
    }

    #[test]
    fn compaction_rejects_final_bar_below_interior_bar() {
        let cfg = CompactionConfig {
            interior_min_length: 500,
            final_min_length: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn compaction_rejects_zero_budget() {
        let cfg = CompactionConfig {
            max_total_length: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_scheme_and_shared_address() {
        let mut cfg = AppConfig::default();
        cfg.daemon.input_address = "http://127.0.0.1:5555".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.daemon.output_address = cfg.daemon.input_address.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let mut cfg = AppConfig::default();
        cfg.agent.data_dir = "/var/lib/shellbot".to_string();
        assert_eq!(
            cfg.history_path(),
            PathBuf::from("/var/lib/shellbot/history.jsonl")
        );
        assert_eq!(
            cfg.presence_marker_path(),
            PathBuf::from("/var/lib/shellbot/ask.presence")
        );
        assert_eq!(cfg.usage_path(), PathBuf::from("/var/lib/shellbot/usage.jsonl"));
    }

    #[test]
    fn validate_rejects_zero_line_cap_and_low_shell_ceiling() {
        let mut cfg = AppConfig::default();
        cfg.daemon.max_line_bytes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.tools.shell_max_timeout_secs = cfg.tools.shell_timeout_secs - 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("shell_max_timeout_secs"));
    }

    #[test]
    fn config_serializes_to_json() {
        let cfg = AppConfig::default();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["daemon"]["queue_capacity"], 64);
        assert_eq!(json["run"]["max_tool_rounds"], 10);
    }
}
