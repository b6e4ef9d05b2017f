//! `pkm-bridge` configuration: TOML file, then environment overrides, then validation.

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_INSTRUCTIONS: &str = "You are a personal knowledge assistant working over \
the user's plain-text notes (org-mode and markdown). Answer from the notes when they are \
relevant and say so when they are not. Use semantic_search to look further than the \
excerpts provided, search_notes for exact words or patterns, list_files to see what notes \
exist, read_note to read part of a file, execute_shell for other lookups inside the notes \
directory, execute_script for multi-step shell work or edits, and add_journal_note to \
record something in today's journal. Keep answers short and cite the files you used.";

#[derive(Debug, Clone, Deserialize)]
pub struct PkmConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Inline instructions. Takes precedence over `system_prompt_file`.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_file: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_provider_timeout_seconds")]
    pub provider_timeout_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: None,
            system_prompt_file: None,
            max_output_tokens: default_max_output_tokens(),
            provider_timeout_seconds: default_provider_timeout_seconds(),
        }
    }
}

fn default_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_max_output_tokens() -> u32 {
    8192
}

fn default_provider_timeout_seconds() -> u64 {
    120
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub voyage_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_notes_dir")]
    pub notes_dir: String,
    #[serde(default = "default_data_dir_string")]
    pub data_dir: String,
    #[serde(default)]
    pub profile_file: Option<String>,
    /// Chunk database written by the ingestion job. Retrieval is off without it.
    #[serde(default)]
    pub chunk_db: Option<String>,
    /// Defaults to `<data_dir>/sessions.db`.
    #[serde(default)]
    pub sessions_db: Option<String>,
    /// Defaults to `<data_dir>/audit.jsonl`.
    #[serde(default)]
    pub audit_log: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            notes_dir: default_notes_dir(),
            data_dir: default_data_dir_string(),
            profile_file: None,
            chunk_db: None,
            sessions_db: None,
            audit_log: None,
        }
    }
}

fn default_notes_dir() -> String {
    "~/notes".to_string()
}

fn default_data_dir_string() -> String {
    "~/.pkm-bridge/data".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retrieval_limit")]
    pub limit: usize,
    /// Threshold on raw cosine similarity. Stores that report `(1 + cos) / 2` instead
    /// need `2 * t - 1` here, so 0.65 on that scale is 0.30.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_retrieval_limit(),
            min_similarity: default_min_similarity(),
            candidate_limit: default_candidate_limit(),
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retrieval_limit() -> usize {
    12
}

fn default_min_similarity() -> f32 {
    0.30
}

fn default_candidate_limit() -> usize {
    50
}

fn default_embedding_model() -> String {
    "voyage-3".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_preserve_turns")]
    pub preserve_turns: usize,
    #[serde(default = "default_tool_result_threshold")]
    pub tool_result_threshold: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            preserve_turns: default_preserve_turns(),
            tool_result_threshold: default_tool_result_threshold(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

fn default_token_budget() -> usize {
    100_000
}

fn default_preserve_turns() -> usize {
    10
}

fn default_tool_result_threshold() -> usize {
    1_000
}

fn default_chars_per_token() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_turn_seconds")]
    pub max_turn_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_turn_seconds: default_max_turn_seconds(),
        }
    }
}

fn default_max_iterations() -> usize {
    20
}

fn default_max_turn_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockedPatternConfig {
    pub name: String,
    pub regex: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_script_timeout_seconds")]
    pub script_timeout_seconds: u64,
    #[serde(default = "default_output_bytes_max")]
    pub output_bytes_max: usize,
    #[serde(default)]
    pub keep_scripts: bool,
    #[serde(default = "default_file_bytes_max")]
    pub file_bytes_max: usize,
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
    /// Appended after the built-in patterns.
    #[serde(default)]
    pub extra_blocked_patterns: Vec<BlockedPatternConfig>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: default_command_timeout_seconds(),
            script_timeout_seconds: default_script_timeout_seconds(),
            output_bytes_max: default_output_bytes_max(),
            keep_scripts: false,
            file_bytes_max: default_file_bytes_max(),
            journal_path: default_journal_path(),
            extra_blocked_patterns: Vec::new(),
        }
    }
}

fn default_command_timeout_seconds() -> u64 {
    60
}

fn default_script_timeout_seconds() -> u64 {
    300
}

fn default_output_bytes_max() -> usize {
    20_000
}

fn default_file_bytes_max() -> usize {
    200_000
}

fn default_journal_path() -> String {
    pkm_tools::DEFAULT_JOURNAL_PATH.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Should exceed `agent.max_turn_seconds` so a capped turn still gets its reply out.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_seconds: default_request_timeout_seconds(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    330
}

fn default_max_in_flight() -> usize {
    32
}

impl PkmConfig {
    /// Reads the file at `path` (or the default location). A missing default file falls
    /// back to built-in defaults so the environment alone can drive a run.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                String::new()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        let mut cfg = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PKM_MODEL") {
            if !v.trim().is_empty() {
                self.general.model = v;
            }
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            if !v.trim().is_empty() {
                self.keys.anthropic_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("VOYAGE_API_KEY") {
            if !v.trim().is_empty() {
                self.keys.voyage_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("PKM_NOTES_DIR") {
            if !v.trim().is_empty() {
                self.paths.notes_dir = v;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.general.max_output_tokens == 0 {
            return Err(anyhow::anyhow!("general.max_output_tokens must be > 0"));
        }
        if self.general.provider_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("general.provider_timeout_seconds must be > 0"));
        }
        if self.paths.notes_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("paths.notes_dir is required"));
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_similarity) {
            return Err(anyhow::anyhow!(
                "retrieval.min_similarity must be between 0 and 1, got {}",
                self.retrieval.min_similarity
            ));
        }
        if self.retrieval.enabled && self.retrieval.candidate_limit == 0 {
            return Err(anyhow::anyhow!("retrieval.candidate_limit must be > 0"));
        }
        if self.history.token_budget == 0 {
            return Err(anyhow::anyhow!("history.token_budget must be > 0"));
        }
        if self.history.chars_per_token == 0 {
            return Err(anyhow::anyhow!("history.chars_per_token must be > 0"));
        }
        if self.agent.max_iterations == 0 {
            return Err(anyhow::anyhow!("agent.max_iterations must be > 0"));
        }
        if self.agent.max_turn_seconds == 0 {
            return Err(anyhow::anyhow!("agent.max_turn_seconds must be > 0"));
        }
        if self.shell.command_timeout_seconds == 0 || self.shell.script_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("shell timeouts must be > 0"));
        }
        if self.shell.output_bytes_max == 0 || self.shell.file_bytes_max == 0 {
            return Err(anyhow::anyhow!("shell output and file caps must be > 0"));
        }
        if self.server.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.request_timeout_seconds must be > 0"));
        }
        if self.server.max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.max_in_flight must be > 0"));
        }
        Ok(())
    }

    pub fn notes_dir(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.paths.notes_dir)
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.paths.data_dir)
    }

    pub fn sessions_db_path(&self) -> anyhow::Result<PathBuf> {
        match self.paths.sessions_db.as_deref() {
            Some(p) => expand_home(p),
            None => Ok(self.data_dir()?.join("sessions.db")),
        }
    }

    pub fn audit_log_path(&self) -> anyhow::Result<PathBuf> {
        match self.paths.audit_log.as_deref() {
            Some(p) => expand_home(p),
            None => Ok(self.data_dir()?.join("audit.jsonl")),
        }
    }

    pub fn chunk_db_path(&self) -> anyhow::Result<Option<PathBuf>> {
        self.paths.chunk_db.as_deref().map(expand_home).transpose()
    }

    pub fn profile_path(&self) -> anyhow::Result<Option<PathBuf>> {
        self.paths.profile_file.as_deref().map(expand_home).transpose()
    }

    /// Inline prompt, then prompt file, then the built-in instructions.
    pub async fn instructions(&self) -> anyhow::Result<String> {
        if let Some(text) = self.general.system_prompt.as_deref() {
            if !text.trim().is_empty() {
                return Ok(text.to_string());
            }
        }
        if let Some(file) = self.general.system_prompt_file.as_deref() {
            let path = expand_home(file)?;
            return tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| anyhow::anyhow!("read system prompt {}: {e}", path.display()));
        }
        Ok(DEFAULT_INSTRUCTIONS.to_string())
    }

    pub fn anthropic_api_key(&self) -> Option<String> {
        self.keys
            .anthropic_api_key
            .clone()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn voyage_api_key(&self) -> Option<String> {
        self.keys
            .voyage_api_key
            .clone()
            .filter(|s| !s.trim().is_empty())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".pkm-bridge").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    if trimmed == "~" || trimmed.starts_with("~/") {
        let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
        return Ok(PathBuf::from(trimmed.replacen('~', &home, 1)));
    }
    Ok(PathBuf::from(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = PkmConfig::from_toml_str("").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.general.model, "claude-haiku-4-5");
        assert_eq!(cfg.retrieval.limit, 12);
        assert!((cfg.retrieval.min_similarity - 0.30).abs() < f32::EPSILON);
        assert_eq!(cfg.history.token_budget, 100_000);
        assert_eq!(cfg.history.preserve_turns, 10);
        assert_eq!(cfg.agent.max_iterations, 20);
        assert_eq!(cfg.shell.command_timeout_seconds, 60);
        assert_eq!(cfg.shell.journal_path, "journals/journal.org");
    }

    #[test]
    fn example_config_parses() {
        let cfg =
            PkmConfig::from_toml_str(include_str!("../../config/pkm-bridge.example.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:8000");
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = PkmConfig::from_toml_str(
            r#"
[general]
model = "claude-sonnet-4-5"

[paths]
notes_dir = "/srv/notes"
data_dir = "/var/lib/pkm"

[history]
token_budget = 5000
preserve_turns = 2

[[shell.extra_blocked_patterns]]
name = "git_push"
regex = "git\\s+push"
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.general.model, "claude-sonnet-4-5");
        assert_eq!(cfg.notes_dir().unwrap(), PathBuf::from("/srv/notes"));
        assert_eq!(
            cfg.sessions_db_path().unwrap(),
            PathBuf::from("/var/lib/pkm/sessions.db")
        );
        assert_eq!(cfg.history.token_budget, 5000);
        assert_eq!(cfg.shell.extra_blocked_patterns[0].name, "git_push");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = PkmConfig::from_toml_str("").unwrap();
        cfg.retrieval.min_similarity = 1.5;
        assert!(cfg.validate().unwrap_err().to_string().contains("min_similarity"));

        let mut cfg = PkmConfig::from_toml_str("").unwrap();
        cfg.history.token_budget = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PkmConfig::from_toml_str("").unwrap();
        cfg.agent.max_turn_seconds = 0;
        assert!(cfg.validate().is_err());

        assert!(PkmConfig::from_toml_str("[general]\nmodel = 3").is_err());
    }

    #[tokio::test]
    async fn inline_prompt_wins_over_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("prompt.md");
        std::fs::write(&file, "from file").unwrap();

        let mut cfg = PkmConfig::from_toml_str("").unwrap();
        cfg.general.system_prompt_file = Some(file.display().to_string());
        assert_eq!(cfg.instructions().await.unwrap(), "from file");

        cfg.general.system_prompt = Some("inline".to_string());
        assert_eq!(cfg.instructions().await.unwrap(), "inline");
    }
}
