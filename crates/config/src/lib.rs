use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub language: LanguageConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_standard_model() -> String {
    "gpt-4o".to_string()
}

fn default_deep_model() -> String {
    "o3".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model used for routine classification/reasoning calls.
    #[serde(default = "default_standard_model")]
    pub standard_model: String,
    /// Model used for plan synthesis and deep deliberation.
    #[serde(default = "default_deep_model")]
    pub deep_model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            base_url: None,
            standard_model: default_standard_model(),
            deep_model: default_deep_model(),
            temperature: None,
            max_tokens: None,
            retry: RetrySettings::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_step_attempts() -> u32 {
    3
}

fn default_replan_limit() -> u32 {
    2
}

fn default_chat_turn_limit() -> u32 {
    5
}

fn default_self_fix_limit() -> u32 {
    3
}

fn default_consent_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Retries of a single step after auditor rejection.
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,
    /// Full plan regenerations after a rejected plan.
    #[serde(default = "default_replan_limit")]
    pub replan_limit: u32,
    /// Tool-calling turns allowed in solo_task mode.
    #[serde(default = "default_chat_turn_limit")]
    pub chat_turn_limit: u32,
    /// Executor self-fix attempts inside one step.
    #[serde(default = "default_self_fix_limit")]
    pub self_fix_limit: u32,
    /// Seconds to wait for a user answer before deciding autonomously.
    #[serde(default = "default_consent_timeout_secs")]
    pub consent_timeout_secs: u64,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_step_attempts: default_max_step_attempts(),
            replan_limit: default_replan_limit(),
            chat_turn_limit: default_chat_turn_limit(),
            self_fix_limit: default_self_fix_limit(),
            consent_timeout_secs: default_consent_timeout_secs(),
            checkpoint_dir: None,
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    10
}

fn default_vibe_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Code-assistant (vibe) tools can run for a very long time.
    #[serde(default = "default_vibe_timeout_secs")]
    pub vibe_timeout_secs: u64,
    /// Per-tool timeout overrides, keyed by canonical tool name.
    #[serde(default)]
    pub tool_timeouts: HashMap<String, u64>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            vibe_timeout_secs: default_vibe_timeout_secs(),
            tool_timeouts: HashMap::new(),
        }
    }
}

fn default_max_segments() -> usize {
    5
}

fn default_min_segment_length() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
    /// Minimum words per segment (chat segments are exempt).
    #[serde(default = "default_min_segment_length")]
    pub min_segment_length: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_segments: default_max_segments(),
            min_segment_length: default_min_segment_length(),
        }
    }
}

fn default_creator_triggers() -> Vec<String> {
    vec![
        "creator".to_string(),
        "творець".to_string(),
        "засновник".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Phrases that may invert a purely policy-based plan rejection.
    #[serde(default = "default_creator_triggers")]
    pub creator_trigger_phrases: Vec<String>,
    /// Extends the built-in destructive-shell blocklist.
    #[serde(default)]
    pub dangerous_commands: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            creator_trigger_phrases: default_creator_triggers(),
            dangerous_commands: Vec::new(),
        }
    }
}

fn default_target_language() -> String {
    "uk".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// BCP-47 tag of the language spoken to the user.
    #[serde(default = "default_target_language")]
    pub target: String,
    /// Whether the target language uses a non-Latin script.
    #[serde(default = "default_true")]
    pub non_latin_script: bool,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            target: default_target_language(),
            non_latin_script: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Path to the mcpServers JSON file; defaults to config_dir/servers.json.
    #[serde(default)]
    pub servers_file: Option<PathBuf>,
    /// Secret env var names substituted into server command/args/env.
    #[serde(default)]
    pub secret_env: Vec<String>,
    /// Inline server definitions merged over the file contents.
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    #[default]
    Stdio,
    /// Handled in-process by the dispatcher, no subprocess is spawned.
    Internal,
}

fn default_tier() -> u8 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub transport: McpTransport,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_tier")]
    pub tier: u8,
    /// Agent roles allowed to invoke this server. Empty = all.
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Config {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("triad")
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("triad")
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }
}

/// Parsed `mcpServers` file (Claude Code / MCP compatibility format).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersFile {
    #[serde(default, alias = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    #[serde(default, rename = "_metadata")]
    pub metadata: Option<serde_json::Value>,
}

/// Load the server file, tolerating a missing or malformed file with a warning.
pub fn load_mcp_servers(path: &Path) -> HashMap<String, McpServerConfig> {
    if !path.exists() {
        return HashMap::new();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read servers file");
            return HashMap::new();
        }
    };
    match serde_json::from_str::<McpServersFile>(&content) {
        Ok(parsed) => parsed.mcp_servers,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to parse servers file");
            HashMap::new()
        }
    }
}

/// Resolve the full server map: file contents overlaid by inline entries.
pub fn resolve_servers(config: &McpConfig) -> HashMap<String, McpServerConfig> {
    let file_path = config
        .servers_file
        .clone()
        .unwrap_or_else(|| Config::config_dir().join("servers.json"));
    let mut servers = load_mcp_servers(&file_path);
    for (name, server) in &config.servers {
        servers.insert(name.clone(), server.clone());
    }
    servers
}

/// Expand `${HOME}`, `${PROJECT_ROOT}` and declared secret vars in a string.
pub fn expand_placeholders(value: &str, project_root: &Path, secret_env: &[String]) -> String {
    let mut out = value.to_string();
    if let Some(home) = dirs::home_dir() {
        out = out.replace("${HOME}", &home.to_string_lossy());
    }
    out = out.replace("${PROJECT_ROOT}", &project_root.to_string_lossy());
    for var in secret_env {
        let placeholder = format!("${{{var}}}");
        if out.contains(&placeholder) {
            match std::env::var(var) {
                Ok(v) => out = out.replace(&placeholder, &v),
                Err(_) => {
                    tracing::warn!(var = %var, "Secret env var not set, placeholder left as-is");
                }
            }
        }
    }
    out
}

/// Expand placeholders across a server config before spawn.
pub fn expand_server_config(
    server: &McpServerConfig,
    project_root: &Path,
    secret_env: &[String],
) -> McpServerConfig {
    let mut expanded = server.clone();
    expanded.command = expand_placeholders(&server.command, project_root, secret_env);
    expanded.args = server
        .args
        .iter()
        .map(|a| expand_placeholders(a, project_root, secret_env))
        .collect();
    expanded.env = server
        .env
        .iter()
        .map(|(k, v)| (k.clone(), expand_placeholders(v, project_root, secret_env)))
        .collect();
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_step_attempts, 3);
        assert_eq!(config.orchestrator.replan_limit, 2);
        assert_eq!(config.orchestrator.consent_timeout_secs, 20);
        assert_eq!(config.dispatch.tool_timeout_secs, 10);
        assert_eq!(config.dispatch.vibe_timeout_secs, 3600);
        assert_eq!(config.segmentation.max_segments, 5);
        assert_eq!(config.language.target, "uk");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [llm]
            provider = "anthropic"
            deep_model = "claude-opus-4"

            [segmentation]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.llm.deep_model, "claude-opus-4");
        assert!(!config.segmentation.enabled);
        assert_eq!(config.segmentation.max_segments, 5);
    }

    #[test]
    fn test_parse_servers_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{
                "mcpServers": {
                    "filesystem": {
                        "command": "npx",
                        "args": ["-y", "@modelcontextprotocol/server-filesystem", "${HOME}"],
                        "tier": 1,
                        "description": "File operations"
                    },
                    "tour-guide": {
                        "transport": "internal",
                        "disabled": false
                    }
                },
                "_metadata": {"version": 3}
            }"#,
        )
        .unwrap();

        let servers = load_mcp_servers(&path);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers["filesystem"].tier, 1);
        assert_eq!(servers["tour-guide"].transport, McpTransport::Internal);
    }

    #[test]
    fn test_malformed_servers_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_mcp_servers(&path).is_empty());
    }

    #[test]
    fn test_expand_placeholders() {
        let root = PathBuf::from("/tmp/project");
        let out = expand_placeholders("${PROJECT_ROOT}/bin", &root, &[]);
        assert_eq!(out, "/tmp/project/bin");

        std::env::set_var("TRIAD_TEST_TOKEN", "sekrit");
        let out = expand_placeholders(
            "--token=${TRIAD_TEST_TOKEN}",
            &root,
            &["TRIAD_TEST_TOKEN".to_string()],
        );
        assert_eq!(out, "--token=sekrit");

        // Undeclared vars are left untouched.
        let out = expand_placeholders("${TRIAD_TEST_TOKEN}", &root, &[]);
        assert_eq!(out, "${TRIAD_TEST_TOKEN}");
    }

    #[test]
    fn test_expand_server_config() {
        let root = PathBuf::from("/srv/app");
        let server = McpServerConfig {
            transport: McpTransport::Stdio,
            command: "${PROJECT_ROOT}/server".to_string(),
            args: vec!["--root".to_string(), "${PROJECT_ROOT}".to_string()],
            env: HashMap::from([("ROOT".to_string(), "${PROJECT_ROOT}".to_string())]),
            tier: 2,
            agents: vec![],
            disabled: false,
            description: String::new(),
        };
        let expanded = expand_server_config(&server, &root, &[]);
        assert_eq!(expanded.command, "/srv/app/server");
        assert_eq!(expanded.args[1], "/srv/app");
        assert_eq!(expanded.env["ROOT"], "/srv/app");
    }
}
