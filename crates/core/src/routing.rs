//! LLM-first mode classification and declarative profile building.
//!
//! Profile construction here is the only way a mode is assigned downstream;
//! agents and the orchestrator never re-classify by keywords. The keyword
//! heuristic exists purely as the emergency fallback when the LLM fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use triad_config::SegmentationConfig;
use triad_provider::LlmTier;

const EMBEDDED_PROFILES: &str = include_str!("../data/mode_profiles.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Chat,
    DeepChat,
    SoloTask,
    Task,
    Development,
    Recall,
    Status,
}

impl Mode {
    pub const ALL: &'static [Mode] = &[
        Mode::Chat,
        Mode::DeepChat,
        Mode::SoloTask,
        Mode::Task,
        Mode::Development,
        Mode::Recall,
        Mode::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::DeepChat => "deep_chat",
            Mode::SoloTask => "solo_task",
            Mode::Task => "task",
            Mode::Development => "development",
            Mode::Recall => "recall",
            Mode::Status => "status",
        }
    }

    /// Tolerant parse covering the synonyms models actually emit.
    pub fn parse(raw: &str) -> Option<Mode> {
        match raw.trim().to_lowercase().as_str() {
            "chat" => Some(Mode::Chat),
            "deep_chat" | "deepchat" | "deep" => Some(Mode::DeepChat),
            "solo_task" | "solotask" | "solo" => Some(Mode::SoloTask),
            "task" => Some(Mode::Task),
            "development" | "dev" | "coding" => Some(Mode::Development),
            "recall" => Some(Mode::Recall),
            "status" => Some(Mode::Status),
            _ => None,
        }
    }

    /// Trinity modes run the full plan/verify/execute pipeline.
    pub fn is_trinity(&self) -> bool {
        matches!(self, Mode::Task | Mode::Development)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolsAccess {
    #[default]
    None,
    Limited,
    Full,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SegmentationRules {
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub split_keywords: Vec<String>,
    #[serde(default)]
    pub merge_with: Vec<String>,
}

fn default_priority() -> i32 {
    999
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModeDefaults {
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub llm_tier: LlmTier,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub tools_access: ToolsAccess,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub require_planning: bool,
    #[serde(default)]
    pub require_tools: bool,
    #[serde(default)]
    pub use_deep_persona: bool,
    #[serde(default)]
    pub use_sequential_thinking: bool,
    #[serde(default)]
    pub use_vibe: bool,
    #[serde(default)]
    pub trinity_required: bool,
    #[serde(default)]
    pub segmentation: SegmentationRules,
}

/// Parsed `mode_profiles.json`: per-mode defaults plus the protocol registry
/// and segmentation meta.
#[derive(Debug, Clone, Default)]
pub struct ModeProfilesData {
    pub modes: HashMap<Mode, ModeDefaults>,
    pub protocol_registry: HashMap<String, String>,
    pub segmentation: SegmentationConfig,
}

impl ModeProfilesData {
    pub fn parse(json: &str) -> Result<Self> {
        let mut raw: HashMap<String, Value> =
            serde_json::from_str(json).context("Failed to parse mode profiles")?;

        let protocol_registry = raw
            .remove("_protocol_registry")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let segmentation = raw
            .remove("_meta")
            .and_then(|v| serde_json::from_value(v["segmentation"].clone()).ok())
            .unwrap_or_default();

        let mut modes = HashMap::new();
        for (name, value) in raw {
            let Some(mode) = Mode::parse(&name) else {
                tracing::warn!(mode = %name, "Skipping unknown mode in profiles");
                continue;
            };
            let defaults: ModeDefaults = serde_json::from_value(value)
                .with_context(|| format!("Invalid defaults for mode '{name}'"))?;
            modes.insert(mode, defaults);
        }

        Ok(Self {
            modes,
            protocol_registry,
            segmentation,
        })
    }

    pub fn embedded() -> Self {
        Self::parse(EMBEDDED_PROFILES)
            .unwrap_or_else(|e| panic!("embedded mode profiles are invalid: {e}"))
    }
}

/// Complete execution contract for one classified request segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeProfile {
    pub mode: Mode,
    pub reason: String,
    pub voice_response: String,
    pub enriched_request: String,
    pub complexity: String,
    pub llm_tier: LlmTier,
    pub protocols: Vec<String>,
    pub servers: Vec<String>,
    pub tools_access: ToolsAccess,
    pub prompt_template: String,
    pub require_planning: bool,
    pub require_tools: bool,
    pub use_deep_persona: bool,
    pub use_sequential_thinking: bool,
    pub use_vibe: bool,
    pub trinity_required: bool,
    pub extra_servers: Vec<String>,
    pub extra_protocols: Vec<String>,
}

impl ModeProfile {
    /// Defaults plus LLM-suggested servers, de-duplicated in order.
    pub fn all_servers(&self) -> Vec<String> {
        dedup_in_order(self.servers.iter().chain(self.extra_servers.iter()))
    }

    pub fn all_protocols(&self) -> Vec<String> {
        dedup_in_order(self.protocols.iter().chain(self.extra_protocols.iter()))
    }

    /// Serialization consumed by prompts and accepted back by
    /// `build_profile` (profile construction is idempotent under it).
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "mode": self.mode.as_str(),
            "reason": self.reason,
            "voice_response": self.voice_response,
            "enriched_request": self.enriched_request,
            "complexity": self.complexity,
            "llm_tier": self.llm_tier.to_string(),
            "protocols": self.all_protocols(),
            "servers": self.all_servers(),
            "tools_access": self.tools_access,
            "use_deep_persona": self.use_deep_persona,
            "use_vibe": self.use_vibe,
            "extra_servers": self.extra_servers,
            "extra_protocols": self.extra_protocols,
        })
    }
}

fn dedup_in_order<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            result.push(item.clone());
        }
    }
    result
}

pub struct ModeRouter {
    data: RwLock<ModeProfilesData>,
    classification_count: AtomicU64,
    fallback_count: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub total_classifications: u64,
    pub fallback_classifications: u64,
    pub fallback_rate_pct: f64,
}

impl Default for ModeRouter {
    fn default() -> Self {
        Self::new(ModeProfilesData::embedded())
    }
}

impl ModeRouter {
    pub fn new(data: ModeProfilesData) -> Self {
        Self {
            data: RwLock::new(data),
            classification_count: AtomicU64::new(0),
            fallback_count: AtomicU64::new(0),
        }
    }

    pub fn segmentation_config(&self) -> SegmentationConfig {
        self.data
            .read()
            .map(|d| d.segmentation.clone())
            .unwrap_or_default()
    }

    pub fn protocol_registry(&self) -> HashMap<String, String> {
        self.data
            .read()
            .map(|d| d.protocol_registry.clone())
            .unwrap_or_default()
    }

    pub fn mode_defaults(&self, mode: Mode) -> ModeDefaults {
        self.data
            .read()
            .ok()
            .and_then(|d| d.modes.get(&mode).cloned())
            .unwrap_or_default()
    }

    pub fn mode_priority(&self, mode: Mode) -> i32 {
        self.mode_defaults(mode).segmentation.priority
    }

    pub fn split_keywords(&self, mode: Mode) -> Vec<String> {
        self.mode_defaults(mode).segmentation.split_keywords
    }

    pub fn merge_with(&self, mode: Mode) -> Vec<String> {
        self.mode_defaults(mode).segmentation.merge_with
    }

    /// Hot-reload profile data.
    pub fn reload(&self, json: &str) -> Result<()> {
        let parsed = ModeProfilesData::parse(json)?;
        if let Ok(mut data) = self.data.write() {
            *data = parsed;
        }
        tracing::info!("Mode profiles reloaded");
        Ok(())
    }

    /// Merge mode defaults with the LLM's analysis blob. The single
    /// constructor for `ModeProfile`.
    pub fn build_profile(&self, llm_analysis: &Value) -> ModeProfile {
        self.classification_count.fetch_add(1, Ordering::Relaxed);

        let raw_mode = llm_analysis["mode"]
            .as_str()
            .or_else(|| llm_analysis["intent"].as_str())
            .unwrap_or("chat");
        let mode = self.normalize_mode(raw_mode, llm_analysis);
        let defaults = self.mode_defaults(mode);

        let str_field = |key: &str| {
            llm_analysis[key]
                .as_str()
                .unwrap_or_default()
                .to_string()
        };
        let list_field = |key: &str| -> Vec<String> {
            llm_analysis[key]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut profile = ModeProfile {
            mode,
            reason: str_field("reason"),
            voice_response: str_field("voice_response"),
            enriched_request: str_field("enriched_request"),
            complexity: llm_analysis["complexity"]
                .as_str()
                .map(str::to_string)
                .or(defaults.complexity.clone())
                .unwrap_or_else(|| "medium".to_string()),
            llm_tier: defaults.llm_tier,
            protocols: defaults.protocols.clone(),
            servers: defaults.servers.clone(),
            tools_access: defaults.tools_access,
            prompt_template: defaults
                .prompt_template
                .clone()
                .unwrap_or_else(|| "strategist_chat".to_string()),
            require_planning: defaults.require_planning,
            require_tools: defaults.require_tools,
            use_deep_persona: llm_analysis["use_deep_persona"]
                .as_bool()
                .unwrap_or(defaults.use_deep_persona),
            use_sequential_thinking: defaults.use_sequential_thinking,
            use_vibe: llm_analysis["use_vibe"].as_bool().unwrap_or(defaults.use_vibe),
            trinity_required: defaults.trinity_required,
            extra_servers: list_field("extra_servers"),
            extra_protocols: list_field("extra_protocols"),
        };

        // Deep persona on a plain chat upgrades the whole profile.
        if profile.use_deep_persona && profile.mode == Mode::Chat {
            let deep = self.mode_defaults(Mode::DeepChat);
            profile.mode = Mode::DeepChat;
            profile.llm_tier = deep.llm_tier;
            profile.tools_access = deep.tools_access;
            profile.use_sequential_thinking = deep.use_sequential_thinking;
            if let Some(template) = deep.prompt_template {
                profile.prompt_template = template;
            }
            for protocol in deep.protocols {
                if !profile.protocols.contains(&protocol) {
                    profile.protocols.push(protocol);
                }
            }
            for server in deep.servers {
                if !profile.servers.contains(&server) {
                    profile.servers.push(server);
                }
            }
        }
        // Deep persona is meaningless outside deep_chat/development.
        if profile.use_deep_persona
            && !matches!(profile.mode, Mode::DeepChat | Mode::Development)
        {
            profile.use_deep_persona = false;
        }

        tracing::info!(
            mode = %profile.mode,
            servers = profile.all_servers().len(),
            deep_persona = profile.use_deep_persona,
            "Profile built"
        );
        profile
    }

    fn normalize_mode(&self, raw_mode: &str, llm_analysis: &Value) -> Mode {
        if let Some(mode) = Mode::parse(raw_mode) {
            return mode;
        }
        if llm_analysis["use_deep_persona"].as_bool() == Some(true) {
            return Mode::DeepChat;
        }
        if llm_analysis["use_vibe"].as_bool() == Some(true) {
            return Mode::Development;
        }
        tracing::warn!(mode = %raw_mode, "Unknown mode, defaulting to chat");
        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        Mode::Chat
    }

    /// Emergency heuristic, used only when LLM classification fails.
    /// Deliberately minimal: six ordered rules.
    pub fn fallback_classify(&self, user_request: &str) -> ModeProfile {
        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        let lower = user_request.to_lowercase();
        let word_count = user_request.split_whitespace().count();

        // Rule 1: code words win even for short requests.
        const CODE_WORDS: &[&str] = &[
            "код", "code", "баг", "bug", "рефактор", "refactor", "програм", "app",
        ];
        if CODE_WORDS.iter().any(|w| lower.contains(w)) {
            return self.build_profile(&serde_json::json!({"mode": "development"}));
        }

        // Rule 2: imperative verbs, checked before word count so "відкрий X"
        // lands in task.
        const ACTION_VERBS: &[&str] = &[
            "відкрий", "зроби", "створи", "встанови", "запусти", "видали", "скопіюй",
            "перемісти", "надішли", "побудуй", "налаштуй", "open", "create", "install",
            "run", "delete", "move", "send", "build",
        ];
        if ACTION_VERBS
            .iter()
            .any(|v| lower.starts_with(v) || lower.contains(&format!(" {v}")))
        {
            return self.build_profile(&serde_json::json!({"mode": "task"}));
        }

        // Rule 3: very short, no action verbs.
        if word_count <= 3 {
            return self.build_profile(&serde_json::json!({"mode": "chat"}));
        }

        // Rule 4: long complex request.
        if word_count >= 15 {
            return self.build_profile(&serde_json::json!({"mode": "task", "complexity": "high"}));
        }

        // Rule 5: medium-length question.
        if user_request.contains('?') && word_count < 10 {
            return self.build_profile(&serde_json::json!({"mode": "solo_task"}));
        }

        // Rule 6: solo_task is the safe default since it allows tool use.
        self.build_profile(&serde_json::json!({"mode": "solo_task"}))
    }

    pub fn stats(&self) -> RouterStats {
        let total = self.classification_count.load(Ordering::Relaxed);
        let fallback = self.fallback_count.load(Ordering::Relaxed);
        RouterStats {
            total_classifications: total,
            fallback_classifications: fallback,
            fallback_rate_pct: if total > 0 {
                (fallback as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mode_synonyms() {
        assert_eq!(Mode::parse("dev"), Some(Mode::Development));
        assert_eq!(Mode::parse("coding"), Some(Mode::Development));
        assert_eq!(Mode::parse("deepchat"), Some(Mode::DeepChat));
        assert_eq!(Mode::parse("solotask"), Some(Mode::SoloTask));
        assert_eq!(Mode::parse("solo"), Some(Mode::SoloTask));
        assert_eq!(Mode::parse("nonsense"), None);
    }

    #[test]
    fn test_build_profile_merges_defaults() {
        let router = ModeRouter::default();
        let profile = router.build_profile(&json!({
            "mode": "task",
            "reason": "user asked to open an app",
            "extra_servers": ["maps"],
        }));
        assert_eq!(profile.mode, Mode::Task);
        assert!(profile.trinity_required);
        assert!(profile.require_planning);
        assert_eq!(profile.llm_tier, LlmTier::Deep);
        let servers = profile.all_servers();
        assert!(servers.contains(&"macos-use".to_string()));
        assert_eq!(servers.last().unwrap(), "maps");
    }

    #[test]
    fn test_auto_upgrade_chat_to_deep_chat() {
        let router = ModeRouter::default();
        let profile = router.build_profile(&json!({
            "mode": "chat",
            "use_deep_persona": true,
        }));
        assert_eq!(profile.mode, Mode::DeepChat);
        assert_eq!(profile.llm_tier, LlmTier::Deep);
        assert!(profile.servers.contains(&"memory".to_string()));
    }

    #[test]
    fn test_deep_persona_invariant() {
        let router = ModeRouter::default();
        // use_deep_persona on a task must not survive construction.
        let profile = router.build_profile(&json!({
            "mode": "task",
            "use_deep_persona": true,
        }));
        assert!(!profile.use_deep_persona);

        for mode in Mode::ALL {
            let profile = router.build_profile(&json!({
                "mode": mode.as_str(),
                "use_deep_persona": true,
            }));
            if profile.use_deep_persona {
                assert!(matches!(profile.mode, Mode::DeepChat | Mode::Development));
            }
        }
    }

    #[test]
    fn test_unknown_mode_rescued_by_flags() {
        let router = ModeRouter::default();
        let profile = router.build_profile(&json!({"mode": "weird", "use_vibe": true}));
        assert_eq!(profile.mode, Mode::Development);

        let profile = router.build_profile(&json!({"mode": "weird", "use_deep_persona": true}));
        assert_eq!(profile.mode, Mode::DeepChat);

        let profile = router.build_profile(&json!({"mode": "weird"}));
        assert_eq!(profile.mode, Mode::Chat);
    }

    #[test]
    fn test_fallback_rules_in_order() {
        let router = ModeRouter::default();
        assert_eq!(
            router.fallback_classify("fix the bug in my app").mode,
            Mode::Development
        );
        assert_eq!(router.fallback_classify("відкрий Safari").mode, Mode::Task);
        assert_eq!(router.fallback_classify("привіт!").mode, Mode::Chat);
        let long = "please do something about the files in that folder and also \
                    tidy everything up carefully one by one thanks a lot";
        let profile = router.fallback_classify(long);
        assert_eq!(profile.mode, Mode::Task);
        assert_eq!(profile.complexity, "high");
        assert_eq!(
            router.fallback_classify("яка погода сьогодні у Києві?").mode,
            Mode::SoloTask
        );
        assert_eq!(
            router
                .fallback_classify("I wonder about the general state of things today")
                .mode,
            Mode::SoloTask
        );
    }

    #[test]
    fn test_profile_idempotent_under_serialization() {
        let router = ModeRouter::default();
        let original = router.build_profile(&json!({
            "mode": "chat",
            "use_deep_persona": true,
            "reason": "identity question",
            "extra_servers": ["golden-fund"],
        }));
        let rebuilt = router.build_profile(&original.to_value());
        assert_eq!(original, rebuilt);
    }

    #[test]
    fn test_stats_track_fallbacks() {
        let router = ModeRouter::default();
        let _ = router.build_profile(&json!({"mode": "chat"}));
        let _ = router.fallback_classify("привіт");
        let stats = router.stats();
        assert!(stats.total_classifications >= 2);
        assert!(stats.fallback_classifications >= 1);
    }

    #[test]
    fn test_segmentation_config_from_data() {
        let router = ModeRouter::default();
        let config = router.segmentation_config();
        assert!(config.enabled);
        assert_eq!(config.max_segments, 5);
        assert_eq!(router.mode_priority(Mode::DeepChat), 1);
        assert_eq!(router.mode_priority(Mode::Task), 4);
    }
}
