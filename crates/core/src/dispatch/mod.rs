//! Single entry point for every tool call.
//!
//! Agents emit whatever tool names their models produce; the dispatcher turns
//! that into a concrete (server, tool, arguments) triple or a typed failure.
//! Resolution order: sanitize/infer, hallucination check, dotted namespace,
//! prefix strip, per-server handlers, registry fallback, compatibility check,
//! argument validation, dispatch, post-processing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::context::{MapState, SharedContext};
use crate::mcp::{CallOutcome, ServerManager};
use crate::registry::SchemaRegistry;

/// Transport seam between resolution and execution. Production is the
/// `ServerManager`; tests plug an in-memory transport.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn call(&self, server: &str, tool: &str, args: Value) -> CallOutcome;
    fn is_internal(&self, server: &str) -> bool;
}

#[async_trait]
impl ToolTransport for ServerManager {
    async fn call(&self, server: &str, tool: &str, args: Value) -> CallOutcome {
        self.call_tool(server, tool, args).await
    }

    fn is_internal(&self, server: &str) -> bool {
        ServerManager::is_internal(self, server)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    Hallucinated,
    UnknownTool,
    CompatibilityError,
    ValidationError,
    BadRequest,
    ToolNotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub tag: Option<ErrorTag>,
    pub server: Option<String>,
    pub tool: Option<String>,
    pub suggestion: Option<String>,
}

impl DispatchResult {
    fn failure(error: impl Into<String>, tag: ErrorTag) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            tag: Some(tag),
            server: None,
            tool: None,
            suggestion: None,
        }
    }
}

/// Invented names models produce that exist on no server.
const HALLUCINATED_TOOLS: &[(&str, &str)] = &[
    ("evaluate", "Use vibe_code_review for code evaluation or execute_command for running tests."),
    ("assess", "Use vibe_code_review for assessment."),
    ("verify", "Use execute_command to run verification commands."),
    ("validate", "Use execute_command to run validation scripts."),
    ("check", "Use execute_command for running check commands."),
    ("test", "Use execute_command('npm test') or similar."),
    ("compile", "Use execute_command with the appropriate build command."),
    ("build", "Use execute_command('npm run build') or similar."),
    ("deploy", "Use execute_command with deployment scripts."),
    ("run", "Use execute_command for running arbitrary commands."),
];

const TERMINAL_SYNONYMS: &[&str] = &[
    "bash", "zsh", "sh", "shell", "terminal", "execute", "exec", "cmd", "command",
    "run_command", "run_shell", "execute_shell",
];

const FILESYSTEM_SYNONYMS: &[&str] = &[
    "read", "write", "save", "save_file", "read_text", "write_text", "list", "list_dir",
    "ls", "mkdir", "make_dir", "remove", "rm", "mv", "file_info",
];

const BROWSER_SYNONYMS: &[&str] = &[
    "browser", "puppeteer", "open_url", "goto", "navigate_to", "google", "search",
    "click_selector", "fill",
];

const VIBE_SYNONYMS: &[&str] = &[
    "vibe", "code_task", "code_review", "analyze_error", "fix_code", "windsurf",
];

const DEVTOOLS_SYNONYMS: &[&str] = &["devtools", "console", "console_logs", "network_requests"];

const CONTEXT7_SYNONYMS: &[&str] = &["context7", "docs", "library_docs", "resolve_library_id"];

const GOLDEN_FUND_SYNONYMS: &[&str] =
    &["golden_fund", "goldenfund", "dataset_search", "ingest", "probe"];

const DATA_ANALYSIS_SYNONYMS: &[&str] = &[
    "pandas", "dataframe", "analyze_data", "statistics", "visualize", "plot", "chart",
];

const XCODEBUILD_SYNONYMS: &[&str] = &["xcode", "xcodebuild", "simulator", "ios_build"];

/// Words that always route to the OS-automation family (coverage target 90%).
const OS_NATIVE_PRIORITY: &[&str] = &[
    "bash", "zsh", "git", "npm", "curl", "time", "clipboard", "applescript", "osascript",
    "brew", "screenshot", "click", "type", "press", "hotkey", "open_app",
];

/// Verbs that only gather information; consent gates never block these.
pub const INFO_GATHERING_VERBS: &[&str] = &[
    "search", "find", "list", "read", "get", "show", "lookup", "fetch", "check", "знайди",
    "пошукай", "прочитай", "перевір", "покажи",
];

pub struct ToolDispatcher {
    transport: Arc<dyn ToolTransport>,
    registry: Arc<SchemaRegistry>,
    map_state: MapState,
    context: SharedContext,
    total_calls: AtomicU64,
    os_native_calls: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageStats {
    pub total_calls: u64,
    pub os_native_calls: u64,
    pub coverage_percentage: f64,
    pub target: f64,
}

impl ToolDispatcher {
    pub fn new(
        transport: Arc<dyn ToolTransport>,
        registry: Arc<SchemaRegistry>,
        map_state: MapState,
        context: SharedContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            registry,
            map_state,
            context,
            total_calls: AtomicU64::new(0),
            os_native_calls: AtomicU64::new(0),
        })
    }

    /// The only way agents execute tools.
    pub async fn resolve_and_dispatch(
        &self,
        tool_name: Option<&str>,
        args: Value,
        explicit_server: Option<&str>,
    ) -> DispatchResult {
        let mut args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut tool_name = tool_name.unwrap_or("").trim().to_lowercase();
        if tool_name.is_empty() {
            tool_name = infer_tool_from_args(&args);
        }

        if let Some((_, hint)) = HALLUCINATED_TOOLS.iter().find(|(n, _)| *n == tool_name) {
            tracing::warn!(tool = %tool_name, "Hallucinated tool detected");
            let mut result = DispatchResult::failure(
                format!("Tool '{tool_name}' does not exist. {hint}"),
                ErrorTag::Hallucinated,
            );
            result.suggestion = Some(hint.to_string());
            return result;
        }

        let (server, resolved_tool, mut resolved_args) =
            self.resolve_routing(&tool_name, args.clone(), explicit_server);

        let Some(server) = server else {
            return self.resolution_failure(&tool_name);
        };

        if self.transport.is_internal(&server) {
            return self.handle_internal(&server, &resolved_tool, &resolved_args).await;
        }

        if let Some(result) = self.check_compatibility(&server, &resolved_tool) {
            return result;
        }

        wrap_command_cwd(&server, &resolved_tool, &mut resolved_args);
        self.inject_known_context(&server, &resolved_tool, &mut resolved_args).await;

        match self.validate_args(&resolved_tool, &mut resolved_args) {
            Ok(()) => {}
            Err(message) => {
                tracing::error!(server = %server, tool = %resolved_tool, "{message}");
                let mut result = DispatchResult::failure(
                    format!("Invalid arguments for '{resolved_tool}': {message}"),
                    ErrorTag::ValidationError,
                );
                result.server = Some(server);
                result.tool = Some(resolved_tool);
                return result;
            }
        }

        self.dispatch(&server, &resolved_tool, resolved_args).await
    }

    fn resolve_routing(
        &self,
        tool_name: &str,
        args: Map<String, Value>,
        explicit_server: Option<&str>,
    ) -> (Option<String>, String, Map<String, Value>) {
        // Dot notation wins over everything.
        if let Some((server, tool)) = tool_name.split_once('.') {
            return self.resolve_with_server(tool, args, server);
        }

        let mut tool_name = tool_name.to_string();
        let mut explicit = explicit_server.map(str::to_lowercase);

        // Strip a known server prefix when unambiguous.
        if explicit.is_none() && self.registry.get_tool_schema(&tool_name).is_none() {
            if let Some((server, stripped)) = self.strip_server_prefix(&tool_name) {
                explicit = Some(server);
                tool_name = stripped;
            }
        }

        if let Some(server) = explicit {
            return self.resolve_with_server(&tool_name, args, &server);
        }

        self.route_by_synonyms(&tool_name, args)
    }

    fn strip_server_prefix(&self, tool_name: &str) -> Option<(String, String)> {
        let mut servers: Vec<&str> = self.registry.server_names();
        // Longest prefix first so "duckduckgo-search" beats "search".
        servers.sort_by_key(|s| std::cmp::Reverse(s.len()));
        for server in servers {
            for prefix in [format!("{server}_"), format!("{}_", server.replace('-', "_"))] {
                if let Some(stripped) = tool_name.strip_prefix(&prefix) {
                    return Some((server.to_string(), stripped.to_string()));
                }
            }
        }
        None
    }

    fn resolve_with_server(
        &self,
        tool_name: &str,
        args: Map<String, Value>,
        server: &str,
    ) -> (Option<String>, String, Map<String, Value>) {
        match server {
            "terminal" | "macos-use" | "macos_use" | "notes" => {
                handle_os_automation(tool_name, args)
            }
            "filesystem" => handle_filesystem(tool_name, args),
            "puppeteer" | "browser" => handle_browser(tool_name, args),
            "vibe" => handle_vibe(tool_name, args),
            "devtools" => handle_devtools(tool_name, args),
            "context7" => handle_context7(tool_name, args),
            "golden-fund" | "golden_fund" => handle_golden_fund(tool_name, args),
            "data-analysis" => handle_data_analysis(tool_name, args),
            "xcodebuild" => handle_xcodebuild(tool_name, args),
            "git" => handle_legacy_git(tool_name, args),
            "maps" => handle_maps(tool_name, args),
            other => (Some(other.to_string()), tool_name.to_string(), args),
        }
    }

    fn route_by_synonyms(
        &self,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> (Option<String>, String, Map<String, Value>) {
        // The literal name "search" in a browser context must reach the
        // web-search server, never browser automation.
        if tool_name == "search" && !args.contains_key("query") && args.contains_key("url") {
            return handle_browser(tool_name, args);
        }
        if tool_name == "search" {
            let mut args = args;
            if !args.contains_key("query") {
                if let Some(q) = args.remove("question").or_else(|| args.remove("text")) {
                    args.insert("query".to_string(), q);
                }
            }
            return (
                Some("duckduckgo-search".to_string()),
                "web_search".to_string(),
                args,
            );
        }

        if tool_name == "memory" && args.contains_key("query") {
            return (Some("memory".to_string()), "search".to_string(), args);
        }

        if OS_NATIVE_PRIORITY.contains(&tool_name)
            || tool_name.starts_with("macos-use")
            || tool_name.starts_with("macos_use_")
            || tool_name.starts_with("notes_")
        {
            return handle_os_automation(tool_name, args);
        }

        if TERMINAL_SYNONYMS.contains(&tool_name) {
            return handle_os_automation(tool_name, args);
        }
        if FILESYSTEM_SYNONYMS.contains(&tool_name) {
            return handle_filesystem(tool_name, args);
        }
        if (BROWSER_SYNONYMS.contains(&tool_name) && tool_name != "search")
            || tool_name.starts_with("puppeteer_")
            || tool_name.starts_with("browser_")
        {
            return handle_browser(tool_name, args);
        }
        if VIBE_SYNONYMS.contains(&tool_name) || tool_name.starts_with("vibe_") {
            return handle_vibe(tool_name, args);
        }
        if ["sequential-thinking", "sequentialthinking", "think"].contains(&tool_name) {
            return (
                Some("sequential-thinking".to_string()),
                "sequentialthinking".to_string(),
                args,
            );
        }
        if DEVTOOLS_SYNONYMS.contains(&tool_name) {
            return handle_devtools(tool_name, args);
        }
        if CONTEXT7_SYNONYMS.contains(&tool_name) {
            return handle_context7(tool_name, args);
        }
        if GOLDEN_FUND_SYNONYMS.contains(&tool_name) {
            return handle_golden_fund(tool_name, args);
        }
        if DATA_ANALYSIS_SYNONYMS.contains(&tool_name) {
            return handle_data_analysis(tool_name, args);
        }
        if XCODEBUILD_SYNONYMS.contains(&tool_name) {
            return handle_xcodebuild(tool_name, args);
        }
        if tool_name.starts_with("git_") {
            return handle_legacy_git(tool_name, args);
        }
        if tool_name.starts_with("maps_") {
            return handle_maps(tool_name, args);
        }

        // Registry fallback. Aliases resolve to their canonical name.
        match self.registry.get_server_for_tool(tool_name) {
            Some(server) => {
                let canonical = self
                    .registry
                    .canonical_name(tool_name)
                    .unwrap_or(tool_name)
                    .to_string();
                (Some(server), canonical, args)
            }
            None => (None, tool_name.to_string(), args),
        }
    }

    fn resolution_failure(&self, tool_name: &str) -> DispatchResult {
        let similar: Vec<&str> = self
            .registry
            .all_tool_names()
            .into_iter()
            .filter(|t| t.contains(tool_name) || tool_name.contains(*t))
            .take(5)
            .collect();
        let suggestion = if similar.is_empty() {
            None
        } else {
            Some(format!("Did you mean: {}", similar.join(", ")))
        };
        tracing::warn!(tool = %tool_name, ?suggestion, "Unknown tool");
        let mut result = DispatchResult::failure(
            format!(
                "Could not resolve server for tool: '{tool_name}'.{}",
                suggestion
                    .as_deref()
                    .map(|s| format!(" {s}"))
                    .unwrap_or_default()
            ),
            ErrorTag::UnknownTool,
        );
        result.suggestion = suggestion;
        result
    }

    /// The resolved tool must belong to the server's advertised surface.
    fn check_compatibility(&self, server: &str, tool: &str) -> Option<DispatchResult> {
        let Some(entry) = self.registry.server_entry(server) else {
            return Some(DispatchResult::failure(
                format!("Realm-tool compatibility error: unknown server/realm: {server}"),
                ErrorTag::CompatibilityError,
            ));
        };

        if entry.key_tools.iter().any(|t| t == tool) {
            return None;
        }

        let patterns = [
            format!("{server}_{tool}"),
            format!("{}_{tool}", server.replace('-', "_")),
            tool.to_string(),
        ];
        for pattern in &patterns {
            if let Some(schema) = self.registry.get_tool_schema(pattern) {
                if schema.server == server {
                    return None;
                }
            }
        }

        // Capability keyword match as the last resort.
        let tool_lower = tool.to_lowercase();
        let capability_match = entry
            .capabilities
            .iter()
            .flat_map(|c| c.split_whitespace())
            .any(|kw| tool_lower.contains(&kw.to_lowercase()));
        if capability_match {
            return None;
        }

        let allowed = self.registry.tool_names_for_server(server).join(", ");
        Some(DispatchResult::failure(
            format!(
                "Realm-tool compatibility error: tool '{tool}' is not compatible with {server} realm. Available tools: {allowed}"
            ),
            ErrorTag::CompatibilityError,
        ))
    }

    async fn inject_known_context(&self, server: &str, tool: &str, args: &mut Map<String, Value>) {
        if server == "macos-use"
            && ["click", "type_text", "press_key", "screenshot"].contains(&tool)
            && !args.contains_key("pid")
        {
            if let Some(pid) = self.context.current_pid().await {
                args.insert("pid".to_string(), json!(pid));
            }
        }
    }

    /// Required args with synonym auto-fill, then schema-driven coercion.
    fn validate_args(&self, tool: &str, args: &mut Map<String, Value>) -> Result<(), String> {
        let Some(schema) = self.registry.get_tool_schema(tool) else {
            tracing::debug!(tool = %tool, "No schema, skipping validation");
            return Ok(());
        };
        let schema = schema.clone();

        let mut missing: Vec<String> = schema
            .required
            .iter()
            .filter(|r| !args.contains_key(r.as_str()) || args[r.as_str()].is_null())
            .cloned()
            .collect();

        if !missing.is_empty() {
            for req in missing.clone() {
                let filled = match req.as_str() {
                    "query" => args.get("question").cloned(),
                    "prompt" => args.get("query").cloned(),
                    "term" => args.get("libraryName").cloned(),
                    _ => None,
                };
                if let Some(value) = filled {
                    tracing::info!(tool = %tool, arg = %req, "Auto-filled missing argument");
                    args.insert(req.clone(), value);
                }
            }
            missing.retain(|r| !args.contains_key(r.as_str()) || args[r.as_str()].is_null());
        }

        if !missing.is_empty() {
            return Err(format!(
                "Missing required arguments: {}. Schema requires: {:?}. Provided: {:?}",
                missing.join(", "),
                schema.required,
                args.keys().collect::<Vec<_>>()
            ));
        }

        for (key, expected) in &schema.types {
            if let Some(value) = args.get(key) {
                if value.is_null() {
                    continue;
                }
                match coerce_value(value, expected) {
                    Some(coerced) => {
                        args.insert(key.clone(), coerced);
                    }
                    None => {
                        tracing::error!(
                            tool = %tool,
                            arg = %key,
                            expected = %expected,
                            "Type conversion failed"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        server: &str,
        tool: &str,
        args: Map<String, Value>,
    ) -> DispatchResult {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if server == "macos-use" {
            self.os_native_calls.fetch_add(1, Ordering::Relaxed);
        }

        tracing::info!(server = %server, tool = %tool, "Dispatching tool call");
        let outcome = self
            .transport
            .call(server, tool, Value::Object(args.clone()))
            .await;

        self.post_process_maps(tool, &outcome).await;
        if let Some(path) = args.get("path").and_then(Value::as_str) {
            self.context.push_recent_path(path).await;
        }

        let tag = if outcome.tool_not_found {
            Some(ErrorTag::ToolNotFound)
        } else if outcome.bad_request {
            Some(ErrorTag::BadRequest)
        } else {
            None
        };

        DispatchResult {
            success: outcome.success,
            output: outcome.output,
            error: outcome.error,
            tag,
            server: Some(server.to_string()),
            tool: Some(tool.to_string()),
            suggestion: if outcome.tool_not_found {
                Some(format!(
                    "Available on '{server}': {}",
                    self.registry.tool_names_for_server(server).join(", ")
                ))
            } else {
                None
            },
        }
    }

    async fn handle_internal(
        &self,
        server: &str,
        tool: &str,
        args: &Map<String, Value>,
    ) -> DispatchResult {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let output = match (server, tool) {
            ("tour-guide", "start_tour") => format!(
                "Tour '{}' started",
                args.get("tour_name").and_then(Value::as_str).unwrap_or("default")
            ),
            ("tour-guide", "next_stop") => "Advanced to the next stop".to_string(),
            ("tour-guide", "end_tour") => "Tour finished".to_string(),
            _ => {
                return DispatchResult::failure(
                    format!("Internal server '{server}' has no tool '{tool}'"),
                    ErrorTag::ToolNotFound,
                )
            }
        };
        DispatchResult {
            success: true,
            output,
            error: None,
            tag: None,
            server: Some(server.to_string()),
            tool: Some(tool.to_string()),
            suggestion: None,
        }
    }

    /// Maps responses feed the shared map view as a side effect.
    async fn post_process_maps(&self, tool: &str, outcome: &CallOutcome) {
        if !tool.starts_with("maps_") || !outcome.success {
            return;
        }
        let Ok(data) = serde_json::from_str::<Value>(&outcome.output) else {
            return;
        };
        match tool {
            "maps_distance_matrix" => {
                if let Some(element) = data["rows"][0]["elements"][0].as_object() {
                    let distance = element
                        .get("distance")
                        .and_then(|d| d["text"].as_str())
                        .unwrap_or("");
                    let duration = element
                        .get("duration")
                        .and_then(|d| d["text"].as_str())
                        .unwrap_or("");
                    if !distance.is_empty() {
                        self.map_state.record_distance(distance, duration).await;
                    }
                }
            }
            "maps_directions" => {
                if let Some(summary) = data["routes"][0]["summary"].as_str() {
                    self.map_state.record_route(summary).await;
                }
            }
            _ => {}
        }
    }

    pub fn coverage_stats(&self) -> CoverageStats {
        let total = self.total_calls.load(Ordering::Relaxed);
        let native = self.os_native_calls.load(Ordering::Relaxed);
        CoverageStats {
            total_calls: total,
            os_native_calls: native,
            coverage_percentage: if total > 0 {
                (native as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
            } else {
                0.0
            },
            target: 90.0,
        }
    }
}

/// When the backing tool has no working-dir parameter, fold `cwd`/`path`
/// into the command itself.
fn wrap_command_cwd(server: &str, tool: &str, args: &mut Map<String, Value>) {
    if server != "macos-use" || tool != "execute_command" {
        return;
    }
    let command = args
        .get("command")
        .or_else(|| args.get("cmd"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let cwd = args
        .get("cwd")
        .or_else(|| args.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string);
    if let (Some(command), Some(cwd)) = (command, cwd) {
        if !command.trim().is_empty() && !command.trim_start().starts_with("cd ") {
            args.insert("command".to_string(), json!(format!("cd {cwd} && {command}")));
        }
    }
    args.remove("cwd");
    args.remove("path");
    args.remove("cmd");
}

fn infer_tool_from_args(args: &Map<String, Value>) -> String {
    let action = args
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    let has_command = args.contains_key("command") || args.contains_key("cmd");

    if action.contains("vibe") {
        return "vibe".to_string();
    }
    if ["click", "type", "press", "screenshot", "scroll"]
        .iter()
        .any(|kw| action.contains(kw))
    {
        return "macos-use".to_string();
    }
    if args.contains_key("x") && args.contains_key("y") {
        return "click".to_string();
    }
    if ["read", "write", "list", "save", "delete"]
        .iter()
        .any(|kw| action.contains(kw))
        || args.contains_key("path")
    {
        return "read".to_string();
    }
    if args.contains_key("url") {
        return "fetch".to_string();
    }
    if has_command {
        return "execute_command".to_string();
    }
    if !action.is_empty() {
        return action;
    }
    "execute_command".to_string()
}

fn repair_arg(args: &mut Map<String, Value>, wrong: &str, right: &str) {
    if args.contains_key(wrong) && !args.contains_key(right) {
        if let Some(value) = args.remove(wrong) {
            tracing::info!(from = %wrong, to = %right, "Repaired argument name");
            args.insert(right.to_string(), value);
        }
    }
}

type Routed = (Option<String>, String, Map<String, Value>);

fn handle_os_automation(tool_name: &str, mut args: Map<String, Value>) -> Routed {
    repair_arg(&mut args, "cmd", "command");
    let clean = tool_name
        .trim_start_matches("macos-use_")
        .trim_start_matches("macos_use_")
        .trim_start_matches("notes_");

    let tool = match clean {
        t if TERMINAL_SYNONYMS.contains(&t) => "execute_command",
        "git" | "npm" | "curl" | "brew" => {
            // The word itself is the command family; keep any provided command.
            if !args.contains_key("command") {
                args.insert("command".to_string(), json!(clean));
            }
            "execute_command"
        }
        "time" => "get_time",
        "fetch" | "fetch_url" | "url" => "fetch_url",
        "clipboard" | "clipboard_read" => "clipboard_read",
        "clipboard_write" | "copy_to_clipboard" => "clipboard_write",
        "screenshot" | "capture" | "capture_screen" => "screenshot",
        "click" | "tap" => "click",
        "type" | "type_text" | "input_text" => "type_text",
        "press" | "press_key" | "hotkey" | "key" => "press_key",
        "open_app" | "open" | "launch" | "launch_app" => "open_app",
        "applescript" | "osascript" => {
            repair_arg(&mut args, "script", "command");
            if let Some(script) = args.get("command").and_then(Value::as_str) {
                let wrapped = format!("osascript -e '{script}'");
                args.insert("command".to_string(), json!(wrapped));
            }
            "execute_command"
        }
        other => other,
    };
    (Some("macos-use".to_string()), tool.to_string(), args)
}

fn handle_filesystem(tool_name: &str, mut args: Map<String, Value>) -> Routed {
    repair_arg(&mut args, "new_path", "path");
    repair_arg(&mut args, "file_path", "path");
    repair_arg(&mut args, "filename", "path");
    let tool = match tool_name {
        "read" | "cat" | "read_text" => "read_file",
        "write" | "save" | "save_file" | "write_text" => "write_file",
        "list" | "list_dir" | "ls" => "list_directory",
        "mkdir" | "make_dir" => "create_directory",
        "remove" | "rm" | "delete" => "delete_file",
        "mv" | "move" | "rename" => "move_file",
        "file_info" | "stat" => "get_file_info",
        other => other,
    };
    (Some("filesystem".to_string()), tool.to_string(), args)
}

fn handle_browser(tool_name: &str, mut args: Map<String, Value>) -> Routed {
    let clean = tool_name
        .trim_start_matches("puppeteer_")
        .trim_start_matches("browser_");
    let tool = match clean {
        "open_url" | "goto" | "navigate_to" | "open" | "browser" | "puppeteer" | "search"
        | "google" => "navigate",
        "click" | "click_selector" => "click_element",
        "fill" | "type" => "fill_field",
        "screenshot" | "capture" => "page_screenshot",
        "evaluate" | "eval" | "js" => "evaluate_js",
        other => other,
    };
    // A "search" that reached the browser still needs a URL to navigate to.
    if tool == "navigate" && !args.contains_key("url") {
        if let Some(query) = args.remove("query").or_else(|| args.remove("q")) {
            if let Some(query) = query.as_str() {
                args.insert(
                    "url".to_string(),
                    json!(format!("https://duckduckgo.com/?q={query}")),
                );
            }
        }
    }
    (Some("puppeteer".to_string()), tool.to_string(), args)
}

fn handle_vibe(tool_name: &str, mut args: Map<String, Value>) -> Routed {
    let tool = match tool_name {
        "vibe" | "code_task" | "windsurf" => "vibe_execute_task",
        "analyze_error" | "fix_code" => "vibe_analyze_error",
        "code_review" => "vibe_code_review",
        other if other.starts_with("vibe_") => other,
        other => other,
    };
    // Always run with an absolute working directory that exists.
    let cwd = args
        .get("cwd")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|c| c.starts_with('/'))
        .unwrap_or_else(|| {
            std::env::current_dir()
                .map(|d| d.to_string_lossy().to_string())
                .unwrap_or_else(|_| "/tmp".to_string())
        });
    let _ = std::fs::create_dir_all(&cwd);
    args.insert("cwd".to_string(), json!(cwd));
    (Some("vibe".to_string()), tool.to_string(), args)
}

fn handle_devtools(tool_name: &str, args: Map<String, Value>) -> Routed {
    let tool = match tool_name {
        "console" | "console_logs" | "devtools" => "get_console_logs",
        "network_requests" | "network" => "get_network_requests",
        "inspect" => "inspect_element",
        other => other,
    };
    (Some("devtools".to_string()), tool.to_string(), args)
}

fn handle_context7(tool_name: &str, mut args: Map<String, Value>) -> Routed {
    repair_arg(&mut args, "libraryName", "term");
    repair_arg(&mut args, "library", "term");
    let tool = match tool_name {
        "docs" | "library_docs" | "context7" => "get_library_docs",
        "resolve_library_id" => "resolve_library",
        other => other,
    };
    (Some("context7".to_string()), tool.to_string(), args)
}

fn handle_golden_fund(tool_name: &str, args: Map<String, Value>) -> Routed {
    let tool = match tool_name {
        "golden_fund" | "goldenfund" | "dataset_search" => "search_golden_fund",
        "ingest" => "ingest_dataset",
        "probe" => "probe_entity",
        other => other,
    };
    (Some("golden-fund".to_string()), tool.to_string(), args)
}

fn handle_data_analysis(tool_name: &str, args: Map<String, Value>) -> Routed {
    let tool = match tool_name {
        "pandas" | "dataframe" | "analyze_data" => "analyze_dataset",
        "statistics" => "generate_statistics",
        "visualize" | "plot" | "chart" => "create_visualization",
        other => other,
    };
    (Some("data-analysis".to_string()), tool.to_string(), args)
}

fn handle_xcodebuild(tool_name: &str, mut args: Map<String, Value>) -> Routed {
    repair_arg(&mut args, "project", "project_path");
    let tool = match tool_name {
        "xcode" | "xcodebuild" | "ios_build" | "build" => "build_project",
        "simulator" => "list_simulators",
        "test" => "run_tests",
        other => other,
    };
    (Some("xcodebuild".to_string()), tool.to_string(), args)
}

/// Legacy git server was folded into OS automation.
fn handle_legacy_git(tool_name: &str, mut args: Map<String, Value>) -> Routed {
    let subcommand = tool_name.trim_start_matches("git_");
    if !args.contains_key("command") {
        let extra = args
            .get("args")
            .and_then(Value::as_str)
            .map(|a| format!(" {a}"))
            .unwrap_or_default();
        args.insert("command".to_string(), json!(format!("git {subcommand}{extra}")));
        args.remove("args");
    }
    (
        Some("macos-use".to_string()),
        "execute_command".to_string(),
        args,
    )
}

fn handle_maps(tool_name: &str, mut args: Map<String, Value>) -> Routed {
    repair_arg(&mut args, "location", "address");
    let tool = if tool_name.starts_with("maps_") {
        tool_name.to_string()
    } else {
        format!("maps_{tool_name}")
    };
    (Some("maps".to_string()), tool, args)
}

fn coerce_value(value: &Value, expected: &str) -> Option<Value> {
    match expected {
        "str" => match value {
            Value::String(_) => Some(value.clone()),
            other => Some(json!(other.to_string().trim_matches('"').to_string())),
        },
        "int" => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
            Value::Number(n) => n.as_f64().map(|f| json!(f as i64)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .map(|f| json!(f as i64)),
            _ => None,
        },
        "float" => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| json!(f)),
            _ => None,
        },
        "bool" => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => Some(json!(matches!(
                s.to_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ))),
            Value::Number(n) => Some(json!(n.as_i64() == Some(1))),
            _ => None,
        },
        "list" => match value {
            Value::Array(_) => Some(value.clone()),
            Value::String(s) => {
                if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                    if parsed.is_array() {
                        return Some(parsed);
                    }
                }
                if s.contains(',') {
                    Some(json!(s.split(',').map(str::trim).collect::<Vec<_>>()))
                } else {
                    Some(json!([s]))
                }
            }
            other => Some(json!([other])),
        },
        "dict" => match value {
            Value::Object(_) => Some(value.clone()),
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(Value::is_object),
            _ => None,
        },
        _ => Some(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records calls and returns a scripted outcome.
    struct MockTransport {
        calls: Mutex<Vec<(String, String, Value)>>,
        outcome: CallOutcome,
    }

    impl MockTransport {
        fn ok(output: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                outcome: CallOutcome {
                    success: true,
                    output: output.to_string(),
                    ..Default::default()
                },
            })
        }

        fn last_call(&self) -> (String, String, Value) {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ToolTransport for MockTransport {
        async fn call(&self, server: &str, tool: &str, args: Value) -> CallOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((server.to_string(), tool.to_string(), args));
            self.outcome.clone()
        }

        fn is_internal(&self, server: &str) -> bool {
            server == "tour-guide"
        }
    }

    fn dispatcher(transport: Arc<MockTransport>) -> Arc<ToolDispatcher> {
        ToolDispatcher::new(
            transport,
            Arc::new(SchemaRegistry::embedded()),
            MapState::new(),
            SharedContext::new(),
        )
    }

    #[tokio::test]
    async fn test_hallucinated_tool_is_rejected_immediately() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        let result = d
            .resolve_and_dispatch(Some("evaluate"), json!({}), None)
            .await;
        assert!(!result.success);
        assert_eq!(result.tag, Some(ErrorTag::Hallucinated));
        assert!(result.error.unwrap().contains("does not exist"));
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_synonym_resolves_to_execute_command() {
        let transport = MockTransport::ok("done");
        let d = dispatcher(transport.clone());
        let result = d
            .resolve_and_dispatch(Some("bash"), json!({"cmd": "ls -la"}), None)
            .await;
        assert!(result.success);
        let (server, tool, args) = transport.last_call();
        assert_eq!(server, "macos-use");
        assert_eq!(tool, "execute_command");
        assert_eq!(args["command"], "ls -la");
    }

    #[tokio::test]
    async fn test_cwd_is_chained_into_command() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        d.resolve_and_dispatch(
            Some("execute_command"),
            json!({"command": "ls", "cwd": "/tmp/work"}),
            Some("macos-use"),
        )
        .await;
        let (_, _, args) = transport.last_call();
        assert_eq!(args["command"], "cd /tmp/work && ls");
        assert!(args.get("cwd").is_none());
    }

    #[tokio::test]
    async fn test_dotted_namespace_equals_explicit_server() {
        let transport_a = MockTransport::ok("");
        let transport_b = MockTransport::ok("");
        let da = dispatcher(transport_a.clone());
        let db = dispatcher(transport_b.clone());

        da.resolve_and_dispatch(Some("filesystem.read_file"), json!({"path": "/x"}), None)
            .await;
        db.resolve_and_dispatch(Some("read_file"), json!({"path": "/x"}), Some("filesystem"))
            .await;

        assert_eq!(transport_a.last_call(), transport_b.last_call());
    }

    #[tokio::test]
    async fn test_prefix_strip() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        d.resolve_and_dispatch(Some("macos-use_get_time"), json!({}), None)
            .await;
        let (server, tool, _) = transport.last_call();
        assert_eq!(server, "macos-use");
        assert_eq!(tool, "get_time");
    }

    #[tokio::test]
    async fn test_search_reroutes_to_web_search_server() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        d.resolve_and_dispatch(Some("search"), json!({"question": "rust async"}), None)
            .await;
        let (server, tool, args) = transport.last_call();
        assert_eq!(server, "duckduckgo-search");
        assert_eq!(tool, "web_search");
        assert_eq!(args["query"], "rust async");
    }

    #[tokio::test]
    async fn test_unknown_tool_gets_suggestions() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport);
        let result = d
            .resolve_and_dispatch(Some("read_fil"), json!({}), None)
            .await;
        assert!(!result.success);
        assert_eq!(result.tag, Some(ErrorTag::UnknownTool));
    }

    #[tokio::test]
    async fn test_missing_required_arg_is_validation_error() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        let result = d
            .resolve_and_dispatch(Some("write_file"), json!({"path": "/x"}), Some("filesystem"))
            .await;
        assert!(!result.success);
        assert_eq!(result.tag, Some(ErrorTag::ValidationError));
        assert!(result.error.unwrap().contains("content"));
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_type_coercion_string_to_int() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        d.resolve_and_dispatch(
            Some("click"),
            json!({"x": "100", "y": "250"}),
            Some("macos-use"),
        )
        .await;
        let (_, _, args) = transport.last_call();
        assert_eq!(args["x"], 100);
        assert_eq!(args["y"], 250);
    }

    #[tokio::test]
    async fn test_pid_injection_for_gui_tools() {
        let transport = MockTransport::ok("");
        let context = SharedContext::new();
        context.set_pid(Some(4242)).await;
        let d = ToolDispatcher::new(
            transport.clone(),
            Arc::new(SchemaRegistry::embedded()),
            MapState::new(),
            context,
        );
        d.resolve_and_dispatch(Some("click"), json!({"x": 1, "y": 2}), Some("macos-use"))
            .await;
        let (_, _, args) = transport.last_call();
        assert_eq!(args["pid"], 4242);
    }

    #[tokio::test]
    async fn test_compatibility_error_lists_allowed_tools() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        let result = d
            .resolve_and_dispatch(Some("navigate"), json!({"url": "http://x"}), Some("data-analysis"))
            .await;
        assert!(!result.success);
        assert_eq!(result.tag, Some(ErrorTag::CompatibilityError));
        assert!(result.error.unwrap().contains("analyze_dataset"));
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_git_becomes_shell_command() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        d.resolve_and_dispatch(Some("git_status"), json!({}), None).await;
        let (server, tool, args) = transport.last_call();
        assert_eq!(server, "macos-use");
        assert_eq!(tool, "execute_command");
        assert_eq!(args["command"], "git status");
    }

    #[tokio::test]
    async fn test_infer_tool_from_args_when_name_missing() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        d.resolve_and_dispatch(None, json!({"command": "uptime"}), None)
            .await;
        let (server, tool, _) = transport.last_call();
        assert_eq!(server, "macos-use");
        assert_eq!(tool, "execute_command");
    }

    #[tokio::test]
    async fn test_internal_server_is_handled_in_process() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        let result = d
            .resolve_and_dispatch(Some("start_tour"), json!({"tour_name": "intro"}), Some("tour-guide"))
            .await;
        assert!(result.success);
        assert!(result.output.contains("intro"));
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_os_native_coverage_metric() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport);
        d.resolve_and_dispatch(Some("bash"), json!({"command": "ls"}), None)
            .await;
        d.resolve_and_dispatch(Some("web_search"), json!({"query": "x"}), None)
            .await;
        let stats = d.coverage_stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.os_native_calls, 1);
        assert!((stats.coverage_percentage - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_maps_post_processing_updates_map_state() {
        let transport = Arc::new(MockTransport {
            calls: Mutex::new(Vec::new()),
            outcome: CallOutcome {
                success: true,
                output: json!({
                    "rows": [{"elements": [{"distance": {"text": "12 km"}, "duration": {"text": "18 min"}}]}]
                })
                .to_string(),
                ..Default::default()
            },
        });
        let map_state = MapState::new();
        let d = ToolDispatcher::new(
            transport,
            Arc::new(SchemaRegistry::embedded()),
            map_state.clone(),
            SharedContext::new(),
        );
        d.resolve_and_dispatch(
            Some("maps_distance_matrix"),
            json!({"origins": ["a"], "destinations": ["b"]}),
            None,
        )
        .await;
        let snapshot = map_state.snapshot().await;
        assert_eq!(snapshot.last_distance_text.as_deref(), Some("12 km"));
        assert_eq!(snapshot.last_duration_text.as_deref(), Some("18 min"));
    }

    #[tokio::test]
    async fn test_vibe_gets_absolute_cwd() {
        let transport = MockTransport::ok("");
        let d = dispatcher(transport.clone());
        d.resolve_and_dispatch(
            Some("vibe_execute_task"),
            json!({"prompt": "fix the build"}),
            None,
        )
        .await;
        let (server, tool, args) = transport.last_call();
        assert_eq!(server, "vibe");
        assert_eq!(tool, "vibe_execute_task");
        assert!(args["cwd"].as_str().unwrap().starts_with('/'));
    }
}
