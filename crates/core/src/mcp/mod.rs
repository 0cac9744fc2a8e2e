//! Tool server lifecycle and the line-delimited JSON-RPC 2.0 client.
//!
//! Every server gets one writer task and one reader task; callers multiplex
//! over the session through request-id correlation. The manager exclusively
//! owns the child processes; no other component touches their stdin.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use triad_config::{expand_server_config, DispatchSettings, McpServerConfig, McpTransport};

const PROTOCOL_VERSION: &str = "2024-11-05";
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const SHUTDOWN_GRACE_SECS: u64 = 3;

/// Normalized result of one tool invocation. Tool failures are values, not
/// errors; upstream decides between retry, reflexion and replanning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOutcome {
    pub success: bool,
    /// Concatenated text parts for convenience.
    pub output: String,
    /// Raw `content` array from the server, when present.
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_not_found: bool,
    #[serde(default)]
    pub bad_request: bool,
}

impl CallOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// One executed tool call, retained for internal audit queries only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step_id: Option<u32>,
    pub server: String,
    pub tool: String,
    pub args: Value,
    pub success: bool,
    pub output_preview: String,
    pub timestamp: DateTime<Utc>,
}

/// In-memory execution trace. The auditor queries it when evidence tools
/// misbehave; it is never reachable from LLM-driven callers.
#[derive(Default)]
pub struct ExecutionLog {
    records: std::sync::Mutex<Vec<ExecutionRecord>>,
}

impl ExecutionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, record: ExecutionRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    /// Most recent records, newest first, optionally filtered by step.
    pub fn recent(&self, step_id: Option<u32>, limit: usize) -> Vec<ExecutionRecord> {
        let Ok(records) = self.records.lock() else {
            return Vec::new();
        };
        records
            .iter()
            .rev()
            .filter(|r| step_id.is_none() || r.step_id == step_id)
            .take(limit)
            .cloned()
            .collect()
    }
}

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct Session {
    name: String,
    outbound: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
    io_tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Wire a session over arbitrary streams. Production connects child
    /// stdio; tests connect an in-memory duplex.
    pub fn start_io<R, W>(name: &str, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = outbound_rx.recv().await {
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
            // Dropping the writer closes the server's stdin.
        });

        let pending_for_reader = pending.clone();
        let reader_name = name.to_string();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let value: Value = match serde_json::from_str(line) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::debug!(server = %reader_name, error = %e, "Skipping non-JSON line");
                                continue;
                            }
                        };
                        // Lines without an id are notifications; nobody awaits them.
                        let Some(id) = value.get("id").and_then(Value::as_u64) else {
                            continue;
                        };
                        let sender = pending_for_reader
                            .lock()
                            .ok()
                            .and_then(|mut p| p.remove(&id));
                        if let Some(sender) = sender {
                            let _ = sender.send(value);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Stream closed: outstanding requests will never be answered.
            if let Ok(mut p) = pending_for_reader.lock() {
                p.clear();
            }
            tracing::debug!(server = %reader_name, "Reader task finished");
        });

        Arc::new(Self {
            name: name.to_string(),
            outbound: outbound_tx,
            pending,
            next_id: AtomicU64::new(0),
            child: Mutex::new(None),
            io_tasks: vec![writer_task, reader_task],
        })
    }

    async fn attach_child(&self, child: Child) {
        *self.child.lock().await = Some(child);
    }

    /// Send a request and await its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: std::time::Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(id, tx);
        }

        if self.outbound.send(frame).await.is_err() {
            if let Ok(mut p) = self.pending.lock() {
                p.remove(&id);
            }
            anyhow::bail!("Server '{}' connection closed", self.name);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => anyhow::bail!("Server '{}' dropped the request", self.name),
            Err(_) => {
                if let Ok(mut p) = self.pending.lock() {
                    p.remove(&id);
                }
                anyhow::bail!("timeout waiting for '{}' after {:?}", method, timeout)
            }
        }
    }

    /// Fire-and-forget notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("Server '{}' connection closed", self.name))
    }

    pub async fn handshake(&self) -> Result<()> {
        let timeout = std::time::Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "triad", "version": env!("CARGO_PKG_VERSION")},
            }),
            timeout,
        )
        .await
        .with_context(|| format!("initialize failed for '{}'", self.name))?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    async fn teardown(&self, grace: std::time::Duration) {
        for task in &self.io_tasks {
            task.abort();
        }
        if let Ok(mut p) = self.pending.lock() {
            p.clear();
        }
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
    }
}

pub struct ServerManager {
    configs: HashMap<String, McpServerConfig>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    project_root: PathBuf,
    secret_env: Vec<String>,
    settings: DispatchSettings,
}

impl ServerManager {
    pub fn new(
        configs: HashMap<String, McpServerConfig>,
        project_root: &Path,
        secret_env: Vec<String>,
        settings: DispatchSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            configs,
            sessions: RwLock::new(HashMap::new()),
            project_root: project_root.to_path_buf(),
            secret_env,
            settings,
        })
    }

    pub fn is_disabled(&self, server: &str) -> bool {
        self.configs.get(server).map(|c| c.disabled).unwrap_or(false)
    }

    pub fn is_internal(&self, server: &str) -> bool {
        self.configs
            .get(server)
            .map(|c| c.transport == McpTransport::Internal)
            .unwrap_or(false)
    }

    pub fn known_server(&self, server: &str) -> bool {
        self.configs.contains_key(server)
    }

    fn timeout_for(&self, tool: &str) -> std::time::Duration {
        let secs = if let Some(over) = self.settings.tool_timeouts.get(tool) {
            *over
        } else if tool.starts_with("vibe_") {
            self.settings.vibe_timeout_secs
        } else {
            self.settings.tool_timeout_secs
        };
        std::time::Duration::from_secs(secs)
    }

    /// Idempotent session accessor; spawns the server on first use.
    pub async fn get_session(&self, server: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.read().await.get(server) {
            return Ok(session.clone());
        }

        let config = self
            .configs
            .get(server)
            .ok_or_else(|| anyhow::anyhow!("Unknown server '{server}'"))?;
        if config.disabled {
            anyhow::bail!("Server '{server}' is disabled");
        }
        if config.transport == McpTransport::Internal {
            anyhow::bail!("Server '{server}' is internal and has no session");
        }

        let mut sessions = self.sessions.write().await;
        // Re-check: another caller may have connected while we waited.
        if let Some(session) = sessions.get(server) {
            return Ok(session.clone());
        }

        let session = self.spawn_session(server, config).await?;
        sessions.insert(server.to_string(), session.clone());
        Ok(session)
    }

    async fn spawn_session(&self, name: &str, config: &McpServerConfig) -> Result<Arc<Session>> {
        let expanded = expand_server_config(config, &self.project_root, &self.secret_env);
        let mut command = tokio::process::Command::new(&expanded.command);
        command
            .args(&expanded.args)
            .envs(&expanded.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn server '{name}' ({})", expanded.command))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("No stdin for server '{name}'"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("No stdout for server '{name}'"))?;

        let session = Session::start_io(name, stdout, stdin);
        session.attach_child(child).await;
        session.handshake().await?;
        tracing::info!(server = %name, "Tool server connected");
        Ok(session)
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>> {
        let session = self.get_session(server).await?;
        let response = session
            .request(
                "tools/list",
                json!({}),
                std::time::Duration::from_secs(self.settings.tool_timeout_secs),
            )
            .await?;
        let tools = response["result"]["tools"].clone();
        serde_json::from_value(tools).context("Malformed tools/list response")
    }

    /// Invoke a tool and normalize the result. Spawn and transport failures
    /// become failed outcomes so the dispatcher can decide what happens next.
    pub async fn call_tool(&self, server: &str, tool: &str, args: Value) -> CallOutcome {
        if self.is_disabled(server) {
            return CallOutcome::error(format!("Server '{server}' is disabled"));
        }
        let session = match self.get_session(server).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "Session unavailable");
                let mut outcome = CallOutcome::error(format!("Server '{server}' unavailable: {e}"));
                outcome.tool_not_found = true;
                return outcome;
            }
        };

        let response = session
            .request(
                "tools/call",
                json!({"name": tool, "arguments": args}),
                self.timeout_for(tool),
            )
            .await;

        match response {
            Ok(value) => normalize_response(server, tool, &value),
            Err(e) => CallOutcome::error(e.to_string()),
        }
    }

    /// Kill and respawn a server. Outstanding request ids are invalidated.
    pub async fn restart_server(&self, server: &str) -> bool {
        let existing = self.sessions.write().await.remove(server);
        if let Some(session) = existing {
            session.teardown(std::time::Duration::from_secs(1)).await;
        }
        match self.get_session(server).await {
            Ok(_) => {
                tracing::info!(server = %server, "Server restarted");
                true
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "Restart failed");
                false
            }
        }
    }

    pub async fn ensure_servers_connected(&self, servers: &[String]) -> HashMap<String, bool> {
        let mut status = HashMap::new();
        for server in servers {
            if self.is_internal(server) || self.is_disabled(server) {
                status.insert(server.clone(), self.is_internal(server));
                continue;
            }
            let connected = self.get_session(server).await.is_ok();
            status.insert(server.clone(), connected);
        }
        status
    }

    /// Close stdin, give each server a grace period, then kill.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (name, session) in sessions.drain() {
            tracing::debug!(server = %name, "Shutting down server");
            session
                .teardown(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS))
                .await;
        }
    }

}

/// Derive a `CallOutcome` from a raw JSON-RPC response.
pub fn normalize_response(server: &str, tool: &str, response: &Value) -> CallOutcome {
    if let Some(error) = response.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error");
        let code = error["code"].as_i64().unwrap_or(0);
        let lower = message.to_lowercase();
        let mut outcome = CallOutcome::error(format!("{message} (server '{server}')"));
        if lower.contains("not found") || code == -32602 {
            outcome.tool_not_found = true;
            outcome.error = Some(format!(
                "{message}. Tool '{tool}' may not exist on server '{server}'."
            ));
        } else if lower.contains("bad request") || lower.contains("400") {
            outcome.bad_request = true;
        }
        return outcome;
    }

    let result = &response["result"];
    let is_error = result["isError"].as_bool().unwrap_or(false);
    let mut output = String::new();
    if let Some(parts) = result["content"].as_array() {
        for part in parts {
            if part["type"] == "text" {
                if let Some(text) = part["text"].as_str() {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(text);
                }
            }
        }
    } else if let Some(text) = result.as_str() {
        output = text.to_string();
    }

    CallOutcome {
        success: !is_error,
        error: if is_error && !output.is_empty() {
            Some(output.clone())
        } else if is_error {
            Some("tool returned an error with no content".to_string())
        } else {
            None
        },
        content: result["content"].clone(),
        output,
        tool_not_found: false,
        bad_request: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    /// Scripted JSON-RPC server speaking over an in-memory duplex.
    fn spawn_fake_server(
        reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
        mut writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
        silent_on: Option<&'static str>,
    ) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let value: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let method = value["method"].as_str().unwrap_or("");
                let Some(id) = value["id"].as_u64() else {
                    continue; // notification
                };
                if Some(method) == silent_on {
                    continue;
                }
                let response = match method {
                    "initialize" => json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {"protocolVersion": PROTOCOL_VERSION, "capabilities": {}}
                    }),
                    "tools/list" => json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {"tools": [
                            {"name": "echo", "description": "echoes", "inputSchema": {}}
                        ]}
                    }),
                    "tools/call" => {
                        // Interleave a notification before the response; the
                        // client must skip it.
                        let notification = json!({
                            "jsonrpc": "2.0", "method": "notifications/progress",
                            "params": {"progress": 50}
                        });
                        let _ = writer
                            .write_all(format!("{notification}\n").as_bytes())
                            .await;
                        let text = value["params"]["arguments"]["text"]
                            .as_str()
                            .unwrap_or("")
                            .to_string();
                        json!({
                            "jsonrpc": "2.0", "id": id,
                            "result": {"content": [{"type": "text", "text": text}], "isError": false}
                        })
                    }
                    _ => json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": -32601, "message": "method not found"}
                    }),
                };
                let _ = writer.write_all(format!("{response}\n").as_bytes()).await;
            }
        });
    }

    fn connect_fake(silent_on: Option<&'static str>) -> Arc<Session> {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);
        spawn_fake_server(server_read, server_write, silent_on);
        Session::start_io("fake", client_read, client_write)
    }

    #[tokio::test]
    async fn test_handshake_and_call() {
        let session = connect_fake(None);
        session.handshake().await.unwrap();

        let response = session
            .request(
                "tools/call",
                json!({"name": "echo", "arguments": {"text": "hello"}}),
                std::time::Duration::from_secs(2),
            )
            .await
            .unwrap();
        let outcome = normalize_response("fake", "echo", &response);
        assert!(outcome.success);
        assert_eq!(outcome.output, "hello");
    }

    #[tokio::test]
    async fn test_request_ids_are_monotonic() {
        let session = connect_fake(None);
        session.handshake().await.unwrap();
        let before = session.next_id.load(Ordering::SeqCst);
        let _ = session
            .request("tools/list", json!({}), std::time::Duration::from_secs(2))
            .await
            .unwrap();
        let after = session.next_id.load(Ordering::SeqCst);
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_concurrent_requests_multiplex() {
        let session = connect_fake(None);
        session.handshake().await.unwrap();

        let a = session.request(
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "one"}}),
            std::time::Duration::from_secs(2),
        );
        let b = session.request(
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "two"}}),
            std::time::Duration::from_secs(2),
        );
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(
            normalize_response("fake", "echo", &ra.unwrap()).output,
            "one"
        );
        assert_eq!(
            normalize_response("fake", "echo", &rb.unwrap()).output,
            "two"
        );
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_error() {
        let session = connect_fake(Some("tools/call"));
        session.handshake().await.unwrap();
        let err = session
            .request(
                "tools/call",
                json!({"name": "echo", "arguments": {}}),
                std::time::Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_normalize_error_tags() {
        let not_found = json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32602, "message": "tool not found"}
        });
        let outcome = normalize_response("srv", "ghost", &not_found);
        assert!(!outcome.success);
        assert!(outcome.tool_not_found);

        let bad = json!({
            "jsonrpc": "2.0", "id": 2,
            "error": {"code": -32600, "message": "Bad Request: wrong shape"}
        });
        let outcome = normalize_response("srv", "echo", &bad);
        assert!(outcome.bad_request);
    }

    #[test]
    fn test_normalize_is_error_result() {
        let response = json!({
            "jsonrpc": "2.0", "id": 3,
            "result": {"content": [{"type": "text", "text": "boom"}], "isError": true}
        });
        let outcome = normalize_response("srv", "echo", &response);
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_execution_log_is_filtered_by_step() {
        let log = ExecutionLog::new();
        for step in [1u32, 1, 2] {
            log.record(ExecutionRecord {
                step_id: Some(step),
                server: "macos-use".to_string(),
                tool: "execute_command".to_string(),
                args: json!({"command": "ls"}),
                success: true,
                output_preview: String::new(),
                timestamp: Utc::now(),
            });
        }
        assert_eq!(log.recent(Some(1), 10).len(), 2);
        assert_eq!(log.recent(None, 10).len(), 3);
    }
}
