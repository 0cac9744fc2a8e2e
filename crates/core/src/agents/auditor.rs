//! The Auditor: verifies plans before execution and every step after it.
//!
//! Step verification is three-phase: decide what to verify and with which
//! tools, gather evidence through the dispatcher, then form a verdict from
//! structured deliberation. A hard command-relevance invariant runs before
//! any success verdict is allowed out.

use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};

use triad_config::{LanguageConfig, SecurityConfig};
use triad_provider::{extract_json, ChatRequest, LlmClient, LlmTier, Message};

use crate::agents::{is_data_intensive, is_repetitive_thinking, sequential_thinking, truncate_output};
use crate::bus::{AgentBus, AgentId, BusMessage, BusPayload};
use crate::dispatch::ToolDispatcher;
use crate::mcp::ExecutionLog;
use crate::plan::{PlanStep, StepResult, TaskPlan, VerificationResult};
use crate::reports::ReportWriter;
use crate::voice::standardize_voice_actions;

/// Destructive shell patterns that short-circuit every security check.
const BLOCKLIST: &[&str] = &[
    "rm -rf /",
    "mkfs",
    "dd if=",
    ":(){:|:&};:",
    "chmod 777 /",
    "chown root:root /",
    "> /dev/sda",
    "mv / /dev/null",
];

const MAX_EVIDENCE_TOOLS: usize = 4;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SecurityVerdict {
    pub safe: bool,
    pub risk_level: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct EvidenceResult {
    server: String,
    tool: String,
    args: Value,
    output: String,
    error: bool,
}

pub struct Auditor {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<ToolDispatcher>,
    bus: AgentBus,
    reports: ReportWriter,
    exec_log: Arc<ExecutionLog>,
    security: SecurityConfig,
    language: LanguageConfig,
}

impl Auditor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<ToolDispatcher>,
        bus: AgentBus,
        reports: ReportWriter,
        exec_log: Arc<ExecutionLog>,
        security: SecurityConfig,
        language: LanguageConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            llm,
            dispatcher,
            bus,
            reports,
            exec_log,
            security,
            language,
        })
    }

    /// Simulate a whole plan before execution. With `fix_if_rejected` a
    /// rejection triggers an extra pass that may produce a repaired plan.
    pub async fn verify_plan(
        &self,
        plan: &TaskPlan,
        user_request: &str,
        fix_if_rejected: bool,
    ) -> VerificationResult {
        let steps_text = format_plan_steps(plan);
        let prompt = format!(
            "Simulate this plan against the user's goal. Find discovery gaps, wrong \
             realms, ordering problems and missing steps. Structure the answer with \
             sections:\nVERDICT: APPROVED or REJECTED\nCORE PROBLEMS:\n- ...\n\
             STRATEGIC GAP ANALYSIS:\n...\nFEEDBACK:\n...\nSUMMARY:\n...\n\n\
             USER REQUEST: {user_request}\nGOAL: {}\nSTEPS:\n{steps_text}",
            plan.goal
        );

        let mut analysis = sequential_thinking(&self.dispatcher, &prompt, 6).await;
        if analysis.is_empty() {
            // Engine down: deliberate through the plain LLM instead.
            analysis = self
                .llm
                .chat(&ChatRequest::new(
                    LlmTier::Deep,
                    vec![Message::user(prompt.clone())],
                ))
                .await
                .map(|r| r.content)
                .unwrap_or_default();
        }
        if analysis.is_empty() {
            return VerificationResult {
                step_id: 0,
                verified: true,
                confidence: 0.5,
                description: "Verification engine unavailable, plan passed through".to_string(),
                issues: vec!["verification engine unavailable".to_string()],
                voice_message: "Не можу перевірити план, діємо обережно.".to_string(),
                fixed_plan: None,
                screenshot_analyzed: false,
            };
        }

        let sections = parse_simulation_sections(&analysis);
        let mut verified = sections.verdict_approved;
        let mut issues = compress_cascading_issues(sections.issues);

        // Creator override: a purely policy-based rejection is inverted when
        // the request invokes a configured authority phrase.
        if !verified
            && self.creator_invoked(user_request)
            && !issues_contain_technical_blockers(&issues)
        {
            tracing::info!("Creator override: inverting policy-based rejection");
            verified = true;
            issues.push("approved by creator override".to_string());
        }

        let mut fixed_plan = None;
        if !verified && fix_if_rejected {
            fixed_plan = self.attempt_plan_fix(user_request, &steps_text, &analysis).await;
        }

        VerificationResult {
            step_id: 0,
            verified,
            confidence: if verified { 0.85 } else { 0.3 },
            description: if sections.feedback.is_empty() {
                truncate_output(&analysis, 1500)
            } else {
                sections.feedback
            },
            issues,
            voice_message: if verified {
                "План схвалено, починаємо.".to_string()
            } else {
                "План відхилено, потрібні зміни.".to_string()
            },
            fixed_plan,
            screenshot_analyzed: false,
        }
    }

    fn creator_invoked(&self, user_request: &str) -> bool {
        let lower = user_request.to_lowercase();
        self.security
            .creator_trigger_phrases
            .iter()
            .any(|phrase| lower.contains(&phrase.to_lowercase()))
    }

    /// "Architecture override": ask the deliberation engine for a corrected
    /// plan and parse it out of the raw final thought.
    async fn attempt_plan_fix(
        &self,
        user_request: &str,
        failed_plan: &str,
        audit_feedback: &str,
    ) -> Option<TaskPlan> {
        let prompt = format!(
            "The plan below was rejected. Produce a corrected plan as JSON only: \
             {{\"goal\": \"...\", \"steps\": [{{\"id\": 1, \"action\": \"...\", \
             \"voice_action\": \"...\", \"expected_result\": \"...\", \"realm\": \"...\"}}]}}\n\n\
             USER REQUEST: {user_request}\nREJECTED PLAN:\n{failed_plan}\n\
             AUDIT FEEDBACK:\n{}",
            truncate_output(audit_feedback, 2000)
        );
        let raw = sequential_thinking(&self.dispatcher, &prompt, 5).await;
        let value = parse_fixed_plan_json(&raw)?;

        let goal = value["goal"].as_str().unwrap_or(user_request).to_string();
        let mut steps: Vec<PlanStep> = value["steps"]
            .as_array()?
            .iter()
            .filter_map(|s| serde_json::from_value(s.clone()).ok())
            .collect();
        if steps.is_empty() {
            return None;
        }
        for (i, step) in steps.iter_mut().enumerate() {
            if step.id == 0 {
                step.id = i as u32 + 1;
            }
        }
        standardize_voice_actions(&mut steps, self.language.non_latin_script);
        tracing::info!(steps = steps.len(), "Architecture override produced a fixed plan");
        Some(TaskPlan::new(goal, steps))
    }

    /// Three-phase step verification plus the command-relevance invariant.
    pub async fn verify_step(
        &self,
        step: &PlanStep,
        result: &StepResult,
        goal: &str,
    ) -> VerificationResult {
        // Phase 1: what should be verified, and with which tools?
        let analysis_prompt = format!(
            "A step was executed; decide how to verify it independently. Select 1 to \
             {MAX_EVIDENCE_TOOLS} evidence-gathering tool calls. Reply ending with JSON: \
             {{\"purpose\": \"...\", \"tools\": [{{\"server\": \"...\", \"tool\": \"...\", \
             \"args\": {{}}}}]}}\n\nGOAL: {goal}\nSTEP: {}\nEXPECTED: {}\n\
             REPORTED RESULT: {}",
            step.action,
            step.expected_result,
            truncate_output(&result.result, 800)
        );
        let analysis = sequential_thinking(&self.dispatcher, &analysis_prompt, 4).await;

        // Anti-loop: a spinning engine gets no tools, only the execution log.
        if is_repetitive_thinking(&analysis) {
            tracing::warn!(step = step.id, "Repetitive analysis, auditing via execution record");
            return self.finalize(step, self.verdict_from_execution_log(step), true).await;
        }

        let tools = extract_evidence_tools(&analysis);
        if tools.is_empty() {
            return self.finalize(step, self.verdict_from_execution_log(step), true).await;
        }

        // Phase 2: gather evidence.
        let mut evidence = Vec::new();
        for (server, tool, args) in tools {
            let dispatched = self
                .dispatcher
                .resolve_and_dispatch(Some(&tool), args.clone(), Some(&server))
                .await;
            let empty_data = dispatched.success
                && dispatched.output.trim().is_empty()
                && is_data_intensive(&tool);
            evidence.push(EvidenceResult {
                server,
                tool,
                args,
                output: truncate_output(&dispatched.output, 1000),
                error: !dispatched.success || empty_data,
            });
        }

        // Phase 3: verdict formation.
        let evidence_text = evidence
            .iter()
            .map(|e| {
                format!(
                    "- {}.{} args={} error={} output: {}",
                    e.server, e.tool, e.args, e.error, e.output
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let verdict_prompt = format!(
            "Form a verification verdict from the evidence. Answer with:\n\
             VERDICT: CONFIRMED or FAILED\nCONFIDENCE: 0..1\nREASONING: ...\nISSUES:\n- ...\n\n\
             STEP: {}\nEXPECTED: {}\nEVIDENCE:\n{evidence_text}",
            step.action, step.expected_result
        );
        let verdict_text = sequential_thinking(&self.dispatcher, &verdict_prompt, 4).await;

        let mut verdict = if verdict_text.is_empty() {
            fallback_verdict(&evidence)
        } else {
            parse_verdict_analysis(&verdict_text)
        };

        // Hard invariant: a success verdict must be backed by commands that
        // could actually observe the expected result.
        if verdict.verified {
            let commands = extract_executed_commands(&evidence);
            let (relevant, reason) =
                check_command_relevance(&step.action, &step.expected_result, &commands);
            if !relevant {
                tracing::warn!(step = step.id, reason = %reason, "Demoting verdict: irrelevant commands");
                verdict.verified = false;
                verdict.confidence = verdict.confidence.min(0.3);
                verdict.issues.push(reason);
            }
        }

        self.finalize(step, verdict, false).await
    }

    /// Verdict from the internal execution record, used when evidence tools
    /// are unavailable or the analysis engine is looping.
    fn verdict_from_execution_log(&self, step: &PlanStep) -> VerdictAnalysis {
        let records = self.exec_log.recent(Some(step.id), 10);
        let verified = !records.is_empty()
            && records.iter().all(|r| r.success)
            && records
                .iter()
                .any(|r| !r.output_preview.trim().is_empty() || !is_data_intensive(&r.tool));
        VerdictAnalysis {
            verified,
            confidence: if verified { 0.6 } else { 0.3 },
            reasoning: format!(
                "Audit via execution record only: {} call(s) on file",
                records.len()
            ),
            issues: if verified {
                vec![]
            } else {
                vec!["no successful execution evidence on record".to_string()]
            },
        }
    }

    async fn finalize(
        &self,
        step: &PlanStep,
        verdict: VerdictAnalysis,
        record_audit: bool,
    ) -> VerificationResult {
        let verification = VerificationResult {
            step_id: step.id,
            verified: verdict.verified,
            confidence: verdict.confidence,
            description: verdict.reasoning,
            issues: verdict.issues,
            voice_message: if verdict.verified {
                "Крок підтверджено.".to_string()
            } else {
                "Крок не підтверджено, повертаю на доопрацювання.".to_string()
            },
            fixed_plan: None,
            screenshot_analyzed: false,
        };

        if !verification.verified {
            // Persist the rejection twice and notify the executor. The bus
            // message must land before the next attempt reads its inbox.
            let summary = ReportWriter::format_summary(step, &verification);
            if let Err(e) = self.reports.write_rejection(step, &verification) {
                tracing::warn!(error = %e, "Failed to write rejection report");
            }
            let graph = self
                .dispatcher
                .resolve_and_dispatch(
                    Some("add_observation"),
                    json!({"entity": format!("step_{}", step.id), "observation": summary}),
                    Some("graph"),
                )
                .await;
            if !graph.success {
                tracing::debug!("Knowledge-graph write skipped");
            }
            self.bus.send(
                AgentId::Executor,
                BusMessage::new(
                    AgentId::Auditor,
                    BusPayload::Rejection {
                        step_id: step.id,
                        report: ReportWriter::format_summary(step, &verification),
                        issues: verification.issues.clone(),
                    },
                ),
            );
        }

        if record_audit {
            tracing::info!(step = step.id, verified = verification.verified, "Record-only audit");
        }
        verification
    }

    /// Quick audit of a code-assistant self-heal proposal.
    pub async fn audit_vibe_fix(&self, fix_description: &str, step: &PlanStep) -> bool {
        let system = "A self-heal fix is proposed for a failing step. Approve only if it \
                      addresses the failure without side effects. Reply with JSON: \
                      {\"approved\": bool, \"reason\": \"\"}";
        let prompt = format!("STEP: {}\nPROPOSED FIX:\n{fix_description}", step.action);
        let reply = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Standard,
                vec![Message::system(system.to_string()), Message::user(prompt)],
            ))
            .await;
        reply
            .ok()
            .and_then(|r| extract_json(&r.content))
            .and_then(|v| v["approved"].as_bool())
            .unwrap_or(false)
    }

    /// Destructive-shell screening. The blocklist short-circuits with no LLM
    /// involvement at all.
    pub fn security_check(&self, action: &Value) -> SecurityVerdict {
        let mut haystack = String::new();
        if let Some(command) = action["args"]["command"].as_str() {
            haystack.push_str(command);
        }
        if let Some(command) = action["command"].as_str() {
            haystack.push(' ');
            haystack.push_str(command);
        }
        if let Some(text) = action["action"].as_str() {
            haystack.push(' ');
            haystack.push_str(text);
        }

        for pattern in BLOCKLIST
            .iter()
            .map(|p| p.to_string())
            .chain(self.security.dangerous_commands.iter().cloned())
        {
            if haystack.contains(&pattern) {
                return SecurityVerdict {
                    safe: false,
                    risk_level: "critical".to_string(),
                    reason: format!("destructive pattern blocked: {pattern}"),
                };
            }
        }
        SecurityVerdict {
            safe: true,
            risk_level: "low".to_string(),
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerdictAnalysis {
    pub verified: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub issues: Vec<String>,
}

struct PlanSimulation {
    verdict_approved: bool,
    issues: Vec<String>,
    feedback: String,
}

fn format_plan_steps(plan: &TaskPlan) -> String {
    plan.steps
        .iter()
        .map(|s| {
            format!(
                "{}. [{}] {} -> expected: {}",
                s.id, s.realm, s.action, s.expected_result
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_simulation_sections(analysis: &str) -> PlanSimulation {
    let upper = analysis.to_uppercase();
    let verdict_approved = {
        let re = Regex::new(r"(?i)VERDICT[:\s]*(APPROVED|REJECTED|CONFIRMED|FAILED)")
            .expect("static regex");
        match re.captures(analysis) {
            Some(capture) => {
                let word = capture[1].to_uppercase();
                word == "APPROVED" || word == "CONFIRMED"
            }
            // No explicit verdict: look for strong rejection words up top.
            None => !upper.contains("REJECTED") && !upper.contains("CRITICAL FLAW"),
        }
    };

    let issues = extract_section(analysis, "CORE PROBLEMS")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.trim_start_matches(['-', '*', ' ']).to_string())
        .filter(|l| !l.is_empty() && l != "None")
        .collect();

    PlanSimulation {
        verdict_approved,
        issues,
        feedback: extract_section(analysis, "FEEDBACK").trim().to_string(),
    }
}

/// Text between `HEADER:` and the next ALL-CAPS header (or end).
fn extract_section(text: &str, header: &str) -> String {
    let upper = text.to_uppercase();
    let Some(start) = upper.find(&format!("{header}:")) else {
        return String::new();
    };
    let body_start = start + header.len() + 1;
    let rest = &text[body_start..];
    let headers = [
        "VERDICT:",
        "CORE PROBLEMS:",
        "STRATEGIC GAP ANALYSIS:",
        "FEEDBACK:",
        "SUMMARY:",
        "REASONING:",
        "ISSUES:",
        "CONFIDENCE:",
    ];
    let mut end = rest.len();
    let rest_upper = rest.to_uppercase();
    for other in headers {
        if other.trim_end_matches(':') == header {
            continue;
        }
        if let Some(position) = rest_upper.find(other) {
            end = end.min(position);
        }
    }
    rest[..end].to_string()
}

/// Three or more issues describing downstream blockage collapse into one.
fn compress_cascading_issues(issues: Vec<String>) -> Vec<String> {
    let is_cascade = |issue: &String| {
        let lower = issue.to_lowercase();
        lower.contains("block") || lower.contains("залеж") || lower.contains("cannot proceed")
    };
    let cascading: Vec<&String> = issues.iter().filter(|i| is_cascade(i)).collect();
    if cascading.len() < 3 {
        return issues;
    }
    let count = cascading.len();
    let mut compressed: Vec<String> = issues.into_iter().filter(|i| !is_cascade(i)).collect();
    compressed.push(format!(
        "Cascading failure: {count} downstream steps blocked by the issues above"
    ));
    compressed
}

fn issues_contain_technical_blockers(issues: &[String]) -> bool {
    const TECHNICAL_MARKERS: &[&str] = &[
        "missing", "unknown", "not found", "error", "invalid", "unreachable", "недоступ",
        "відсутн", "помилка",
    ];
    issues.iter().any(|issue| {
        let lower = issue.to_lowercase();
        TECHNICAL_MARKERS.iter().any(|m| lower.contains(m))
    })
}

/// Corrected-plan JSON out of raw deliberation output, tolerating markdown
/// fences and leading commentary lines.
fn parse_fixed_plan_json(raw: &str) -> Option<Value> {
    const SKIP_PREFIXES: &[&str] = &[
        "FIXED PLAN:",
        "CORRECTED PLAN:",
        "PLAN:",
        "Here is the corrected plan",
        "Ось виправлений план",
    ];
    let mut cleaned = raw.trim().to_string();
    for prefix in SKIP_PREFIXES {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.trim().to_string();
        }
    }
    extract_json(&cleaned).filter(|v| v["steps"].is_array())
}

fn extract_evidence_tools(analysis: &str) -> Vec<(String, String, Value)> {
    let Some(value) = extract_json(analysis) else {
        return Vec::new();
    };
    value["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let server = t["server"].as_str()?.to_string();
                    let tool = t["tool"].as_str()?.to_string();
                    let args = t.get("args").cloned().unwrap_or(json!({}));
                    Some((server, tool, args))
                })
                .take(MAX_EVIDENCE_TOOLS)
                .collect()
        })
        .unwrap_or_default()
}

/// Port of the verdict text parser: explicit verdict wins, confidence over 1
/// is a percentage, contradictory issues are filtered on success.
pub fn parse_verdict_analysis(analysis: &str) -> VerdictAnalysis {
    let verdict_re = Regex::new(
        r"(?i)(?:VERDICT|ВЕРДИКТ)[:\s]*(CONFIRMED|FAILED|ПІДТВЕРДЖЕНО|ПРОВАЛЕНО|УСПІШНО)",
    )
    .expect("static regex");

    let verified = match verdict_re.captures(analysis) {
        Some(capture) => {
            let word = capture[1].to_uppercase();
            word.contains("CONFIRMED") || word.contains("ПІДТВЕРДЖЕНО") || word.contains("УСПІШНО")
        }
        None => fallback_verdict_from_text(analysis),
    };

    let confidence_re =
        Regex::new(r"(?i)(?:CONFIDENCE|ВПЕВНЕНІСТЬ)[:\s]*([0-9]*\.?[0-9]+)\s*%?").expect("static regex");
    let mut confidence = confidence_re
        .captures(analysis)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(if verified { 0.8 } else { 0.2 });
    if confidence > 1.0 {
        confidence /= 100.0;
    }

    let reasoning = {
        let section = extract_section(analysis, "REASONING");
        if section.trim().is_empty() {
            truncate_output(analysis, 600)
        } else {
            section.trim().to_string()
        }
    };

    let mut issues: Vec<String> = extract_section(analysis, "ISSUES")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.trim_start_matches(['-', '*', ' ']).to_string())
        .filter(|l| !l.is_empty() && l != "None" && l != "Не виявлено")
        .collect();

    if verified {
        issues.retain(|issue| {
            const CONTRADICTING: &[&str] =
                &["НЕ ВИКОНАНО", "ПОМИЛКА", "ПРОВАЛЕНО", "НЕМАЄ", "ВІДСУТНІЙ"];
            let upper = issue.to_uppercase();
            !CONTRADICTING.iter().any(|phrase| upper.contains(phrase))
        });
    }
    if !verified && issues.is_empty() {
        issues.push("Verification criteria not met".to_string());
    }

    VerdictAnalysis {
        verified,
        confidence,
        reasoning,
        issues,
    }
}

fn fallback_verdict_from_text(analysis: &str) -> bool {
    let upper = analysis.to_uppercase();
    let header = upper
        .split("REASONING")
        .next()
        .unwrap_or(&upper)
        .to_string();
    const SUCCESS_WORDS: &[&str] = &["CONFIRMED", "SUCCESS", "VERIFIED", "ПІДТВЕРДЖЕНО", "УСПІШНО"];
    const FAILURE_WORDS: &[&str] = &["FAILED", "ERROR", "ПРОВАЛЕНО", "ПОМИЛКА", "НЕ ВИКОНАНО"];
    let has_success = SUCCESS_WORDS.iter().any(|w| header.contains(w));
    let has_failure = FAILURE_WORDS.iter().any(|w| header.contains(w));
    if has_success && !has_failure {
        return true;
    }
    if has_failure {
        return false;
    }
    false
}

fn fallback_verdict(evidence: &[EvidenceResult]) -> VerdictAnalysis {
    let all_ok = !evidence.is_empty() && evidence.iter().all(|e| !e.error);
    VerdictAnalysis {
        verified: all_ok,
        confidence: if all_ok { 0.6 } else { 0.3 },
        reasoning: "Verdict derived from raw evidence results".to_string(),
        issues: if all_ok {
            vec![]
        } else {
            vec!["evidence gathering reported errors".to_string()]
        },
    }
}

fn extract_executed_commands(evidence: &[EvidenceResult]) -> Vec<String> {
    evidence
        .iter()
        .filter(|e| e.tool.contains("execute_command"))
        .filter_map(|e| e.args["command"].as_str().map(str::to_string))
        .collect()
}

/// Were the executed commands capable of observing the expected result?
/// Returns (relevant, reason). Only recognized expectation families demote.
pub fn check_command_relevance(
    step_action: &str,
    expected_result: &str,
    commands: &[String],
) -> (bool, String) {
    if commands.is_empty() {
        return (true, "no commands to check".to_string());
    }
    let expected = expected_result.to_lowercase();
    let step = step_action.to_lowercase();

    // Network-mode expectations need commands that can actually show the
    // adapter state; listing VMs proves nothing.
    if expected.contains("bridged") || expected.contains("network mode") {
        const RELEVANT: &[&str] = &[
            "showvminfo",
            "getextradata",
            "modifyvm",
            "ip a",
            "ifconfig",
            "netstat",
        ];
        for command in commands {
            let lower = command.to_lowercase();
            if RELEVANT.iter().any(|kw| lower.contains(kw)) {
                return (true, format!("command '{command}' inspects network state"));
            }
        }
        return (
            false,
            "irrelevant command: missing `VBoxManage showvminfo`/`ip a` for network verification"
                .to_string(),
        );
    }

    if expected.contains("ip") || expected.contains("network") {
        for command in commands {
            let lower = command.to_lowercase();
            if ["ip a", "ifconfig", "ping", "netstat", "nmap"]
                .iter()
                .any(|kw| lower.contains(kw))
            {
                return (true, format!("command '{command}' verifies the network"));
            }
        }
    }

    if ["search", "find", "locate", "read", "check"]
        .iter()
        .any(|kw| step.contains(kw))
    {
        for command in commands {
            let lower = command.to_lowercase();
            if ["grep", "find", "ls", "cat", "read", "list"]
                .iter()
                .any(|kw| lower.contains(kw))
            {
                return (true, format!("command '{command}' performs discovery"));
            }
        }
    }

    if ["url", "api", "web", "http"].iter().any(|kw| expected.contains(kw)) {
        for command in commands {
            let lower = command.to_lowercase();
            if ["curl", "wget", "fetch", "http"].iter().any(|kw| lower.contains(kw)) {
                return (true, format!("command '{command}' talks to the web"));
            }
        }
    }

    (true, "command relevance assumed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MapState, SharedContext};
    use crate::dispatch::{ToolTransport, ToolDispatcher};
    use crate::mcp::{CallOutcome, ExecutionRecord};
    use crate::registry::SchemaRegistry;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use triad_provider::{ChatResponse, Usage};

    struct SilentLlm;

    #[async_trait]
    impl LlmClient for SilentLlm {
        fn name(&self) -> &str {
            "silent"
        }

        fn model_name(&self, _tier: LlmTier) -> String {
            "silent".to_string()
        }

        async fn chat(&self, _request: &ChatRequest) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                content: "{}".to_string(),
                model: "silent".to_string(),
                usage: Usage::default(),
            })
        }
    }

    /// Pops scripted sequential-thinking replies in order; other tools get
    /// fixed outputs.
    struct ScriptedTransport {
        thinking_replies: Mutex<Vec<String>>,
        tool_output: &'static str,
    }

    #[async_trait]
    impl ToolTransport for ScriptedTransport {
        async fn call(&self, _server: &str, tool: &str, _args: Value) -> CallOutcome {
            if tool == "sequentialthinking" {
                let reply = self
                    .thinking_replies
                    .lock()
                    .unwrap()
                    .pop()
                    .unwrap_or_default();
                return CallOutcome {
                    success: !reply.is_empty(),
                    output: reply,
                    ..Default::default()
                };
            }
            CallOutcome {
                success: true,
                output: self.tool_output.to_string(),
                ..Default::default()
            }
        }

        fn is_internal(&self, _server: &str) -> bool {
            false
        }
    }

    fn auditor_with(
        transport: Arc<dyn ToolTransport>,
        reports_dir: &std::path::Path,
    ) -> (Arc<Auditor>, AgentBus, Arc<ExecutionLog>) {
        let bus = AgentBus::new();
        let exec_log = ExecutionLog::new();
        let dispatcher = ToolDispatcher::new(
            transport,
            Arc::new(SchemaRegistry::embedded()),
            MapState::new(),
            SharedContext::new(),
        );
        let auditor = Auditor::new(
            Arc::new(SilentLlm),
            dispatcher,
            bus.clone(),
            ReportWriter::new(reports_dir),
            exec_log.clone(),
            SecurityConfig::default(),
            LanguageConfig::default(),
        );
        (auditor, bus, exec_log)
    }

    #[test]
    fn test_parse_verdict_confirmed() {
        let verdict = parse_verdict_analysis(
            "VERDICT: CONFIRMED\nCONFIDENCE: 0.9\nREASONING: file exists\nISSUES:\nNone",
        );
        assert!(verdict.verified);
        assert!((verdict.confidence - 0.9).abs() < f64::EPSILON);
        assert!(verdict.issues.is_empty());
    }

    #[test]
    fn test_parse_verdict_percentage_confidence() {
        let verdict = parse_verdict_analysis("VERDICT: FAILED\nCONFIDENCE: 85%\nREASONING: nope");
        assert!(!verdict.verified);
        assert!((verdict.confidence - 0.85).abs() < 1e-9);
        assert_eq!(verdict.issues, vec!["Verification criteria not met"]);
    }

    #[test]
    fn test_parse_verdict_ukrainian() {
        let verdict = parse_verdict_analysis("ВЕРДИКТ: ПІДТВЕРДЖЕНО\nВПЕВНЕНІСТЬ: 75");
        assert!(verdict.verified);
        assert!((verdict.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_contradictory_issues_filtered_on_success() {
        let verdict = parse_verdict_analysis(
            "VERDICT: CONFIRMED\nCONFIDENCE: 0.8\nISSUES:\n- Крок НЕ ВИКОНАНО повністю\n- minor cosmetic warning",
        );
        assert!(verdict.verified);
        assert_eq!(verdict.issues, vec!["minor cosmetic warning"]);
    }

    #[test]
    fn test_fallback_verdict_from_header_words() {
        let verdict = parse_verdict_analysis(&format!(
            "The check was a SUCCESS overall.\n{}",
            "details ".repeat(30)
        ));
        assert!(verdict.verified);

        let verdict = parse_verdict_analysis("Everything FAILED badly");
        assert!(!verdict.verified);
    }

    #[test]
    fn test_cascading_issue_compression() {
        let issues = vec![
            "step 2 is blocked by step 1".to_string(),
            "step 3 is blocked by step 1".to_string(),
            "step 4 cannot proceed".to_string(),
            "missing file path".to_string(),
        ];
        let compressed = compress_cascading_issues(issues);
        assert_eq!(compressed.len(), 2);
        assert!(compressed[1].contains("Cascading failure: 3"));
    }

    #[test]
    fn test_command_relevance_bridged_network() {
        // Listing VMs does not prove a bridged adapter.
        let (relevant, reason) = check_command_relevance(
            "configure the VM network in VirtualBox",
            "VM has bridged network",
            &["VBoxManage list vms".to_string()],
        );
        assert!(!relevant);
        assert!(reason.contains("irrelevant command"));

        let (relevant, _) = check_command_relevance(
            "configure the VM network in VirtualBox",
            "VM has bridged network",
            &["VBoxManage showvminfo devbox".to_string()],
        );
        assert!(relevant);
    }

    #[test]
    fn test_parse_fixed_plan_json_tolerates_wrappers() {
        let raw = "FIXED PLAN:\n```json\n{\"goal\": \"g\", \"steps\": [{\"id\": 1, \
                   \"action\": \"do it\", \"expected_result\": \"done\", \"realm\": \"macos-use\"}]}\n```";
        let value = parse_fixed_plan_json(raw).unwrap();
        assert_eq!(value["steps"][0]["action"], "do it");

        assert!(parse_fixed_plan_json("no json at all").is_none());
        assert!(parse_fixed_plan_json("{\"goal\": \"g\"}").is_none());
    }

    #[tokio::test]
    async fn test_security_check_blocklist_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport {
            thinking_replies: Mutex::new(vec![]),
            tool_output: "",
        });
        let (auditor, _, _) = auditor_with(transport, dir.path());

        let verdict = auditor.security_check(&json!({"args": {"command": "rm -rf / --no-preserve-root"}}));
        assert!(!verdict.safe);
        assert_eq!(verdict.risk_level, "critical");

        let verdict = auditor.security_check(&json!({"args": {"command": "ls -la"}}));
        assert!(verdict.safe);
    }

    #[tokio::test]
    async fn test_verify_step_confirmed_flow() {
        let dir = tempfile::tempdir().unwrap();
        // Replies pop from the back: goal analysis first, then the verdict.
        let transport = Arc::new(ScriptedTransport {
            thinking_replies: Mutex::new(vec![
                "VERDICT: CONFIRMED\nCONFIDENCE: 0.9\nREASONING: process found".to_string(),
                json!({
                    "purpose": "check the app is running",
                    "tools": [{"server": "macos-use", "tool": "execute_command",
                               "args": {"command": "pgrep TextEdit"}}]
                })
                .to_string(),
            ]),
            tool_output: "4242",
        });
        let (auditor, bus, _) = auditor_with(transport, dir.path());

        let step = PlanStep {
            id: 1,
            action: "відкрий TextEdit".to_string(),
            expected_result: "TextEdit запущено".to_string(),
            realm: "macos-use".to_string(),
            ..Default::default()
        };
        let result = StepResult {
            step_id: 1,
            success: true,
            result: "launched".to_string(),
            error: None,
            tool_call: None,
            thought: None,
            is_deviation: false,
            deviation_info: None,
            screenshot_path: None,
            voice_message: None,
            timestamp: chrono::Utc::now(),
        };
        let verification = auditor.verify_step(&step, &result, "відкрити редактор").await;
        assert!(verification.verified);
        assert!(verification.confidence > 0.8);
        // No rejection traffic on success.
        assert_eq!(bus.pending_count(AgentId::Executor), 0);
    }

    #[tokio::test]
    async fn test_verify_step_rejection_writes_report_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport {
            thinking_replies: Mutex::new(vec![
                "VERDICT: FAILED\nCONFIDENCE: 0.2\nREASONING: nothing running\nISSUES:\n- app not found"
                    .to_string(),
                json!({
                    "purpose": "check the app",
                    "tools": [{"server": "macos-use", "tool": "execute_command",
                               "args": {"command": "pgrep TextEdit"}}]
                })
                .to_string(),
            ]),
            tool_output: "no such process",
        });
        let (auditor, bus, _) = auditor_with(transport, dir.path());

        let step = PlanStep {
            id: 2,
            action: "відкрий TextEdit".to_string(),
            expected_result: "TextEdit запущено".to_string(),
            realm: "macos-use".to_string(),
            ..Default::default()
        };
        let result = StepResult::failed(2, "window not visible");
        let verification = auditor.verify_step(&step, &result, "").await;
        assert!(!verification.verified);

        // Markdown report on disk.
        let reports: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(reports.len(), 1);
        // Typed rejection queued for the executor.
        let (report, issues) = bus.take_rejection_for(2).unwrap();
        assert!(report.contains("Step 2 rejected"));
        assert_eq!(issues, vec!["app not found"]);
    }

    #[tokio::test]
    async fn test_verify_step_record_audit_on_looping_engine() {
        let dir = tempfile::tempdir().unwrap();
        let looping = "checking the same thing\n".repeat(15);
        let transport = Arc::new(ScriptedTransport {
            thinking_replies: Mutex::new(vec![looping]),
            tool_output: "",
        });
        let (auditor, _, exec_log) = auditor_with(transport, dir.path());
        exec_log.record(ExecutionRecord {
            step_id: Some(3),
            server: "macos-use".to_string(),
            tool: "execute_command".to_string(),
            args: json!({"command": "open -a TextEdit"}),
            success: true,
            output_preview: "ok".to_string(),
            timestamp: chrono::Utc::now(),
        });

        let step = PlanStep {
            id: 3,
            action: "відкрий застосунок".to_string(),
            expected_result: "застосунок відкрито".to_string(),
            realm: "macos-use".to_string(),
            ..Default::default()
        };
        let result = StepResult::failed(3, "unclear");
        let verification = auditor.verify_step(&step, &result, "").await;
        // Record-only audit sees one successful execution.
        assert!(verification.verified);
        assert!(verification.description.contains("execution record"));
    }

    #[tokio::test]
    async fn test_verify_plan_approved_and_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport {
            thinking_replies: Mutex::new(vec![
                "VERDICT: APPROVED\nCORE PROBLEMS:\nNone\nFEEDBACK:\nlooks complete\nSUMMARY:\nдобре"
                    .to_string(),
            ]),
            tool_output: "",
        });
        let (auditor, _, _) = auditor_with(transport, dir.path());
        let plan = TaskPlan::new(
            "open editor",
            vec![PlanStep {
                id: 1,
                action: "open TextEdit".to_string(),
                realm: "macos-use".to_string(),
                ..Default::default()
            }],
        );
        let verification = auditor.verify_plan(&plan, "відкрий редактор", false).await;
        assert!(verification.verified);
        assert_eq!(verification.description, "looks complete");
    }

    #[tokio::test]
    async fn test_verify_plan_fix_pass_produces_plan() {
        let dir = tempfile::tempdir().unwrap();
        let fixed = json!({
            "goal": "open the editor",
            "steps": [{"id": 1, "action": "open TextEdit", "voice_action": "",
                       "expected_result": "running", "realm": "macos-use"}]
        })
        .to_string();
        let transport = Arc::new(ScriptedTransport {
            thinking_replies: Mutex::new(vec![
                format!("CORRECTED PLAN:\n```json\n{fixed}\n```"),
                "VERDICT: REJECTED\nCORE PROBLEMS:\n- missing discovery step\nFEEDBACK:\nfix it"
                    .to_string(),
            ]),
            tool_output: "",
        });
        let (auditor, _, _) = auditor_with(transport, dir.path());
        let plan = TaskPlan::new("open editor", vec![]);
        let verification = auditor.verify_plan(&plan, "відкрий редактор", true).await;
        assert!(!verification.verified);
        let fixed_plan = verification.fixed_plan.unwrap();
        assert_eq!(fixed_plan.steps.len(), 1);
        // Voice actions in the repaired plan went through standardization.
        assert!(!crate::voice::contains_latin(&fixed_plan.steps[0].voice_action));
    }

    #[tokio::test]
    async fn test_creator_override_inverts_policy_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport {
            thinking_replies: Mutex::new(vec![
                "VERDICT: REJECTED\nCORE PROBLEMS:\n- policy restriction on automation\nFEEDBACK:\nblocked by policy"
                    .to_string(),
            ]),
            tool_output: "",
        });
        let (auditor, _, _) = auditor_with(transport, dir.path());
        let plan = TaskPlan::new("automate the thing", vec![]);
        let verification = auditor
            .verify_plan(&plan, "творець просить: автоматизуй це", false)
            .await;
        assert!(verification.verified);
        assert!(verification
            .issues
            .iter()
            .any(|i| i.contains("creator override")));
    }

    #[tokio::test]
    async fn test_creator_override_respects_technical_blockers() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport {
            thinking_replies: Mutex::new(vec![
                "VERDICT: REJECTED\nCORE PROBLEMS:\n- target host unknown, IP missing\nFEEDBACK:\nneeds discovery"
                    .to_string(),
            ]),
            tool_output: "",
        });
        let (auditor, _, _) = auditor_with(transport, dir.path());
        let plan = TaskPlan::new("deploy", vec![]);
        let verification = auditor
            .verify_plan(&plan, "творець просить: задеплой", false)
            .await;
        // Technical blockers keep the rejection in force.
        assert!(!verification.verified);
    }
}
