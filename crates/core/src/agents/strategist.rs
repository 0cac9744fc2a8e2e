//! The Strategist: classifies requests, builds and repairs plans, answers
//! for the user when they stay silent, and judges the final execution.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Value};

use triad_config::LanguageConfig;
use triad_provider::{extract_json, ChatRequest, LlmClient, LlmTier, Message};

use crate::agents::{sequential_thinking, truncate_output, value_as_f64};
use crate::dispatch::ToolDispatcher;
use crate::plan::{PlanStep, StepResult, TaskPlan, ToolCall};
use crate::registry::SchemaRegistry;
use crate::routing::{Mode, ModeProfile, ModeRouter};
use crate::voice::standardize_voice_actions;

const TASK_DOCTRINE: &str = include_str!("../../data/protocols/task_protocol.txt");
const SDLC_DOCTRINE: &str = include_str!("../../data/protocols/sdlc_protocol.txt");

const PLAN_SELF_AUDIT_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct Classification {
    pub profile: ModeProfile,
    pub enriched_request: String,
    pub voice_response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CritiqueAction {
    Accept,
    Dispute,
}

#[derive(Debug, Clone)]
pub struct CritiqueVerdict {
    pub action: CritiqueAction,
    pub argument: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RecoverySuggestion {
    /// A direct fix to run before retrying the step.
    pub fix_call: Option<ToolCall>,
    /// Discovery steps to execute immediately before the retry.
    pub intermediate_steps: Vec<PlanStep>,
    pub note: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeviationDecision {
    pub approved: bool,
    pub skip: bool,
    pub alternative: Option<PlanStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealingDecision {
    Proceed,
    Pivot,
    Abort,
}

#[derive(Debug, Clone)]
pub struct ExecutionEvaluation {
    pub achieved: bool,
    /// 0.0..=1.0
    pub quality_score: f64,
    pub should_remember: bool,
    pub final_report: String,
    pub missing_artifacts: Vec<String>,
}

pub struct Strategist {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<ToolDispatcher>,
    router: Arc<ModeRouter>,
    registry: Arc<SchemaRegistry>,
    language: LanguageConfig,
}

impl Strategist {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<ToolDispatcher>,
        router: Arc<ModeRouter>,
        registry: Arc<SchemaRegistry>,
        language: LanguageConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            llm,
            dispatcher,
            router,
            registry,
            language,
        })
    }

    /// Classify and enrich a request. LLM failure degrades to the router's
    /// keyword heuristic, never to an error.
    pub async fn analyze_request(&self, text: &str, history: &[String]) -> Classification {
        let mut enrichment_hint = String::new();
        let lower = text.to_lowercase();
        if lower.contains("повтори останн") || lower.contains("repeat last") {
            // Back-references resolve through long-term memory.
            let recalled = self
                .dispatcher
                .resolve_and_dispatch(Some("recall_task"), json!({"query": text}), Some("memory"))
                .await;
            if recalled.success && !recalled.output.is_empty() {
                enrichment_hint = format!("\nLAST TASK ON RECORD:\n{}", recalled.output);
            }
        }

        let system = format!(
            "You classify user requests for a task orchestrator. Modes: chat, deep_chat, \
             solo_task, task, development, recall, status.\n\
             Reply with JSON only: {{\"mode\": \"...\", \"reason\": \"...\", \
             \"enriched_request\": \"...\", \"complexity\": \"low|medium|high\", \
             \"use_deep_persona\": bool, \"use_vibe\": bool, \
             \"voice_response\": \"short acknowledgement in {}\", \
             \"extra_servers\": [], \"extra_protocols\": []}}",
            self.language.target
        );
        let mut prompt = format!("REQUEST:\n{text}{enrichment_hint}");
        if !history.is_empty() {
            let recent: Vec<&String> = history.iter().rev().take(4).rev().collect();
            prompt.push_str(&format!("\n\nRECENT HISTORY:\n{recent:?}"));
        }

        let request = ChatRequest::new(
            LlmTier::Standard,
            vec![Message::system(system), Message::user(prompt)],
        )
        .with_temperature(0.1);

        match self.llm.chat(&request).await {
            Ok(response) => match extract_json(&response.content) {
                Some(analysis) => {
                    let profile = self.router.build_profile(&analysis);
                    Classification {
                        enriched_request: analysis["enriched_request"]
                            .as_str()
                            .filter(|s| !s.is_empty())
                            .unwrap_or(text)
                            .to_string(),
                        voice_response: analysis["voice_response"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        profile,
                    }
                }
                None => self.fallback_classification(text),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Classification LLM failed, using fallback");
                self.fallback_classification(text)
            }
        }
    }

    fn fallback_classification(&self, text: &str) -> Classification {
        Classification {
            profile: self.router.fallback_classify(text),
            enriched_request: text.to_string(),
            voice_response: String::new(),
        }
    }

    /// Conversational path. Context is gathered in parallel with a join
    /// barrier; every lookup is best-effort.
    pub async fn chat(&self, text: &str, profile: &ModeProfile, history: &[String]) -> String {
        let graph_fut = self.dispatcher.resolve_and_dispatch(
            Some("search_nodes"),
            json!({"query": text}),
            Some("graph"),
        );
        let memory_fut = self.dispatcher.resolve_and_dispatch(
            Some("search"),
            json!({"query": text, "limit": 3}),
            Some("memory"),
        );
        let (graph, memory) = futures::join!(graph_fut, memory_fut);

        let mut system = if profile.use_deep_persona {
            format!(
                "You are the strategist of a trinity of agents: a thoughtful, candid \
                 companion. Answer questions about identity, purpose and mission with \
                 depth and honesty. Respond in {}.",
                self.language.target
            )
        } else {
            format!(
                "You are a helpful assistant with a warm, concise style. Respond in {}.",
                self.language.target
            )
        };
        for protocol in profile.all_protocols() {
            system.push_str(&format!("\nProtocol active: {protocol}"));
        }
        if graph.success && !graph.output.is_empty() {
            system.push_str(&format!(
                "\n\nKNOWN FACTS:\n{}",
                truncate_output(&graph.output, 1500)
            ));
        }
        if memory.success && !memory.output.is_empty() {
            system.push_str(&format!(
                "\n\nRELEVANT MEMORIES:\n{}",
                truncate_output(&memory.output, 1500)
            ));
        }

        let mut messages = vec![Message::system(system)];
        for entry in history.iter().rev().take(6).rev() {
            messages.push(Message::user(entry.clone()));
        }
        messages.push(Message::user(text.to_string()));

        match self
            .llm
            .chat(&ChatRequest::new(profile.llm_tier, messages))
            .await
        {
            Ok(response) => response.content,
            Err(e) => {
                tracing::error!(error = %e, "Chat LLM failed");
                "Вибач, зараз не можу відповісти.".to_string()
            }
        }
    }

    /// Solo-task path: the strategist alone, with tool access, bounded turns.
    pub async fn solo_with_tools(
        &self,
        text: &str,
        profile: &ModeProfile,
        turn_limit: u32,
    ) -> String {
        let system = format!(
            "You are a capable assistant with tool access. Work the request yourself.\n{}\n\
             Reply with JSON only: {{\"reply\": \"answer in {}\", \
             \"tool_call\": {{\"server\": \"\", \"tool\": \"\", \"args\": {{}}}} | null}}\n\
             Set tool_call to null when you have everything you need.",
            self.registry.catalog_for_prompt(true),
            self.language.target
        );
        let mut messages = vec![Message::system(system), Message::user(text.to_string())];
        let mut last_reply = String::new();

        for turn in 0..turn_limit {
            let response = match self
                .llm
                .chat(&ChatRequest::new(profile.llm_tier, messages.clone()))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, turn, "Solo-task LLM failed");
                    break;
                }
            };
            let Some(value) = extract_json(&response.content) else {
                return response.content;
            };
            if let Some(reply) = value["reply"].as_str() {
                last_reply = reply.to_string();
            }
            let Some(call) = value["tool_call"].as_object() else {
                break;
            };
            let tool = call.get("tool").and_then(Value::as_str).unwrap_or_default();
            let server = call.get("server").and_then(Value::as_str);
            let args = call.get("args").cloned().unwrap_or(json!({}));
            let result = self
                .dispatcher
                .resolve_and_dispatch(Some(tool), args, server.filter(|s| !s.is_empty()))
                .await;
            messages.push(Message::assistant(response.content.clone()));
            messages.push(Message::user(format!(
                "TOOL RESULT (success={}):\n{}",
                result.success,
                truncate_output(&result.output, 2000)
            )));
        }

        if last_reply.is_empty() {
            "Не вдалося завершити запит.".to_string()
        } else {
            last_reply
        }
    }

    /// Build a TaskPlan: recall, simulate, synthesize, post-process.
    pub async fn create_plan(
        &self,
        enriched_request: &str,
        profile: &ModeProfile,
        feedback: Option<&str>,
    ) -> Result<TaskPlan> {
        // Phase 1: memory recall.
        let recalled = self
            .dispatcher
            .resolve_and_dispatch(
                Some("search"),
                json!({"query": enriched_request, "limit": 3}),
                Some("memory"),
            )
            .await;
        let lessons = if recalled.success && !recalled.output.is_empty() {
            format!(
                "\n\nLESSONS FROM SIMILAR PAST TASKS:\n{}",
                truncate_output(&recalled.output, 1200)
            )
        } else {
            String::new()
        };

        // Phase 2: deep simulation.
        let simulation = if profile.use_sequential_thinking {
            let mut prompt = format!(
                "Simulate executing this request step by step and surface unknowns \
                 (paths, identifiers, credentials) that need discovery first. \
                 Reason in English. REQUEST: {enriched_request}"
            );
            if let Some(feedback) = feedback {
                prompt.push_str(&format!("\nPRIOR FEEDBACK TO ADDRESS:\n{feedback}"));
            }
            sequential_thinking(&self.dispatcher, &prompt, 5).await
        } else {
            String::new()
        };

        // Phase 3 + 4: prompt assembly and synthesis.
        let plan_value = self
            .synthesize_plan(enriched_request, profile, feedback, &lessons, &simulation)
            .await?;

        let mut plan = parse_plan(&plan_value, enriched_request)?;

        // Phase 5a: meta-planning fallback when the model returned no steps.
        if plan.steps.is_empty() {
            tracing::warn!("Planner returned zero steps, running research pass");
            let research = self
                .dispatcher
                .resolve_and_dispatch(
                    Some("web_search"),
                    json!({"query": enriched_request, "max_results": 5}),
                    Some("duckduckgo-search"),
                )
                .await;
            let extra = if research.success {
                format!("\n\nRESEARCH NOTES:\n{}", truncate_output(&research.output, 1500))
            } else {
                String::new()
            };
            let retry_value = self
                .synthesize_plan(enriched_request, profile, feedback, &lessons, &extra)
                .await?;
            plan = parse_plan(&retry_value, enriched_request)?;
            if plan.steps.is_empty() {
                anyhow::bail!("Planner produced no steps after research pass");
            }
        }

        standardize_voice_actions(&mut plan.steps, self.language.non_latin_script);

        // Phase 5b: self-audit; regenerate once below the confidence bar.
        let audit_prompt = format!(
            "Audit this plan for discovery gaps (unknown IPs/paths/credentials), \
             invalid realms, dependency order and completeness. End with \
             'CONFIDENCE: <0..1>' and list ISSUES.\nGOAL: {}\nSTEPS:\n{}",
            plan.goal,
            format_steps(&plan.steps)
        );
        let audit = sequential_thinking(&self.dispatcher, &audit_prompt, 4).await;
        if let Some(confidence) = parse_confidence_line(&audit) {
            if confidence < PLAN_SELF_AUDIT_THRESHOLD {
                tracing::info!(confidence, "Self-audit below threshold, regenerating plan");
                let issues = audit
                    .lines()
                    .filter(|l| l.to_uppercase().contains("ISSUE"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let retry_value = self
                    .synthesize_plan(
                        enriched_request,
                        profile,
                        Some(&format!("Fix these audit issues:\n{issues}")),
                        &lessons,
                        &simulation,
                    )
                    .await?;
                if let Ok(mut regenerated) = parse_plan(&retry_value, enriched_request) {
                    if !regenerated.steps.is_empty() {
                        standardize_voice_actions(
                            &mut regenerated.steps,
                            self.language.non_latin_script,
                        );
                        plan = regenerated;
                    }
                }
            }
        }

        tracing::info!(steps = plan.steps.len(), goal = %plan.goal, "Plan created");
        Ok(plan)
    }

    async fn synthesize_plan(
        &self,
        enriched_request: &str,
        profile: &ModeProfile,
        feedback: Option<&str>,
        lessons: &str,
        simulation: &str,
    ) -> Result<Value> {
        let doctrine = match profile.mode {
            Mode::Development => SDLC_DOCTRINE,
            _ => TASK_DOCTRINE,
        };
        let active = profile.all_servers();
        let system = format!(
            "You are the strategist of an autonomous trinity. Produce an execution plan.\n\n\
             {doctrine}\n\n{}\n\nACTIVE REALMS FOR THIS TASK: {}\n\
             Never assign a step to a realm that is not active.\n\n\
             Reply with JSON only:\n\
             {{\"goal\": \"...\", \"steps\": [{{\"id\": 1, \"action\": \"imperative technical action\", \
             \"voice_action\": \"short phrase in {}\", \"expected_result\": \"observable outcome\", \
             \"realm\": \"server name\", \"tool\": \"tool name or null\", \"args\": {{}}, \
             \"requires_consent\": false, \"requires_user_input\": false, \
             \"requires_vision\": false}}]}}",
            self.registry.catalog_for_prompt(true),
            active.join(", "),
            self.language.target,
        );

        let mut prompt = format!("REQUEST:\n{enriched_request}{lessons}");
        if !simulation.is_empty() {
            prompt.push_str(&format!("\n\nSIMULATION:\n{simulation}"));
        }
        if let Some(feedback) = feedback {
            prompt.push_str(&format!("\n\nFEEDBACK ON PREVIOUS ATTEMPT:\n{feedback}"));
        }

        let response = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Deep,
                vec![Message::system(system), Message::user(prompt)],
            ))
            .await
            .context("Plan synthesis LLM call failed")?;

        extract_json(&response.content)
            .ok_or_else(|| anyhow::anyhow!("Planner reply was not valid JSON"))
    }

    /// Invoked when the auditor rejects a plan without producing a fix.
    pub async fn assess_plan_critique(&self, plan: &TaskPlan, critique: &str) -> CritiqueVerdict {
        let system = "The plan auditor rejected your plan. Decide: ACCEPT the critique \
                      (plan will be regenerated) or DISPUTE it with an argument. Reply \
                      with JSON: {\"action\": \"ACCEPT|DISPUTE\", \"argument\": \"...\", \
                      \"confidence\": 0.0}";
        let prompt = format!(
            "GOAL: {}\nSTEPS:\n{}\nCRITIQUE:\n{critique}",
            plan.goal,
            format_steps(&plan.steps)
        );
        let reply = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Deep,
                vec![Message::system(system.to_string()), Message::user(prompt)],
            ))
            .await;

        match reply.ok().and_then(|r| extract_json(&r.content)) {
            Some(value) => CritiqueVerdict {
                action: if value["action"].as_str().unwrap_or("ACCEPT").eq_ignore_ascii_case("dispute")
                {
                    CritiqueAction::Dispute
                } else {
                    CritiqueAction::Accept
                },
                argument: value["argument"].as_str().unwrap_or_default().to_string(),
                confidence: value_as_f64(&value["confidence"]).unwrap_or(0.5),
            },
            None => CritiqueVerdict {
                action: CritiqueAction::Accept,
                argument: String::new(),
                confidence: 0.5,
            },
        }
    }

    /// Rescue a stuck executor with a direct fix or discovery steps.
    pub async fn help_executor(
        &self,
        step: &PlanStep,
        error: &str,
        rejection_report: Option<&str>,
    ) -> RecoverySuggestion {
        let system = "The executor is stuck on a step. Propose either a direct \
                      fix_tool_call, or intermediate discovery steps to run first. \
                      Reply with JSON: {\"fix_tool_call\": {\"server\": \"\", \"tool\": \"\", \
                      \"args\": {}} | null, \"intermediate_steps\": [{\"id\": 0, \
                      \"action\": \"\", \"expected_result\": \"\", \"realm\": \"\"}], \
                      \"note\": \"\"}";
        let mut prompt = format!(
            "STEP: {}\nEXPECTED: {}\nREALM: {}\nERROR: {error}",
            step.action, step.expected_result, step.realm
        );
        if let Some(report) = rejection_report {
            prompt.push_str(&format!("\n\nAUDITOR REJECTION REPORT:\n{report}"));
        }

        let reply = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Deep,
                vec![Message::system(system.to_string()), Message::user(prompt)],
            ))
            .await;

        let Some(value) = reply.ok().and_then(|r| extract_json(&r.content)) else {
            return RecoverySuggestion::default();
        };

        let fix_call = value["fix_tool_call"].as_object().map(|fix| ToolCall {
            server: fix
                .get("server")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool: fix
                .get("tool")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            args: fix.get("args").cloned().unwrap_or(json!({})),
        });
        let mut intermediate_steps: Vec<PlanStep> = value["intermediate_steps"]
            .as_array()
            .map(|steps| {
                steps
                    .iter()
                    .filter_map(|s| serde_json::from_value(s.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        standardize_voice_actions(&mut intermediate_steps, self.language.non_latin_script);

        RecoverySuggestion {
            fix_call,
            intermediate_steps,
            note: value["note"].as_str().unwrap_or_default().to_string(),
        }
    }

    /// Approve or reject an executor-proposed strategy change.
    pub async fn evaluate_deviation(
        &self,
        step: &PlanStep,
        deviation_info: &Value,
    ) -> DeviationDecision {
        let system = "The executor proposes deviating from the plan. Decide. Reply with \
                      JSON: {\"approved\": bool, \"skip\": bool, \"alternative_step\": \
                      {\"id\": 0, \"action\": \"\", \"expected_result\": \"\", \"realm\": \"\"} | null}";
        let prompt = format!(
            "BLOCKED STEP: {}\nDEVIATION PROPOSAL:\n{deviation_info}",
            step.action
        );
        let reply = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Deep,
                vec![Message::system(system.to_string()), Message::user(prompt)],
            ))
            .await;

        let Some(value) = reply.ok().and_then(|r| extract_json(&r.content)) else {
            return DeviationDecision::default();
        };
        let mut alternative: Option<PlanStep> = value["alternative_step"]
            .as_object()
            .and_then(|_| serde_json::from_value(value["alternative_step"].clone()).ok());
        if let Some(step) = alternative.as_mut() {
            standardize_voice_actions(
                std::slice::from_mut(step),
                self.language.non_latin_script,
            );
        }
        DeviationDecision {
            approved: value["approved"].as_bool().unwrap_or(false),
            skip: value["skip"].as_bool().unwrap_or(false),
            alternative,
        }
    }

    /// Gate for the code-assistant self-heal path.
    pub async fn evaluate_healing_strategy(&self, context: &str) -> HealingDecision {
        let system = "A code-assistant self-heal fix is proposed. Reply with JSON: \
                      {\"decision\": \"PROCEED|PIVOT|ABORT\", \"reason\": \"\"}";
        let reply = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Standard,
                vec![
                    Message::system(system.to_string()),
                    Message::user(context.to_string()),
                ],
            ))
            .await;
        let decision = reply
            .ok()
            .and_then(|r| extract_json(&r.content))
            .and_then(|v| v["decision"].as_str().map(str::to_uppercase));
        match decision.as_deref() {
            Some("PIVOT") => HealingDecision::Pivot,
            Some("ABORT") => HealingDecision::Abort,
            _ => HealingDecision::Proceed,
        }
    }

    /// Final authoritative evaluation. Claimed artifacts that do not exist on
    /// disk force failure regardless of step-level success flags.
    pub async fn evaluate_execution(
        &self,
        goal: &str,
        steps: &[PlanStep],
        results: &[StepResult],
    ) -> ExecutionEvaluation {
        let claimed = extract_artifact_paths(goal, steps, results);
        let mut missing = Vec::new();
        let mut verified = Vec::new();
        for artifact in &claimed {
            if Path::new(artifact).exists() {
                verified.push(artifact.clone());
            } else {
                missing.push(artifact.clone());
            }
        }

        let mut artifact_note = String::new();
        if !claimed.is_empty() {
            artifact_note.push_str("\n\n=== ARTIFACT VERIFICATION ===");
            if !verified.is_empty() {
                artifact_note.push_str(&format!("\nVerified on disk: {verified:?}"));
            }
            if !missing.is_empty() {
                artifact_note.push_str(&format!("\nMISSING from disk: {missing:?}"));
            }
        }

        let successes = results.iter().filter(|r| r.success).count();
        let system = format!(
            "Evaluate whether the goal was achieved from the step results. Reply with \
             JSON: {{\"achieved\": bool, \"quality_score\": 0.0, \"should_remember\": bool, \
             \"final_report\": \"summary in {}\"}}",
            self.language.target
        );
        let prompt = format!(
            "GOAL: {goal}\nSTEPS SUCCEEDED: {successes}/{}\nRESULTS:\n{}{artifact_note}",
            results.len(),
            results
                .iter()
                .map(|r| format!(
                    "- step {}: success={} {}",
                    r.step_id,
                    r.success,
                    truncate_output(&r.result, 200)
                ))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let reply = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Deep,
                vec![Message::system(system), Message::user(prompt)],
            ))
            .await;

        let (mut achieved, mut quality_score, should_remember, final_report) =
            match reply.ok().and_then(|r| extract_json(&r.content)) {
                Some(value) => (
                    value["achieved"].as_bool().unwrap_or(false),
                    value_as_f64(&value["quality_score"]).unwrap_or(0.0),
                    value["should_remember"].as_bool().unwrap_or(false),
                    value["final_report"].as_str().unwrap_or_default().to_string(),
                ),
                None => (
                    successes == results.len() && !results.is_empty(),
                    if results.is_empty() {
                        0.0
                    } else {
                        successes as f64 / results.len() as f64
                    },
                    false,
                    "Завдання опрацьовано.".to_string(),
                ),
            };

        // Missing artifacts invalidate any optimistic self-assessment.
        if !missing.is_empty() {
            achieved = false;
            quality_score = quality_score.min(0.3);
        }

        ExecutionEvaluation {
            achieved,
            quality_score,
            should_remember,
            final_report,
            missing_artifacts: missing,
        }
    }

    /// Called after the silent-answer timeout on a consent prompt. Must be
    /// decisive and in the target language.
    pub async fn decide_for_user(&self, question: &str, context: &str) -> String {
        let system = format!(
            "The user is away. Answer the pending question on their behalf: one short, \
             decisive answer in {}. Never ask anything back.",
            self.language.target
        );
        let prompt = format!("QUESTION: {question}\nCONTEXT: {context}");
        match self
            .llm
            .chat(
                &ChatRequest::new(
                    LlmTier::Standard,
                    vec![Message::system(system), Message::user(prompt)],
                )
                .with_temperature(0.2),
            )
            .await
        {
            Ok(response) if !response.content.trim().is_empty() => {
                response.content.trim().to_string()
            }
            _ => "Так, продовжуй як вважаєш за краще.".to_string(),
        }
    }
}

fn format_steps(steps: &[PlanStep]) -> String {
    steps
        .iter()
        .map(|s| {
            format!(
                "{}. [{}] {} -> {}",
                s.id, s.realm, s.action, s.expected_result
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_plan(value: &Value, fallback_goal: &str) -> Result<TaskPlan> {
    let goal = value["goal"]
        .as_str()
        .filter(|g| !g.is_empty())
        .unwrap_or(fallback_goal)
        .to_string();
    let mut steps: Vec<PlanStep> = value["steps"]
        .as_array()
        .map(|raw| {
            raw.iter()
                .filter_map(|s| serde_json::from_value(s.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    for (i, step) in steps.iter_mut().enumerate() {
        if step.id == 0 {
            step.id = i as u32 + 1;
        }
    }
    Ok(TaskPlan::new(goal, steps))
}

fn parse_confidence_line(analysis: &str) -> Option<f64> {
    let re = Regex::new(r"(?i)CONFIDENCE[:\s]*([0-9]*\.?[0-9]+)%?").ok()?;
    let capture = re.captures(analysis)?;
    let mut confidence: f64 = capture.get(1)?.as_str().parse().ok()?;
    if confidence > 1.0 {
        confidence /= 100.0;
    }
    Some(confidence)
}

/// Collect file paths the execution claims to have produced: explicit step
/// artifacts first, then a regex sweep over the goal and results.
pub fn extract_artifact_paths(
    goal: &str,
    steps: &[PlanStep],
    results: &[StepResult],
) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for step in steps {
        for artifact in &step.artifacts {
            if !paths.contains(artifact) {
                paths.push(artifact.clone());
            }
        }
    }

    let re = Regex::new(r"(?:~|/)[\w./-]+\.[A-Za-z0-9]{1,5}").expect("static regex");
    let mut scan = |text: &str| {
        for capture in re.find_iter(text) {
            let mut path = capture.as_str().to_string();
            if let Some(rest) = path.strip_prefix('~') {
                if let Some(home) = dirs::home_dir() {
                    path = format!("{}{rest}", home.to_string_lossy());
                }
            }
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    };
    scan(goal);
    for result in results {
        scan(&result.result);
    }
    paths
}
