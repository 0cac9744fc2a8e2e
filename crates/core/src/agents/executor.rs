//! The Executor: runs one plan step at a time with self-repair.
//!
//! A step attempt walks a fixed ladder: consent gate, goal alignment, vision
//! pre-check, auditor feedback, fast path, reasoning monologue, dispatch,
//! empty-proof detection and a bounded technical reflexion loop. Failures are
//! absorbed here and come out as typed `StepResult`s; the orchestrator never
//! sees raw tool errors.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use triad_config::{LanguageConfig, OrchestratorSettings};
use triad_provider::{extract_json, ChatRequest, LlmClient, LlmTier, Message};

use crate::agents::{is_data_intensive, is_read_only, sequential_thinking, truncate_output};
use crate::bus::{AgentBus, AgentId, BusMessage, BusPayload};
use crate::checkpoint::CheckpointStore;
use crate::context::SharedContext;
use crate::dispatch::{DispatchResult, ToolDispatcher, INFO_GATHERING_VERBS};
use crate::events::{EventStream, OrchestratorEvent};
use crate::mcp::{ExecutionLog, ExecutionRecord};
use crate::plan::{
    FailureKind, PlanStep, StepResult, ToolCall, ERR_NEED_USER_INPUT, ERR_PROACTIVE_HELP,
};
use crate::registry::SchemaRegistry;

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "timeout",
    "rate limit",
    "broken pipe",
    "connection reset",
];

struct VisionCheck {
    screenshot_path: Option<String>,
    coordinates: Option<(i64, i64)>,
}

pub struct Executor {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<ToolDispatcher>,
    registry: Arc<SchemaRegistry>,
    context: SharedContext,
    bus: AgentBus,
    events: EventStream,
    exec_log: Arc<ExecutionLog>,
    checkpoints: Arc<CheckpointStore>,
    settings: OrchestratorSettings,
    language: LanguageConfig,
    history: tokio::sync::Mutex<Vec<StepResult>>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<ToolDispatcher>,
        registry: Arc<SchemaRegistry>,
        context: SharedContext,
        bus: AgentBus,
        events: EventStream,
        exec_log: Arc<ExecutionLog>,
        checkpoints: Arc<CheckpointStore>,
        settings: OrchestratorSettings,
        language: LanguageConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            llm,
            dispatcher,
            registry,
            context,
            bus,
            events,
            exec_log,
            checkpoints,
            settings,
            language,
            history: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub async fn execute_step(
        &self,
        session_id: &str,
        step: &PlanStep,
        attempt: u32,
        goal: &str,
    ) -> StepResult {
        tracing::info!(step = step.id, attempt, action = %step.action, "Executing step");

        // 1. Consent gate. Information gathering never blocks.
        let provided_response = self.bus.take_user_response();
        if (step.requires_consent || step.requires_user_input)
            && provided_response.is_none()
            && !is_info_gathering(&step.action)
        {
            let mut result = StepResult::failed(step.id, ERR_NEED_USER_INPUT);
            result.voice_message = Some(format!("Потрібна твоя відповідь: {}", step.action));
            return result;
        }

        // 2. Goal-alignment validation, first attempt only.
        let mut action = step.action.clone();
        let mut original_action: Option<String> = None;
        if attempt == 1 && !goal.is_empty() {
            if let Some(alternative) = self.validate_goal_alignment(step, goal).await {
                tracing::info!(step = step.id, "Substituting misaligned step action");
                original_action = Some(action.clone());
                action = alternative;
            }
        }

        // 3. Vision pre-check.
        let vision = if step.requires_vision && attempt <= 2 {
            match self.vision_precheck(step).await {
                Ok(check) => check,
                Err(blocker) => {
                    let mut result = StepResult::failed(step.id, blocker);
                    result.voice_message =
                        Some("На екрані перевірка, потрібна твоя допомога.".to_string());
                    return result;
                }
            }
        } else {
            VisionCheck {
                screenshot_path: None,
                coordinates: None,
            }
        };

        // 4. Auditor feedback from the bus, synchronously, before retrying.
        let rejection = if attempt > 1 {
            self.bus.take_rejection_for(step.id)
        } else {
            None
        };
        let strategist_answer = self.bus.take_response_for(step.id);

        // 5/6. Fast path or reasoning monologue.
        let (mut tool_call, mut monologue) =
            match self.fast_path_call(step, &action) {
                Some(call) => (call, Value::Null),
                None => {
                    match self
                        .reason_about_step(
                            step,
                            &action,
                            attempt,
                            goal,
                            rejection.as_ref(),
                            provided_response.as_deref(),
                            strategist_answer.as_deref(),
                            vision.screenshot_path.as_deref(),
                        )
                        .await
                    {
                        Ok((call, monologue)) => (call, monologue),
                        Err(result) => return *result,
                    }
                }
            };

        // 7. Normalization: step id, vision coordinates, argument repair.
        normalize_tool_call(&mut tool_call, step, vision.coordinates);

        // 8. Execute via the dispatcher.
        let mut dispatch = self.dispatch_and_log(step.id, &tool_call).await;

        // 9. "Empty proof": success with no data from a data-intensive tool
        // is a soft failure.
        apply_empty_proof(&tool_call, &mut dispatch);

        // 10. Technical reflexion, bounded.
        if !dispatch.success {
            match self
                .technical_reflexion(step, &action, &mut tool_call, &mut dispatch)
                .await
            {
                ReflexionOutcome::Resolved => {}
                ReflexionOutcome::Deviation(info) => {
                    let mut result = StepResult::failed(step.id, "deviation proposed");
                    result.is_deviation = true;
                    result.deviation_info = Some(info);
                    result.tool_call = Some(tool_call);
                    return result;
                }
                ReflexionOutcome::Exhausted => {}
            }
        }

        // 11. Finalize and checkpoint.
        if monologue.is_null() {
            monologue = json!({});
        }
        let voice_message = monologue["voice_message"]
            .as_str()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                if dispatch.success {
                    "Крок виконано.".to_string()
                } else {
                    "Крок не вдався, аналізую.".to_string()
                }
            });

        let result = StepResult {
            step_id: step.id,
            success: dispatch.success,
            result: truncate_output(&dispatch.output, 8000),
            error: dispatch.error.clone(),
            tool_call: Some(tool_call),
            thought: monologue["thought"].as_str().map(|t| match &original_action {
                Some(original) => format!("{t} (substituted from: {original})"),
                None => t.to_string(),
            }),
            is_deviation: false,
            deviation_info: None,
            screenshot_path: vision.screenshot_path,
            voice_message: Some(voice_message),
            timestamp: Utc::now(),
        };

        self.history.lock().await.push(result.clone());
        if let Err(e) = self
            .checkpoints
            .checkpoint_step(session_id, step.id, &result)
        {
            tracing::warn!(error = %e, "Checkpoint write failed");
        }
        self.events.publish(OrchestratorEvent::StepCompleted {
            step_id: step.id,
            success: result.success,
        });
        result
    }

    /// Does the step drift from the goal chain? Returns a replacement action
    /// when the model is confident in a better one.
    async fn validate_goal_alignment(&self, step: &PlanStep, goal: &str) -> Option<String> {
        let system = "Compare the step to the global goal. Reply with JSON: \
                      {\"aligned\": bool, \"confidence\": 0.0, \"alternative_action\": \"\" | null}";
        let prompt = format!("GOAL: {goal}\nSTEP: {}\nEXPECTED: {}", step.action, step.expected_result);
        let reply = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Standard,
                vec![Message::system(system.to_string()), Message::user(prompt)],
            ))
            .await
            .ok()?;
        let value = extract_json(&reply.content)?;
        let aligned = value["aligned"].as_bool().unwrap_or(true);
        let confidence = value["confidence"].as_f64().unwrap_or(1.0);
        let alternative = value["alternative_action"]
            .as_str()
            .filter(|a| !a.is_empty())?;
        if !aligned && confidence < 0.6 {
            Some(alternative.to_string())
        } else {
            None
        }
    }

    /// Screenshot plus target localization. Err carries a blocker message
    /// (CAPTCHA, verification challenge).
    async fn vision_precheck(&self, step: &PlanStep) -> Result<VisionCheck, String> {
        let shot = self
            .dispatch_and_log(
                step.id,
                &ToolCall {
                    server: "macos-use".to_string(),
                    tool: "screenshot".to_string(),
                    args: json!({}),
                },
            )
            .await;
        if !shot.success {
            // No screen, no vision; the step continues blind.
            return Ok(VisionCheck {
                screenshot_path: None,
                coordinates: None,
            });
        }
        let screenshot_path = shot.output.lines().next().map(str::to_string);

        let system = "You analyze a UI screenshot description to locate a target element. \
                      Reply with JSON: {\"found\": bool, \"x\": 0, \"y\": 0, \
                      \"blocker\": \"CAPTCHA|verification|null\"}";
        let prompt = format!(
            "ACTION: {}\nSCREENSHOT: {}\n",
            step.action,
            screenshot_path.as_deref().unwrap_or("(unavailable)")
        );
        let Ok(reply) = self
            .llm
            .chat(&ChatRequest::new(
                LlmTier::Standard,
                vec![Message::system(system.to_string()), Message::user(prompt)],
            ))
            .await
        else {
            return Ok(VisionCheck {
                screenshot_path,
                coordinates: None,
            });
        };
        let Some(value) = extract_json(&reply.content) else {
            return Ok(VisionCheck {
                screenshot_path,
                coordinates: None,
            });
        };

        if let Some(blocker) = value["blocker"].as_str() {
            if !blocker.is_empty() && blocker != "null" {
                return Err(format!("vision blocker detected: {blocker}"));
            }
        }
        let coordinates = match (value["x"].as_i64(), value["y"].as_i64()) {
            (Some(x), Some(y)) if value["found"].as_bool() == Some(true) => Some((x, y)),
            _ => None,
        };
        Ok(VisionCheck {
            screenshot_path,
            coordinates,
        })
    }

    /// Read-only, schema-complete planned calls skip the reasoning LLM.
    fn fast_path_call(&self, step: &PlanStep, action: &str) -> Option<ToolCall> {
        if action != step.action {
            return None; // substituted actions always get reasoning
        }
        let tool = step.tool.as_deref()?;
        if !is_read_only(tool) {
            return None;
        }
        let args = step.args.as_object()?.clone();
        let (ok, _) = self.registry.validate_tool_call(tool, &args);
        if !ok {
            return None;
        }
        tracing::debug!(step = step.id, tool = %tool, "Fast path");
        Some(ToolCall {
            server: step.realm.clone(),
            tool: tool.to_string(),
            args: Value::Object(args),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn reason_about_step(
        &self,
        step: &PlanStep,
        action: &str,
        attempt: u32,
        goal: &str,
        rejection: Option<&(String, Vec<String>)>,
        provided_response: Option<&str>,
        strategist_answer: Option<&str>,
        screenshot_path: Option<&str>,
    ) -> Result<(ToolCall, Value), Box<StepResult>> {
        let target_server = resolve_target_server(step);
        let server_tools = self.registry.tool_names_for_server(&target_server).join(", ");
        let recent: Vec<String> = self
            .history
            .lock()
            .await
            .iter()
            .rev()
            .take(3)
            .map(|r| format!("step {}: success={}", r.step_id, r.success))
            .collect();

        let system = format!(
            "You are the executor of a trinity of agents. Produce an internal monologue \
             and one concrete tool call.\nTarget realm: {target_server} \
             (tools: {server_tools})\n\
             Reply with JSON: {{\"thought\": \"...\", \"proposed_action\": \
             {{\"tool\": \"...\", \"args\": {{}}, \"server\": \"{target_server}\"}}, \
             \"voice_message\": \"short phrase in {}\", \
             \"question_to_strategist\": null}}",
            self.language.target
        );

        let mut prompt = format!(
            "GOAL: {goal}\nSTEP {} (attempt {attempt}): {action}\nEXPECTED: {}\nRECENT: {recent:?}",
            step.id, step.expected_result
        );
        if !step.args.is_null() {
            prompt.push_str(&format!("\nPLANNED ARGS: {}", step.args));
        }
        if let Some((report, issues)) = rejection {
            prompt.push_str(&format!(
                "\nAUDITOR REJECTED THE PREVIOUS ATTEMPT:\n{report}\nISSUES: {issues:?}"
            ));
        }
        if let Some(response) = provided_response {
            prompt.push_str(&format!("\nUSER RESPONSE: {response}"));
        }
        if let Some(answer) = strategist_answer {
            prompt.push_str(&format!("\nSTRATEGIST ANSWER: {answer}"));
        }
        if let Some(path) = screenshot_path {
            prompt.push_str(&format!("\nSCREENSHOT AVAILABLE AT: {path}"));
        }

        let temperature = dynamic_temperature(attempt);
        let reply = self
            .llm
            .chat(
                &ChatRequest::new(
                    LlmTier::Standard,
                    vec![Message::system(system), Message::user(prompt)],
                )
                .with_temperature(temperature),
            )
            .await;

        let value = match reply.ok().and_then(|r| extract_json(&r.content)) {
            Some(value) => value,
            None => {
                // Reasoning failed; fall back to whatever the plan committed to.
                if let Some(tool) = &step.tool {
                    return Ok((
                        ToolCall {
                            server: target_server,
                            tool: tool.clone(),
                            args: step.args.clone(),
                        },
                        Value::Null,
                    ));
                }
                return Err(Box::new(StepResult::failed(
                    step.id,
                    "reasoning produced no tool call",
                )));
            }
        };

        if let Some(question) = value["question_to_strategist"].as_str() {
            if !question.is_empty() && question != "null" {
                self.bus.send(
                    AgentId::Strategist,
                    BusMessage::new(
                        AgentId::Executor,
                        BusPayload::HelpRequest {
                            step_id: step.id,
                            question: question.to_string(),
                        },
                    ),
                );
                let mut result = StepResult::failed(step.id, ERR_PROACTIVE_HELP);
                result.voice_message = Some("Мені потрібна порада стратега.".to_string());
                result.thought = value["thought"].as_str().map(str::to_string);
                return Err(Box::new(result));
            }
        }

        let proposed = &value["proposed_action"];
        let tool = proposed["tool"]
            .as_str()
            .filter(|t| !t.is_empty())
            .or(step.tool.as_deref())
            .unwrap_or("execute_command")
            .to_string();
        let server = proposed["server"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or(target_server);
        let args = proposed["args"].clone();

        Ok((
            ToolCall {
                server,
                tool,
                args: if args.is_object() { args } else { json!({}) },
            },
            value,
        ))
    }

    async fn dispatch_and_log(&self, step_id: u32, call: &ToolCall) -> DispatchResult {
        let result = self
            .dispatcher
            .resolve_and_dispatch(Some(&call.tool), call.args.clone(), Some(&call.server))
            .await;
        self.exec_log.record(ExecutionRecord {
            step_id: Some(step_id),
            server: result.server.clone().unwrap_or_else(|| call.server.clone()),
            tool: result.tool.clone().unwrap_or_else(|| call.tool.clone()),
            args: call.args.clone(),
            success: result.success,
            output_preview: truncate_output(&result.output, 300),
            timestamp: Utc::now(),
        });
        result
    }

    /// Bounded self-repair: transient retry, deep reasoning with a possible
    /// deviation, a last-resort code-assistant heal, then targeted fixes.
    async fn technical_reflexion(
        &self,
        step: &PlanStep,
        action: &str,
        tool_call: &mut ToolCall,
        dispatch: &mut DispatchResult,
    ) -> ReflexionOutcome {
        let max_fixes = self.settings.self_fix_limit;
        let mut fix_count = 0u32;

        while !dispatch.success && fix_count < max_fixes {
            fix_count += 1;
            let error = dispatch.error.clone().unwrap_or_else(|| "Unknown error".to_string());
            let kind = FailureKind::from_error(Some(&error));

            // Hard failures never retry the same tool.
            if kind.is_hard() {
                tracing::warn!(step = step.id, error = %error, "Hard failure, no retry");
                return ReflexionOutcome::Exhausted;
            }

            // Transient network-class errors: linear backoff with jitter,
            // same call.
            if TRANSIENT_MARKERS
                .iter()
                .any(|m| error.to_lowercase().contains(m))
            {
                tracing::info!(step = step.id, retry = fix_count, "Transient error, retrying");
                let jitter_ms = rand::random::<u64>() % 250;
                tokio::time::sleep(std::time::Duration::from_millis(
                    fix_count as u64 * 1000 + jitter_ms,
                ))
                .await;
                *dispatch = self.dispatch_and_log(step.id, tool_call).await;
                apply_empty_proof(tool_call, dispatch);
                continue;
            }

            // Persistent failure: deep reasoning may propose a deviation.
            if fix_count >= 2 {
                let analysis = sequential_thinking(
                    &self.dispatcher,
                    &format!(
                        "I fail to execute '{action}'. Error: {error}. \
                         Propose DEVIATION if the step should be skipped or replaced."
                    ),
                    3,
                )
                .await;
                let lower = analysis.to_lowercase();
                if ["deviation", "alternative approach", "skip this step"]
                    .iter()
                    .any(|kw| lower.contains(kw))
                {
                    return ReflexionOutcome::Deviation(json!({
                        "analysis": analysis,
                        "proposal": truncate_output(&lower, 500),
                    }));
                }
            }

            // Last fix: code-assistant self-heal, then one re-execution.
            if fix_count == max_fixes {
                tracing::info!(step = step.id, "Invoking code-assistant self-heal");
                let heal = self
                    .dispatch_and_log(
                        step.id,
                        &ToolCall {
                            server: "vibe".to_string(),
                            tool: "vibe_analyze_error".to_string(),
                            args: json!({"error_message": error, "auto_fix": true}),
                        },
                    )
                    .await;
                if heal.success {
                    *dispatch = self.dispatch_and_log(step.id, tool_call).await;
                    apply_empty_proof(tool_call, dispatch);
                    if dispatch.success {
                        return ReflexionOutcome::Resolved;
                    }
                }
                break;
            }

            // Targeted fix proposed by the reflexion model.
            let system = "You are a technical debugger. Analyze the error and suggest one \
                          fix action. Reply with JSON: {\"fix_attempt\": {\"tool\": \"\", \
                          \"args\": {}, \"server\": \"\"} | null, \"requires_strategist\": false}";
            let recent: Vec<String> = self
                .history
                .lock()
                .await
                .iter()
                .rev()
                .take(5)
                .map(|r| format!("step {} success={} error={:?}", r.step_id, r.success, r.error))
                .collect();
            let prompt = format!(
                "STEP: {action}\nFAILED CALL: {}.{} args={}\nERROR: {error}\nRECENT: {recent:?}",
                tool_call.server, tool_call.tool, tool_call.args
            );
            let reply = self
                .llm
                .chat(&ChatRequest::new(
                    LlmTier::Standard,
                    vec![Message::system(system.to_string()), Message::user(prompt)],
                ))
                .await;
            let Some(value) = reply.ok().and_then(|r| extract_json(&r.content)) else {
                break;
            };
            if value["requires_strategist"].as_bool() == Some(true) {
                break;
            }
            let Some(fix) = value["fix_attempt"].as_object() else {
                break;
            };
            let fix_call = ToolCall {
                server: fix
                    .get("server")
                    .and_then(Value::as_str)
                    .unwrap_or(&tool_call.server)
                    .to_string(),
                tool: fix
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or(&tool_call.tool)
                    .to_string(),
                args: fix.get("args").cloned().unwrap_or(json!({})),
            };
            tracing::info!(step = step.id, tool = %fix_call.tool, "Attempting targeted fix");
            let fix_result = self.dispatch_and_log(step.id, &fix_call).await;
            if fix_result.success {
                *tool_call = fix_call;
                *dispatch = fix_result;
                return ReflexionOutcome::Resolved;
            }
        }

        if dispatch.success {
            ReflexionOutcome::Resolved
        } else {
            ReflexionOutcome::Exhausted
        }
    }
}

enum ReflexionOutcome {
    Resolved,
    Deviation(Value),
    Exhausted,
}

fn is_info_gathering(action: &str) -> bool {
    let lower = action.to_lowercase();
    INFO_GATHERING_VERBS
        .iter()
        .any(|v| lower.starts_with(v) || lower.contains(&format!(" {v}")))
}

fn resolve_target_server(step: &PlanStep) -> String {
    let realm = if step.realm.is_empty() {
        "macos-use"
    } else {
        &step.realm
    };
    // Legacy plans name a generic "browser" realm.
    if realm == "browser" {
        "puppeteer".to_string()
    } else {
        realm.to_string()
    }
}

fn dynamic_temperature(attempt: u32) -> f32 {
    (0.3 + 0.2 * (attempt.saturating_sub(1)) as f32).min(0.9)
}

fn normalize_tool_call(call: &mut ToolCall, step: &PlanStep, coordinates: Option<(i64, i64)>) {
    let mut args = match call.args.take() {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    // Common argument hallucinations.
    if args.contains_key("new_path") && !args.contains_key("path") {
        if let Some(value) = args.remove("new_path") {
            args.insert("path".to_string(), value);
        }
    }

    args.insert("step_id".to_string(), json!(step.id));

    if let Some((x, y)) = coordinates {
        if call.tool == "click" {
            // Vision coordinates win over whatever was planned, and selector
            // arguments from a previously planned browser tool do not apply.
            args.insert("x".to_string(), json!(x));
            args.insert("y".to_string(), json!(y));
            args.remove("selector");
            call.server = "macos-use".to_string();
        }
    }

    call.args = Value::Object(args);
}

fn apply_empty_proof(call: &ToolCall, dispatch: &mut DispatchResult) {
    if dispatch.success && dispatch.output.trim().is_empty() && is_data_intensive(&call.tool) {
        dispatch.success = false;
        dispatch.error = Some(format!(
            "empty output from data-intensive tool '{}' (no data returned)",
            call.tool
        ));
    }
}
