//! Top-level state machine: segments in, verified execution out.
//!
//! One segment at a time, steps strictly sequential, cancellation only at
//! step boundaries. The orchestrator sees typed `StepResult`s and
//! `VerificationResult`s; raw tool errors never reach this loop.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use triad_config::OrchestratorSettings;

use crate::agents::auditor::Auditor;
use crate::agents::executor::Executor;
use crate::agents::strategist::{
    CritiqueAction, ExecutionEvaluation, HealingDecision, Strategist,
};
use crate::bus::{AgentBus, AgentId, BusMessage, BusPayload};
use crate::checkpoint::CheckpointStore;
use crate::context::SharedContext;
use crate::dispatch::ToolDispatcher;
use crate::events::{EventStream, OrchestratorEvent};
use crate::plan::{PlanStep, StepOutcome, StepResult};
use crate::routing::Mode;
use crate::segmenter::{RequestSegment, RequestSegmenter};

const DISPUTE_CONFIDENCE_THRESHOLD: f64 = 0.7;
/// Bounds re-execution loops that do not consume a step attempt
/// (consent answers, proactive help round-trips).
const MAX_REEXECUTIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Classifying,
    Planning,
    VerifyingPlan,
    Executing,
    AwaitingInput,
    Recovery,
    Evaluating,
    Failed,
}

impl OrchestratorState {
    fn as_str(&self) -> &'static str {
        match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Classifying => "classifying",
            OrchestratorState::Planning => "planning",
            OrchestratorState::VerifyingPlan => "verifying_plan",
            OrchestratorState::Executing => "executing",
            OrchestratorState::AwaitingInput => "awaiting_input",
            OrchestratorState::Recovery => "recovery",
            OrchestratorState::Evaluating => "evaluating",
            OrchestratorState::Failed => "failed",
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionReport {
    pub session_id: String,
    pub replies: Vec<String>,
    pub step_results: Vec<StepResult>,
    pub evaluations: Vec<ExecutionEvaluation>,
    pub failed: bool,
}

pub struct Orchestrator {
    strategist: Arc<Strategist>,
    executor: Arc<Executor>,
    auditor: Arc<Auditor>,
    segmenter: RequestSegmenter,
    dispatcher: Arc<ToolDispatcher>,
    context: SharedContext,
    bus: AgentBus,
    events: EventStream,
    checkpoints: Arc<CheckpointStore>,
    settings: OrchestratorSettings,
    cancel: CancellationToken,
    user_response_tx: mpsc::Sender<String>,
    user_responses: tokio::sync::Mutex<mpsc::Receiver<String>>,
    state: std::sync::Mutex<OrchestratorState>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategist: Arc<Strategist>,
        executor: Arc<Executor>,
        auditor: Arc<Auditor>,
        segmenter: RequestSegmenter,
        dispatcher: Arc<ToolDispatcher>,
        context: SharedContext,
        bus: AgentBus,
        events: EventStream,
        checkpoints: Arc<CheckpointStore>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let (user_response_tx, user_responses) = mpsc::channel(8);
        Arc::new(Self {
            strategist,
            executor,
            auditor,
            segmenter,
            dispatcher,
            context,
            bus,
            events,
            checkpoints,
            settings,
            cancel: CancellationToken::new(),
            user_response_tx,
            user_responses: tokio::sync::Mutex::new(user_responses),
            state: std::sync::Mutex::new(OrchestratorState::Idle),
        })
    }

    /// Channel for delivering user answers to consent prompts.
    pub fn user_response_sender(&self) -> mpsc::Sender<String> {
        self.user_response_tx.clone()
    }

    /// Cancellation is honored between steps, never mid-tool-call.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(OrchestratorState::Idle)
    }

    fn set_state(&self, state: OrchestratorState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
        self.events.publish(OrchestratorEvent::StateChanged {
            state: state.as_str().to_string(),
        });
    }

    /// Entry point for one user request. Resumes from a checkpoint when a
    /// restart is pending.
    pub async fn process_request(&self, request: &str, history: &[String]) -> SessionReport {
        let (session_id, prior_results) = match self.checkpoints.take_restart_pending() {
            Some(pending) => {
                tracing::info!(session = %pending.session_id, reason = %pending.reason, "Resuming session");
                let results = self.checkpoints.load_steps(&pending.session_id);
                (pending.session_id, results)
            }
            None => (uuid::Uuid::new_v4().to_string(), Vec::new()),
        };

        let mut report = SessionReport {
            session_id: session_id.clone(),
            ..Default::default()
        };

        self.set_state(OrchestratorState::Classifying);
        let segments = self.segmenter.split_request(request, history, None).await;
        tracing::info!(count = segments.len(), "Dispatching segments");

        for (index, segment) in segments.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancelled between segments");
                break;
            }
            self.events.publish(OrchestratorEvent::SegmentStarted {
                index,
                mode: segment.mode.as_str().to_string(),
                text: segment.text.clone(),
            });

            match segment.mode {
                Mode::Chat | Mode::DeepChat | Mode::Recall | Mode::Status => {
                    let reply = self
                        .strategist
                        .chat(&segment.text, &segment.profile, history)
                        .await;
                    self.events.publish(OrchestratorEvent::Reply {
                        content: reply.clone(),
                    });
                    report.replies.push(reply);
                }
                Mode::SoloTask => {
                    let reply = self
                        .strategist
                        .solo_with_tools(
                            &segment.text,
                            &segment.profile,
                            self.settings.chat_turn_limit,
                        )
                        .await;
                    self.events.publish(OrchestratorEvent::Reply {
                        content: reply.clone(),
                    });
                    report.replies.push(reply);
                }
                Mode::Task | Mode::Development => {
                    self.run_trinity(&session_id, segment, request, &prior_results, &mut report)
                        .await;
                    if report.failed {
                        break;
                    }
                }
            }
            self.context.clear_segment(&format!("segment_{index}")).await;
        }

        if !report.failed {
            self.set_state(OrchestratorState::Idle);
        }
        report
    }

    /// The full plan -> verify -> execute loop for one segment.
    async fn run_trinity(
        &self,
        session_id: &str,
        segment: &RequestSegment,
        request: &str,
        prior_results: &[StepResult],
        report: &mut SessionReport,
    ) {
        let goal_text = if segment.profile.enriched_request.is_empty() {
            segment.text.clone()
        } else {
            segment.profile.enriched_request.clone()
        };

        // PLANNING with bounded replans driven by the auditor.
        self.set_state(OrchestratorState::Planning);
        let mut plan = match self
            .strategist
            .create_plan(&goal_text, &segment.profile, None)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(error = %e, "Planning failed");
                self.fail_session(session_id, report, &format!("planning failed: {e}"));
                return;
            }
        };

        self.set_state(OrchestratorState::VerifyingPlan);
        let mut replans = 0u32;
        loop {
            let verification = self.auditor.verify_plan(&plan, request, true).await;
            self.events.voice("auditor", &verification.voice_message);
            if verification.verified {
                break;
            }
            if let Some(fixed) = verification.fixed_plan {
                tracing::info!("Adopting auditor-fixed plan");
                plan = fixed;
                break;
            }

            let critique = self
                .strategist
                .assess_plan_critique(&plan, &verification.description)
                .await;
            if critique.action == CritiqueAction::Dispute
                && critique.confidence >= DISPUTE_CONFIDENCE_THRESHOLD
            {
                tracing::info!(
                    confidence = critique.confidence,
                    "Strategist dispute accepted, proceeding with the plan"
                );
                break;
            }

            if replans >= self.settings.replan_limit {
                self.fail_session(session_id, report, "plan rejected after replan limit");
                return;
            }
            replans += 1;
            self.set_state(OrchestratorState::Planning);
            let feedback = format!(
                "{}\nIssues: {}",
                verification.description,
                verification.issues.join("; ")
            );
            plan = match self
                .strategist
                .create_plan(&goal_text, &segment.profile, Some(&feedback))
                .await
            {
                Ok(plan) => plan,
                Err(e) => {
                    self.fail_session(session_id, report, &format!("replanning failed: {e}"));
                    return;
                }
            };
            self.set_state(OrchestratorState::VerifyingPlan);
        }

        // EXECUTING, strictly in order. Completed prior steps are skipped on
        // resume with identical results.
        self.set_state(OrchestratorState::Executing);
        self.context.set_goal(&plan.goal).await;
        let mut results: Vec<StepResult> = Vec::new();

        for step in &plan.steps {
            if self.cancel.is_cancelled() {
                tracing::info!(step = step.id, "Cancelled before step");
                if let Err(e) = self.checkpoints.set_restart_pending(session_id, "cancelled") {
                    tracing::warn!(error = %e, "Failed to flag restart");
                }
                report.step_results.append(&mut results);
                return;
            }

            if let Some(prior) = prior_results.iter().find(|r| r.step_id == step.id && r.success)
            {
                tracing::info!(step = step.id, "Skipping step completed before restart");
                results.push(prior.clone());
                continue;
            }

            self.events.publish(OrchestratorEvent::StepStarted {
                step_id: step.id,
                action: step.action.clone(),
            });
            self.events.voice("executor", &step.voice_action);

            let result = self
                .run_step_with_recovery(session_id, step, &plan.goal)
                .await;
            if !result.success {
                self.events.voice(
                    "executor",
                    result
                        .voice_message
                        .as_deref()
                        .unwrap_or("Крок не вдалося завершити."),
                );
            }
            results.push(result);
        }

        // EVALUATING: the strategist's verdict is authoritative.
        self.set_state(OrchestratorState::Evaluating);
        let evaluation = self
            .strategist
            .evaluate_execution(&plan.goal, &plan.steps, &results)
            .await;
        if evaluation.should_remember {
            let stored = self
                .dispatcher
                .resolve_and_dispatch(
                    Some("store"),
                    json!({
                        "content": format!("Task: {}\nReport: {}", plan.goal, evaluation.final_report),
                        "tags": ["task_summary"],
                    }),
                    Some("memory"),
                )
                .await;
            if !stored.success {
                tracing::debug!("Memory write skipped");
            }
        }
        self.events.publish(OrchestratorEvent::Reply {
            content: evaluation.final_report.clone(),
        });
        report.replies.push(evaluation.final_report.clone());
        report.failed = !evaluation.achieved && evaluation.quality_score < 0.3;
        report.step_results.append(&mut results);
        report.evaluations.push(evaluation);
    }

    /// One step through the attempt/verify/recover ladder.
    async fn run_step_with_recovery(
        &self,
        session_id: &str,
        step: &PlanStep,
        goal: &str,
    ) -> StepResult {
        let mut current_step = step.clone();
        let mut attempt = 1u32;
        let mut reexecutions = 0u32;

        loop {
            let result = self
                .executor
                .execute_step(session_id, &current_step, attempt, goal)
                .await;

            match result.outcome() {
                StepOutcome::Success => {
                    let verification = self
                        .auditor
                        .verify_step(&current_step, &result, goal)
                        .await;
                    self.events.voice("auditor", &verification.voice_message);
                    if verification.verified {
                        return result;
                    }
                    if attempt >= self.settings.max_step_attempts {
                        let mut failed = result;
                        failed.success = false;
                        failed.error = Some(format!(
                            "verification rejected: {}",
                            verification.issues.join("; ")
                        ));
                        return failed;
                    }
                    self.set_state(OrchestratorState::Recovery);
                    self.recover(
                        session_id,
                        &current_step,
                        goal,
                        &verification.description,
                        Some(&verification.issues.join("; ")),
                    )
                    .await;
                    attempt += 1;
                    self.set_state(OrchestratorState::Executing);
                }
                StepOutcome::NeedInput => {
                    reexecutions += 1;
                    if reexecutions > MAX_REEXECUTIONS {
                        return result;
                    }
                    let question = result
                        .voice_message
                        .clone()
                        .unwrap_or_else(|| current_step.action.clone());
                    let answer = self.await_user_answer(&question, goal).await;
                    self.bus.send(
                        AgentId::Executor,
                        BusMessage::new(
                            AgentId::Orchestrator,
                            BusPayload::UserResponse { content: answer },
                        ),
                    );
                    self.set_state(OrchestratorState::Executing);
                }
                StepOutcome::ProactiveHelp => {
                    reexecutions += 1;
                    if reexecutions > MAX_REEXECUTIONS {
                        return result;
                    }
                    self.route_help_requests(goal).await;
                }
                StepOutcome::Deviation => {
                    let info = result.deviation_info.clone().unwrap_or(json!({}));
                    let decision = self.strategist.evaluate_deviation(&current_step, &info).await;
                    if decision.approved && decision.skip {
                        tracing::info!(step = step.id, "Deviation approved: skipping step");
                        let mut skipped = result;
                        skipped.success = true;
                        skipped.error = None;
                        skipped.result = "step skipped per approved deviation".to_string();
                        return skipped;
                    }
                    if decision.approved {
                        if let Some(mut alternative) = decision.alternative {
                            alternative.id = current_step.id;
                            tracing::info!(step = step.id, "Deviation approved: substituting step");
                            current_step = alternative;
                            attempt = 1;
                            continue;
                        }
                    }
                    if attempt >= self.settings.max_step_attempts {
                        return result;
                    }
                    self.set_state(OrchestratorState::Recovery);
                    self.recover(session_id, &current_step, goal, "deviation rejected", None)
                        .await;
                    attempt += 1;
                    self.set_state(OrchestratorState::Executing);
                }
                StepOutcome::Failure(kind) => {
                    if attempt >= self.settings.max_step_attempts {
                        return result;
                    }
                    tracing::info!(step = step.id, ?kind, attempt, "Step failed, entering recovery");
                    self.set_state(OrchestratorState::Recovery);
                    self.recover(
                        session_id,
                        &current_step,
                        goal,
                        result.error.as_deref().unwrap_or("unknown failure"),
                        None,
                    )
                    .await;
                    attempt += 1;
                    self.set_state(OrchestratorState::Executing);
                }
            }
        }
    }

    /// AWAITING_INPUT: wait for the user, then decide autonomously.
    async fn await_user_answer(&self, question: &str, goal: &str) -> String {
        self.set_state(OrchestratorState::AwaitingInput);
        self.events.publish(OrchestratorEvent::UserPrompt {
            question: question.to_string(),
        });

        let timeout = std::time::Duration::from_secs(self.settings.consent_timeout_secs);
        let mut receiver = self.user_responses.lock().await;
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(answer)) => answer,
            _ => {
                tracing::info!("Consent timeout, deciding on the user's behalf");
                let answer = self.strategist.decide_for_user(question, goal).await;
                self.events.voice("strategist", &format!("Вирішую сама: {answer}"));
                answer
            }
        }
    }

    /// Answer queued executor questions through the strategist.
    async fn route_help_requests(&self, goal: &str) {
        for message in self.bus.drain(AgentId::Strategist) {
            if let BusPayload::HelpRequest { step_id, question } = message.payload {
                let answer = self.strategist.decide_for_user(&question, goal).await;
                self.bus.send(
                    AgentId::Executor,
                    BusMessage::new(
                        AgentId::Strategist,
                        BusPayload::Response {
                            step_id,
                            content: answer,
                        },
                    ),
                );
            }
        }
    }

    /// RECOVERY ladder: strategist suggestion, immediate discovery steps,
    /// gated self-heal fix.
    async fn recover(
        &self,
        session_id: &str,
        step: &PlanStep,
        goal: &str,
        error: &str,
        rejection_report: Option<&str>,
    ) {
        let suggestion = self
            .strategist
            .help_executor(step, error, rejection_report)
            .await;

        for discovery in &suggestion.intermediate_steps {
            tracing::info!(action = %discovery.action, "Running discovery step");
            self.events.voice("executor", &discovery.voice_action);
            let _ = self
                .executor
                .execute_step(session_id, discovery, 1, goal)
                .await;
        }

        if let Some(fix) = &suggestion.fix_call {
            let is_self_heal = fix.server == "vibe" || fix.tool.starts_with("vibe_");
            if is_self_heal {
                let description = format!("{}.{} args={}", fix.server, fix.tool, fix.args);
                let audit_ok = self.auditor.audit_vibe_fix(&description, step).await;
                let healing = self
                    .strategist
                    .evaluate_healing_strategy(&format!(
                        "STEP: {}\nERROR: {error}\nPROPOSED FIX: {description}\nAUDIT APPROVED: {audit_ok}",
                        step.action
                    ))
                    .await;
                match healing {
                    HealingDecision::Proceed if audit_ok => {}
                    HealingDecision::Proceed | HealingDecision::Pivot => {
                        tracing::info!("Self-heal fix skipped");
                        return;
                    }
                    HealingDecision::Abort => {
                        tracing::warn!("Self-heal aborted by strategist");
                        return;
                    }
                }
            }
            let fixed = self
                .dispatcher
                .resolve_and_dispatch(Some(&fix.tool), fix.args.clone(), Some(&fix.server))
                .await;
            tracing::info!(success = fixed.success, tool = %fix.tool, "Recovery fix executed");
        }
    }

    fn fail_session(&self, session_id: &str, report: &mut SessionReport, reason: &str) {
        tracing::error!(session = %session_id, reason, "Session failed");
        self.events.publish(OrchestratorEvent::Error {
            message: reason.to_string(),
        });
        // Checkpoints are retained for diagnostics.
        report.failed = true;
        self.set_state(OrchestratorState::Failed);
    }
}

/// Stop a plan between steps by flagging a pending restart; the next
/// `process_request` resumes from the checkpointed results.
pub fn request_restart(checkpoints: &CheckpointStore, session_id: &str, reason: &str) {
    if let Err(e) = checkpoints.set_restart_pending(session_id, reason) {
        tracing::warn!(error = %e, "Failed to set restart_pending");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::auditor::Auditor;
    use crate::agents::executor::Executor;
    use crate::agents::strategist::Strategist;
    use crate::context::MapState;
    use crate::dispatch::ToolTransport;
    use crate::mcp::{CallOutcome, ExecutionLog};
    use crate::registry::SchemaRegistry;
    use crate::reports::ReportWriter;
    use crate::routing::ModeRouter;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use triad_config::{LanguageConfig, SecurityConfig, SegmentationConfig};
    use triad_provider::{ChatRequest, ChatResponse, LlmClient, LlmTier, Usage};

    struct KeyedLlm {
        rules: Vec<(&'static str, String)>,
    }

    #[async_trait]
    impl LlmClient for KeyedLlm {
        fn name(&self) -> &str {
            "keyed"
        }

        fn model_name(&self, _tier: LlmTier) -> String {
            "keyed".to_string()
        }

        async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatResponse> {
            let haystack: String = request
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            for (key, reply) in &self.rules {
                if haystack.contains(key) {
                    return Ok(ChatResponse {
                        content: reply.clone(),
                        model: "keyed".to_string(),
                        usage: Usage::default(),
                    });
                }
            }
            anyhow::bail!("no scripted reply for request")
        }
    }

    /// Routes sequential-thinking calls by thought content; counts verdict
    /// requests so tests can fail the first N verifications.
    struct TrinityTransport {
        verdict_calls: AtomicU32,
        fail_verdicts: u32,
    }

    #[async_trait]
    impl ToolTransport for TrinityTransport {
        async fn call(&self, _server: &str, tool: &str, args: Value) -> CallOutcome {
            if tool == "sequentialthinking" {
                let thought = args["thought"].as_str().unwrap_or_default();
                let output = if thought.contains("Simulate executing this request") {
                    "The request is clear; open the editor.".to_string()
                } else if thought.contains("Audit this plan") {
                    "All realms valid.\nCONFIDENCE: 0.95".to_string()
                } else if thought.contains("Simulate this plan against") {
                    "VERDICT: APPROVED\nCORE PROBLEMS:\nNone\nFEEDBACK:\nplan is sound\nSUMMARY:\nдобре"
                        .to_string()
                } else if thought.contains("decide how to verify") {
                    serde_json::json!({
                        "purpose": "confirm the app is running",
                        "tools": [{"server": "macos-use", "tool": "execute_command",
                                   "args": {"command": "pgrep TextEdit"}}]
                    })
                    .to_string()
                } else if thought.contains("Form a verification verdict") {
                    let n = self.verdict_calls.fetch_add(1, Ordering::SeqCst);
                    if n < self.fail_verdicts {
                        "VERDICT: FAILED\nCONFIDENCE: 0.2\nREASONING: nothing on screen\nISSUES:\n- window not found"
                            .to_string()
                    } else {
                        "VERDICT: CONFIRMED\nCONFIDENCE: 0.9\nREASONING: process found".to_string()
                    }
                } else {
                    "ok".to_string()
                };
                return CallOutcome {
                    success: true,
                    output,
                    ..Default::default()
                };
            }
            CallOutcome {
                success: true,
                output: match tool {
                    "execute_command" => "done".to_string(),
                    _ => String::new(),
                },
                ..Default::default()
            }
        }

        fn is_internal(&self, _server: &str) -> bool {
            false
        }
    }

    fn plan_reply(requires_user_input: bool) -> String {
        serde_json::json!({
            "goal": "відкрити TextEdit і написати привіт",
            "steps": [{
                "id": 1,
                "action": if requires_user_input {
                    "приготуй каву яку попросив користувач"
                } else {
                    "open TextEdit and type привіт"
                },
                "voice_action": "Відкриваю застосунок",
                "expected_result": "TextEdit відкрито",
                "realm": "macos-use",
                "tool": "execute_command",
                "args": {"command": "open -a TextEdit"},
                "requires_user_input": requires_user_input
            }]
        })
        .to_string()
    }

    fn monologue_reply() -> String {
        serde_json::json!({
            "thought": "running the command",
            "proposed_action": {
                "tool": "execute_command",
                "args": {"command": "open -a TextEdit"},
                "server": "macos-use"
            },
            "voice_message": "Відкриваю застосунок",
            "question_to_strategist": null
        })
        .to_string()
    }

    fn evaluation_reply() -> String {
        serde_json::json!({
            "achieved": true,
            "quality_score": 0.9,
            "should_remember": false,
            "final_report": "Завдання виконано успішно."
        })
        .to_string()
    }

    fn build_orchestrator(
        rules: Vec<(&'static str, String)>,
        transport: Arc<TrinityTransport>,
        dir: &std::path::Path,
        settings: OrchestratorSettings,
    ) -> Arc<Orchestrator> {
        let llm: Arc<dyn LlmClient> = Arc::new(KeyedLlm { rules });
        let registry = Arc::new(SchemaRegistry::embedded());
        let router = Arc::new(ModeRouter::default());
        let context = SharedContext::new();
        let bus = AgentBus::new();
        let events = EventStream::new();
        let exec_log = ExecutionLog::new();
        let checkpoints = Arc::new(CheckpointStore::new(&dir.join("checkpoints")));
        let dispatcher = ToolDispatcher::new(
            transport,
            registry.clone(),
            MapState::new(),
            context.clone(),
        );
        let language = LanguageConfig::default();

        let strategist = Strategist::new(
            llm.clone(),
            dispatcher.clone(),
            router.clone(),
            registry.clone(),
            language.clone(),
        );
        let executor = Executor::new(
            llm.clone(),
            dispatcher.clone(),
            registry.clone(),
            context.clone(),
            bus.clone(),
            events.clone(),
            exec_log.clone(),
            checkpoints.clone(),
            settings.clone(),
            language.clone(),
        );
        let auditor = Auditor::new(
            llm,
            dispatcher.clone(),
            bus.clone(),
            ReportWriter::new(&dir.join("reports")),
            exec_log,
            SecurityConfig::default(),
            language,
        );
        let segmenter =
            RequestSegmenter::new(router.clone(), None, SegmentationConfig::default());

        Orchestrator::new(
            strategist,
            executor,
            auditor,
            segmenter,
            dispatcher,
            context,
            bus,
            events,
            checkpoints,
            settings,
        )
    }

    #[tokio::test]
    async fn test_trinity_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TrinityTransport {
            verdict_calls: AtomicU32::new(0),
            fail_verdicts: 0,
        });
        let orchestrator = build_orchestrator(
            vec![
                ("Produce an execution plan", plan_reply(false)),
                ("internal monologue", monologue_reply()),
                ("Evaluate whether the goal was achieved", evaluation_reply()),
                ("Compare the step to the global goal",
                 serde_json::json!({"aligned": true, "confidence": 0.9, "alternative_action": null}).to_string()),
            ],
            transport,
            dir.path(),
            OrchestratorSettings::default(),
        );

        let report = orchestrator
            .process_request("відкрий TextEdit і напиши привіт", &[])
            .await;

        assert!(!report.failed);
        assert_eq!(report.step_results.len(), 1);
        assert!(report.step_results[0].success);
        assert_eq!(report.evaluations.len(), 1);
        assert!(report.evaluations[0].achieved);
        assert_eq!(report.replies.last().unwrap(), "Завдання виконано успішно.");
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_trinity_recovers_from_rejected_verification() {
        let dir = tempfile::tempdir().unwrap();
        // First verdict fails, the retry confirms.
        let transport = Arc::new(TrinityTransport {
            verdict_calls: AtomicU32::new(0),
            fail_verdicts: 1,
        });
        let orchestrator = build_orchestrator(
            vec![
                ("Produce an execution plan", plan_reply(false)),
                ("internal monologue", monologue_reply()),
                ("Evaluate whether the goal was achieved", evaluation_reply()),
                ("Compare the step to the global goal",
                 serde_json::json!({"aligned": true, "confidence": 0.9, "alternative_action": null}).to_string()),
                ("The executor is stuck",
                 serde_json::json!({"fix_tool_call": null, "intermediate_steps": [], "note": "retry with focus"}).to_string()),
            ],
            transport.clone(),
            dir.path(),
            OrchestratorSettings::default(),
        );

        let report = orchestrator
            .process_request("відкрий TextEdit і напиши привіт", &[])
            .await;

        assert!(!report.failed);
        assert_eq!(report.step_results.len(), 1);
        assert!(report.step_results[0].success);
        // Two verdicts were formed: the rejection and the confirmation.
        assert_eq!(transport.verdict_calls.load(Ordering::SeqCst), 2);
        // The rejection left a report on disk.
        let reports: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
            .unwrap()
            .collect();
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn test_consent_timeout_triggers_autonomous_decision() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TrinityTransport {
            verdict_calls: AtomicU32::new(0),
            fail_verdicts: 0,
        });
        let settings = OrchestratorSettings {
            consent_timeout_secs: 0,
            ..Default::default()
        };
        let orchestrator = build_orchestrator(
            vec![
                ("Produce an execution plan", plan_reply(true)),
                ("The user is away", "Еспресо.".to_string()),
                ("USER RESPONSE: Еспресо", monologue_reply()),
                ("Evaluate whether the goal was achieved", evaluation_reply()),
                ("Compare the step to the global goal",
                 serde_json::json!({"aligned": true, "confidence": 0.9, "alternative_action": null}).to_string()),
            ],
            transport,
            dir.path(),
            settings,
        );

        let report = orchestrator
            .process_request("відкрий кавоварку і зроби каву", &[])
            .await;

        assert!(!report.failed);
        assert_eq!(report.step_results.len(), 1);
        assert!(report.step_results[0].success, "step should succeed after autonomous answer");
    }

    #[tokio::test]
    async fn test_chat_segment_goes_to_strategist_only() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TrinityTransport {
            verdict_calls: AtomicU32::new(0),
            fail_verdicts: 0,
        });
        let orchestrator = build_orchestrator(
            vec![("You are a helpful assistant", "Привіт! Як справи?".to_string())],
            transport,
            dir.path(),
            OrchestratorSettings::default(),
        );

        let report = orchestrator.process_request("привіт", &[]).await;
        assert_eq!(report.replies, vec!["Привіт! Як справи?"]);
        assert!(report.step_results.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_segments() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TrinityTransport {
            verdict_calls: AtomicU32::new(0),
            fail_verdicts: 0,
        });
        let orchestrator = build_orchestrator(vec![], transport, dir.path(), OrchestratorSettings::default());
        orchestrator.cancel_token().cancel();
        let report = orchestrator.process_request("відкрий TextEdit", &[]).await;
        assert!(report.step_results.is_empty());
        assert!(report.replies.is_empty());
    }
}
