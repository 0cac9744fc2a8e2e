use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: PlanStatus,
    /// Free-form planning context carried for diagnostics and resumption.
    #[serde(default)]
    pub context: serde_json::Value,
}

impl TaskPlan {
    pub fn new(goal: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            steps,
            created_at: Utc::now(),
            status: PlanStatus::Pending,
            context: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable within the plan.
    #[serde(default)]
    pub id: u32,
    /// Imperative technical action.
    #[serde(default)]
    pub action: String,
    /// Human-facing phrase in the target natural language.
    #[serde(default)]
    pub voice_action: String,
    #[serde(default)]
    pub expected_result: String,
    /// Target server name ("realm" in plan JSON).
    #[serde(default)]
    pub realm: String,
    /// Preferred tool name, if the planner committed to one.
    #[serde(default)]
    pub tool: Option<String>,
    /// Partial arguments; the executor completes them.
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub requires_consent: bool,
    #[serde(default)]
    pub requires_user_input: bool,
    #[serde(default)]
    pub requires_vision: bool,
    /// Explicit artifacts this step claims to produce; takes precedence over
    /// regex extraction during final evaluation.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub server: String,
    pub tool: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: u32,
    pub success: bool,
    /// Textual tool output, possibly truncated.
    pub result: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    /// Agent rationale for the chosen action.
    #[serde(default)]
    pub thought: Option<String>,
    /// The agent proposed a deliberate strategy change.
    #[serde(default)]
    pub is_deviation: bool,
    #[serde(default)]
    pub deviation_info: Option<serde_json::Value>,
    #[serde(default)]
    pub screenshot_path: Option<String>,
    #[serde(default)]
    pub voice_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub const ERR_NEED_USER_INPUT: &str = "need_user_input";
pub const ERR_PROACTIVE_HELP: &str = "proactive_help_requested";

impl StepResult {
    pub fn failed(step_id: u32, error: impl Into<String>) -> Self {
        Self {
            step_id,
            success: false,
            result: String::new(),
            error: Some(error.into()),
            tool_call: None,
            thought: None,
            is_deviation: false,
            deviation_info: None,
            screenshot_path: None,
            voice_message: None,
            timestamp: Utc::now(),
        }
    }

    /// Classify this result for the orchestrator loop.
    pub fn outcome(&self) -> StepOutcome {
        if self.success {
            return StepOutcome::Success;
        }
        if self.is_deviation {
            return StepOutcome::Deviation;
        }
        match self.error.as_deref() {
            Some(ERR_NEED_USER_INPUT) => StepOutcome::NeedInput,
            Some(ERR_PROACTIVE_HELP) => StepOutcome::ProactiveHelp,
            _ => StepOutcome::Failure(FailureKind::from_error(self.error.as_deref())),
        }
    }
}

/// What the orchestrator does next after a step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    NeedInput,
    ProactiveHelp,
    Deviation,
    Failure(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Hallucinated,
    UnknownTool,
    Compatibility,
    Validation,
    Transient,
    EmptyProof,
    Blocked,
    ToolError,
}

impl FailureKind {
    pub fn from_error(error: Option<&str>) -> Self {
        let Some(error) = error else {
            return FailureKind::ToolError;
        };
        let lower = error.to_lowercase();
        if lower.contains("does not exist") || lower.contains("hallucinated") {
            FailureKind::Hallucinated
        } else if lower.contains("could not resolve server") || lower.contains("unknown tool") {
            FailureKind::UnknownTool
        } else if lower.contains("compatibility") {
            FailureKind::Compatibility
        } else if lower.contains("invalid arguments") || lower.contains("missing required") {
            FailureKind::Validation
        } else if lower.contains("timeout")
            || lower.contains("connection refused")
            || lower.contains("broken pipe")
            || lower.contains("rate limit")
            || lower.contains("connection reset")
        {
            FailureKind::Transient
        } else if lower.contains("empty output") || lower.contains("no data returned") {
            FailureKind::EmptyProof
        } else if lower.contains("blocked") || lower.contains("destructive") {
            FailureKind::Blocked
        } else {
            FailureKind::ToolError
        }
    }

    /// Hard failures should not be retried with the same tool call.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            FailureKind::Hallucinated | FailureKind::Blocked | FailureKind::UnknownTool
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub step_id: u32,
    pub verified: bool,
    /// 0.0..=1.0
    pub confidence: f64,
    pub description: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub voice_message: String,
    /// Only set when verifying a whole plan and a repaired plan was produced.
    #[serde(default)]
    pub fixed_plan: Option<TaskPlan>,
    #[serde(default)]
    pub screenshot_analyzed: bool,
}

impl VerificationResult {
    pub fn rejected(step_id: u32, description: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            step_id,
            verified: false,
            confidence: 0.2,
            description: description.into(),
            issues,
            voice_message: String::new(),
            fixed_plan: None,
            screenshot_analyzed: false,
        }
    }
}
