//! Shared types: the on-disk agent record, per-iteration task state, and the
//! permissive JSONL event decoded from backend output.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a supervised agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Terminated,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why a terminated agent stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    Completed,
    Killed,
    Crashed,
    Timeout,
    Error,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Killed => write!(f, "killed"),
            Self::Crashed => write!(f, "crashed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Termination intent injected by external CLI processes. The runner observes
/// this at iteration boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateMode {
    Immediate,
    AfterIteration,
}

/// Which deadline fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutReason {
    Total,
    Iteration,
}

/// One supervised agent, as persisted in the shared state file.
///
/// Progress fields are owned by the runner; the control fields (`iterations`,
/// `model`, `terminate_mode`, `paused`) may be rewritten at any time by other
/// CLI processes and are re-read by the runner at each iteration boundary.
/// `Clone` is a deep copy — every field is owned data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub pid: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    /// Target number of iterations; 0 means unlimited.
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(default)]
    pub successful_iterations: u32,
    #[serde(default)]
    pub failed_iterations: u32,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate_mode: Option<TerminateMode>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_reason: Option<TimeoutReason>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    /// Names of environment variables injected into the backend. Values are
    /// supplied live at spawn and never persisted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_names: Vec<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_task: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub on_complete: String,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl AgentRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            parent_id: None,
            labels: HashMap::new(),
            pid: 0,
            prompt: String::new(),
            model: String::new(),
            started_at: Utc::now(),
            terminated_at: None,
            iterations: 0,
            current_iteration: 0,
            successful_iterations: 0,
            failed_iterations: 0,
            status: AgentStatus::Running,
            exit_reason: None,
            terminate_mode: None,
            paused: false,
            paused_at: None,
            timeout_at: None,
            timeout_reason: None,
            log_file: String::new(),
            working_dir: String::new(),
            env_names: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            total_cost_usd: 0.0,
            current_task: String::new(),
            last_error: String::new(),
            on_complete: String::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }

    /// Wall-clock duration from start to termination (or now, while running).
    pub fn duration_secs(&self) -> i64 {
        let end = self.terminated_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds()
    }
}

/// Per-iteration state of one task in a pipeline run. Reset at the start of
/// every iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskState {
    pub name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TaskState {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error: String::new(),
        }
    }
}

/// A single decoded line of backend JSONL output. Every field is optional;
/// anything the backend omits, nulls, or shapes unexpectedly must not stop
/// the stream.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogEvent {
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub message: Option<LogMessage>,
    #[serde(default)]
    pub text: Option<String>,
    /// Heterogeneous map keyed by tool name; argument shapes vary per tool.
    #[serde(default)]
    pub tool_call: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub usage: Option<UsageFields>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

/// Token counters as backends variously spell them.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UsageFields {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
}

impl UsageFields {
    pub fn input(&self) -> u64 {
        self.input_tokens.or(self.prompt_tokens).unwrap_or(0)
    }

    pub fn output(&self) -> u64 {
        self.output_tokens.or(self.completion_tokens).unwrap_or(0)
    }
}

/// Telemetry accumulated per agent from parsed output. Monotonic: counters
/// only grow, except on explicit reset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
    pub current_task: String,
}
