// 领域模型：所有实体按 user_id 分租户。
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeStatus {
    #[default]
    Idle,
    Running,
    Waiting,
}

impl ClaudeStatus {
    pub fn parse(raw: &str) -> Option<ClaudeStatus> {
        match raw {
            "idle" => Some(ClaudeStatus::Idle),
            "running" => Some(ClaudeStatus::Running),
            "waiting" => Some(ClaudeStatus::Waiting),
            _ => None,
        }
    }
}

/// Worker process liveness, derived from `last_seen` at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    InProgress,
    Locked,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Locked => "locked",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskStatus> {
        match raw {
            "queued" => Some(TaskStatus::Queued),
            "in_progress" => Some(TaskStatus::InProgress),
            "locked" => Some(TaskStatus::Locked),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    #[default]
    Queued,
    InProgress,
    Locked,
    Done,
    Failed,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Queued => "queued",
            ChainStatus::InProgress => "in_progress",
            ChainStatus::Locked => "locked",
            ChainStatus::Done => "done",
            ChainStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<ChainStatus> {
        match raw {
            "queued" => Some(ChainStatus::Queued),
            "in_progress" => Some(ChainStatus::InProgress),
            "locked" => Some(ChainStatus::Locked),
            "done" => Some(ChainStatus::Done),
            "failed" => Some(ChainStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    AcceptEdits,
    PlanMode,
    BypassPermission,
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCode {
    pub code: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_name: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    pub name: String,
    /// Legacy mirror of `claude_status`, kept for older workers.
    pub status: ClaudeStatus,
    pub claude_status: ClaudeStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_task_id: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Online iff the last heartbeat is younger than `threshold`.
    pub fn derived_worker_status(&self, now: DateTime<Utc>, threshold: Duration) -> WorkerStatus {
        if now - self.last_seen < threshold {
            WorkerStatus::Online
        } else {
            WorkerStatus::Offline
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    pub channel_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub status: ChainStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    pub channel_id: String,
    pub chain_id: String,
    /// 1-based position within the chain, unique per chain.
    pub sequence: i32,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "type")]
    pub task_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_session_request_token: String,
    pub status: TaskStatus,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assigned_agent_id: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub send_enter: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

pub const TASK_TYPE_SESSION_REQUEST: &str = "request_claude_session";
pub const EVENT_SESSION_REQUEST_COMPLETED: &str = "agent.automation.session_request.completed";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_status_threshold() {
        let now = Utc::now();
        let mut agent = sample_agent(now);
        assert_eq!(
            agent.derived_worker_status(now, Duration::seconds(30)),
            WorkerStatus::Online
        );
        agent.last_seen = now - Duration::seconds(31);
        assert_eq!(
            agent.derived_worker_status(now, Duration::seconds(30)),
            WorkerStatus::Offline
        );
    }

    #[test]
    fn execution_mode_wire_values() {
        assert_eq!(
            serde_json::to_string(&ExecutionMode::AcceptEdits).unwrap(),
            "\"accept-edits\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionMode::Unspecified).unwrap(),
            "\"\""
        );
        let parsed: ExecutionMode = serde_json::from_str("\"plan-mode\"").unwrap();
        assert_eq!(parsed, ExecutionMode::PlanMode);
    }

    #[test]
    fn task_status_round_trip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Locked,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    fn sample_agent(now: DateTime<Utc>) -> Agent {
        Agent {
            id: "a1".to_string(),
            user_id: "u1".to_string(),
            name: "worker".to_string(),
            status: ClaudeStatus::Idle,
            claude_status: ClaudeStatus::Running,
            current_task_id: String::new(),
            last_seen: now,
            meta: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
