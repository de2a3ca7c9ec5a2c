// 存储模块：统一封装内存与 Postgres 两种后端的调度状态读写。

mod memory;
mod postgres;

use crate::config::Config;
use crate::model::{
    Agent, AuthCode, Chain, ChainStatus, Channel, ClaudeStatus, Event, Task, TaskInput, TaskStatus,
    User,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not_found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("no_queued_tasks")]
    NoQueuedTasks,
    #[error("no_pending_inputs")]
    NoPendingInputs,
    /// Missing or malformed request field, carrying a machine-readable code
    /// such as `channel_id_required`.
    #[error("{0}")]
    Invalid(String),
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn invalid(code: &str) -> Self {
        StoreError::Invalid(code.to_string())
    }
}

/// Heartbeat upsert: empty/absent fields preserve the stored values, the
/// `last_seen` stamp always refreshes.
#[derive(Debug, Clone, Default)]
pub struct UpsertAgentRequest {
    pub agent_id: String,
    pub user_id: String,
    pub name: String,
    pub status: Option<ClaudeStatus>,
    pub claude_status: Option<ClaudeStatus>,
    pub current_task_id: String,
    pub meta: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: String,
    pub channel_id: String,
    pub chain_id: String,
    pub status: Option<TaskStatus>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub user_id: String,
    pub agent_id: String,
    pub task_id: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimTaskRequest {
    pub user_id: String,
    pub agent_id: String,
    pub channel_id: String,
    pub channel: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct AssignTaskRequest {
    pub task_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteTaskRequest {
    pub task_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct FailTaskRequest {
    pub task_id: String,
    pub agent_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DetachAgentFromChainRequest {
    pub chain_id: String,
    pub agent_id: String,
}

/// Patch update: `None` preserves the stored value. The owner is the only
/// field where clearing is meaningful, hence `Some(String::new())` releases
/// ownership explicitly.
#[derive(Debug, Clone, Default)]
pub struct UpdateChainRequest {
    pub chain_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ChainStatus>,
    pub owner_agent_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateTaskInputRequest {
    pub task_id: String,
    pub agent_id: String,
    pub kind: String,
    pub text: String,
    pub send_enter: bool,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimTaskInputRequest {
    pub task_id: String,
    pub agent_id: String,
}

/// Transactional state engine. Every operation is atomic and linearizable
/// with respect to the other operations of the same tenant; the memory
/// backend serializes behind one mutex, the Postgres backend behind
/// row-locking transactions.
pub trait Store: Send + Sync {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError>;
    fn get_user_by_username(&self, username: &str) -> Result<User, StoreError>;
    fn get_user_by_id(&self, id: &str) -> Result<User, StoreError>;
    fn create_auth_code(&self, code: AuthCode) -> Result<(), StoreError>;
    fn consume_auth_code(&self, code: &str) -> Result<AuthCode, StoreError>;

    fn upsert_agent(&self, req: UpsertAgentRequest) -> Result<Agent, StoreError>;
    fn get_agent(&self, id: &str) -> Result<Agent, StoreError>;
    fn list_agents(&self, user_id: &str) -> Result<Vec<Agent>, StoreError>;

    fn create_channel(&self, channel: Channel) -> Result<Channel, StoreError>;
    fn list_channels(&self, user_id: &str) -> Result<Vec<Channel>, StoreError>;
    fn get_channel_by_name(&self, user_id: &str, name: &str) -> Result<Channel, StoreError>;

    fn create_chain(&self, chain: Chain) -> Result<Chain, StoreError>;
    fn get_chain(&self, id: &str) -> Result<Chain, StoreError>;
    fn list_chains(&self, user_id: &str, channel_id: &str) -> Result<Vec<Chain>, StoreError>;
    fn update_chain(&self, req: UpdateChainRequest) -> Result<Chain, StoreError>;
    fn delete_chain(&self, id: &str) -> Result<(), StoreError>;
    fn detach_agent_from_chain(&self, req: DetachAgentFromChainRequest) -> Result<(), StoreError>;

    fn create_task(&self, task: Task) -> Result<Task, StoreError>;
    fn get_task(&self, id: &str) -> Result<Task, StoreError>;
    fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError>;
    fn claim_task(&self, req: ClaimTaskRequest) -> Result<Task, StoreError>;
    fn assign_task(&self, req: AssignTaskRequest) -> Result<Task, StoreError>;
    fn complete_task(&self, req: CompleteTaskRequest) -> Result<Task, StoreError>;
    fn fail_task(&self, req: FailTaskRequest) -> Result<Task, StoreError>;
    fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<Task, StoreError>;

    fn create_event(&self, event: Event) -> Result<Event, StoreError>;
    fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>, StoreError>;
    fn purge_events_before(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    fn create_task_input(&self, req: CreateTaskInputRequest) -> Result<TaskInput, StoreError>;
    fn claim_task_input(&self, req: ClaimTaskInputRequest) -> Result<TaskInput, StoreError>;
}

/// 根据配置选择后端：设置了数据库地址则用 Postgres，否则用内存实现。
pub fn build_store(config: &Config) -> Result<Arc<dyn Store>> {
    if config.database_url.is_empty() {
        info!("using memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PostgresStore::new(config.database_url.clone())?;
    store.ensure_initialized()?;
    info!("using postgres store");
    Ok(Arc::new(store))
}
