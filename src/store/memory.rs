// 内存后端：单把互斥锁下完成全部调度决策，作为参照实现。
use super::{
    AssignTaskRequest, ClaimTaskInputRequest, ClaimTaskRequest, CompleteTaskRequest,
    CreateTaskInputRequest, DetachAgentFromChainRequest, EventFilter, FailTaskRequest, Store,
    StoreError, TaskFilter, UpdateChainRequest, UpsertAgentRequest,
};
use crate::ids::new_id;
use crate::model::{
    Agent, AuthCode, Chain, ChainStatus, Channel, ClaudeStatus, Event, Task, TaskInput, TaskStatus,
    User,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::warn;

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    auth_codes: HashMap<String, AuthCode>,
    agents: HashMap<String, Agent>,
    channels: HashMap<String, Channel>,
    chains: HashMap<String, Chain>,
    tasks: HashMap<String, Task>,
    events: HashMap<String, Event>,
    inputs: HashMap<String, TaskInput>,

    claim_idem: HashMap<String, String>,
    input_idem: HashMap<String, String>,
    event_idem: HashSet<String>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    /// Chain status after a terminal completion. Ownership is preserved here;
    /// it is released only by explicit detach or operator intervention.
    fn update_chain_status(&mut self, chain_id: &str, now: DateTime<Utc>) {
        let Some(chain) = self.chains.get(chain_id) else {
            return;
        };
        let mut chain = chain.clone();

        let mut all_terminal = true;
        let mut has_failed = false;
        for task in self.tasks.values().filter(|t| t.chain_id == chain_id) {
            match task.status {
                TaskStatus::Failed => has_failed = true,
                TaskStatus::Done => {}
                _ => all_terminal = false,
            }
        }

        // A failed task halts the whole chain immediately.
        if has_failed {
            chain.status = ChainStatus::Failed;
            chain.updated_at = now;
            self.chains.insert(chain_id.to_string(), chain);
            return;
        }

        if all_terminal {
            chain.status = ChainStatus::Done;
            chain.updated_at = now;
            self.chains.insert(chain_id.to_string(), chain);
        }
    }

    /// Full re-evaluation after operator-driven transitions. Unlike
    /// `update_chain_status`, reaching a terminal state here also releases
    /// ownership.
    fn reevaluate_chain_status(&mut self, chain_id: &str, now: DateTime<Utc>) {
        let Some(chain) = self.chains.get(chain_id) else {
            return;
        };
        let mut chain = chain.clone();

        let mut has_locked = false;
        let mut has_in_progress = false;
        let mut has_queued = false;
        let mut all_terminal = true;
        let mut has_failed = false;
        for task in self.tasks.values().filter(|t| t.chain_id == chain_id) {
            match task.status {
                TaskStatus::Locked => {
                    has_locked = true;
                    all_terminal = false;
                }
                TaskStatus::InProgress => {
                    has_in_progress = true;
                    all_terminal = false;
                }
                TaskStatus::Queued => {
                    has_queued = true;
                    all_terminal = false;
                }
                TaskStatus::Failed => has_failed = true,
                TaskStatus::Done => {}
            }
        }

        if all_terminal {
            chain.owner_agent_id = String::new();
            chain.status = if has_failed {
                ChainStatus::Failed
            } else {
                ChainStatus::Done
            };
        } else if has_locked {
            chain.status = ChainStatus::Locked;
        } else if has_in_progress {
            chain.status = ChainStatus::InProgress;
        } else if has_queued {
            chain.status = ChainStatus::Queued;
        }

        chain.updated_at = now;
        self.chains.insert(chain_id.to_string(), chain);
    }

    fn clear_agent_current_task(&mut self, agent_id: &str, now: DateTime<Utc>) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.current_task_id = String::new();
            agent.updated_at = now;
        }
    }
}

impl Store for MemoryStore {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let mut inner = self.inner.lock();

        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::invalid("username_required"));
        }
        if inner
            .users
            .values()
            .any(|u| u.username.eq_ignore_ascii_case(username))
        {
            return Err(StoreError::Conflict);
        }

        let now = Utc::now();
        let user = User {
            id: new_id(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    fn get_user_by_username(&self, username: &str) -> Result<User, StoreError> {
        let inner = self.inner.lock();
        inner
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_user_by_id(&self, id: &str) -> Result<User, StoreError> {
        let inner = self.inner.lock();
        inner.users.get(id).cloned().ok_or(StoreError::NotFound)
    }

    fn create_auth_code(&self, code: AuthCode) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.auth_codes.insert(code.code.clone(), code);
        Ok(())
    }

    fn consume_auth_code(&self, code: &str) -> Result<AuthCode, StoreError> {
        let mut inner = self.inner.lock();
        let Some(existing) = inner.auth_codes.get(code) else {
            return Err(StoreError::NotFound);
        };
        if existing.used {
            return Err(StoreError::Conflict);
        }
        if Utc::now() > existing.expires_at {
            return Err(StoreError::NotFound);
        }
        let mut consumed = existing.clone();
        consumed.used = true;
        inner.auth_codes.insert(code.to_string(), consumed.clone());
        Ok(consumed)
    }

    fn upsert_agent(&self, req: UpsertAgentRequest) -> Result<Agent, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let agent_id = if req.agent_id.trim().is_empty() {
            new_id()
        } else {
            req.agent_id.trim().to_string()
        };

        if let Some(existing) = inner.agents.get(&agent_id) {
            // Agents never migrate between tenants; a foreign id reads as absent.
            if !req.user_id.is_empty() && existing.user_id != req.user_id {
                return Err(StoreError::NotFound);
            }
            let mut updated = existing.clone();
            if !req.name.trim().is_empty() {
                updated.name = req.name.trim().to_string();
            }
            if let Some(status) = req.status {
                updated.status = status;
            }
            if let Some(claude_status) = req.claude_status {
                updated.claude_status = claude_status;
            }
            if !req.current_task_id.trim().is_empty() {
                updated.current_task_id = req.current_task_id.trim().to_string();
            }
            if let Some(meta) = req.meta {
                updated.meta = meta;
            }
            updated.last_seen = now;
            updated.updated_at = now;
            inner.agents.insert(agent_id, updated.clone());
            return Ok(updated);
        }

        let agent = Agent {
            id: agent_id.clone(),
            user_id: req.user_id,
            name: req.name.trim().to_string(),
            status: req.status.unwrap_or(ClaudeStatus::Idle),
            claude_status: req.claude_status.unwrap_or(ClaudeStatus::Idle),
            current_task_id: req.current_task_id.trim().to_string(),
            last_seen: now,
            meta: req.meta.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        inner.agents.insert(agent_id, agent.clone());
        Ok(agent)
    }

    fn get_agent(&self, id: &str) -> Result<Agent, StoreError> {
        let inner = self.inner.lock();
        inner.agents.get(id).cloned().ok_or(StoreError::NotFound)
    }

    fn list_agents(&self, user_id: &str) -> Result<Vec<Agent>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<Agent> = inner
            .agents
            .values()
            .filter(|a| user_id.is_empty() || a.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(out)
    }

    fn create_channel(&self, channel: Channel) -> Result<Channel, StoreError> {
        let mut inner = self.inner.lock();

        let name = channel.name.trim();
        if name.is_empty() {
            return Err(StoreError::invalid("name_required"));
        }
        if inner
            .channels
            .values()
            .any(|c| c.user_id == channel.user_id && c.name.eq_ignore_ascii_case(name))
        {
            return Err(StoreError::Conflict);
        }

        let created = Channel {
            id: new_id(),
            user_id: channel.user_id,
            name: name.to_string(),
            description: channel.description.trim().to_string(),
            created_at: Utc::now(),
        };
        inner.channels.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    fn list_channels(&self, user_id: &str) -> Result<Vec<Channel>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<Channel> = inner
            .channels
            .values()
            .filter(|c| user_id.is_empty() || c.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    fn get_channel_by_name(&self, user_id: &str, name: &str) -> Result<Channel, StoreError> {
        let inner = self.inner.lock();
        inner
            .channels
            .values()
            .find(|c| {
                (user_id.is_empty() || c.user_id == user_id) && c.name.eq_ignore_ascii_case(name)
            })
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn create_chain(&self, chain: Chain) -> Result<Chain, StoreError> {
        let mut inner = self.inner.lock();

        if chain.channel_id.trim().is_empty() {
            return Err(StoreError::invalid("channel_id_required"));
        }
        if chain.name.trim().is_empty() {
            return Err(StoreError::invalid("name_required"));
        }
        let Some(channel) = inner.channels.get(chain.channel_id.trim()) else {
            return Err(StoreError::NotFound);
        };
        if !chain.user_id.is_empty() && channel.user_id != chain.user_id {
            return Err(StoreError::NotFound);
        }
        let owner_user = channel.user_id.clone();

        let now = Utc::now();
        let created = Chain {
            id: new_id(),
            user_id: owner_user,
            channel_id: chain.channel_id.trim().to_string(),
            name: chain.name.trim().to_string(),
            description: chain.description.trim().to_string(),
            status: chain.status,
            owner_agent_id: chain.owner_agent_id,
            created_at: now,
            updated_at: now,
        };
        inner.chains.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    fn get_chain(&self, id: &str) -> Result<Chain, StoreError> {
        let inner = self.inner.lock();
        inner.chains.get(id).cloned().ok_or(StoreError::NotFound)
    }

    fn list_chains(&self, user_id: &str, channel_id: &str) -> Result<Vec<Chain>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<Chain> = inner
            .chains
            .values()
            .filter(|c| user_id.is_empty() || c.user_id == user_id)
            .filter(|c| channel_id.is_empty() || c.channel_id == channel_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    fn update_chain(&self, req: UpdateChainRequest) -> Result<Chain, StoreError> {
        let mut inner = self.inner.lock();

        let Some(existing) = inner.chains.get(&req.chain_id) else {
            return Err(StoreError::NotFound);
        };
        let mut chain = existing.clone();

        if let Some(name) = req.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            chain.name = name.to_string();
        }
        if let Some(desc) = req
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            chain.description = desc.to_string();
        }
        if let Some(status) = req.status {
            chain.status = status;
        }
        if let Some(owner) = req.owner_agent_id {
            chain.owner_agent_id = owner.trim().to_string();
        }

        chain.updated_at = Utc::now();
        inner.chains.insert(chain.id.clone(), chain.clone());
        Ok(chain)
    }

    fn delete_chain(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.chains.remove(id).is_none() {
            return Err(StoreError::NotFound);
        }
        inner.tasks.retain(|_, t| t.chain_id != id);
        Ok(())
    }

    fn detach_agent_from_chain(&self, req: DetachAgentFromChainRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        let chain_id = req.chain_id.trim();
        let agent_id = req.agent_id.trim();
        if chain_id.is_empty() {
            return Err(StoreError::invalid("chain_id_required"));
        }
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        let Some(chain) = inner.chains.get(chain_id) else {
            return Err(StoreError::NotFound);
        };
        if chain.owner_agent_id != agent_id {
            return Err(StoreError::Conflict);
        }
        let mut chain = chain.clone();

        let now = Utc::now();

        // Any in-flight task is parked; the chain is unclaimable until an
        // operator converts the locked task.
        if let Some(task) = inner
            .tasks
            .values_mut()
            .find(|t| t.chain_id == chain_id && t.status == TaskStatus::InProgress)
        {
            task.status = TaskStatus::Locked;
            task.updated_at = now;
        }

        chain.owner_agent_id = String::new();
        chain.status = ChainStatus::Locked;
        chain.updated_at = now;
        inner.chains.insert(chain_id.to_string(), chain);

        inner.clear_agent_current_task(agent_id, now);
        Ok(())
    }

    fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();

        if task.channel_id.trim().is_empty() {
            return Err(StoreError::invalid("channel_id_required"));
        }
        if task.title.trim().is_empty() {
            return Err(StoreError::invalid("title_required"));
        }
        let Some(channel) = inner.channels.get(task.channel_id.trim()) else {
            return Err(StoreError::NotFound);
        };
        let owner_user = channel.user_id.clone();
        if task.chain_id.trim().is_empty() {
            return Err(StoreError::invalid("chain_id_required"));
        }
        let Some(chain) = inner.chains.get(task.chain_id.trim()) else {
            return Err(StoreError::invalid("chain_id_not_found"));
        };
        if chain.channel_id != task.channel_id.trim() {
            return Err(StoreError::invalid("chain_id_not_found"));
        }
        let chain_id = chain.id.clone();

        let sequence = if task.sequence > 0 {
            task.sequence
        } else {
            inner
                .tasks
                .values()
                .filter(|t| t.chain_id == chain_id)
                .map(|t| t.sequence)
                .max()
                .unwrap_or(0)
                + 1
        };
        if inner
            .tasks
            .values()
            .any(|t| t.chain_id == chain_id && t.sequence == sequence)
        {
            return Err(StoreError::Conflict);
        }

        let now = Utc::now();
        let created = Task {
            id: new_id(),
            user_id: owner_user,
            channel_id: task.channel_id.trim().to_string(),
            chain_id,
            sequence,
            title: task.title.trim().to_string(),
            description: task.description.trim().to_string(),
            task_type: task.task_type.trim().to_string(),
            agent_session_request_token: task.agent_session_request_token,
            status: task.status,
            priority: task.priority,
            assigned_agent_id: String::new(),
            execution_mode: task.execution_mode,
            created_at: now,
            claimed_at: None,
            done_at: None,
            updated_at: now,
        };
        inner.tasks.insert(created.id.clone(), created.clone());

        // Late-arriving work re-arms a finished chain.
        if let Some(chain) = inner.chains.get_mut(&created.chain_id) {
            if chain.status == ChainStatus::Done {
                chain.status = ChainStatus::Queued;
                chain.updated_at = now;
            }
        }

        Ok(created)
    }

    fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        let inner = self.inner.lock();
        inner.tasks.get(id).cloned().ok_or(StoreError::NotFound)
    }

    fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| filter.user_id.is_empty() || t.user_id == filter.user_id)
            .filter(|t| filter.channel_id.is_empty() || t.channel_id == filter.channel_id)
            .filter(|t| filter.chain_id.is_empty() || t.chain_id == filter.chain_id)
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if filter.limit > 0 && out.len() > filter.limit {
            out.truncate(filter.limit);
        }
        Ok(out)
    }

    fn claim_task(&self, req: ClaimTaskRequest) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();

        let agent_id = req.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        // Replays of a claim the agent already made return the remembered
        // task verbatim, whatever state it has reached since.
        let idem_key = req.idempotency_key.trim().to_string();
        if !idem_key.is_empty() {
            let key = format!("{agent_id}:{idem_key}");
            if let Some(task_id) = inner.claim_idem.get(&key).cloned() {
                if let Some(task) = inner.tasks.get(&task_id) {
                    return Ok(task.clone());
                }
                inner.claim_idem.remove(&key);
            }
        }

        let channel_id = {
            let given = req.channel_id.trim();
            if !given.is_empty() {
                let Some(channel) = inner.channels.get(given) else {
                    return Err(StoreError::NotFound);
                };
                if !req.user_id.is_empty() && channel.user_id != req.user_id {
                    return Err(StoreError::NotFound);
                }
                channel.id.clone()
            } else if !req.channel.trim().is_empty() {
                inner
                    .channels
                    .values()
                    .find(|c| {
                        (req.user_id.is_empty() || c.user_id == req.user_id)
                            && c.name.eq_ignore_ascii_case(req.channel.trim())
                    })
                    .map(|c| c.id.clone())
                    .ok_or(StoreError::NotFound)?
            } else {
                return Err(StoreError::invalid("channel_id_or_channel_required"));
            }
        };

        // An agent that owns a running chain is pinned to it until the chain
        // finishes or it detaches.
        let owned_chain_id = inner
            .chains
            .values()
            .filter(|c| c.owner_agent_id == agent_id && c.status == ChainStatus::InProgress)
            .min_by_key(|c| c.created_at)
            .map(|c| c.id.clone());

        let mut eligible: Vec<&Task> = Vec::new();
        for task in inner.tasks.values() {
            if task.channel_id != channel_id
                || task.status != TaskStatus::Queued
                || task.chain_id.is_empty()
            {
                continue;
            }

            let Some(chain) = inner.chains.get(&task.chain_id) else {
                continue;
            };
            if chain.status != ChainStatus::Queued && chain.status != ChainStatus::InProgress {
                continue;
            }

            // A locked task halts its whole chain.
            if inner
                .tasks
                .values()
                .any(|t| t.chain_id == task.chain_id && t.status == TaskStatus::Locked)
            {
                continue;
            }

            match owned_chain_id.as_deref() {
                Some(owned) if task.chain_id != owned => continue,
                None if !chain.owner_agent_id.is_empty() => continue,
                _ => {}
            }

            let next_in_sequence = if task.sequence == 1 {
                !inner
                    .tasks
                    .values()
                    .any(|t| t.chain_id == task.chain_id && t.status == TaskStatus::InProgress)
            } else {
                // The predecessor must exist and be strictly done; failed
                // predecessors never admit their successor.
                inner.tasks.values().any(|t| {
                    t.chain_id == task.chain_id
                        && t.sequence == task.sequence - 1
                        && t.status == TaskStatus::Done
                })
            };
            if next_in_sequence {
                eligible.push(task);
            }
        }

        // Oldest chain first, then lowest sequence within the chain.
        eligible.sort_by(|a, b| {
            let chain_a = inner.chains.get(&a.chain_id).map(|c| c.created_at);
            let chain_b = inner.chains.get(&b.chain_id).map(|c| c.created_at);
            chain_a.cmp(&chain_b).then(a.sequence.cmp(&b.sequence))
        });

        let Some(selected_id) = eligible.first().map(|t| t.id.clone()) else {
            return Err(StoreError::NoQueuedTasks);
        };

        let now = Utc::now();
        let claimed = {
            let task = inner
                .tasks
                .get_mut(&selected_id)
                .ok_or(StoreError::NoQueuedTasks)?;
            task.status = TaskStatus::InProgress;
            task.assigned_agent_id = agent_id.clone();
            task.claimed_at = Some(now);
            task.updated_at = now;
            task.clone()
        };

        if let Some(chain) = inner.chains.get_mut(&claimed.chain_id) {
            if chain.status == ChainStatus::Queued {
                chain.status = ChainStatus::InProgress;
                chain.owner_agent_id = agent_id.clone();
                chain.updated_at = now;
            }
        }

        if !idem_key.is_empty() {
            let key = format!("{agent_id}:{idem_key}");
            inner.claim_idem.insert(key, claimed.id.clone());
        }

        // current_task_id only; claude_status belongs to the heartbeat alone.
        if let Some(agent) = inner.agents.get_mut(&agent_id) {
            agent.current_task_id = claimed.id.clone();
            agent.updated_at = now;
        }

        Ok(claimed)
    }

    fn assign_task(&self, req: AssignTaskRequest) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();

        let task_id = req.task_id.trim();
        let agent_id = req.agent_id.trim().to_string();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        let Some(task) = inner.tasks.get(task_id) else {
            return Err(StoreError::NotFound);
        };
        match task.status {
            TaskStatus::Queued => {}
            TaskStatus::InProgress if task.assigned_agent_id == agent_id => {
                return Ok(task.clone());
            }
            _ => return Err(StoreError::Conflict),
        }

        let now = Utc::now();
        let assigned = {
            let task = inner.tasks.get_mut(task_id).ok_or(StoreError::NotFound)?;
            task.status = TaskStatus::InProgress;
            task.assigned_agent_id = agent_id.clone();
            if task.claimed_at.is_none() {
                task.claimed_at = Some(now);
            }
            task.updated_at = now;
            task.clone()
        };

        if let Some(agent) = inner.agents.get_mut(&agent_id) {
            agent.current_task_id = assigned.id.clone();
            agent.updated_at = now;
        }

        Ok(assigned)
    }

    fn complete_task(&self, req: CompleteTaskRequest) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();

        let task_id = req.task_id.trim();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        let Some(task) = inner.tasks.get(task_id) else {
            return Err(StoreError::NotFound);
        };

        let req_agent = req.agent_id.trim();
        if !req_agent.is_empty() && task.assigned_agent_id != req_agent {
            warn!(
                task_id,
                request_agent = req_agent,
                assigned_agent = %task.assigned_agent_id,
                "complete rejected: agent mismatch"
            );
            return Err(StoreError::Conflict);
        }

        // A worker that is tracking a different task must not close this one.
        if !req_agent.is_empty() {
            if let Some(agent) = inner.agents.get(req_agent) {
                if !agent.current_task_id.is_empty() && agent.current_task_id != task_id {
                    warn!(
                        task_id,
                        agent_id = req_agent,
                        current_task_id = %agent.current_task_id,
                        "complete rejected: current task mismatch"
                    );
                    return Err(StoreError::Conflict);
                }
            }
        }

        let now = Utc::now();
        let completed = match task.status {
            TaskStatus::Done => task.clone(),
            TaskStatus::InProgress => {
                let task = inner.tasks.get_mut(task_id).ok_or(StoreError::NotFound)?;
                task.status = TaskStatus::Done;
                if task.done_at.is_none() {
                    task.done_at = Some(now);
                }
                task.updated_at = now;
                task.clone()
            }
            _ => return Err(StoreError::Conflict),
        };

        let clear_agent = if req_agent.is_empty() {
            completed.assigned_agent_id.clone()
        } else {
            req_agent.to_string()
        };
        if !clear_agent.is_empty() {
            inner.clear_agent_current_task(&clear_agent, now);
        }

        if !completed.chain_id.is_empty() {
            inner.update_chain_status(&completed.chain_id, now);
        }

        Ok(completed)
    }

    fn fail_task(&self, req: FailTaskRequest) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();

        let task_id = req.task_id.trim();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        let Some(task) = inner.tasks.get(task_id) else {
            return Err(StoreError::NotFound);
        };

        let req_agent = req.agent_id.trim();
        if !req_agent.is_empty() && task.assigned_agent_id != req_agent {
            return Err(StoreError::Conflict);
        }

        let now = Utc::now();
        let failed = match task.status {
            TaskStatus::Failed => task.clone(),
            TaskStatus::InProgress => {
                let task = inner.tasks.get_mut(task_id).ok_or(StoreError::NotFound)?;
                task.status = TaskStatus::Failed;
                task.done_at = None;
                task.updated_at = now;
                task.clone()
            }
            _ => return Err(StoreError::Conflict),
        };

        if !req.reason.trim().is_empty() {
            warn!(task_id, reason = req.reason.trim(), "task failed");
        }

        let clear_agent = if req_agent.is_empty() {
            failed.assigned_agent_id.clone()
        } else {
            req_agent.to_string()
        };
        if !clear_agent.is_empty() {
            inner.clear_agent_current_task(&clear_agent, now);
        }

        if !failed.chain_id.is_empty() {
            inner.update_chain_status(&failed.chain_id, now);
        }

        Ok(failed)
    }

    fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();

        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        let Some(task) = inner.tasks.get(task_id) else {
            return Err(StoreError::NotFound);
        };

        // Operator reconciliation of parked work: locked → queued | done only.
        if task.status != TaskStatus::Locked {
            return Err(StoreError::Conflict);
        }
        if status != TaskStatus::Queued && status != TaskStatus::Done {
            return Err(StoreError::Conflict);
        }

        let now = Utc::now();
        let updated = {
            let task = inner.tasks.get_mut(task_id).ok_or(StoreError::NotFound)?;
            if status == TaskStatus::Queued {
                task.status = TaskStatus::Queued;
                task.assigned_agent_id = String::new();
                task.claimed_at = None;
            } else {
                task.status = TaskStatus::Done;
                task.done_at = Some(now);
            }
            task.updated_at = now;
            task.clone()
        };

        if !updated.chain_id.is_empty() {
            inner.reevaluate_chain_status(&updated.chain_id, now);
        }

        Ok(updated)
    }

    fn create_event(&self, event: Event) -> Result<Event, StoreError> {
        let mut inner = self.inner.lock();

        if event.agent_id.trim().is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }
        if event.event_type.trim().is_empty() {
            return Err(StoreError::invalid("type_required"));
        }

        let idem_key = event.idempotency_key.trim().to_string();
        if !idem_key.is_empty() {
            let key = format!("event:{}:{}", event.agent_id.trim(), idem_key);
            if inner.event_idem.contains(&key) {
                return Err(StoreError::Conflict);
            }
            inner.event_idem.insert(key);
        }

        let created = Event {
            id: new_id(),
            agent_id: event.agent_id.trim().to_string(),
            task_id: event.task_id.trim().to_string(),
            event_type: event.event_type.trim().to_string(),
            payload: event.payload,
            idempotency_key: idem_key,
            created_at: Utc::now(),
        };
        inner.events.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();

        let user_agents: Option<HashSet<&str>> = if filter.user_id.is_empty() {
            None
        } else {
            Some(
                inner
                    .agents
                    .values()
                    .filter(|a| a.user_id == filter.user_id)
                    .map(|a| a.id.as_str())
                    .collect(),
            )
        };

        let mut out: Vec<Event> = inner
            .events
            .values()
            .filter(|e| {
                user_agents
                    .as_ref()
                    .is_none_or(|ids| ids.contains(e.agent_id.as_str()))
            })
            .filter(|e| filter.agent_id.is_empty() || e.agent_id == filter.agent_id)
            .filter(|e| filter.task_id.is_empty() || e.task_id == filter.task_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 && out.len() > filter.limit {
            out.truncate(filter.limit);
        }
        Ok(out)
    }

    fn purge_events_before(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let before_len = inner.events.len();
        inner.events.retain(|_, e| e.created_at >= before);
        Ok(before_len - inner.events.len())
    }

    fn create_task_input(&self, req: CreateTaskInputRequest) -> Result<TaskInput, StoreError> {
        let mut inner = self.inner.lock();

        let task_id = req.task_id.trim().to_string();
        let agent_id = req.agent_id.trim().to_string();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        let kind = if req.kind.trim().is_empty() {
            "text".to_string()
        } else {
            req.kind.trim().to_string()
        };

        if req.text.trim().is_empty() && !req.send_enter {
            return Err(StoreError::invalid("text_or_send_enter_required"));
        }

        let idem_key = req.idempotency_key.trim().to_string();
        if !idem_key.is_empty() {
            let key = format!("{task_id}:{idem_key}");
            if let Some(existing_id) = inner.input_idem.get(&key).cloned() {
                if let Some(existing) = inner.inputs.get(&existing_id) {
                    return Ok(existing.clone());
                }
                inner.input_idem.remove(&key);
            }
        }

        let created = TaskInput {
            id: new_id(),
            task_id: task_id.clone(),
            agent_id,
            kind,
            text: req.text,
            send_enter: req.send_enter,
            idempotency_key: idem_key.clone(),
            created_at: Utc::now(),
            claimed_at: None,
        };
        inner.inputs.insert(created.id.clone(), created.clone());
        if !idem_key.is_empty() {
            inner
                .input_idem
                .insert(format!("{task_id}:{idem_key}"), created.id.clone());
        }
        Ok(created)
    }

    fn claim_task_input(&self, req: ClaimTaskInputRequest) -> Result<TaskInput, StoreError> {
        let mut inner = self.inner.lock();

        let task_id = req.task_id.trim();
        let agent_id = req.agent_id.trim();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        let selected_id = inner
            .inputs
            .values()
            .filter(|i| i.task_id == task_id && i.agent_id == agent_id && i.claimed_at.is_none())
            .min_by_key(|i| i.created_at)
            .map(|i| i.id.clone())
            .ok_or(StoreError::NoPendingInputs)?;

        let input = inner
            .inputs
            .get_mut(&selected_id)
            .ok_or(StoreError::NoPendingInputs)?;
        input.claimed_at = Some(Utc::now());
        Ok(input.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionMode;
    use serde_json::Map;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    fn channel(s: &MemoryStore, user_id: &str, name: &str) -> Channel {
        s.create_channel(Channel {
            id: String::new(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            created_at: Utc::now(),
        })
        .expect("create channel")
    }

    fn chain(s: &MemoryStore, channel: &Channel, name: &str) -> Chain {
        s.create_chain(Chain {
            id: String::new(),
            user_id: channel.user_id.clone(),
            channel_id: channel.id.clone(),
            name: name.to_string(),
            description: String::new(),
            status: ChainStatus::Queued,
            owner_agent_id: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .expect("create chain")
    }

    fn task(s: &MemoryStore, channel: &Channel, chain: &Chain, seq: i32, title: &str) -> Task {
        s.create_task(Task {
            id: String::new(),
            user_id: channel.user_id.clone(),
            channel_id: channel.id.clone(),
            chain_id: chain.id.clone(),
            sequence: seq,
            title: title.to_string(),
            description: String::new(),
            task_type: String::new(),
            agent_session_request_token: String::new(),
            status: TaskStatus::Queued,
            priority: 0,
            assigned_agent_id: String::new(),
            execution_mode: ExecutionMode::Unspecified,
            created_at: Utc::now(),
            claimed_at: None,
            done_at: None,
            updated_at: Utc::now(),
        })
        .expect("create task")
    }

    fn heartbeat(s: &MemoryStore, user_id: &str, agent_id: &str) -> Agent {
        s.upsert_agent(UpsertAgentRequest {
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            name: format!("agent-{agent_id}"),
            status: None,
            claude_status: Some(ClaudeStatus::Idle),
            current_task_id: String::new(),
            meta: Some(Map::new()),
        })
        .expect("upsert agent")
    }

    fn claim(s: &MemoryStore, user_id: &str, agent_id: &str, channel_id: &str) -> Result<Task, StoreError> {
        s.claim_task(ClaimTaskRequest {
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            channel_id: channel_id.to_string(),
            channel: String::new(),
            idempotency_key: String::new(),
        })
    }

    #[test]
    fn create_chain_validation() {
        let s = store();
        let ch = channel(&s, "u1", "ops");

        let c = chain(&s, &ch, "deploy");
        assert_eq!(c.channel_id, ch.id);
        assert_eq!(c.status, ChainStatus::Queued);
        assert_eq!(c.user_id, "u1");

        let missing_channel = s.create_chain(Chain {
            id: String::new(),
            user_id: "u1".to_string(),
            channel_id: "missing".to_string(),
            name: "x".to_string(),
            description: String::new(),
            status: ChainStatus::Queued,
            owner_agent_id: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        assert!(matches!(missing_channel, Err(StoreError::NotFound)));
    }

    #[test]
    fn channel_names_unique_per_user_case_insensitive() {
        let s = store();
        channel(&s, "u1", "ops");

        let dup = s.create_channel(Channel {
            id: String::new(),
            user_id: "u1".to_string(),
            name: "OPS".to_string(),
            description: String::new(),
            created_at: Utc::now(),
        });
        assert!(matches!(dup, Err(StoreError::Conflict)));

        // Same name under another tenant is fine.
        channel(&s, "u2", "ops");
    }

    #[test]
    fn claim_walks_chain_in_sequence() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "pipeline");
        let t1 = task(&s, &ch, &c, 1, "first");
        let t2 = task(&s, &ch, &c, 2, "second");
        heartbeat(&s, "u1", "agent-a");

        let claimed = claim(&s, "u1", "agent-a", &ch.id).expect("claim t1");
        assert_eq!(claimed.id, t1.id);
        assert_eq!(claimed.status, TaskStatus::InProgress);

        let updated_chain = s.get_chain(&c.id).unwrap();
        assert_eq!(updated_chain.status, ChainStatus::InProgress);
        assert_eq!(updated_chain.owner_agent_id, "agent-a");

        // t2 is not eligible while t1 is in progress.
        assert!(matches!(
            claim(&s, "u1", "agent-a", &ch.id),
            Err(StoreError::NoQueuedTasks)
        ));

        s.complete_task(CompleteTaskRequest {
            task_id: t1.id.clone(),
            agent_id: "agent-a".to_string(),
        })
        .expect("complete t1");

        let claimed = claim(&s, "u1", "agent-a", &ch.id).expect("claim t2");
        assert_eq!(claimed.id, t2.id);

        s.complete_task(CompleteTaskRequest {
            task_id: t2.id.clone(),
            agent_id: "agent-a".to_string(),
        })
        .expect("complete t2");

        let finished = s.get_chain(&c.id).unwrap();
        assert_eq!(finished.status, ChainStatus::Done);
        // Ownership survives terminal completion until explicit detach.
        assert_eq!(finished.owner_agent_id, "agent-a");
    }

    #[test]
    fn owned_chain_blocks_interleave() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "chain-c");
        task(&s, &ch, &c, 1, "c1");
        task(&s, &ch, &c, 2, "c2");
        let d = chain(&s, &ch, "chain-d");
        let u1 = task(&s, &ch, &d, 1, "d1");
        heartbeat(&s, "u1", "agent-a");
        heartbeat(&s, "u1", "agent-b");

        claim(&s, "u1", "agent-a", &ch.id).expect("a claims c1");

        // B cannot enter chain c (owned by A); it gets chain d instead.
        let b_task = claim(&s, "u1", "agent-b", &ch.id).expect("b claims d1");
        assert_eq!(b_task.id, u1.id);
        assert_eq!(s.get_chain(&d.id).unwrap().owner_agent_id, "agent-b");
    }

    #[test]
    fn failed_task_fails_chain_and_blocks_successor() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "pipeline");
        let t1 = task(&s, &ch, &c, 1, "first");
        task(&s, &ch, &c, 2, "second");
        heartbeat(&s, "u1", "agent-a");

        claim(&s, "u1", "agent-a", &ch.id).expect("claim t1");
        s.fail_task(FailTaskRequest {
            task_id: t1.id.clone(),
            agent_id: "agent-a".to_string(),
            reason: "boom".to_string(),
        })
        .expect("fail t1");

        let failed = s.get_chain(&c.id).unwrap();
        assert_eq!(failed.status, ChainStatus::Failed);

        let t1_after = s
            .list_tasks(TaskFilter {
                chain_id: c.id.clone(),
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(t1_after[0].status, TaskStatus::Failed);
        assert!(t1_after[0].done_at.is_none());

        // The chain is failed, so the successor never becomes claimable.
        assert!(matches!(
            claim(&s, "u1", "agent-a", &ch.id),
            Err(StoreError::NoQueuedTasks)
        ));
    }

    #[test]
    fn detach_locks_chain_and_operator_requeues() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "pipeline");
        let t1 = task(&s, &ch, &c, 1, "first");
        heartbeat(&s, "u1", "agent-a");

        claim(&s, "u1", "agent-a", &ch.id).expect("claim t1");

        // Only the owner may detach.
        let not_owner = s.detach_agent_from_chain(DetachAgentFromChainRequest {
            chain_id: c.id.clone(),
            agent_id: "agent-b".to_string(),
        });
        assert!(matches!(not_owner, Err(StoreError::Conflict)));

        s.detach_agent_from_chain(DetachAgentFromChainRequest {
            chain_id: c.id.clone(),
            agent_id: "agent-a".to_string(),
        })
        .expect("detach");

        let locked = s.get_chain(&c.id).unwrap();
        assert_eq!(locked.status, ChainStatus::Locked);
        assert!(locked.owner_agent_id.is_empty());
        assert!(s.get_agent("agent-a").unwrap().current_task_id.is_empty());

        // Locked chains are unclaimable.
        assert!(matches!(
            claim(&s, "u1", "agent-a", &ch.id),
            Err(StoreError::NoQueuedTasks)
        ));

        // Only locked → queued / locked → done are allowed.
        assert!(matches!(
            s.update_task_status(&t1.id, TaskStatus::Failed),
            Err(StoreError::Conflict)
        ));
        let requeued = s
            .update_task_status(&t1.id, TaskStatus::Queued)
            .expect("requeue");
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert!(requeued.assigned_agent_id.is_empty());
        assert!(requeued.claimed_at.is_none());

        assert_eq!(s.get_chain(&c.id).unwrap().status, ChainStatus::Queued);

        let reclaimed = claim(&s, "u1", "agent-a", &ch.id).expect("reclaim");
        assert_eq!(reclaimed.id, t1.id);
    }

    #[test]
    fn claim_is_idempotent_under_replay() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "pipeline");
        let t1 = task(&s, &ch, &c, 1, "first");
        heartbeat(&s, "u1", "agent-a");

        let req = ClaimTaskRequest {
            user_id: "u1".to_string(),
            agent_id: "agent-a".to_string(),
            channel_id: ch.id.clone(),
            channel: String::new(),
            idempotency_key: "key-1".to_string(),
        };

        let first = s.claim_task(req.clone()).expect("claim");
        assert_eq!(first.id, t1.id);

        let replay = s.claim_task(req.clone()).expect("replay");
        assert_eq!(replay.id, t1.id);
        assert_eq!(replay.status, TaskStatus::InProgress);

        s.complete_task(CompleteTaskRequest {
            task_id: t1.id.clone(),
            agent_id: "agent-a".to_string(),
        })
        .expect("complete");

        // Replay after completion still names the same task.
        let after_done = s.claim_task(req).expect("replay after done");
        assert_eq!(after_done.id, t1.id);
        assert_eq!(after_done.status, TaskStatus::Done);
    }

    #[test]
    fn complete_requires_matching_assignment_and_current_task() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "pipeline");
        let t1 = task(&s, &ch, &c, 1, "first");
        heartbeat(&s, "u1", "agent-a");
        heartbeat(&s, "u1", "agent-b");

        claim(&s, "u1", "agent-a", &ch.id).expect("claim");

        let foreign = s.complete_task(CompleteTaskRequest {
            task_id: t1.id.clone(),
            agent_id: "agent-b".to_string(),
        });
        assert!(matches!(foreign, Err(StoreError::Conflict)));

        // An agent tracking another task cannot close this one.
        let d = chain(&s, &ch, "other");
        let d1 = task(&s, &ch, &d, 1, "other-first");
        let b_task = claim(&s, "u1", "agent-b", &ch.id).expect("b claims d1");
        assert_eq!(b_task.id, d1.id);
        let stale = s.complete_task(CompleteTaskRequest {
            task_id: t1.id.clone(),
            agent_id: "agent-b".to_string(),
        });
        assert!(matches!(stale, Err(StoreError::Conflict)));

        let done = s
            .complete_task(CompleteTaskRequest {
                task_id: t1.id.clone(),
                agent_id: "agent-a".to_string(),
            })
            .expect("complete");
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.done_at.is_some());

        // Completing an already-done task is a no-op.
        let again = s
            .complete_task(CompleteTaskRequest {
                task_id: t1.id,
                agent_id: "agent-a".to_string(),
            })
            .expect("idempotent complete");
        assert_eq!(again.done_at, done.done_at);
    }

    #[test]
    fn duplicate_sequence_in_chain_conflicts() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "pipeline");
        task(&s, &ch, &c, 1, "first");

        let dup = s.create_task(Task {
            id: String::new(),
            user_id: "u1".to_string(),
            channel_id: ch.id.clone(),
            chain_id: c.id.clone(),
            sequence: 1,
            title: "dup".to_string(),
            description: String::new(),
            task_type: String::new(),
            agent_session_request_token: String::new(),
            status: TaskStatus::Queued,
            priority: 0,
            assigned_agent_id: String::new(),
            execution_mode: ExecutionMode::Unspecified,
            created_at: Utc::now(),
            claimed_at: None,
            done_at: None,
            updated_at: Utc::now(),
        });
        assert!(matches!(dup, Err(StoreError::Conflict)));
    }

    #[test]
    fn late_task_rearms_done_chain() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "pipeline");
        let t1 = task(&s, &ch, &c, 1, "first");
        heartbeat(&s, "u1", "agent-a");

        claim(&s, "u1", "agent-a", &ch.id).expect("claim");
        s.complete_task(CompleteTaskRequest {
            task_id: t1.id,
            agent_id: "agent-a".to_string(),
        })
        .expect("complete");
        assert_eq!(s.get_chain(&c.id).unwrap().status, ChainStatus::Done);

        // Sequence is auto-assigned past the existing maximum.
        let late = task(&s, &ch, &c, 0, "late");
        assert_eq!(late.sequence, 2);
        assert_eq!(s.get_chain(&c.id).unwrap().status, ChainStatus::Queued);
    }

    #[test]
    fn input_queue_is_fifo_and_at_most_once() {
        let s = store();
        let mut ids = Vec::new();
        for n in 1..=3 {
            let input = s
                .create_task_input(CreateTaskInputRequest {
                    task_id: "t1".to_string(),
                    agent_id: "agent-a".to_string(),
                    kind: String::new(),
                    text: format!("line {n}"),
                    send_enter: true,
                    idempotency_key: String::new(),
                })
                .expect("create input");
            assert_eq!(input.kind, "text");
            ids.push(input.id);
        }

        for expected in &ids {
            let claimed = s
                .claim_task_input(ClaimTaskInputRequest {
                    task_id: "t1".to_string(),
                    agent_id: "agent-a".to_string(),
                })
                .expect("claim input");
            assert_eq!(&claimed.id, expected);
            assert!(claimed.claimed_at.is_some());
        }

        assert!(matches!(
            s.claim_task_input(ClaimTaskInputRequest {
                task_id: "t1".to_string(),
                agent_id: "agent-a".to_string(),
            }),
            Err(StoreError::NoPendingInputs)
        ));
    }

    #[test]
    fn input_requires_text_or_enter_and_replays_by_key() {
        let s = store();
        let empty = s.create_task_input(CreateTaskInputRequest {
            task_id: "t1".to_string(),
            agent_id: "agent-a".to_string(),
            kind: String::new(),
            text: "   ".to_string(),
            send_enter: false,
            idempotency_key: String::new(),
        });
        assert!(matches!(empty, Err(StoreError::Invalid(_))));

        let first = s
            .create_task_input(CreateTaskInputRequest {
                task_id: "t1".to_string(),
                agent_id: "agent-a".to_string(),
                kind: String::new(),
                text: "hello".to_string(),
                send_enter: false,
                idempotency_key: "k1".to_string(),
            })
            .expect("create");
        let replay = s
            .create_task_input(CreateTaskInputRequest {
                task_id: "t1".to_string(),
                agent_id: "agent-a".to_string(),
                kind: String::new(),
                text: "different".to_string(),
                send_enter: false,
                idempotency_key: "k1".to_string(),
            })
            .expect("replay");
        assert_eq!(replay.id, first.id);
        assert_eq!(replay.text, "hello");
    }

    #[test]
    fn event_idempotency_and_user_scoped_listing() {
        let s = store();
        heartbeat(&s, "u1", "agent-a");
        heartbeat(&s, "u2", "agent-z");

        let make = |agent: &str, key: &str| {
            s.create_event(Event {
                id: String::new(),
                agent_id: agent.to_string(),
                task_id: String::new(),
                event_type: "progress".to_string(),
                payload: Map::new(),
                idempotency_key: key.to_string(),
                created_at: Utc::now(),
            })
        };

        make("agent-a", "e1").expect("event");
        assert!(matches!(make("agent-a", "e1"), Err(StoreError::Conflict)));
        // Same key from a different agent is distinct.
        make("agent-z", "e1").expect("event");

        let u1_events = s
            .list_events(EventFilter {
                user_id: "u1".to_string(),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(u1_events.len(), 1);
        assert_eq!(u1_events[0].agent_id, "agent-a");
    }

    #[test]
    fn purge_removes_only_old_events() {
        let s = store();
        heartbeat(&s, "u1", "agent-a");
        s.create_event(Event {
            id: String::new(),
            agent_id: "agent-a".to_string(),
            task_id: String::new(),
            event_type: "progress".to_string(),
            payload: Map::new(),
            idempotency_key: String::new(),
            created_at: Utc::now(),
        })
        .expect("event");

        let removed = s
            .purge_events_before(Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(removed, 0);

        let removed = s
            .purge_events_before(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(s.list_events(EventFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn auth_code_single_use() {
        let s = store();
        s.create_auth_code(AuthCode {
            code: "c0de".to_string(),
            user_id: "u1".to_string(),
            agent_name: String::new(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            used: false,
            created_at: Utc::now(),
        })
        .expect("create code");

        let consumed = s.consume_auth_code("c0de").expect("consume");
        assert_eq!(consumed.user_id, "u1");
        assert!(matches!(
            s.consume_auth_code("c0de"),
            Err(StoreError::Conflict)
        ));
        assert!(matches!(
            s.consume_auth_code("missing"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn expired_auth_code_reads_as_absent() {
        let s = store();
        s.create_auth_code(AuthCode {
            code: "old".to_string(),
            user_id: "u1".to_string(),
            agent_name: String::new(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            used: false,
            created_at: Utc::now(),
        })
        .expect("create code");
        assert!(matches!(
            s.consume_auth_code("old"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn usernames_unique_case_insensitive() {
        let s = store();
        s.create_user("Alice", "hash").expect("create");
        assert!(matches!(
            s.create_user("alice", "hash"),
            Err(StoreError::Conflict)
        ));
        let found = s.get_user_by_username("ALICE").expect("lookup");
        assert_eq!(found.username, "Alice");
    }

    #[test]
    fn delete_chain_cascades_tasks() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        let c = chain(&s, &ch, "pipeline");
        task(&s, &ch, &c, 1, "first");
        task(&s, &ch, &c, 2, "second");

        s.delete_chain(&c.id).expect("delete");
        assert!(matches!(s.get_chain(&c.id), Err(StoreError::NotFound)));
        assert!(s
            .list_tasks(TaskFilter {
                chain_id: c.id,
                ..TaskFilter::default()
            })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn tenant_mismatch_reads_as_not_found() {
        let s = store();
        let ch = channel(&s, "u1", "ops");
        heartbeat(&s, "u1", "agent-a");

        // Another tenant cannot re-register the same agent id.
        let hijack = s.upsert_agent(UpsertAgentRequest {
            agent_id: "agent-a".to_string(),
            user_id: "u2".to_string(),
            name: "impostor".to_string(),
            status: None,
            claude_status: None,
            current_task_id: String::new(),
            meta: None,
        });
        assert!(matches!(hijack, Err(StoreError::NotFound)));

        // Claims resolve channels within the caller's tenant only.
        let cross = s.claim_task(ClaimTaskRequest {
            user_id: "u2".to_string(),
            agent_id: "agent-z".to_string(),
            channel_id: ch.id,
            channel: String::new(),
            idempotency_key: String::new(),
        });
        assert!(matches!(cross, Err(StoreError::NotFound)));
    }
}
