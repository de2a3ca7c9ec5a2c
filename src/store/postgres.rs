// Postgres 后端：行级锁事务承载调度决策，claim 走 skip-locked。
use super::{
    AssignTaskRequest, ClaimTaskInputRequest, ClaimTaskRequest, CompleteTaskRequest,
    CreateTaskInputRequest, DetachAgentFromChainRequest, EventFilter, FailTaskRequest, Store,
    StoreError, TaskFilter, UpdateChainRequest, UpsertAgentRequest,
};
use crate::ids::new_id;
use crate::model::{
    Agent, AuthCode, Chain, ChainStatus, Channel, ClaudeStatus, Event, ExecutionMode, Task,
    TaskInput, TaskStatus, User,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::warn;

const DEFAULT_POOL_SIZE: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
create table if not exists users (
    id text primary key,
    username text not null,
    password_hash text not null,
    created_at timestamptz not null default now(),
    updated_at timestamptz not null default now()
);
create unique index if not exists users_username_lower_idx on users (lower(username));

create table if not exists auth_codes (
    code text primary key,
    user_id text not null references users (id),
    agent_name text not null default '',
    expires_at timestamptz not null,
    used boolean not null default false,
    created_at timestamptz not null default now()
);

create table if not exists agents (
    id text primary key,
    user_id text not null default '',
    name text not null default '',
    status text not null default 'idle',
    claude_status text not null default 'idle',
    current_task_id text not null default '',
    last_seen timestamptz not null default now(),
    meta jsonb not null default '{}'::jsonb,
    created_at timestamptz not null default now(),
    updated_at timestamptz not null default now()
);

create table if not exists channels (
    id text primary key,
    user_id text not null default '',
    name text not null,
    description text not null default '',
    created_at timestamptz not null default now()
);
create unique index if not exists channels_user_name_idx on channels (user_id, lower(name));

create table if not exists chains (
    id text primary key,
    user_id text not null default '',
    channel_id text not null references channels (id),
    name text not null,
    description text not null default '',
    status text not null default 'queued',
    owner_agent_id text not null default '',
    created_at timestamptz not null default now(),
    updated_at timestamptz not null default now()
);

create table if not exists tasks (
    id text primary key,
    user_id text not null default '',
    channel_id text not null references channels (id),
    chain_id text not null references chains (id) on delete cascade,
    sequence integer not null default 1,
    title text not null,
    description text not null default '',
    type text not null default '',
    agent_session_request_token text not null default '',
    status text not null default 'queued',
    priority integer not null default 0,
    assigned_agent_id text not null default '',
    execution_mode text not null default '',
    created_at timestamptz not null default now(),
    claimed_at timestamptz,
    done_at timestamptz,
    updated_at timestamptz not null default now()
);
create unique index if not exists tasks_chain_sequence_idx on tasks (chain_id, sequence);
create index if not exists tasks_channel_status_idx on tasks (channel_id, status);

create table if not exists events (
    id text primary key,
    agent_id text not null,
    task_id text not null default '',
    type text not null,
    payload jsonb not null default '{}'::jsonb,
    idempotency_key text,
    created_at timestamptz not null default now()
);
create unique index if not exists events_agent_idem_idx
    on events (agent_id, idempotency_key) where idempotency_key is not null;
create index if not exists events_created_at_idx on events (created_at);

create table if not exists task_inputs (
    id text primary key,
    task_id text not null,
    agent_id text not null,
    kind text not null default 'text',
    text text not null default '',
    send_enter boolean not null default false,
    idempotency_key text,
    created_at timestamptz not null default now(),
    claimed_at timestamptz
);
create unique index if not exists task_inputs_task_idem_idx
    on task_inputs (task_id, idempotency_key) where idempotency_key is not null;

create table if not exists task_claim_idempotency (
    agent_id text not null,
    idempotency_key text not null,
    channel_id text not null default '',
    task_id text not null default '',
    created_at timestamptz not null default now(),
    primary key (agent_id, idempotency_key)
);
"#;

// Next eligible queued task for one agent in one channel, locked with
// skip-locked so concurrent pollers never hand out the same row.
const CLAIM_TASK_FN: &str = r#"
create or replace function claim_task(p_channel_id text, p_agent_id text)
returns setof tasks
language plpgsql
as $$
declare
    v_owned_chain text;
    v_task_id text;
begin
    select id into v_owned_chain
    from chains
    where owner_agent_id = p_agent_id and status = 'in_progress'
    order by created_at asc
    limit 1;

    select t.id into v_task_id
    from tasks t
    join chains c on c.id = t.chain_id
    where t.channel_id = p_channel_id
      and t.status = 'queued'
      and c.status in ('queued', 'in_progress')
      and not exists (
          select 1 from tasks lt
          where lt.chain_id = t.chain_id and lt.status = 'locked')
      and ((v_owned_chain is not null and t.chain_id = v_owned_chain)
        or (v_owned_chain is null and c.owner_agent_id = ''))
      and ((t.sequence = 1 and not exists (
              select 1 from tasks it
              where it.chain_id = t.chain_id and it.status = 'in_progress'))
        or (t.sequence > 1 and exists (
              select 1 from tasks pt
              where pt.chain_id = t.chain_id
                and pt.sequence = t.sequence - 1
                and pt.status = 'done')))
    order by c.created_at asc, t.sequence asc
    limit 1
    for update of t skip locked;

    if v_task_id is null then
        return;
    end if;

    update tasks
    set status = 'in_progress',
        assigned_agent_id = p_agent_id,
        claimed_at = now(),
        updated_at = now()
    where id = v_task_id;

    update chains
    set status = 'in_progress',
        owner_agent_id = p_agent_id,
        updated_at = now()
    where id = (select chain_id from tasks where id = v_task_id)
      and status = 'queued';

    return query select * from tasks where id = v_task_id;
end;
$$;
"#;

pub struct PostgresStore {
    pool: Pool,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
    fallback_runtime: tokio::runtime::Runtime,
}

struct PgConn<'a> {
    store: &'a PostgresStore,
    client: deadpool_postgres::Client,
}

impl PgConn<'_> {
    fn batch_execute(&mut self, query: &str) -> Result<()> {
        self.store.block_on(self.client.batch_execute(query))??;
        Ok(())
    }

    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.store.block_on(self.client.execute(query, params))??)
    }

    fn query(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        Ok(self.store.block_on(self.client.query(query, params))??)
    }

    fn query_opt(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>> {
        Ok(self
            .store
            .block_on(self.client.query_opt(query, params))??)
    }

    fn transaction(&mut self) -> Result<PgTx<'_>> {
        let tx = self.store.block_on(self.client.transaction())??;
        Ok(PgTx {
            store: self.store,
            tx,
        })
    }
}

struct PgTx<'a> {
    store: &'a PostgresStore,
    tx: deadpool_postgres::Transaction<'a>,
}

impl PgTx<'_> {
    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.store.block_on(self.tx.execute(query, params))??)
    }

    fn query(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        Ok(self.store.block_on(self.tx.query(query, params))??)
    }

    fn query_opt(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>> {
        Ok(self.store.block_on(self.tx.query_opt(query, params))??)
    }

    fn commit(self) -> Result<()> {
        self.store.block_on(self.tx.commit())??;
        Ok(())
    }
}

impl PostgresStore {
    pub fn new(database_url: String) -> Result<Self> {
        let cleaned = database_url.trim().to_string();
        if cleaned.is_empty() {
            return Err(anyhow!("database url is empty"));
        }
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        config.connect_timeout(CONNECT_TIMEOUT);
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager).max_size(DEFAULT_POOL_SIZE).build()?;
        let fallback_runtime = tokio::runtime::Runtime::new()
            .map_err(|err| anyhow!("create tokio runtime for postgres: {err}"))?;
        Ok(Self {
            pool,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
            fallback_runtime,
        })
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut conn = self.conn()?;
        conn.batch_execute(SCHEMA)?;
        conn.batch_execute(CLAIM_TASK_FN)?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn conn(&self) -> Result<PgConn<'_>> {
        let client = self.block_on(self.pool.get())??;
        Ok(PgConn {
            store: self,
            client,
        })
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
            Err(_) => Ok(self.fallback_runtime.block_on(fut)),
        }
    }
}

fn map_db_err(err: anyhow::Error) -> StoreError {
    if let Some(db_err) = err.downcast_ref::<tokio_postgres::Error>() {
        if let Some(code) = db_err.code() {
            if *code == SqlState::UNIQUE_VIOLATION {
                return StoreError::Conflict;
            }
            if *code == SqlState::FOREIGN_KEY_VIOLATION {
                return StoreError::NotFound;
            }
        }
    }
    StoreError::Internal(err)
}

fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn auth_code_from_row(row: &Row) -> AuthCode {
    AuthCode {
        code: row.get("code"),
        user_id: row.get("user_id"),
        agent_name: row.get("agent_name"),
        expires_at: row.get("expires_at"),
        used: row.get("used"),
        created_at: row.get("created_at"),
    }
}

fn agent_from_row(row: &Row) -> Agent {
    let status: String = row.get("status");
    let claude_status: String = row.get("claude_status");
    let meta: Value = row.get("meta");
    Agent {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        status: ClaudeStatus::parse(&status).unwrap_or_default(),
        claude_status: ClaudeStatus::parse(&claude_status).unwrap_or_default(),
        current_task_id: row.get("current_task_id"),
        last_seen: row.get("last_seen"),
        meta: json_map(meta),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn channel_from_row(row: &Row) -> Channel {
    Channel {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: row.get("created_at"),
    }
}

fn chain_from_row(row: &Row) -> Chain {
    let status: String = row.get("status");
    Chain {
        id: row.get("id"),
        user_id: row.get("user_id"),
        channel_id: row.get("channel_id"),
        name: row.get("name"),
        description: row.get("description"),
        status: ChainStatus::parse(&status).unwrap_or_default(),
        owner_agent_id: row.get("owner_agent_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn task_from_row(row: &Row) -> Task {
    let status: String = row.get("status");
    let execution_mode: String = row.get("execution_mode");
    Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        channel_id: row.get("channel_id"),
        chain_id: row.get("chain_id"),
        sequence: row.get("sequence"),
        title: row.get("title"),
        description: row.get("description"),
        task_type: row.get("type"),
        agent_session_request_token: row.get("agent_session_request_token"),
        status: TaskStatus::parse(&status).unwrap_or_default(),
        priority: row.get("priority"),
        assigned_agent_id: row.get("assigned_agent_id"),
        execution_mode: parse_execution_mode(&execution_mode),
        created_at: row.get("created_at"),
        claimed_at: row.get("claimed_at"),
        done_at: row.get("done_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_execution_mode(raw: &str) -> ExecutionMode {
    match raw {
        "accept-edits" => ExecutionMode::AcceptEdits,
        "plan-mode" => ExecutionMode::PlanMode,
        "bypass-permission" => ExecutionMode::BypassPermission,
        _ => ExecutionMode::Unspecified,
    }
}

fn execution_mode_str(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::AcceptEdits => "accept-edits",
        ExecutionMode::PlanMode => "plan-mode",
        ExecutionMode::BypassPermission => "bypass-permission",
        ExecutionMode::Unspecified => "",
    }
}

fn event_from_row(row: &Row) -> Event {
    let payload: Value = row.get("payload");
    let idempotency_key: Option<String> = row.get("idempotency_key");
    Event {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        task_id: row.get("task_id"),
        event_type: row.get("type"),
        payload: json_map(payload),
        idempotency_key: idempotency_key.unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

fn input_from_row(row: &Row) -> TaskInput {
    let idempotency_key: Option<String> = row.get("idempotency_key");
    TaskInput {
        id: row.get("id"),
        task_id: row.get("task_id"),
        agent_id: row.get("agent_id"),
        kind: row.get("kind"),
        text: row.get("text"),
        send_enter: row.get("send_enter"),
        idempotency_key: idempotency_key.unwrap_or_default(),
        created_at: row.get("created_at"),
        claimed_at: row.get("claimed_at"),
    }
}

impl PgTx<'_> {
    fn get_task_locked(&mut self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let row = self
            .query_opt("select * from tasks where id = $1 for update", &[&task_id])
            .map_err(map_db_err)?;
        Ok(row.as_ref().map(task_from_row))
    }

    fn get_chain_locked(&mut self, chain_id: &str) -> Result<Option<Chain>, StoreError> {
        let row = self
            .query_opt(
                "select * from chains where id = $1 for update",
                &[&chain_id],
            )
            .map_err(map_db_err)?;
        Ok(row.as_ref().map(chain_from_row))
    }

    fn clear_agent_current_task(&mut self, agent_id: &str) -> Result<(), StoreError> {
        self.execute(
            "update agents set current_task_id = '', updated_at = now() where id = $1",
            &[&agent_id],
        )
        .map_err(map_db_err)?;
        Ok(())
    }

    fn set_agent_current_task(&mut self, agent_id: &str, task_id: &str) -> Result<(), StoreError> {
        self.execute(
            "update agents set current_task_id = $2, updated_at = now() where id = $1",
            &[&agent_id, &task_id],
        )
        .map_err(map_db_err)?;
        Ok(())
    }

    fn chain_status_counts(&mut self, chain_id: &str) -> Result<ChainCounts, StoreError> {
        let rows = self
            .query(
                "select status, count(*)::bigint as n from tasks where chain_id = $1 group by status",
                &[&chain_id],
            )
            .map_err(map_db_err)?;
        let mut counts = ChainCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.as_str() {
                "queued" => counts.queued = n,
                "in_progress" => counts.in_progress = n,
                "locked" => counts.locked = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Terminal-completion re-evaluation: failed is sticky and immediate,
    /// done requires every task terminal. Ownership is preserved.
    fn update_chain_status(&mut self, chain_id: &str) -> Result<(), StoreError> {
        let counts = self.chain_status_counts(chain_id)?;
        if counts.failed > 0 {
            self.execute(
                "update chains set status = 'failed', updated_at = now() where id = $1",
                &[&chain_id],
            )
            .map_err(map_db_err)?;
            return Ok(());
        }
        if counts.queued == 0 && counts.in_progress == 0 && counts.locked == 0 {
            self.execute(
                "update chains set status = 'done', updated_at = now() where id = $1",
                &[&chain_id],
            )
            .map_err(map_db_err)?;
        }
        Ok(())
    }

    /// Operator-driven re-evaluation: recomputes the full status ladder and
    /// releases ownership when the chain reaches a terminal state.
    fn reevaluate_chain_status(&mut self, chain_id: &str) -> Result<(), StoreError> {
        let counts = self.chain_status_counts(chain_id)?;
        let all_terminal =
            counts.queued == 0 && counts.in_progress == 0 && counts.locked == 0;
        if all_terminal {
            let status = if counts.failed > 0 { "failed" } else { "done" };
            self.execute(
                "update chains set status = $2, owner_agent_id = '', updated_at = now() where id = $1",
                &[&chain_id, &status],
            )
            .map_err(map_db_err)?;
            return Ok(());
        }
        let status = if counts.locked > 0 {
            "locked"
        } else if counts.in_progress > 0 {
            "in_progress"
        } else {
            "queued"
        };
        self.execute(
            "update chains set status = $2, updated_at = now() where id = $1",
            &[&chain_id, &status],
        )
        .map_err(map_db_err)?;
        Ok(())
    }
}

#[derive(Default)]
struct ChainCounts {
    queued: i64,
    in_progress: i64,
    locked: i64,
    failed: i64,
}

impl Store for PostgresStore {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::invalid("username_required"));
        }
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt(
                "insert into users (id, username, password_hash) values ($1, $2, $3) returning *",
                &[&new_id(), &username, &password_hash],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::Conflict)?;
        Ok(user_from_row(&row))
    }

    fn get_user_by_username(&self, username: &str) -> Result<User, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt(
                "select * from users where lower(username) = lower($1)",
                &[&username],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        Ok(user_from_row(&row))
    }

    fn get_user_by_id(&self, id: &str) -> Result<User, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt("select * from users where id = $1", &[&id])
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        Ok(user_from_row(&row))
    }

    fn create_auth_code(&self, code: AuthCode) -> Result<(), StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        conn.execute(
            "insert into auth_codes (code, user_id, agent_name, expires_at, used, created_at)
             values ($1, $2, $3, $4, $5, $6)",
            &[
                &code.code,
                &code.user_id,
                &code.agent_name,
                &code.expires_at,
                &code.used,
                &code.created_at,
            ],
        )
        .map_err(map_db_err)?;
        Ok(())
    }

    fn consume_auth_code(&self, code: &str) -> Result<AuthCode, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let row = tx
            .query_opt("select * from auth_codes where code = $1 for update", &[&code])
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        let mut auth_code = auth_code_from_row(&row);
        if auth_code.used {
            return Err(StoreError::Conflict);
        }
        if Utc::now() > auth_code.expires_at {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "update auth_codes set used = true where code = $1",
            &[&code],
        )
        .map_err(map_db_err)?;
        tx.commit().map_err(map_db_err)?;

        auth_code.used = true;
        Ok(auth_code)
    }

    fn upsert_agent(&self, req: UpsertAgentRequest) -> Result<Agent, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let agent_id = if req.agent_id.trim().is_empty() {
            new_id()
        } else {
            req.agent_id.trim().to_string()
        };

        let existing = tx
            .query_opt("select * from agents where id = $1 for update", &[&agent_id])
            .map_err(map_db_err)?;

        let agent = if let Some(row) = existing {
            let current = agent_from_row(&row);
            if !req.user_id.is_empty() && current.user_id != req.user_id {
                return Err(StoreError::NotFound);
            }

            let name = if req.name.trim().is_empty() {
                current.name.clone()
            } else {
                req.name.trim().to_string()
            };
            let status = req.status.unwrap_or(current.status);
            let claude_status = req.claude_status.unwrap_or(current.claude_status);
            let current_task_id = if req.current_task_id.trim().is_empty() {
                current.current_task_id.clone()
            } else {
                req.current_task_id.trim().to_string()
            };
            let meta = Value::Object(req.meta.unwrap_or(current.meta));

            let row = tx
                .query_opt(
                    "update agents
                     set name = $2, status = $3, claude_status = $4, current_task_id = $5,
                         meta = $6, last_seen = now(), updated_at = now()
                     where id = $1
                     returning *",
                    &[
                        &agent_id,
                        &name,
                        &status_str(status),
                        &status_str(claude_status),
                        &current_task_id,
                        &meta,
                    ],
                )
                .map_err(map_db_err)?
                .ok_or(StoreError::NotFound)?;
            agent_from_row(&row)
        } else {
            let meta = Value::Object(req.meta.unwrap_or_default());
            let row = tx
                .query_opt(
                    "insert into agents (id, user_id, name, status, claude_status, current_task_id, meta)
                     values ($1, $2, $3, $4, $5, $6, $7)
                     returning *",
                    &[
                        &agent_id,
                        &req.user_id,
                        &req.name.trim(),
                        &status_str(req.status.unwrap_or_default()),
                        &status_str(req.claude_status.unwrap_or_default()),
                        &req.current_task_id.trim(),
                        &meta,
                    ],
                )
                .map_err(map_db_err)?
                .ok_or(StoreError::Conflict)?;
            agent_from_row(&row)
        };

        tx.commit().map_err(map_db_err)?;
        Ok(agent)
    }

    fn get_agent(&self, id: &str) -> Result<Agent, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt("select * from agents where id = $1", &[&id])
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        Ok(agent_from_row(&row))
    }

    fn list_agents(&self, user_id: &str) -> Result<Vec<Agent>, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let rows = if user_id.is_empty() {
            conn.query("select * from agents order by last_seen desc", &[])
        } else {
            conn.query(
                "select * from agents where user_id = $1 order by last_seen desc",
                &[&user_id],
            )
        }
        .map_err(map_db_err)?;
        Ok(rows.iter().map(agent_from_row).collect())
    }

    fn create_channel(&self, channel: Channel) -> Result<Channel, StoreError> {
        let name = channel.name.trim();
        if name.is_empty() {
            return Err(StoreError::invalid("name_required"));
        }
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt(
                "insert into channels (id, user_id, name, description) values ($1, $2, $3, $4) returning *",
                &[
                    &new_id(),
                    &channel.user_id,
                    &name,
                    &channel.description.trim(),
                ],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::Conflict)?;
        Ok(channel_from_row(&row))
    }

    fn list_channels(&self, user_id: &str) -> Result<Vec<Channel>, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let rows = if user_id.is_empty() {
            conn.query("select * from channels order by created_at asc", &[])
        } else {
            conn.query(
                "select * from channels where user_id = $1 order by created_at asc",
                &[&user_id],
            )
        }
        .map_err(map_db_err)?;
        Ok(rows.iter().map(channel_from_row).collect())
    }

    fn get_channel_by_name(&self, user_id: &str, name: &str) -> Result<Channel, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = if user_id.is_empty() {
            conn.query_opt(
                "select * from channels where lower(name) = lower($1) limit 1",
                &[&name],
            )
        } else {
            conn.query_opt(
                "select * from channels where user_id = $1 and lower(name) = lower($2)",
                &[&user_id, &name],
            )
        }
        .map_err(map_db_err)?
        .ok_or(StoreError::NotFound)?;
        Ok(channel_from_row(&row))
    }

    fn create_chain(&self, chain: Chain) -> Result<Chain, StoreError> {
        if chain.channel_id.trim().is_empty() {
            return Err(StoreError::invalid("channel_id_required"));
        }
        if chain.name.trim().is_empty() {
            return Err(StoreError::invalid("name_required"));
        }

        let mut conn = self.conn().map_err(map_db_err)?;
        let channel_row = conn
            .query_opt(
                "select * from channels where id = $1",
                &[&chain.channel_id.trim()],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        let channel = channel_from_row(&channel_row);
        if !chain.user_id.is_empty() && channel.user_id != chain.user_id {
            return Err(StoreError::NotFound);
        }

        let row = conn
            .query_opt(
                "insert into chains (id, user_id, channel_id, name, description, status, owner_agent_id)
                 values ($1, $2, $3, $4, $5, $6, $7)
                 returning *",
                &[
                    &new_id(),
                    &channel.user_id,
                    &channel.id,
                    &chain.name.trim(),
                    &chain.description.trim(),
                    &chain.status.as_str(),
                    &chain.owner_agent_id,
                ],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::Conflict)?;
        Ok(chain_from_row(&row))
    }

    fn get_chain(&self, id: &str) -> Result<Chain, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt("select * from chains where id = $1", &[&id])
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        Ok(chain_from_row(&row))
    }

    fn list_chains(&self, user_id: &str, channel_id: &str) -> Result<Vec<Chain>, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let mut query = String::from("select * from chains");
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if !user_id.is_empty() {
            params.push(&user_id);
            clauses.push(format!("user_id = ${}", params.len()));
        }
        if !channel_id.is_empty() {
            params.push(&channel_id);
            clauses.push(format!("channel_id = ${}", params.len()));
        }
        if !clauses.is_empty() {
            query.push_str(" where ");
            query.push_str(&clauses.join(" and "));
        }
        query.push_str(" order by created_at asc");

        let rows = conn.query(&query, &params).map_err(map_db_err)?;
        Ok(rows.iter().map(chain_from_row).collect())
    }

    fn update_chain(&self, req: UpdateChainRequest) -> Result<Chain, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let existing = tx
            .get_chain_locked(req.chain_id.trim())?
            .ok_or(StoreError::NotFound)?;

        let name = match req.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => existing.name,
        };
        let description = match req.description.as_deref().map(str::trim) {
            Some(desc) if !desc.is_empty() => desc.to_string(),
            _ => existing.description,
        };
        let status = req.status.unwrap_or(existing.status);
        let owner = match req.owner_agent_id {
            Some(owner) => owner.trim().to_string(),
            None => existing.owner_agent_id,
        };

        let row = tx
            .query_opt(
                "update chains
                 set name = $2, description = $3, status = $4, owner_agent_id = $5, updated_at = now()
                 where id = $1
                 returning *",
                &[
                    &existing.id,
                    &name,
                    &description,
                    &status.as_str(),
                    &owner,
                ],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        let chain = chain_from_row(&row);
        tx.commit().map_err(map_db_err)?;
        Ok(chain)
    }

    fn delete_chain(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let affected = conn
            .execute("delete from chains where id = $1", &[&id])
            .map_err(map_db_err)?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn detach_agent_from_chain(&self, req: DetachAgentFromChainRequest) -> Result<(), StoreError> {
        let chain_id = req.chain_id.trim();
        let agent_id = req.agent_id.trim();
        if chain_id.is_empty() {
            return Err(StoreError::invalid("chain_id_required"));
        }
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let chain = tx.get_chain_locked(chain_id)?.ok_or(StoreError::NotFound)?;
        if chain.owner_agent_id != agent_id {
            return Err(StoreError::Conflict);
        }

        tx.execute(
            "update tasks set status = 'locked', updated_at = now()
             where chain_id = $1 and status = 'in_progress'",
            &[&chain_id],
        )
        .map_err(map_db_err)?;

        tx.execute(
            "update chains set owner_agent_id = '', status = 'locked', updated_at = now()
             where id = $1",
            &[&chain_id],
        )
        .map_err(map_db_err)?;

        tx.clear_agent_current_task(agent_id)?;
        tx.commit().map_err(map_db_err)?;
        Ok(())
    }

    fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        if task.channel_id.trim().is_empty() {
            return Err(StoreError::invalid("channel_id_required"));
        }
        if task.title.trim().is_empty() {
            return Err(StoreError::invalid("title_required"));
        }
        if task.chain_id.trim().is_empty() {
            return Err(StoreError::invalid("chain_id_required"));
        }

        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let channel_row = tx
            .query_opt(
                "select * from channels where id = $1",
                &[&task.channel_id.trim()],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        let channel = channel_from_row(&channel_row);

        // Lock the chain row so concurrent creates serialize on sequence
        // assignment.
        let chain = tx
            .get_chain_locked(task.chain_id.trim())?
            .ok_or_else(|| StoreError::invalid("chain_id_not_found"))?;
        if chain.channel_id != channel.id {
            return Err(StoreError::invalid("chain_id_not_found"));
        }

        let sequence = if task.sequence > 0 {
            task.sequence
        } else {
            let row = tx
                .query_opt(
                    "select coalesce(max(sequence), 0) + 1 as next from tasks where chain_id = $1",
                    &[&chain.id],
                )
                .map_err(map_db_err)?;
            row.map(|r| r.get::<_, i32>("next")).unwrap_or(1)
        };

        let row = tx
            .query_opt(
                "insert into tasks (id, user_id, channel_id, chain_id, sequence, title, description,
                                    type, agent_session_request_token, status, priority, execution_mode)
                 values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 returning *",
                &[
                    &new_id(),
                    &channel.user_id,
                    &channel.id,
                    &chain.id,
                    &sequence,
                    &task.title.trim(),
                    &task.description.trim(),
                    &task.task_type.trim(),
                    &task.agent_session_request_token,
                    &task.status.as_str(),
                    &task.priority,
                    &execution_mode_str(task.execution_mode),
                ],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::Conflict)?;
        let created = task_from_row(&row);

        // Late-arriving work re-arms a finished chain.
        tx.execute(
            "update chains set status = 'queued', updated_at = now()
             where id = $1 and status = 'done'",
            &[&chain.id],
        )
        .map_err(map_db_err)?;

        tx.commit().map_err(map_db_err)?;
        Ok(created)
    }

    fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt("select * from tasks where id = $1", &[&id])
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        Ok(task_from_row(&row))
    }

    fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let mut query = String::from("select * from tasks");
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        let status = filter.status.map(|s| s.as_str().to_string());
        if !filter.user_id.is_empty() {
            params.push(&filter.user_id);
            clauses.push(format!("user_id = ${}", params.len()));
        }
        if !filter.channel_id.is_empty() {
            params.push(&filter.channel_id);
            clauses.push(format!("channel_id = ${}", params.len()));
        }
        if !filter.chain_id.is_empty() {
            params.push(&filter.chain_id);
            clauses.push(format!("chain_id = ${}", params.len()));
        }
        if let Some(status) = status.as_ref() {
            params.push(status);
            clauses.push(format!("status = ${}", params.len()));
        }
        if !clauses.is_empty() {
            query.push_str(" where ");
            query.push_str(&clauses.join(" and "));
        }
        query.push_str(" order by created_at asc");
        let limit = filter.limit as i64;
        if limit > 0 {
            params.push(&limit);
            query.push_str(&format!(" limit ${}", params.len()));
        }

        let rows = conn.query(&query, &params).map_err(map_db_err)?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    fn claim_task(&self, req: ClaimTaskRequest) -> Result<Task, StoreError> {
        let agent_id = req.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        let channel = if !req.channel_id.trim().is_empty() {
            self.get_channel_checked(req.channel_id.trim(), &req.user_id)?
        } else if !req.channel.trim().is_empty() {
            self.get_channel_by_name(&req.user_id, req.channel.trim())?
        } else {
            return Err(StoreError::invalid("channel_id_or_channel_required"));
        };

        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let idem_key = req.idempotency_key.trim().to_string();
        if !idem_key.is_empty() {
            // Reserve the key so concurrent retries converge on one task.
            tx.execute(
                "insert into task_claim_idempotency (agent_id, idempotency_key, channel_id)
                 values ($1, $2, $3)
                 on conflict (agent_id, idempotency_key) do nothing",
                &[&agent_id, &idem_key, &channel.id],
            )
            .map_err(map_db_err)?;

            let remembered: Option<String> = tx
                .query_opt(
                    "select task_id from task_claim_idempotency
                     where agent_id = $1 and idempotency_key = $2",
                    &[&agent_id, &idem_key],
                )
                .map_err(map_db_err)?
                .map(|row| row.get("task_id"));

            if let Some(task_id) = remembered.filter(|id| !id.is_empty()) {
                let row = tx
                    .query_opt("select * from tasks where id = $1", &[&task_id])
                    .map_err(map_db_err)?
                    .ok_or(StoreError::NotFound)?;
                let task = task_from_row(&row);
                tx.set_agent_current_task(&agent_id, &task.id)?;
                tx.commit().map_err(map_db_err)?;
                return Ok(task);
            }
        }

        let row = tx
            .query_opt(
                "select * from claim_task($1, $2)",
                &[&channel.id, &agent_id],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::NoQueuedTasks)?;
        let task = task_from_row(&row);

        if !idem_key.is_empty() {
            tx.execute(
                "update task_claim_idempotency set task_id = $3
                 where agent_id = $1 and idempotency_key = $2 and task_id = ''",
                &[&agent_id, &idem_key, &task.id],
            )
            .map_err(map_db_err)?;
        }

        tx.set_agent_current_task(&agent_id, &task.id)?;
        tx.commit().map_err(map_db_err)?;
        Ok(task)
    }

    fn assign_task(&self, req: AssignTaskRequest) -> Result<Task, StoreError> {
        let task_id = req.task_id.trim();
        let agent_id = req.agent_id.trim().to_string();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let task = tx.get_task_locked(task_id)?.ok_or(StoreError::NotFound)?;
        let task = match task.status {
            TaskStatus::Queued => {
                let row = tx
                    .query_opt(
                        "update tasks
                         set status = 'in_progress', assigned_agent_id = $2,
                             claimed_at = coalesce(claimed_at, now()), updated_at = now()
                         where id = $1
                         returning *",
                        &[&task_id, &agent_id],
                    )
                    .map_err(map_db_err)?
                    .ok_or(StoreError::NotFound)?;
                task_from_row(&row)
            }
            TaskStatus::InProgress if task.assigned_agent_id == agent_id => task,
            _ => return Err(StoreError::Conflict),
        };

        tx.set_agent_current_task(&agent_id, &task.id)?;
        tx.commit().map_err(map_db_err)?;
        Ok(task)
    }

    fn complete_task(&self, req: CompleteTaskRequest) -> Result<Task, StoreError> {
        let task_id = req.task_id.trim();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        let req_agent = req.agent_id.trim();

        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let task = tx.get_task_locked(task_id)?.ok_or(StoreError::NotFound)?;

        if !req_agent.is_empty() && task.assigned_agent_id != req_agent {
            warn!(
                task_id,
                request_agent = req_agent,
                assigned_agent = %task.assigned_agent_id,
                "complete rejected: agent mismatch"
            );
            return Err(StoreError::Conflict);
        }

        if !req_agent.is_empty() {
            let current: Option<String> = tx
                .query_opt(
                    "select current_task_id from agents where id = $1",
                    &[&req_agent],
                )
                .map_err(map_db_err)?
                .map(|row| row.get("current_task_id"));
            if let Some(current) = current {
                if !current.is_empty() && current != task_id {
                    warn!(
                        task_id,
                        agent_id = req_agent,
                        current_task_id = %current,
                        "complete rejected: current task mismatch"
                    );
                    return Err(StoreError::Conflict);
                }
            }
        }

        let completed = match task.status {
            TaskStatus::Done => task,
            TaskStatus::InProgress => {
                let row = tx
                    .query_opt(
                        "update tasks
                         set status = 'done', done_at = coalesce(done_at, now()), updated_at = now()
                         where id = $1
                         returning *",
                        &[&task_id],
                    )
                    .map_err(map_db_err)?
                    .ok_or(StoreError::NotFound)?;
                task_from_row(&row)
            }
            _ => return Err(StoreError::Conflict),
        };

        let clear_agent = if req_agent.is_empty() {
            completed.assigned_agent_id.clone()
        } else {
            req_agent.to_string()
        };
        if !clear_agent.is_empty() {
            tx.clear_agent_current_task(&clear_agent)?;
        }

        if !completed.chain_id.is_empty() {
            tx.update_chain_status(&completed.chain_id)?;
        }

        tx.commit().map_err(map_db_err)?;
        Ok(completed)
    }

    fn fail_task(&self, req: FailTaskRequest) -> Result<Task, StoreError> {
        let task_id = req.task_id.trim();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        let req_agent = req.agent_id.trim();

        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let task = tx.get_task_locked(task_id)?.ok_or(StoreError::NotFound)?;
        if !req_agent.is_empty() && task.assigned_agent_id != req_agent {
            return Err(StoreError::Conflict);
        }

        let failed = match task.status {
            TaskStatus::Failed => task,
            TaskStatus::InProgress => {
                let row = tx
                    .query_opt(
                        "update tasks
                         set status = 'failed', done_at = null, updated_at = now()
                         where id = $1
                         returning *",
                        &[&task_id],
                    )
                    .map_err(map_db_err)?
                    .ok_or(StoreError::NotFound)?;
                task_from_row(&row)
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
            tx.clear_agent_current_task(&clear_agent)?;
        }

        if !failed.chain_id.is_empty() {
            tx.update_chain_status(&failed.chain_id)?;
        }

        tx.commit().map_err(map_db_err)?;
        Ok(failed)
    }

    fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<Task, StoreError> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }

        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let task = tx.get_task_locked(task_id)?.ok_or(StoreError::NotFound)?;
        if task.status != TaskStatus::Locked {
            return Err(StoreError::Conflict);
        }
        if status != TaskStatus::Queued && status != TaskStatus::Done {
            return Err(StoreError::Conflict);
        }

        let row = if status == TaskStatus::Queued {
            tx.query_opt(
                "update tasks
                 set status = 'queued', assigned_agent_id = '', claimed_at = null, updated_at = now()
                 where id = $1
                 returning *",
                &[&task_id],
            )
        } else {
            tx.query_opt(
                "update tasks
                 set status = 'done', done_at = now(), updated_at = now()
                 where id = $1
                 returning *",
                &[&task_id],
            )
        }
        .map_err(map_db_err)?
        .ok_or(StoreError::NotFound)?;
        let updated = task_from_row(&row);

        if !updated.chain_id.is_empty() {
            tx.reevaluate_chain_status(&updated.chain_id)?;
        }

        tx.commit().map_err(map_db_err)?;
        Ok(updated)
    }

    fn create_event(&self, event: Event) -> Result<Event, StoreError> {
        if event.agent_id.trim().is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }
        if event.event_type.trim().is_empty() {
            return Err(StoreError::invalid("type_required"));
        }

        let idem: Option<String> = {
            let trimmed = event.idempotency_key.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };

        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt(
                "insert into events (id, agent_id, task_id, type, payload, idempotency_key)
                 values ($1, $2, $3, $4, $5, $6)
                 returning *",
                &[
                    &new_id(),
                    &event.agent_id.trim(),
                    &event.task_id.trim(),
                    &event.event_type.trim(),
                    &Value::Object(event.payload),
                    &idem,
                ],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::Conflict)?;
        Ok(event_from_row(&row))
    }

    fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let mut query = String::from("select e.* from events e");
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if !filter.user_id.is_empty() {
            query.push_str(" join agents a on a.id = e.agent_id");
            params.push(&filter.user_id);
            clauses.push(format!("a.user_id = ${}", params.len()));
        }
        if !filter.agent_id.is_empty() {
            params.push(&filter.agent_id);
            clauses.push(format!("e.agent_id = ${}", params.len()));
        }
        if !filter.task_id.is_empty() {
            params.push(&filter.task_id);
            clauses.push(format!("e.task_id = ${}", params.len()));
        }
        if !clauses.is_empty() {
            query.push_str(" where ");
            query.push_str(&clauses.join(" and "));
        }
        query.push_str(" order by e.created_at desc");
        let limit = filter.limit as i64;
        if limit > 0 {
            params.push(&limit);
            query.push_str(&format!(" limit ${}", params.len()));
        }

        let rows = conn.query(&query, &params).map_err(map_db_err)?;
        Ok(rows.iter().map(event_from_row).collect())
    }

    fn purge_events_before(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let affected = conn
            .execute("delete from events where created_at < $1", &[&before])
            .map_err(map_db_err)?;
        Ok(affected as usize)
    }

    fn create_task_input(&self, req: CreateTaskInputRequest) -> Result<TaskInput, StoreError> {
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

        let idem: Option<String> = {
            let trimmed = req.idempotency_key.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };

        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt(
                "insert into task_inputs (id, task_id, agent_id, kind, text, send_enter, idempotency_key)
                 values ($1, $2, $3, $4, $5, $6, $7)
                 on conflict (task_id, idempotency_key) where idempotency_key is not null do nothing
                 returning *",
                &[
                    &new_id(),
                    &task_id,
                    &agent_id,
                    &kind,
                    &req.text,
                    &req.send_enter,
                    &idem,
                ],
            )
            .map_err(map_db_err)?;

        if let Some(row) = row {
            return Ok(input_from_row(&row));
        }

        // Replay: hand back the stored row unchanged.
        let row = conn
            .query_opt(
                "select * from task_inputs where task_id = $1 and idempotency_key = $2",
                &[&task_id, &idem],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::Conflict)?;
        Ok(input_from_row(&row))
    }

    fn claim_task_input(&self, req: ClaimTaskInputRequest) -> Result<TaskInput, StoreError> {
        let task_id = req.task_id.trim();
        let agent_id = req.agent_id.trim();
        if task_id.is_empty() {
            return Err(StoreError::invalid("task_id_required"));
        }
        if agent_id.is_empty() {
            return Err(StoreError::invalid("agent_id_required"));
        }

        let mut conn = self.conn().map_err(map_db_err)?;
        let mut tx = conn.transaction().map_err(map_db_err)?;

        let row = tx
            .query_opt(
                "with next as (
                     select id
                     from task_inputs
                     where task_id = $1 and agent_id = $2 and claimed_at is null
                     order by created_at asc
                     limit 1
                     for update skip locked
                 )
                 update task_inputs ti
                 set claimed_at = now()
                 from next
                 where ti.id = next.id
                 returning ti.*",
                &[&task_id, &agent_id],
            )
            .map_err(map_db_err)?
            .ok_or(StoreError::NoPendingInputs)?;
        let input = input_from_row(&row);

        tx.commit().map_err(map_db_err)?;
        Ok(input)
    }
}

impl PostgresStore {
    fn get_channel_checked(&self, channel_id: &str, user_id: &str) -> Result<Channel, StoreError> {
        let mut conn = self.conn().map_err(map_db_err)?;
        let row = conn
            .query_opt("select * from channels where id = $1", &[&channel_id])
            .map_err(map_db_err)?
            .ok_or(StoreError::NotFound)?;
        let channel = channel_from_row(&row);
        if !user_id.is_empty() && channel.user_id != user_id {
            return Err(StoreError::NotFound);
        }
        Ok(channel)
    }
}

fn status_str(status: ClaudeStatus) -> &'static str {
    match status {
        ClaudeStatus::Idle => "idle",
        ClaudeStatus::Running => "running",
        ClaudeStatus::Waiting => "waiting",
    }
}
