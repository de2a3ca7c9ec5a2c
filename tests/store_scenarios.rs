use chrono::Utc;
use foreman::model::{
    Chain, ChainStatus, Channel, ClaudeStatus, ExecutionMode, Task, TaskStatus,
};
use foreman::store::{
    ClaimTaskRequest, CompleteTaskRequest, MemoryStore, Store, StoreError, TaskFilter,
    UpsertAgentRequest,
};
use std::sync::Arc;
use std::thread;

fn channel(store: &dyn Store, user_id: &str, name: &str) -> Channel {
    store
        .create_channel(Channel {
            id: String::new(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            created_at: Utc::now(),
        })
        .expect("create channel")
}

fn chain(store: &dyn Store, channel: &Channel, name: &str) -> Chain {
    store
        .create_chain(Chain {
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

fn task(store: &dyn Store, channel: &Channel, chain: &Chain, seq: i32, title: &str) -> Task {
    store
        .create_task(Task {
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

fn heartbeat(store: &dyn Store, user_id: &str, agent_id: &str) {
    store
        .upsert_agent(UpsertAgentRequest {
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            name: format!("agent-{agent_id}"),
            status: None,
            claude_status: Some(ClaudeStatus::Idle),
            current_task_id: String::new(),
            meta: None,
        })
        .expect("upsert agent");
}

/// Many workers polling one channel never receive the same task twice, and a
/// chain never runs more than one task at a time.
#[test]
fn concurrent_claims_hand_out_each_task_once() {
    let store = Arc::new(MemoryStore::new());
    let ch = channel(store.as_ref(), "u1", "ops");

    // Ten chains with one task each: ten claimable units.
    for n in 0..10 {
        let c = chain(store.as_ref(), &ch, &format!("chain-{n}"));
        task(store.as_ref(), &ch, &c, 1, &format!("work-{n}"));
    }
    for n in 0..8 {
        heartbeat(store.as_ref(), "u1", &format!("agent-{n}"));
    }

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        let channel_id = ch.id.clone();
        handles.push(thread::spawn(move || {
            let mut claimed = Vec::new();
            loop {
                match store.claim_task(ClaimTaskRequest {
                    user_id: "u1".to_string(),
                    agent_id: format!("agent-{n}"),
                    channel_id: channel_id.clone(),
                    channel: String::new(),
                    idempotency_key: String::new(),
                }) {
                    Ok(task) => {
                        claimed.push(task.id.clone());
                        store
                            .complete_task(CompleteTaskRequest {
                                task_id: task.id,
                                agent_id: format!("agent-{n}"),
                            })
                            .expect("complete claimed task");
                    }
                    Err(StoreError::NoQueuedTasks) => break,
                    Err(err) => panic!("unexpected claim error: {err}"),
                }
            }
            claimed
        }));
    }

    let mut all: Vec<String> = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("worker thread"));
    }

    all.sort();
    let before_dedup = all.len();
    all.dedup();
    assert_eq!(before_dedup, all.len(), "a task was claimed twice");
    assert_eq!(all.len(), 10);

    // Every chain drained to done.
    for c in store.list_chains("u1", "").unwrap() {
        assert_eq!(c.status, ChainStatus::Done);
    }
}

/// Replaying the same idempotency key from many threads converges on one
/// task; other tasks stay queued.
#[test]
fn concurrent_idempotent_replays_converge() {
    let store = Arc::new(MemoryStore::new());
    let ch = channel(store.as_ref(), "u1", "ops");
    for n in 0..4 {
        let c = chain(store.as_ref(), &ch, &format!("chain-{n}"));
        task(store.as_ref(), &ch, &c, 1, &format!("work-{n}"));
    }
    heartbeat(store.as_ref(), "u1", "agent-a");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let channel_id = ch.id.clone();
        handles.push(thread::spawn(move || {
            store
                .claim_task(ClaimTaskRequest {
                    user_id: "u1".to_string(),
                    agent_id: "agent-a".to_string(),
                    channel_id,
                    channel: String::new(),
                    idempotency_key: "retry-1".to_string(),
                })
                .expect("claim")
                .id
        }));
    }

    let ids: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "replays diverged");

    let in_progress = store
        .list_tasks(TaskFilter {
            user_id: "u1".to_string(),
            status: Some(TaskStatus::InProgress),
            ..TaskFilter::default()
        })
        .unwrap();
    assert_eq!(in_progress.len(), 1);
}

/// Chain ordering: the oldest chain drains first, and within it tasks run in
/// ascending sequence.
#[test]
fn claim_order_prefers_oldest_chain_then_sequence() {
    let store = MemoryStore::new();
    let ch = channel(&store, "u1", "ops");

    let first = chain(&store, &ch, "first-chain");
    let t11 = task(&store, &ch, &first, 1, "t11");
    let t12 = task(&store, &ch, &first, 2, "t12");
    // Keep chain creation times strictly ordered on coarse clocks.
    thread::sleep(std::time::Duration::from_millis(2));
    let second = chain(&store, &ch, "second-chain");
    let t21 = task(&store, &ch, &second, 1, "t21");

    heartbeat(&store, "u1", "agent-a");
    heartbeat(&store, "u1", "agent-b");

    let claim = |agent: &str| {
        store.claim_task(ClaimTaskRequest {
            user_id: "u1".to_string(),
            agent_id: agent.to_string(),
            channel_id: ch.id.clone(),
            channel: String::new(),
            idempotency_key: String::new(),
        })
    };
    let complete = |agent: &str, task_id: &str| {
        store
            .complete_task(CompleteTaskRequest {
                task_id: task_id.to_string(),
                agent_id: agent.to_string(),
            })
            .expect("complete");
    };

    // A takes the oldest chain; B is pushed to the younger one.
    assert_eq!(claim("agent-a").unwrap().id, t11.id);
    assert_eq!(claim("agent-b").unwrap().id, t21.id);

    complete("agent-a", &t11.id);
    assert_eq!(claim("agent-a").unwrap().id, t12.id);
    complete("agent-a", &t12.id);
    complete("agent-b", &t21.id);

    assert!(matches!(
        claim("agent-a"),
        Err(StoreError::NoQueuedTasks)
    ));
}

/// Claims resolve the channel by case-insensitive name within the tenant.
#[test]
fn claim_by_channel_name_is_case_insensitive() {
    let store = MemoryStore::new();
    let ch = channel(&store, "u1", "Ops-Main");
    let c = chain(&store, &ch, "pipeline");
    let t1 = task(&store, &ch, &c, 1, "first");
    heartbeat(&store, "u1", "agent-a");

    let claimed = store
        .claim_task(ClaimTaskRequest {
            user_id: "u1".to_string(),
            agent_id: "agent-a".to_string(),
            channel_id: String::new(),
            channel: "ops-main".to_string(),
            idempotency_key: String::new(),
        })
        .expect("claim by name");
    assert_eq!(claimed.id, t1.id);
}
