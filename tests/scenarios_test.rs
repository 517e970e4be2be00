//! End-to-end scenario tests driving `ExecutionService` against an
//! in-memory `BlobStore`, the way a deployer exercises the crate through
//! its public surface rather than individual state-machine functions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use object_store::memory::InMemory;
use serde::{Deserialize, Serialize};

use foreman::model::{Action, Block, CheckRole, Checks, FailureReason, Plan, Sequence, Status};
use foreman::plugin::{Plugin, PluginContext, PluginError, PluginRegistry};
use foreman::store::{BlobStore, BlobStoreConfig, SearchFilters, Store};
use foreman::{ExecutionService, ExecutorConfig};

#[derive(Default, Serialize, Deserialize)]
struct Req {}
#[derive(Serialize, Deserialize)]
struct Resp {}

/// Always succeeds, recording its tag to a shared log in call order.
struct LoggingOk {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}
#[async_trait]
impl Plugin for LoggingOk {
    type Request = Req;
    type Response = Resp;
    fn name(&self) -> &str {
        self.tag
    }
    // Used both inside Sequences and inside Checks groups across these
    // scenarios; marking it a check plugin unconditionally satisfies
    // validate_for_start wherever it ends up without needing two types.
    fn is_check_plugin(&self) -> bool {
        true
    }
    async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
        self.log.lock().unwrap().push(self.tag);
        Ok(Resp {})
    }
}

struct AlwaysFails {
    tag: &'static str,
}
#[async_trait]
impl Plugin for AlwaysFails {
    type Request = Req;
    type Response = Resp;
    fn name(&self) -> &str {
        self.tag
    }
    fn is_check_plugin(&self) -> bool {
        true
    }
    async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
        Err(PluginError::permanent("nope"))
    }
}

/// Fails only for requests whose string payload names it in `should_fail`.
struct FailsByRequest {
    tag: &'static str,
    should_fail: Vec<&'static str>,
}
#[async_trait]
impl Plugin for FailsByRequest {
    type Request = String;
    type Response = Resp;
    fn name(&self) -> &str {
        self.tag
    }
    async fn execute(&self, _ctx: &PluginContext, req: String) -> Result<Resp, PluginError> {
        if self.should_fail.contains(&req.as_str()) {
            Err(PluginError::permanent("nope"))
        } else {
            Ok(Resp {})
        }
    }
}

/// Sleeps for a fixed duration on every call; used to give an external
/// `Stop` something to cancel mid-flight.
struct SleepFor(Duration);
#[async_trait]
impl Plugin for SleepFor {
    type Request = Req;
    type Response = Resp;
    fn name(&self) -> &str {
        "sleep"
    }
    async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
        tokio::time::sleep(self.0).await;
        Ok(Resp {})
    }
}

/// Succeeds on its first `trip_after` calls, then fails permanently —
/// models a continuous check that trips partway through a run.
struct TripsAfter {
    trip_after: u32,
    calls: AtomicU32,
}
#[async_trait]
impl Plugin for TripsAfter {
    type Request = Req;
    type Response = Resp;
    fn name(&self) -> &str {
        "cont_probe"
    }
    fn is_check_plugin(&self) -> bool {
        true
    }
    async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.trip_after {
            Ok(Resp {})
        } else {
            Err(PluginError::permanent("tripped"))
        }
    }
}

fn store() -> Arc<dyn Store> {
    Arc::new(BlobStore::new(Arc::new(InMemory::new()), BlobStoreConfig::default()))
}

fn plugin_action(plan_id: foreman::EntityId, name: &str, plugin: &str) -> Action {
    Action::new(plan_id, name, plugin, serde_json::json!({}))
}

/// Scenario 1: Happy path — Pre{A1}, one Block (Concurrency=1, Tolerated=0)
/// with Sequence{A2, A3}, Post{A4}; every plugin succeeds.
#[tokio::test]
async fn happy_path_runs_every_action_in_order_and_completes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = PluginRegistry::builder()
        .register(LoggingOk { tag: "a1", log: log.clone() })
        .register(LoggingOk { tag: "a2", log: log.clone() })
        .register(LoggingOk { tag: "a3", log: log.clone() })
        .register(LoggingOk { tag: "a4", log: log.clone() })
        .build();
    let store = store();
    let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
        .await
        .unwrap();

    let mut plan = Plan::new("happy-path");
    plan.pre = Some(Checks::new(plan.id, CheckRole::Pre).with_actions(vec![plugin_action(plan.id, "a1", "a1")]));
    plan.post = Some(Checks::new(plan.id, CheckRole::Post).with_actions(vec![plugin_action(plan.id, "a4", "a4")]));
    let sequence = Sequence::new(plan.id, "s1")
        .with_actions(vec![plugin_action(plan.id, "a2", "a2"), plugin_action(plan.id, "a3", "a3")]);
    plan.blocks = vec![Block::new(plan.id, "b1").with_concurrency(1).with_tolerated_failures(0).with_sequences(vec![sequence])];
    let plan_id = plan.id;
    store.create(&plan).await.unwrap();

    service.start(plan_id).await.unwrap();
    service.wait(plan_id).await.unwrap();

    let finished = store.read(plan_id).await.unwrap();
    assert_eq!(finished.state.status(), Status::Completed);
    let fields = finished.state_fields();
    assert!(fields.end.unwrap() > fields.start.unwrap());
    assert_eq!(*log.lock().unwrap(), vec!["a1", "a2", "a3", "a4"]);
}

/// Scenario 2: PreCheck failure — A1 returns a permanent error. ExecBlocks
/// and plan-level Cont never run; Deferred always runs regardless.
#[tokio::test]
async fn pre_check_failure_fails_fast_but_still_runs_deferred() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = PluginRegistry::builder()
        .register(AlwaysFails { tag: "a1" })
        .register(LoggingOk { tag: "a2", log: log.clone() })
        .register(LoggingOk { tag: "d1", log: log.clone() })
        .build();
    let store = store();
    let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
        .await
        .unwrap();

    let mut plan = Plan::new("pre-check-failure");
    plan.pre = Some(Checks::new(plan.id, CheckRole::Pre).with_actions(vec![plugin_action(plan.id, "a1", "a1")]));
    plan.deferred = Some(Checks::new(plan.id, CheckRole::Deferred).with_actions(vec![plugin_action(plan.id, "d1", "d1")]));
    let sequence = Sequence::new(plan.id, "s1").with_actions(vec![plugin_action(plan.id, "a2", "a2")]);
    plan.blocks = vec![Block::new(plan.id, "b1").with_sequences(vec![sequence])];
    let plan_id = plan.id;
    store.create(&plan).await.unwrap();

    service.start(plan_id).await.unwrap();
    service.wait(plan_id).await.unwrap();

    let finished = store.read(plan_id).await.unwrap();
    assert_eq!(finished.state.status(), Status::Failed);
    assert_eq!(finished.failure_reason, FailureReason::PreCheck);
    assert_eq!(finished.blocks[0].state.status(), Status::NotStarted);
    assert_eq!(*log.lock().unwrap(), vec!["d1"]);
}

/// Scenario 3: Block tolerance — Concurrency=3, Tolerated=1, four sequences,
/// two fail. Exceeding tolerance fails the block and the plan (Reason=Block).
#[tokio::test]
async fn block_exceeding_tolerance_fails_the_plan_with_block_reason() {
    let registry = PluginRegistry::builder()
        .register(FailsByRequest { tag: "by_name", should_fail: vec!["s1", "s2"] })
        .build();
    let store = store();
    let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
        .await
        .unwrap();

    let mut plan = Plan::new("block-tolerance");
    let seq = |name: &str| {
        Sequence::new(plan.id, name).with_actions(vec![Action::new(plan.id, "a", "by_name", serde_json::json!(name))])
    };
    plan.blocks = vec![Block::new(plan.id, "b1")
        .with_concurrency(3)
        .with_tolerated_failures(1)
        .with_sequences(vec![seq("s1"), seq("s2"), seq("s3"), seq("s4")])];
    let plan_id = plan.id;
    store.create(&plan).await.unwrap();

    service.start(plan_id).await.unwrap();
    service.wait(plan_id).await.unwrap();

    let finished = store.read(plan_id).await.unwrap();
    assert_eq!(finished.blocks[0].state.status(), Status::Failed);
    assert_eq!(finished.state.status(), Status::Failed);
    assert_eq!(finished.failure_reason, FailureReason::Block);
}

/// Scenario 3b: exactly one failure within tolerance completes the block
/// (and the plan) rather than failing it.
#[tokio::test]
async fn block_within_tolerance_completes() {
    let registry = PluginRegistry::builder()
        .register(FailsByRequest { tag: "by_name", should_fail: vec!["s1"] })
        .build();
    let store = store();
    let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
        .await
        .unwrap();

    let mut plan = Plan::new("block-tolerance-ok");
    let seq = |name: &str| {
        Sequence::new(plan.id, name).with_actions(vec![Action::new(plan.id, "a", "by_name", serde_json::json!(name))])
    };
    plan.blocks = vec![Block::new(plan.id, "b1")
        .with_concurrency(2)
        .with_tolerated_failures(1)
        .with_sequences(vec![seq("s1"), seq("s2")])];
    let plan_id = plan.id;
    store.create(&plan).await.unwrap();

    service.start(plan_id).await.unwrap();
    service.wait(plan_id).await.unwrap();

    let finished = store.read(plan_id).await.unwrap();
    assert_eq!(finished.state.status(), Status::Completed);
}

/// Scenario 4: Cont-check trip mid-run — a long-running sequence under a
/// Cont probe that succeeds once then fails. The in-flight sequence is
/// cancelled, the plan fails with Reason=ContCheck, and Deferred still runs.
#[tokio::test]
async fn continuous_check_trip_cancels_the_in_flight_block_and_fails_the_plan() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = PluginRegistry::builder()
        .register(TripsAfter { trip_after: 1, calls: AtomicU32::new(0) })
        .register(SleepFor(Duration::from_secs(5)))
        .register(LoggingOk { tag: "d1", log: log.clone() })
        .build();
    let store = store();
    let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
        .await
        .unwrap();

    let mut plan = Plan::new("cont-trip");
    plan.cont = Some(Checks::new(plan.id, CheckRole::Cont).with_delay(Duration::from_millis(10)).with_actions(vec![
        plugin_action(plan.id, "probe", "cont_probe"),
    ]));
    plan.deferred = Some(Checks::new(plan.id, CheckRole::Deferred).with_actions(vec![plugin_action(plan.id, "d1", "d1")]));
    let sequence = Sequence::new(plan.id, "s1").with_actions(vec![Action::new(plan.id, "a1", "sleep", serde_json::json!({}))]);
    plan.blocks = vec![Block::new(plan.id, "b1").with_sequences(vec![sequence])];
    let plan_id = plan.id;
    store.create(&plan).await.unwrap();

    service.start(plan_id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), service.wait(plan_id))
        .await
        .expect("plan should fail promptly once Cont trips")
        .unwrap();

    let finished = store.read(plan_id).await.unwrap();
    assert_eq!(finished.state.status(), Status::Failed);
    assert_eq!(finished.failure_reason, FailureReason::ContCheck);
    assert_eq!(finished.blocks[0].sequences[0].state.status(), Status::Stopped);
    assert_eq!(*log.lock().unwrap(), vec!["d1"]);
}

/// Scenario 5: Recovery of a crashed Create — an entry blob written without
/// its matching object (simulating a crash between the two uploads) is
/// deleted by `recovery()`; the plan reads as not-found and is absent from
/// `list`.
#[tokio::test]
async fn recovery_deletes_an_entry_left_without_an_object() {
    use foreman::store::blob::backend::BlobBackend;
    use foreman::store::blob::entry::PlanEntry;
    use foreman::store::blob::layout::plan_entry_path;

    let object_store: Arc<dyn object_store::ObjectStore> = Arc::new(InMemory::new());
    let config = BlobStoreConfig::default();
    let backend = BlobBackend::new(object_store.clone(), config.clone());

    let plan = Plan::new("crash-mid-create");
    let container = backend.container_for(plan.id);
    backend
        .put_json(&plan_entry_path(&container, plan.id), &PlanEntry::from_plan(&plan))
        .await
        .unwrap();

    let store: Arc<dyn Store> = Arc::new(BlobStore::new(object_store, config));
    let report = store.recovery().await.unwrap();
    assert_eq!(report.orphan_entries_deleted, 1);

    assert!(store.read(plan.id).await.is_err());

    let mut listing = store.list(100).await.unwrap();
    let mut seen = Vec::new();
    while let Some(r) = listing.next().await {
        seen.push(r.unwrap().plan_id);
    }
    assert!(!seen.contains(&plan.id));
}

/// Scenario 6: Stop mid-run — a long-sleeping action is cancelled promptly
/// by `stop`; the sequence and plan end Stopped, and Deferred still runs
/// under its own detached context.
#[tokio::test]
async fn stop_cancels_a_sleeping_action_and_still_runs_deferred() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = PluginRegistry::builder()
        .register(SleepFor(Duration::from_secs(10)))
        .register(LoggingOk { tag: "d1", log: log.clone() })
        .build();
    let store = store();
    let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
        .await
        .unwrap();

    let mut plan = Plan::new("stop-mid-run");
    plan.deferred = Some(Checks::new(plan.id, CheckRole::Deferred).with_actions(vec![plugin_action(plan.id, "d1", "d1")]));
    let sequence = Sequence::new(plan.id, "s1").with_actions(vec![Action::new(plan.id, "a1", "sleep", serde_json::json!({}))]);
    plan.blocks = vec![Block::new(plan.id, "b1").with_sequences(vec![sequence])];
    let plan_id = plan.id;
    store.create(&plan).await.unwrap();

    service.start(plan_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stopped_at = std::time::Instant::now();
    service.stop(plan_id).unwrap();
    tokio::time::timeout(Duration::from_millis(200), service.wait(plan_id))
        .await
        .expect("stop should cancel the in-flight action within 100ms")
        .unwrap();
    assert!(stopped_at.elapsed() < Duration::from_millis(200));

    let finished = store.read(plan_id).await.unwrap();
    assert_eq!(finished.blocks[0].sequences[0].state.status(), Status::Stopped);
    assert_eq!(finished.state.status(), Status::Stopped);
    assert_eq!(*log.lock().unwrap(), vec!["d1"]);
}

/// (Supplemental) several concurrent `read`s of the same plan, routed
/// through the single-flight dedup path, all observe the same tree.
#[tokio::test]
async fn concurrent_reads_of_the_same_plan_observe_a_consistent_tree() {
    let store = store();
    let mut plan = Plan::new("concurrent-read");
    plan.pre = Some(Checks::new(plan.id, CheckRole::Pre).with_actions(vec![plugin_action(plan.id, "a1", "noop")]));
    let plan_id = plan.id;
    store.create(&plan).await.unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.read(plan_id).await })
        })
        .collect();

    for r in readers {
        let read_back = r.await.unwrap().unwrap();
        assert_eq!(read_back.id, plan_id);
        assert_eq!(read_back.pre.unwrap().actions.len(), 1);
    }
}
