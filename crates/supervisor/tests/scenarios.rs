//! End-to-end pool scenarios.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive_agent::{Execution, Executor, ExecutorError, ExitReason};
use hive_core::event::EventKind;
use hive_core::{
    Assertion, BudgetScope, Commitment, EmptyBehavior, HiveConfig, ItemStatus, MemorySink, QueueSpec, StolenPriority,
    TaskId,
};
use hive_queue::EnqueueRequest;
use hive_supervisor::{Supervisor, SupervisorError, SupervisorHandle};

const DRAIN: Duration = Duration::from_secs(10);

/// Replies with the prompt after an optional delay.
struct Echo {
    delay: Duration,
}

#[async_trait]
impl Executor for Echo {
    async fn execute(&self, prompt: &str, _budget: u64) -> Result<Execution, ExecutorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Execution { output: prompt.to_string(), tokens_consumed: 10 })
    }
}

fn echo() -> Arc<Echo> {
    Arc::new(Echo { delay: Duration::ZERO })
}

/// Fails every third call.
#[derive(Default)]
struct Flaky {
    calls: AtomicUsize,
}

#[async_trait]
impl Executor for Flaky {
    async fn execute(&self, prompt: &str, _budget: u64) -> Result<Execution, ExecutorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if call % 3 == 2 {
            return Err(ExecutorError::Failed { message: "flaked".into(), tokens_consumed: 3 });
        }
        Ok(Execution { output: prompt.to_string(), tokens_consumed: 10 })
    }
}

/// Fails every call whose prompt contains `prefix`.
struct FailsFor {
    prefix: &'static str,
    calls: AtomicUsize,
}

#[async_trait]
impl Executor for FailsFor {
    async fn execute(&self, prompt: &str, _budget: u64) -> Result<Execution, ExecutorError> {
        if prompt.contains(self.prefix) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Err(ExecutorError::Failed { message: "cannot do A".into(), tokens_consumed: 2 });
        }
        Ok(Execution { output: prompt.to_string(), tokens_consumed: 10 })
    }
}

/// Never returns.
struct Hang;

#[async_trait]
impl Executor for Hang {
    async fn execute(&self, _prompt: &str, _budget: u64) -> Result<Execution, ExecutorError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Execution { output: "late".into(), tokens_consumed: 1 })
    }
}

/// Panics on its first call.
#[derive(Default)]
struct PanicOnce {
    panicked: AtomicBool,
}

#[async_trait]
impl Executor for PanicOnce {
    async fn execute(&self, prompt: &str, _budget: u64) -> Result<Execution, ExecutorError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("executor blew up");
        }
        Ok(Execution { output: prompt.to_string(), tokens_consumed: 10 })
    }
}

fn config() -> HiveConfig {
    let mut config = HiveConfig::default();
    config.pool.tick_ms = 10;
    config.pool.min_agents = 1;
    config.pool.max_agents = 2;
    config.agent.idle_backoff_ms = 10;
    config.agent.operation_timeout_ms = 2_000;
    config
}

fn says_done(assignment: &str) -> EnqueueRequest {
    EnqueueRequest::new(assignment).commitment(Commitment::new("says done", Assertion::Contains { text: "done".into() }))
}

fn start(config: HiveConfig, executor: Arc<dyn Executor>, sink: &Arc<MemorySink>) -> SupervisorHandle {
    Supervisor::new(config, executor, sink.clone()).start()
}

fn spec(name: &str) -> QueueSpec {
    QueueSpec::new(name, TaskId::new())
}

fn count(sink: &MemorySink, predicate: impl Fn(&EventKind) -> bool) -> usize {
    sink.filter(predicate).len()
}

#[tokio::test]
async fn test_exhausted_item_is_dead_lettered_while_others_complete() {
    let sink = Arc::new(MemorySink::new());
    let pool = start(config(), echo(), &sink);
    let queue = pool.add_queue(spec("work")).await.unwrap();

    let a = pool.enqueue(queue.id(), says_done("A never finishes").max_attempts(2)).await.unwrap();
    let b = pool.enqueue(queue.id(), says_done("B is done").max_attempts(2)).await.unwrap();
    let c = pool.enqueue(queue.id(), says_done("C is done").max_attempts(2)).await.unwrap();

    pool.wait_drained(DRAIN).await.unwrap();

    let dead = pool.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, a);
    assert_eq!(dead[0].attempts, 2);
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("says done"));

    for id in [b, c] {
        let item = queue.snapshot(id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.attempts, 1);
    }
    assert_eq!(count(&sink, |k| matches!(k, EventKind::ItemDeadLettered { item, .. } if *item == a)), 1);

    let report = pool.shutdown().await.unwrap();
    assert_eq!(report.dead_letters.len(), 1);
    assert_eq!(report.snapshot.live_items(), 0);
}

#[tokio::test]
async fn test_item_failing_execution_is_dead_lettered_while_others_complete() {
    let sink = Arc::new(MemorySink::new());
    let executor = Arc::new(FailsFor { prefix: "A", calls: AtomicUsize::new(0) });
    let pool = start(config(), executor.clone(), &sink);
    let queue = pool.add_queue(spec("work")).await.unwrap();

    let a = pool.enqueue(queue.id(), says_done("A is done").max_attempts(2)).await.unwrap();
    let b = pool.enqueue(queue.id(), says_done("B is done").max_attempts(2)).await.unwrap();
    let c = pool.enqueue(queue.id(), says_done("C is done").max_attempts(2)).await.unwrap();

    pool.wait_drained(DRAIN).await.unwrap();

    let dead = pool.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, a);
    assert_eq!(dead[0].attempts, 2);
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("execution failed"));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

    for id in [b, c] {
        let item = queue.snapshot(id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.attempts, 1);
    }

    let report = pool.shutdown().await.unwrap();
    assert_eq!(report.snapshot.live_items(), 0);
}

#[tokio::test]
async fn test_exhausted_pool_budget_dead_letters_remaining_items() {
    let mut config = config();
    config.pool.token_budget = 4_005;
    config.agent.operation_tokens = 4_000;
    let sink = Arc::new(MemorySink::new());
    let pool = start(config, echo(), &sink);
    let queue = pool.add_queue(spec("work")).await.unwrap();

    for name in ["A is done", "B is done", "C is done"] {
        pool.enqueue(queue.id(), says_done(name).max_attempts(3)).await.unwrap();
    }

    pool.wait_drained(DRAIN).await.unwrap();

    let depth = queue.depth();
    assert_eq!(depth.completed, 1);
    assert_eq!(depth.dead_lettered, 2);

    let dead = pool.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 2);
    for item in &dead {
        assert_eq!(item.attempts, 3);
        assert!(item.last_error.as_deref().unwrap_or_default().contains("budget exceeded"));
    }
    let refusals = sink.filter(|k| matches!(k, EventKind::BudgetExceeded { .. }));
    assert!(refusals.len() >= 6);
    assert!(refusals.iter().all(|k| matches!(k, EventKind::BudgetExceeded { scope: BudgetScope::Pool, .. })));
    assert_eq!(count(&sink, |k| matches!(k, EventKind::ItemDeadLettered { .. })), 2);

    let report = pool.shutdown().await.unwrap();
    assert_eq!(report.snapshot.live_items(), 0);
    assert_eq!(report.snapshot.tokens_used, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_item_is_claimed_once_by_racing_agents() {
    let sink = Arc::new(MemorySink::new());
    let mut config = config();
    config.pool.min_agents = 2;
    let pool = start(config, echo(), &sink);
    let queue = pool.add_queue(spec("race")).await.unwrap();
    let id = pool.enqueue(queue.id(), says_done("one done")).await.unwrap();

    pool.wait_drained(DRAIN).await.unwrap();

    let claims = count(&sink, |k| {
        matches!(k, EventKind::ItemTransition { item, from: ItemStatus::Pending, to: ItemStatus::Claimed, .. } if *item == id)
    });
    assert_eq!(claims, 1);
    assert_eq!(queue.snapshot(id).unwrap().attempts, 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_work_lost_under_flaky_executor() {
    let sink = Arc::new(MemorySink::new());
    let mut config = config();
    config.pool.max_agents = 4;
    config.circuit.failure_threshold = 100;
    let pool = start(config, Arc::new(Flaky::default()), &sink);
    let queue = pool.add_queue(spec("bulk")).await.unwrap();

    let mut ids = Vec::new();
    for n in 0..20 {
        ids.push(pool.enqueue(queue.id(), says_done(&format!("item {} done", n)).max_attempts(10)).await.unwrap());
    }

    pool.wait_drained(DRAIN).await.unwrap();

    let depth = queue.depth();
    assert_eq!(depth.completed, 20);
    assert_eq!(depth.dead_lettered, 0);
    for id in ids {
        let item = queue.snapshot(id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        let completions = count(&sink, |k| {
            matches!(k, EventKind::ItemTransition { item, to: ItemStatus::Completed, .. } if *item == id)
        });
        assert_eq!(completions, 1);
    }
    pool.shutdown().await.unwrap();
}

async fn stealing_pool(policy: StolenPriority) -> (Arc<MemorySink>, SupervisorHandle, hive_core::QueueId) {
    let sink = Arc::new(MemorySink::new());
    let mut config = config();
    config.pool.max_agents = 1;
    config.pool.stolen_priority = policy;
    let pool = start(config, echo(), &sink);

    pool.add_queue(
        spec("helper")
            .with_empty_behavior(EmptyBehavior::StealFromOthers)
            .with_stealing(true)
            .with_priority(7),
    )
    .await
    .unwrap();
    let busy = pool.add_queue(spec("busy").with_priority(2)).await.unwrap();
    for n in 0..4 {
        busy.enqueue(says_done(&format!("task {} done", n))).unwrap();
    }
    (sink, pool, busy.id())
}

#[tokio::test]
async fn test_idle_agent_steals_from_busy_queue() {
    let (sink, pool, busy) = stealing_pool(StolenPriority::Original).await;
    pool.wait_drained(DRAIN).await.unwrap();

    let stolen = count(&sink, |k| matches!(k, EventKind::ItemStolen { from_queue, .. } if *from_queue == busy));
    assert_eq!(stolen, 4);

    let report = pool.shutdown().await.unwrap();
    let items: Vec<_> = report.items.iter().filter(|i| i.queue_id == busy).collect();
    assert_eq!(items.len(), 4);
    assert!(items.iter().all(|i| i.status == ItemStatus::Completed && i.priority == 2));
}

#[tokio::test]
async fn test_stolen_items_can_inherit_thief_priority() {
    let (_sink, pool, busy) = stealing_pool(StolenPriority::Inherit).await;
    pool.wait_drained(DRAIN).await.unwrap();

    let report = pool.shutdown().await.unwrap();
    let items: Vec<_> = report.items.iter().filter(|i| i.queue_id == busy).collect();
    assert!(items.iter().all(|i| i.status == ItemStatus::Completed && i.priority == 7));
}

#[tokio::test]
async fn test_repeated_timeouts_dead_letter_item() {
    let sink = Arc::new(MemorySink::new());
    let mut config = config();
    config.agent.operation_timeout_ms = 50;
    config.agent.reap_threshold = 10;
    let pool = start(config, Arc::new(Hang), &sink);
    let queue = pool.add_queue(spec("slow")).await.unwrap();
    let id = pool.enqueue(queue.id(), says_done("never returns").max_attempts(2)).await.unwrap();

    pool.wait_drained(DRAIN).await.unwrap();

    let item = queue.snapshot(id).unwrap();
    assert_eq!(item.status, ItemStatus::DeadLettered);
    assert_eq!(item.attempts, 2);
    assert_eq!(count(&sink, |k| matches!(k, EventKind::OperationTimedOut { .. })), 2);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pool_scales_with_backlog_and_back_down() {
    let sink = Arc::new(MemorySink::new());
    let mut config = config();
    config.pool.min_agents = 0;
    config.pool.max_agents = 3;
    config.pool.scale_up_backlog = 2;
    let pool = start(config, Arc::new(Echo { delay: Duration::from_millis(50) }), &sink);
    let queue = pool.add_queue(spec("scaled")).await.unwrap();
    assert_eq!(pool.snapshot().await.unwrap().agents.len(), 0);

    for n in 0..6 {
        queue.enqueue(says_done(&format!("job {} done", n))).unwrap();
    }
    pool.wait_drained(DRAIN).await.unwrap();

    assert_eq!(count(&sink, |k| matches!(k, EventKind::PoolScaled { from: 0, to: 3, .. })), 1);
    assert_eq!(count(&sink, |k| matches!(k, EventKind::AgentSpawned { .. })), 3);

    tokio::time::timeout(DRAIN, async {
        while !pool.snapshot().await.unwrap().agents.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let report = pool.shutdown().await.unwrap();
    assert_eq!(report.exits.len(), 3);
    assert!(report.exits.iter().all(|e| e.reason == ExitReason::Shutdown));
}

#[tokio::test]
async fn test_panicked_agent_work_is_recovered() {
    let sink = Arc::new(MemorySink::new());
    let pool = start(config(), Arc::new(PanicOnce::default()), &sink);
    let queue = pool.add_queue(spec("fragile")).await.unwrap();
    let id = pool.enqueue(queue.id(), says_done("survive done")).await.unwrap();

    pool.wait_drained(DRAIN).await.unwrap();

    let item = queue.snapshot(id).unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.attempts, 2);
    assert_eq!(count(&sink, |k| matches!(k, EventKind::ItemsRecovered { count: 1, .. })), 1);

    let report = pool.shutdown().await.unwrap();
    assert!(report.exits.iter().any(|e| e.reason == ExitReason::Crashed));
}

#[tokio::test]
async fn test_shutdown_gives_back_in_flight_work() {
    let sink = Arc::new(MemorySink::new());
    let pool = start(config(), Arc::new(Hang), &sink);
    let queue = pool.add_queue(spec("pending")).await.unwrap();
    let id = pool.enqueue(queue.id(), says_done("long job done")).await.unwrap();

    tokio::time::timeout(DRAIN, async {
        while queue.depth().in_flight == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let report = pool.shutdown().await.unwrap();
    assert_eq!(report.exits.len(), 1);
    assert_eq!(report.exits[0].reason, ExitReason::Shutdown);
    let item = report.items.iter().find(|i| i.id == id).unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.attempts, 0);
    assert!(report.dead_letters.is_empty());
    assert!(report.snapshot.agents.is_empty());

    assert!(matches!(pool.snapshot().await, Err(SupervisorError::Stopped)));
}

#[tokio::test]
async fn test_unknown_queue_is_rejected() {
    let sink = Arc::new(MemorySink::new());
    let pool = start(config(), echo(), &sink);
    let err = pool.enqueue(hive_core::QueueId::new(), says_done("x")).await.unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownQueue(_)));
    pool.shutdown().await.unwrap();
}
