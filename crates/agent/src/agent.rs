//! Agent runtime: the worker state machine driven against a queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use hive_bulkhead::{Bulkhead, BulkheadError};
use hive_core::event::{emit, EventKind, Events};
use hive_core::{
    AgentConfig, AgentEvent, AgentId, AgentSnapshot, AgentState, EmptyBehavior,
    InvalidTransition, ItemId, QueueId, WorkItem, WorkerProfile,
};
use hive_queue::{Claim, QueueError, WorkQueue};
use hive_verify::Verifier;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::executor::Executor;
use crate::link::{ReapDecision, SupervisorLink};

/// Errors that stop an agent abnormally.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The state machine rejected an event
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// A holder transition on the queue failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Why an agent stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Home queue empty with `terminate` behavior
    QueueEmpty,
    /// Shutdown or pool shrink
    Shutdown,
    /// Supervisor retired it after a reap
    Retired,
    /// Reaped too often inside the window
    ChronicFailure,
    /// Panicked or stopped on an internal error
    Crashed,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueEmpty => f.write_str("queue empty"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Retired => f.write_str("retired"),
            Self::ChronicFailure => f.write_str("chronic failure"),
            Self::Crashed => f.write_str("crashed"),
        }
    }
}

/// Final report of a finished agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentExit {
    /// Agent identity
    pub agent: AgentId,
    /// Why it stopped
    pub reason: ExitReason,
    /// Resources used over its lifetime
    pub usage: hive_core::Usage,
}

/// Collaborators shared by every agent of a pool.
#[derive(Clone)]
pub struct AgentRuntime {
    /// External executor
    pub executor: Arc<dyn Executor>,
    /// Output verifier
    pub verifier: Arc<dyn Verifier>,
    /// Supervisor callbacks
    pub link: Arc<dyn SupervisorLink>,
    /// Event sink
    pub events: Events,
    /// Limits and pacing
    pub config: AgentConfig,
    /// How assignments are framed
    pub profile: WorkerProfile,
}

/// A worker bound to a home queue.
pub struct Agent {
    id: AgentId,
    home: Arc<WorkQueue>,
    bulkhead: Bulkhead,
    runtime: AgentRuntime,
    state: AgentState,
    holding: Option<(ItemId, QueueId)>,
    reaps: VecDeque<Instant>,
    snapshot: watch::Sender<AgentSnapshot>,
    shutdown: watch::Receiver<bool>,
}

impl Agent {
    /// Create an idle agent. Its identity is the bulkhead's.
    pub fn new(
        home: Arc<WorkQueue>,
        bulkhead: Bulkhead,
        runtime: AgentRuntime,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let id = bulkhead.agent();
        let (snapshot, _) = watch::channel(AgentSnapshot::new(id, home.id()));
        Self {
            id,
            home,
            bulkhead,
            runtime,
            state: AgentState::Idle,
            holding: None,
            reaps: VecDeque::new(),
            snapshot,
            shutdown,
        }
    }

    /// Agent identity.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Receiver for the snapshots published on every state change.
    pub fn snapshots(&self) -> watch::Receiver<AgentSnapshot> {
        self.snapshot.subscribe()
    }

    /// Run until the agent reaches `done`.
    pub async fn run(mut self) -> Result<AgentExit, AgentError> {
        info!(agent = %self.id, queue = %self.home.spec().name, "agent started");
        let reason = loop {
            if self.shutdown_requested() {
                self.apply(AgentEvent::Shutdown)?;
                break ExitReason::Shutdown;
            }
            if let Some(reason) = self.step().await? {
                break reason;
            }
        };
        info!(agent = %self.id, %reason, "agent finished");
        Ok(AgentExit {
            agent: self.id,
            reason,
            usage: self.bulkhead.usage(),
        })
    }

    /// One pass starting from `idle`.
    async fn step(&mut self) -> Result<Option<ExitReason>, AgentError> {
        if let Some(cooldown) = self.bulkhead.retry_after() {
            self.apply(AgentEvent::CircuitOpen)?;
            debug!(agent = %self.id, ?cooldown, "circuit open, waiting");
            if self.sleep_or_shutdown(cooldown).await {
                return self.shut_down();
            }
            self.apply(AgentEvent::Woken)?;
            return Ok(None);
        }

        // Subscribe before claiming so an enqueue racing the claim still wakes us.
        let mut changes = self.home.subscribe();
        changes.mark_seen();

        if let Some(claim) = self.home.claim(self.id) {
            return self.process(claim).await;
        }

        let behavior = self.empty_behavior();
        self.apply(AgentEvent::NoWork(behavior))?;
        match behavior {
            EmptyBehavior::Idle => self.back_off().await,
            EmptyBehavior::Hibernate => {
                let mut shutdown = self.shutdown.clone();
                let woken = tokio::select! {
                    alive = changes.changed() => alive,
                    _ = wait_for_shutdown(&mut shutdown) => false,
                };
                if !woken {
                    return self.shut_down();
                }
                self.apply(AgentEvent::Woken)?;
                Ok(None)
            }
            EmptyBehavior::Terminate => Ok(Some(ExitReason::QueueEmpty)),
            EmptyBehavior::StealFromOthers => {
                match self.runtime.link.steal(self.id, self.home.id()).await {
                    Some(claim) => self.process(claim).await,
                    None => {
                        self.apply(AgentEvent::NothingToSteal)?;
                        self.back_off().await
                    }
                }
            }
        }
    }

    async fn process(&mut self, claim: Claim) -> Result<Option<ExitReason>, AgentError> {
        let Claim { item, queue } = claim;
        self.holding = Some((item.id, queue.id()));
        self.apply(AgentEvent::Claimed)?;
        let result = self.work(&queue, item).await;
        self.holding = None;
        self.publish();
        result
    }

    /// Execute and verify a claimed item, leaving it completed, requeued or
    /// dead-lettered.
    async fn work(&mut self, queue: &Arc<WorkQueue>, item: WorkItem) -> Result<Option<ExitReason>, AgentError> {
        // Shutdown may have landed after the supervisor saw us idle.
        if self.shutdown_requested() {
            queue.give_back(self.id, item.id, "agent shut down before executing")?;
            return self.shut_down();
        }
        let item = queue.begin_execution(self.id, item.id)?;
        let prompt = self.runtime.profile.render(&item.assignment);
        let tokens = item.token_request.unwrap_or(self.runtime.config.operation_tokens);
        debug!(agent = %self.id, item = %item.id, attempt = item.attempts, tokens, "executing");

        let mut shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            outcome = self.bulkhead.wrap(tokens, self.runtime.executor.execute(&prompt, tokens)) => Some(outcome),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };
        let Some(outcome) = outcome else {
            queue.give_back(self.id, item.id, "agent shut down")?;
            return self.shut_down();
        };

        match outcome {
            Ok(execution) => {
                self.apply(AgentEvent::Output)?;
                let item = queue.begin_verification(self.id, item.id, execution.output)?;
                let verdict = self.runtime.verifier.verify(&item).await;
                if verdict.passed() {
                    queue.complete(self.id, item.id, &verdict)?;
                    self.apply(AgentEvent::VerificationPassed)?;
                } else {
                    let reason = format!("verification failed: {}", verdict.failure_summary());
                    queue.fail(self.id, item.id, reason, Some(&verdict))?;
                    self.apply(AgentEvent::VerificationFailed)?;
                }
                Ok(None)
            }
            Err(BulkheadError::Failed(err)) => {
                queue.fail(self.id, item.id, format!("execution failed: {}", err), None)?;
                self.apply(AgentEvent::ExecutionFailed)?;
                Ok(None)
            }
            Err(breach) => {
                let reason = breach.to_string();
                queue.release(self.id, item.id, reason.clone())?;
                self.apply(AgentEvent::Breach)?;
                self.reaped(&reason).await
            }
        }
    }

    async fn reaped(&mut self, reason: &str) -> Result<Option<ExitReason>, AgentError> {
        let now = Instant::now();
        let window = self.runtime.config.reap_window();
        self.reaps.retain(|at| now.duration_since(*at) <= window);
        self.reaps.push_back(now);
        warn!(agent = %self.id, reaps = self.reaps.len(), %reason, "agent reaped");

        if self.reaps.len() >= self.runtime.config.reap_threshold.max(1) {
            warn!(agent = %self.id, reaps = self.reaps.len(), "chronic failure, retiring agent");
            emit(
                &self.runtime.events,
                EventKind::ChronicFailure {
                    agent: self.id,
                    reaps: self.reaps.len(),
                    window_ms: self.runtime.config.reap_window_ms,
                },
            );
            self.apply(AgentEvent::Retire)?;
            return Ok(Some(ExitReason::ChronicFailure));
        }

        match self.runtime.link.after_reap(self.id, reason).await {
            ReapDecision::Resume => {
                self.apply(AgentEvent::Resume)?;
                Ok(None)
            }
            ReapDecision::Retire => {
                self.apply(AgentEvent::Retire)?;
                Ok(Some(ExitReason::Retired))
            }
        }
    }

    fn empty_behavior(&self) -> EmptyBehavior {
        let spec = self.home.spec();
        match spec.empty_behavior {
            EmptyBehavior::StealFromOthers if !spec.stealing_enabled => EmptyBehavior::Idle,
            behavior => behavior,
        }
    }

    fn apply(&mut self, event: AgentEvent) -> Result<(), InvalidTransition> {
        let from = self.state;
        let to = from.on(event)?;
        self.state = to;
        if from != to {
            debug!(agent = %self.id, %from, %to, "agent state changed");
            emit(&self.runtime.events, EventKind::AgentStateChanged { agent: self.id, from, to });
        }
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.snapshot.send_replace(AgentSnapshot {
            id: self.id,
            home_queue: self.home.id(),
            state: self.state,
            item: self.holding.map(|(item, _)| item),
            item_queue: self.holding.map(|(_, queue)| queue),
            usage: self.bulkhead.usage(),
            recent_reaps: self.reaps.len(),
        });
    }

    fn shut_down(&mut self) -> Result<Option<ExitReason>, AgentError> {
        self.apply(AgentEvent::Shutdown)?;
        Ok(Some(ExitReason::Shutdown))
    }

    async fn back_off(&mut self) -> Result<Option<ExitReason>, AgentError> {
        if self.sleep_or_shutdown(self.runtime.config.idle_backoff()).await {
            return self.shut_down();
        }
        Ok(None)
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleep; `true` if shutdown was requested first.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = wait_for_shutdown(&mut shutdown) => true,
        }
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
