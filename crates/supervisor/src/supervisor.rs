//! Pool supervisor actor.
//!
//! All pool decisions (spawning, retiring, stealing, reap outcomes) happen
//! on one task that owns the queue map and the agent table. Agents talk to it
//! through a weak link; callers through [`SupervisorHandle`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use hive_agent::{Agent, AgentError, AgentExit, AgentRuntime, Executor, ExitReason, ReapDecision};
use hive_bulkhead::{Bulkhead, TokenBudget};
use hive_core::event::{emit, EventKind, Events};
use hive_core::{
    AgentId, AgentSnapshot, EmptyBehavior, HiveConfig, ItemId, PoolConfig, QueueId, QueueSpec,
    StolenPriority, WorkItem, WorkerProfile,
};
use hive_queue::{Claim, EnqueueRequest, WorkQueue};
use hive_verify::{CommitmentVerifier, Verifier};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::error::{Result, SupervisorError};
use crate::handle::{PoolLink, SupervisorHandle};
use crate::report::{PoolSnapshot, QueueReport, ShutdownReport};

const COMMAND_CAPACITY: usize = 256;

type Outcome = std::result::Result<std::result::Result<AgentExit, AgentError>, Box<dyn std::any::Any + Send>>;

/// Agents wanted for `pending` items: one per `scale_up_backlog` items,
/// clamped to the pool bounds.
pub fn target_size(pending: usize, pool: &PoolConfig) -> usize {
    let wanted = pending.div_ceil(pool.scale_up_backlog.max(1));
    wanted.clamp(pool.min_agents, pool.max_agents.max(pool.min_agents))
}

/// A queue is over-served when its own available agents can already take
/// every pending item; thieves leave it alone.
fn over_served(pending: usize, own_available: usize) -> bool {
    own_available >= pending
}

/// Builder for a supervised agent pool.
pub struct Supervisor {
    config: HiveConfig,
    executor: Arc<dyn Executor>,
    verifier: Arc<dyn Verifier>,
    profile: WorkerProfile,
    events: Events,
}

impl Supervisor {
    /// Create a supervisor whose agents call `executor`.
    pub fn new(config: HiveConfig, executor: Arc<dyn Executor>, events: Events) -> Self {
        Self {
            config,
            executor,
            verifier: Arc::new(CommitmentVerifier::default()),
            profile: WorkerProfile::default(),
            events,
        }
    }

    /// Use a custom verifier.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Frame assignments with a worker profile.
    pub fn with_profile(mut self, profile: WorkerProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Spawn the actor and return a handle to it.
    pub fn start(self) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let runtime = AgentRuntime {
            executor: self.executor,
            verifier: self.verifier,
            link: Arc::new(PoolLink::new(tx.downgrade())),
            events: self.events.clone(),
            config: self.config.agent.clone(),
            profile: self.profile,
        };
        let actor = Actor {
            pool: Arc::new(TokenBudget::new(self.config.pool.token_budget)),
            config: self.config,
            runtime,
            events: self.events,
            queues: HashMap::new(),
            agents: HashMap::new(),
            tasks: JoinSet::new(),
            exits: Vec::new(),
            drain_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
            live_target: 0,
            stopping: false,
        };
        tokio::spawn(actor.run(rx));
        SupervisorHandle::new(tx)
    }
}

struct AgentEntry {
    home: QueueId,
    snapshots: watch::Receiver<AgentSnapshot>,
    shutdown: watch::Sender<bool>,
    retiring: bool,
}

impl AgentEntry {
    fn is_available(&self) -> bool {
        !self.retiring && self.snapshots.borrow().state.is_available()
    }
}

struct Actor {
    config: HiveConfig,
    runtime: AgentRuntime,
    events: Events,
    pool: Arc<TokenBudget>,
    queues: HashMap<QueueId, Arc<WorkQueue>>,
    agents: HashMap<AgentId, AgentEntry>,
    tasks: JoinSet<(AgentId, Outcome)>,
    exits: Vec<AgentExit>,
    drain_waiters: Vec<oneshot::Sender<()>>,
    shutdown_waiters: Vec<oneshot::Sender<ShutdownReport>>,
    live_target: usize,
    stopping: bool,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(self.config.pool.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut detached = false;

        info!(
            min = self.config.pool.min_agents,
            max = self.config.pool.max_agents,
            budget = self.config.pool.token_budget,
            "supervisor started"
        );

        loop {
            tokio::select! {
                command = rx.recv(), if !detached => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("all handles dropped");
                        detached = true;
                        self.begin_shutdown();
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok((agent, outcome)) => self.on_exit(agent, outcome),
                    Err(err) => error!(error = %err, "agent task aborted"),
                },
                _ = tick.tick() => self.on_tick(),
            }

            if self.stopping && self.tasks.is_empty() {
                break;
            }
        }

        let report = self.report();
        info!(
            agents = report.exits.len(),
            dead_letters = report.dead_letters.len(),
            "supervisor stopped"
        );
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(report.clone());
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::AddQueue { spec, reply } => {
                let queue = self.add_queue(spec);
                let _ = reply.send(queue);
                self.rebalance();
            }
            Command::Queue { id, reply } => {
                let _ = reply.send(self.queues.get(&id).cloned());
            }
            Command::Enqueue { queue, request, reply } => {
                let result = self.enqueue(queue, request);
                let _ = reply.send(result);
                self.rebalance();
            }
            Command::Steal { agent, home, reply } => {
                if let Some(claim) = self.steal(agent, home) {
                    if let Err(Some(claim)) = reply.send(Some(claim)) {
                        // Thief went away before taking delivery.
                        let _ = claim.queue.give_back(agent, claim.item.id, "steal abandoned");
                    }
                } else {
                    let _ = reply.send(None);
                }
            }
            Command::AfterReap { agent, reason, reply } => {
                let _ = reply.send(self.after_reap(agent, &reason));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::DeadLetters { reply } => {
                let _ = reply.send(self.dead_letters());
            }
            Command::WaitDrained { reply } => {
                self.drain_waiters.push(reply);
                self.notify_drained();
            }
            Command::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown();
            }
        }
    }

    fn add_queue(&mut self, spec: QueueSpec) -> Arc<WorkQueue> {
        if let Some(existing) = self.queues.get(&spec.id) {
            return existing.clone();
        }
        info!(queue = %spec.name, id = %spec.id, priority = spec.priority, behavior = ?spec.empty_behavior, "queue added");
        let queue = Arc::new(
            WorkQueue::new(spec, self.events.clone()).with_default_max_attempts(self.config.queue.max_attempts),
        );
        self.queues.insert(queue.id(), queue.clone());
        queue
    }

    fn enqueue(&mut self, queue: QueueId, request: EnqueueRequest) -> Result<ItemId> {
        let queue = self.queues.get(&queue).ok_or(SupervisorError::UnknownQueue(queue))?;
        Ok(queue.enqueue(request)?)
    }

    fn on_tick(&mut self) {
        self.rebalance();
        self.notify_drained();
    }

    fn pending(&self) -> usize {
        self.queues.values().map(|q| q.depth().pending).sum()
    }

    fn live_agents(&self) -> usize {
        self.agents.values().filter(|a| !a.retiring).count()
    }

    fn homed_on(&self, queue: QueueId) -> usize {
        self.agents.values().filter(|a| !a.retiring && a.home == queue).count()
    }

    /// Grow or shrink the pool toward the backlog-derived target.
    fn rebalance(&mut self) {
        if self.stopping || self.queues.is_empty() {
            return;
        }
        let pending = self.pending();
        let target = target_size(pending, &self.config.pool);
        let before = self.live_agents();

        let mut live = before;
        while live < target {
            let Some(queue) = self.spawn_target() else {
                break;
            };
            self.spawn(&queue);
            live += 1;
        }

        if live > target {
            let idle: Vec<AgentId> = self
                .agents
                .iter()
                .filter(|(_, entry)| entry.is_available())
                .map(|(id, _)| *id)
                .take(live - target)
                .collect();
            for agent in idle {
                self.retire(agent);
                live -= 1;
            }
        }

        self.live_target = target;
        if live != before {
            info!(from = before, to = live, pending, "pool scaled");
            emit(
                &self.events,
                EventKind::PoolScaled {
                    from: before,
                    to: live,
                    reason: format!("{} pending items", pending),
                },
            );
        }
    }

    /// Queue with the most pending work per homed agent.
    fn spawn_target(&self) -> Option<Arc<WorkQueue>> {
        self.queues
            .values()
            .map(|queue| (queue, queue.depth().pending, self.homed_on(queue.id())))
            .filter(|(queue, pending, _)| *pending > 0 || queue.spec().empty_behavior != EmptyBehavior::Terminate)
            .max_by(|(qa, pa, ha), (qb, pb, hb)| {
                (pa * (hb + 1))
                    .cmp(&(pb * (ha + 1)))
                    .then_with(|| hb.cmp(ha))
                    .then_with(|| qa.spec().priority.cmp(&qb.spec().priority))
            })
            .map(|(queue, _, _)| queue.clone())
    }

    fn spawn(&mut self, queue: &Arc<WorkQueue>) {
        let id = AgentId::new();
        let bulkhead = Bulkhead::from_config(
            id,
            &self.config.agent,
            &self.config.circuit,
            self.pool.clone(),
            self.events.clone(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let agent = Agent::new(queue.clone(), bulkhead, self.runtime.clone(), shutdown_rx);
        let snapshots = agent.snapshots();

        self.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(agent.run()).catch_unwind().await;
            (id, outcome)
        });
        self.agents.insert(
            id,
            AgentEntry {
                home: queue.id(),
                snapshots,
                shutdown,
                retiring: false,
            },
        );

        info!(agent = %id, queue = %queue.spec().name, "agent spawned");
        emit(&self.events, EventKind::AgentSpawned { agent: id, home_queue: queue.id() });
    }

    fn retire(&mut self, agent: AgentId) {
        if let Some(entry) = self.agents.get_mut(&agent) {
            entry.retiring = true;
            let _ = entry.shutdown.send(true);
            debug!(%agent, "retiring agent");
        }
    }

    /// Claim an item for `agent` from the highest-priority queue that has
    /// more pending work than idle agents of its own.
    fn steal(&mut self, agent: AgentId, home: QueueId) -> Option<Claim> {
        if self.stopping {
            return None;
        }
        let home_priority = self.queues.get(&home).map(|q| q.spec().priority);

        let mut victims: Vec<Arc<WorkQueue>> =
            self.queues.values().filter(|q| q.id() != home).cloned().collect();
        victims.sort_by(|a, b| b.spec().priority.cmp(&a.spec().priority));

        for victim in victims {
            let pending = victim.depth().pending;
            if pending == 0 {
                continue;
            }
            let own_available = self
                .agents
                .values()
                .filter(|a| a.home == victim.id() && a.is_available())
                .count();
            if over_served(pending, own_available) {
                continue;
            }
            let Some(mut claim) = victim.claim(agent) else {
                continue;
            };

            if let (StolenPriority::Inherit, Some(priority)) = (self.config.pool.stolen_priority, home_priority) {
                match victim.set_priority(claim.item.id, priority) {
                    Ok(()) => claim.item.priority = priority,
                    Err(err) => warn!(item = %claim.item.id, error = %err, "could not adjust stolen priority"),
                }
            }

            info!(%agent, item = %claim.item.id, from = %victim.spec().name, "item stolen");
            emit(
                &self.events,
                EventKind::ItemStolen {
                    item: claim.item.id,
                    from_queue: victim.id(),
                    agent,
                    home_queue: home,
                },
            );
            return Some(claim);
        }
        None
    }

    fn after_reap(&mut self, agent: AgentId, reason: &str) -> ReapDecision {
        let surplus = self.live_agents() > self.live_target;
        if self.stopping || surplus {
            if let Some(entry) = self.agents.get_mut(&agent) {
                entry.retiring = true;
            }
            info!(%agent, %reason, "reaped agent retired");
            ReapDecision::Retire
        } else {
            debug!(%agent, %reason, "reaped agent resumes");
            ReapDecision::Resume
        }
    }

    fn on_exit(&mut self, agent: AgentId, outcome: Outcome) {
        let entry = self.agents.remove(&agent);
        let last_usage = entry
            .as_ref()
            .map(|e| e.snapshots.borrow().usage)
            .unwrap_or_default();

        let exit = match outcome {
            Ok(Ok(exit)) => exit,
            Ok(Err(err)) => {
                error!(%agent, error = %err, "agent stopped on error");
                AgentExit { agent, reason: ExitReason::Crashed, usage: last_usage }
            }
            Err(_) => {
                error!(%agent, "agent panicked");
                AgentExit { agent, reason: ExitReason::Crashed, usage: last_usage }
            }
        };

        for queue in self.queues.values() {
            queue.recover_orphans(agent);
        }

        emit(&self.events, EventKind::AgentRetired { agent, reason: exit.reason.to_string() });
        self.exits.push(exit);
        self.notify_drained();
    }

    fn begin_shutdown(&mut self) {
        if self.stopping {
            return;
        }
        info!(agents = self.agents.len(), "shutting down pool");
        self.stopping = true;
        let ids: Vec<AgentId> = self.agents.keys().copied().collect();
        for agent in ids {
            self.retire(agent);
        }
    }

    fn drained(&self) -> bool {
        self.queues.values().all(|q| q.depth().live() == 0)
    }

    fn notify_drained(&mut self) {
        if self.drain_waiters.is_empty() || !self.drained() {
            return;
        }
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn sorted_queues(&self) -> Vec<&Arc<WorkQueue>> {
        let mut queues: Vec<_> = self.queues.values().collect();
        queues.sort_by(|a, b| {
            b.spec()
                .priority
                .cmp(&a.spec().priority)
                .then_with(|| a.spec().name.cmp(&b.spec().name))
        });
        queues
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            queues: self
                .sorted_queues()
                .into_iter()
                .map(|q| QueueReport {
                    id: q.id(),
                    name: q.spec().name.clone(),
                    priority: q.spec().priority,
                    depth: q.depth(),
                    agents: self.homed_on(q.id()),
                })
                .collect(),
            agents: self.agents.values().map(|a| a.snapshots.borrow().clone()).collect(),
            tokens_used: self.pool.used(),
            tokens_remaining: self.pool.remaining(),
        }
    }

    fn dead_letters(&self) -> Vec<WorkItem> {
        self.sorted_queues().into_iter().flat_map(|q| q.dead_letters()).collect()
    }

    fn report(&self) -> ShutdownReport {
        ShutdownReport {
            snapshot: self.snapshot(),
            exits: self.exits.clone(),
            items: self.sorted_queues().into_iter().flat_map(|q| q.items()).collect(),
            dead_letters: self.dead_letters(),
        }
    }
}
