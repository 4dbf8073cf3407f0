//! The work queue: ordered, claimable items owned by one task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use hive_core::event::{emit, EventKind, Events};
use hive_core::{
    AgentId, ItemId, ItemStatus, QueueDepth, QueueId, QueueSpec, Verdict, WorkItem,
    DEFAULT_MAX_ATTEMPTS,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{QueueError, Result};
use crate::request::EnqueueRequest;
use crate::slot::ItemSlot;

/// An item claimed by an agent, together with the queue that owns it.
///
/// When an item is stolen the queue is not the agent's home queue; every
/// holder transition must go through `queue`.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Item as it was right after the claim
    pub item: WorkItem,

    /// Owning queue
    pub queue: Arc<WorkQueue>,
}

/// What happened to an item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back to pending, appended at the end of the queue
    Requeued,
    /// Attempts exhausted
    DeadLettered,
}

/// Receiver for queue-change notifications (enqueue or requeue).
#[derive(Debug, Clone)]
pub struct QueueWatch(watch::Receiver<u64>);

impl QueueWatch {
    /// Treat every change so far as seen.
    pub fn mark_seen(&mut self) {
        self.0.borrow_and_update();
    }

    /// Wait for a change not yet seen. Returns `false` if the queue is gone.
    pub async fn changed(&mut self) -> bool {
        self.0.changed().await.is_ok()
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Live items in claim order
    order: VecDeque<Arc<ItemSlot>>,
    /// Every item ever enqueued
    index: HashMap<ItemId, Arc<ItemSlot>>,
    /// Dead-lettered items, oldest first
    dead_letters: Vec<ItemId>,
}

/// A queue of claimable work items.
///
/// Lock order: an item record may be held while taking the queue lock, never
/// the other way around.
pub struct WorkQueue {
    spec: QueueSpec,
    default_max_attempts: u32,
    inner: Mutex<Inner>,
    version: watch::Sender<u64>,
    events: Events,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("spec", &self.spec)
            .field("depth", &self.depth())
            .finish()
    }
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new(spec: QueueSpec, events: Events) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            spec,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            inner: Mutex::new(Inner::default()),
            version,
            events,
        }
    }

    /// Set the attempt limit for requests that do not specify one.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Queue identity.
    pub fn id(&self) -> QueueId {
        self.spec.id
    }

    /// Static description.
    pub fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> QueueWatch {
        QueueWatch(self.version.subscribe())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn slot(&self, id: ItemId) -> Result<Arc<ItemSlot>> {
        self.inner
            .lock()
            .index
            .get(&id)
            .cloned()
            .ok_or(QueueError::NotFound(id))
    }

    fn candidates(&self) -> Vec<Arc<ItemSlot>> {
        self.inner.lock().order.iter().cloned().collect()
    }

    /// Append a new item. Never blocks on consumers.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<ItemId> {
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Rejected("max_attempts must be at least 1".into()));
        }

        let mut item = WorkItem::new(self.spec.id, request.assignment);
        item.commitments = request.commitments;
        for commitment in &mut item.commitments {
            commitment.status = Default::default();
        }
        item.max_attempts = max_attempts;
        item.token_request = request.token_request;
        item.parent = request.parent;
        item.priority = self.spec.priority;

        let id = item.id;
        self.admit(item);
        emit(&self.events, EventKind::ItemEnqueued { item: id, queue: self.spec.id });
        debug!(queue = %self.spec.name, item = %id, "enqueued");
        Ok(id)
    }

    /// Re-admit an item loaded from outside (for example a persisted snapshot).
    ///
    /// Held or failed items are reset to pending because their holder is gone;
    /// terminal items are kept as they are.
    pub fn restore(&self, mut item: WorkItem) -> Result<ItemId> {
        if item.queue_id != self.spec.id {
            return Err(QueueError::Rejected(format!(
                "item {} belongs to queue {}",
                item.id, item.queue_id
            )));
        }
        if self.inner.lock().index.contains_key(&item.id) {
            return Err(QueueError::Rejected(format!("item {} already present", item.id)));
        }
        if !item.is_terminal() {
            item.status = ItemStatus::Pending;
            item.claimed_by = None;
        }
        let id = item.id;
        self.admit(item);
        Ok(id)
    }

    fn admit(&self, item: WorkItem) {
        let terminal = item.status;
        let id = item.id;
        let slot = Arc::new(ItemSlot::new(item));
        {
            let mut inner = self.inner.lock();
            match terminal {
                ItemStatus::Completed => {}
                ItemStatus::DeadLettered => inner.dead_letters.push(id),
                _ => inner.order.push_back(slot.clone()),
            }
            inner.index.insert(id, slot);
        }
        self.bump();
    }

    /// Items currently pending, in claim order.
    ///
    /// The order is captured when called; status is checked lazily as the
    /// iterator advances. Call again to restart.
    pub fn peek_claimable(&self) -> impl Iterator<Item = WorkItem> {
        self.candidates()
            .into_iter()
            .filter(|slot| slot.status() == ItemStatus::Pending)
            .map(|slot| slot.snapshot())
    }

    /// Claim the first pending item for `agent`.
    ///
    /// Each candidate is taken with a compare-and-swap `pending -> claimed`;
    /// losing a race moves on to the next candidate. Items whose attempts are
    /// already exhausted are dead-lettered and skipped.
    pub fn claim(self: &Arc<Self>, agent: AgentId) -> Option<Claim> {
        for slot in self.candidates() {
            if slot.status() != ItemStatus::Pending {
                continue;
            }

            if slot.record().attempts_exhausted() {
                if slot.swap(ItemStatus::Pending, ItemStatus::DeadLettered).is_ok() {
                    let rec = slot.record();
                    self.dead_letter(&slot, rec, ItemStatus::Pending, "attempts exhausted before claim".into());
                }
                continue;
            }

            if slot.swap(ItemStatus::Pending, ItemStatus::Claimed).is_err() {
                trace!(item = %slot.id, %agent, "claim conflict");
                continue;
            }

            let item = {
                let mut rec = slot.record();
                rec.status = ItemStatus::Claimed;
                rec.claimed_by = Some(agent);
                rec.attempts += 1;
                rec.claimed_at = Some(chrono::Utc::now());
                rec.output = None;
                rec.clone()
            };
            self.transition_event(item.id, ItemStatus::Pending, ItemStatus::Claimed, Some(agent));
            debug!(queue = %self.spec.name, item = %item.id, %agent, attempt = item.attempts, "claimed");
            return Some(Claim { item, queue: Arc::clone(self) });
        }
        None
    }

    fn holder_transition(
        &self,
        agent: AgentId,
        id: ItemId,
        allowed: &[ItemStatus],
        to: ItemStatus,
    ) -> Result<(Arc<ItemSlot>, ItemStatus)> {
        let slot = self.slot(id)?;
        let current = {
            let rec = slot.record();
            if rec.claimed_by != Some(agent) {
                return Err(QueueError::NotHolder { item: id, agent, holder: rec.claimed_by });
            }
            let current = slot.status();
            if !allowed.contains(&current) {
                return Err(QueueError::InvalidTransition { item: id, from: current, to });
            }
            slot.swap(current, to)
                .map_err(|actual| QueueError::InvalidTransition { item: id, from: actual, to })?;
            current
        };
        Ok((slot, current))
    }

    /// `claimed -> executing`.
    pub fn begin_execution(&self, agent: AgentId, id: ItemId) -> Result<WorkItem> {
        let (slot, from) =
            self.holder_transition(agent, id, &[ItemStatus::Claimed], ItemStatus::Executing)?;
        let item = {
            let mut rec = slot.record();
            rec.status = ItemStatus::Executing;
            rec.clone()
        };
        self.transition_event(id, from, ItemStatus::Executing, Some(agent));
        Ok(item)
    }

    /// `executing -> verifying`, recording the executor output.
    pub fn begin_verification(&self, agent: AgentId, id: ItemId, output: String) -> Result<WorkItem> {
        let (slot, from) =
            self.holder_transition(agent, id, &[ItemStatus::Executing], ItemStatus::Verifying)?;
        let item = {
            let mut rec = slot.record();
            rec.status = ItemStatus::Verifying;
            rec.output = Some(output);
            rec.clone()
        };
        self.transition_event(id, from, ItemStatus::Verifying, Some(agent));
        Ok(item)
    }

    /// `verifying -> completed`. The verdict must pass.
    ///
    /// The completing agent stays recorded in `claimed_by`.
    pub fn complete(&self, agent: AgentId, id: ItemId, verdict: &Verdict) -> Result<WorkItem> {
        if verdict.item_id != id || !verdict.passed() {
            return Err(QueueError::VerdictFailed(id));
        }
        let (slot, from) =
            self.holder_transition(agent, id, &[ItemStatus::Verifying], ItemStatus::Completed)?;
        let item = {
            let mut rec = slot.record();
            rec.status = ItemStatus::Completed;
            rec.completed_at = Some(chrono::Utc::now());
            rec.last_error = None;
            apply_verdict(&mut rec, verdict);
            rec.clone()
        };
        self.inner.lock().order.retain(|s| s.id != id);
        self.transition_event(id, from, ItemStatus::Completed, Some(agent));
        debug!(queue = %self.spec.name, item = %id, %agent, "completed");
        Ok(item)
    }

    /// Failed execution or verification: requeue, or dead-letter when the
    /// attempts are exhausted.
    pub fn fail(
        &self,
        agent: AgentId,
        id: ItemId,
        reason: impl Into<String>,
        verdict: Option<&Verdict>,
    ) -> Result<Disposition> {
        let (slot, from) = self.holder_transition(
            agent,
            id,
            &[ItemStatus::Executing, ItemStatus::Verifying],
            ItemStatus::Failed,
        )?;
        let mut rec = slot.record();
        rec.status = ItemStatus::Failed;
        if let Some(verdict) = verdict {
            apply_verdict(&mut rec, verdict);
        }
        self.transition_event(id, from, ItemStatus::Failed, Some(agent));
        Ok(self.dispose(&slot, rec, reason.into()))
    }

    /// Give an item back after the operation was aborted (reap path).
    ///
    /// The attempt already counted at claim time is not refunded.
    pub fn release(&self, agent: AgentId, id: ItemId, reason: impl Into<String>) -> Result<Disposition> {
        let (slot, from) = self.holder_transition(
            agent,
            id,
            &[ItemStatus::Claimed, ItemStatus::Executing],
            ItemStatus::Failed,
        )?;
        let mut rec = slot.record();
        rec.status = ItemStatus::Failed;
        self.transition_event(id, from, ItemStatus::Failed, Some(agent));
        Ok(self.dispose(&slot, rec, reason.into()))
    }

    /// Hand an item back without counting the attempt, for holders that stop
    /// for reasons unrelated to the item (shutdown, pool shrink, abandoned
    /// steal). The item keeps its place in the queue and is never
    /// dead-lettered by this call.
    pub fn give_back(&self, agent: AgentId, id: ItemId, reason: impl Into<String>) -> Result<()> {
        let slot = self.slot(id)?;
        let from = {
            let mut rec = slot.record();
            if rec.claimed_by != Some(agent) {
                return Err(QueueError::NotHolder { item: id, agent, holder: rec.claimed_by });
            }
            let current = slot.status();
            if !matches!(current, ItemStatus::Claimed | ItemStatus::Executing) {
                return Err(QueueError::InvalidTransition { item: id, from: current, to: ItemStatus::Pending });
            }
            slot.swap(current, ItemStatus::Pending)
                .map_err(|actual| QueueError::InvalidTransition { item: id, from: actual, to: ItemStatus::Pending })?;
            // A racing claim blocks on this record until the refund is visible.
            rec.status = ItemStatus::Pending;
            rec.claimed_by = None;
            rec.claimed_at = None;
            rec.output = None;
            rec.attempts = rec.attempts.saturating_sub(1);
            current
        };

        self.bump();
        self.transition_event(id, from, ItemStatus::Pending, Some(agent));
        debug!(queue = %self.spec.name, item = %id, %agent, reason = %reason.into(), "given back");
        Ok(())
    }

    /// Requeue every item still held by `agent`. Used when an agent vanished
    /// without releasing its work.
    pub fn recover_orphans(&self, agent: AgentId) -> usize {
        let slots: Vec<_> = self.inner.lock().index.values().cloned().collect();
        let mut recovered = 0;
        for slot in slots {
            let rec = slot.record();
            if rec.claimed_by != Some(agent) {
                continue;
            }
            let current = slot.status();
            if !current.is_held() || slot.swap(current, ItemStatus::Failed).is_err() {
                continue;
            }
            self.transition_event(slot.id, current, ItemStatus::Failed, Some(agent));
            self.dispose(&slot, rec, format!("agent {} vanished", agent));
            recovered += 1;
        }
        if recovered > 0 {
            warn!(queue = %self.spec.name, %agent, recovered, "recovered orphaned items");
            emit(&self.events, EventKind::ItemsRecovered { agent, count: recovered });
        }
        recovered
    }

    fn dispose(&self, slot: &Arc<ItemSlot>, mut rec: MutexGuard<'_, WorkItem>, reason: String) -> Disposition {
        rec.last_error = Some(reason.clone());

        if rec.attempts_exhausted() {
            if let Err(actual) = slot.swap(ItemStatus::Failed, ItemStatus::DeadLettered) {
                warn!(item = %slot.id, status = %actual, "unexpected status while dead-lettering");
            }
            self.dead_letter(slot, rec, ItemStatus::Failed, reason);
            return Disposition::DeadLettered;
        }

        let agent = rec.claimed_by.take();
        rec.status = ItemStatus::Pending;
        {
            let mut inner = self.inner.lock();
            inner.order.retain(|s| s.id != slot.id);
            inner.order.push_back(slot.clone());
        }
        if let Err(actual) = slot.swap(ItemStatus::Failed, ItemStatus::Pending) {
            warn!(item = %slot.id, status = %actual, "unexpected status while requeueing");
        }
        let attempts = rec.attempts;
        drop(rec);

        self.bump();
        self.transition_event(slot.id, ItemStatus::Failed, ItemStatus::Pending, agent);
        debug!(queue = %self.spec.name, item = %slot.id, attempts, %reason, "requeued");
        Disposition::Requeued
    }

    /// Finish a dead-letter whose status word already reads `dead_lettered`.
    fn dead_letter(&self, slot: &Arc<ItemSlot>, mut rec: MutexGuard<'_, WorkItem>, from: ItemStatus, reason: String) {
        let agent = rec.claimed_by.take();
        rec.status = ItemStatus::DeadLettered;
        rec.completed_at = Some(chrono::Utc::now());
        if rec.last_error.is_none() {
            rec.last_error = Some(reason.clone());
        }
        let attempts = rec.attempts;
        drop(rec);

        {
            let mut inner = self.inner.lock();
            inner.order.retain(|s| s.id != slot.id);
            inner.dead_letters.push(slot.id);
        }
        self.transition_event(slot.id, from, ItemStatus::DeadLettered, agent);
        emit(
            &self.events,
            EventKind::ItemDeadLettered { item: slot.id, queue: self.spec.id, attempts, reason },
        );
    }

    /// Change the priority of a live item.
    pub fn set_priority(&self, id: ItemId, priority: u32) -> Result<()> {
        let slot = self.slot(id)?;
        let mut rec = slot.record();
        if rec.is_terminal() {
            return Err(QueueError::InvalidTransition { item: id, from: rec.status, to: rec.status });
        }
        rec.priority = priority;
        Ok(())
    }

    /// Depth metric.
    pub fn depth(&self) -> QueueDepth {
        let inner = self.inner.lock();
        let mut depth = QueueDepth::default();
        for slot in inner.index.values() {
            match slot.status() {
                ItemStatus::Pending => depth.pending += 1,
                ItemStatus::Completed => depth.completed += 1,
                ItemStatus::DeadLettered => depth.dead_lettered += 1,
                ItemStatus::Claimed | ItemStatus::Executing | ItemStatus::Verifying | ItemStatus::Failed => {
                    depth.in_flight += 1
                }
            }
        }
        depth
    }

    /// Copy of one item.
    pub fn snapshot(&self, id: ItemId) -> Option<WorkItem> {
        self.slot(id).ok().map(|slot| slot.snapshot())
    }

    /// Copies of every item, oldest first.
    pub fn items(&self) -> Vec<WorkItem> {
        let slots: Vec<_> = self.inner.lock().index.values().cloned().collect();
        let mut items: Vec<_> = slots.iter().map(|s| s.snapshot()).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Dead-lettered items, in the order they were dead-lettered.
    pub fn dead_letters(&self) -> Vec<WorkItem> {
        let slots: Vec<_> = {
            let inner = self.inner.lock();
            inner.dead_letters.iter().filter_map(|id| inner.index.get(id).cloned()).collect()
        };
        slots.iter().map(|s| s.snapshot()).collect()
    }

    fn transition_event(&self, item: ItemId, from: ItemStatus, to: ItemStatus, agent: Option<AgentId>) {
        emit(
            &self.events,
            EventKind::ItemTransition { item, queue: self.spec.id, from, to, agent },
        );
    }
}

fn apply_verdict(item: &mut WorkItem, verdict: &Verdict) {
    for result in &verdict.results {
        if let Some(commitment) = item.commitments.get_mut(result.index) {
            commitment.status = result.status;
        }
    }
}
