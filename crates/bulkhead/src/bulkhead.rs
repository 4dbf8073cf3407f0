//! Per-agent resource bulkhead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hive_core::event::{emit, EventKind, Events};
use hive_core::{AgentConfig, AgentId, BudgetScope, CircuitConfig, CircuitState, Usage};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::budget::{Reservation, TokenBudget};
use crate::circuit::{CircuitBreaker, CircuitChange};

/// Token consumption reported by an operation outcome.
///
/// Implemented by both the success and the error type of a wrapped
/// operation, so partial consumption on failure is still charged.
pub trait Metered {
    /// Tokens actually consumed.
    fn tokens(&self) -> u64;
}

/// Why the bulkhead stopped an operation.
#[derive(Debug, thiserror::Error)]
pub enum BulkheadError<E> {
    /// The reservation was refused before the operation started
    #[error("{scope} budget exceeded: requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        /// Budget that refused
        scope: BudgetScope,
        /// Tokens requested
        requested: u64,
        /// Tokens left in that budget
        remaining: u64,
    },

    /// The circuit breaker is open
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Time left in the cooldown
        retry_after: Duration,
    },

    /// The operation ran past its timeout and was cancelled
    #[error("operation timed out after {limit:?}")]
    Timeout {
        /// Configured timeout
        limit: Duration,
    },

    /// The operation itself failed
    #[error("operation failed: {0}")]
    Failed(E),
}

impl<E> BulkheadError<E> {
    /// Whether the bulkhead aborted the operation (as opposed to the operation failing).
    pub fn is_breach(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Budget, timeout and circuit breaker wrapped around one agent's operations.
pub struct Bulkhead {
    agent: AgentId,
    budget: TokenBudget,
    pool: Arc<TokenBudget>,
    timeout: Duration,
    circuit: CircuitBreaker,
    usage: Mutex<Usage>,
    events: Events,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("agent", &self.agent)
            .field("budget", &self.budget)
            .field("timeout", &self.timeout)
            .field("circuit", &self.circuit.state())
            .finish()
    }
}

impl Bulkhead {
    /// Create a bulkhead with default timeout and circuit settings.
    pub fn new(agent: AgentId, token_budget: u64, pool: Arc<TokenBudget>, events: Events) -> Self {
        let defaults = AgentConfig::default();
        Self {
            agent,
            budget: TokenBudget::new(token_budget),
            pool,
            timeout: defaults.operation_timeout(),
            circuit: CircuitBreaker::new(CircuitConfig::default()),
            usage: Mutex::new(Usage::default()),
            events,
        }
    }

    /// Create a bulkhead from configuration.
    pub fn from_config(
        agent: AgentId,
        config: &AgentConfig,
        circuit: &CircuitConfig,
        pool: Arc<TokenBudget>,
        events: Events,
    ) -> Self {
        Self::new(agent, config.token_budget, pool, events)
            .with_timeout(config.operation_timeout())
            .with_circuit(circuit.clone())
    }

    /// Override the operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the circuit breaker settings.
    pub fn with_circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = CircuitBreaker::new(config);
        self
    }

    /// Agent this bulkhead belongs to.
    pub fn agent(&self) -> AgentId {
        self.agent
    }

    /// The agent's own budget.
    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    /// The shared pool budget.
    pub fn pool(&self) -> &TokenBudget {
        &self.pool
    }

    /// Operation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Circuit breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Cooldown left while the breaker is open.
    pub fn retry_after(&self) -> Option<Duration> {
        self.circuit.retry_after()
    }

    /// Resources used so far.
    pub fn usage(&self) -> Usage {
        *self.usage.lock()
    }

    /// Run `operation` with `tokens` reserved.
    ///
    /// Order: circuit check, agent then pool reservation, then the operation
    /// under the timeout. A refused reservation leaves both budgets as they
    /// were and the operation is never polled. On success the actual
    /// consumption is charged, on failure the reported partial consumption,
    /// on timeout the whole reservation.
    pub async fn wrap<T, E, F>(&self, tokens: u64, operation: F) -> Result<T, BulkheadError<E>>
    where
        F: Future<Output = Result<T, E>>,
        T: Metered,
        E: Metered,
    {
        match self.circuit.admit() {
            Ok(change) => self.report(change),
            Err(retry_after) => {
                debug!(agent = %self.agent, ?retry_after, "circuit open, operation rejected");
                emit(&self.events, EventKind::CircuitRejected { agent: self.agent });
                return Err(BulkheadError::CircuitOpen { retry_after });
            }
        }

        let reservation = match Reservation::acquire(&self.budget, &self.pool, tokens) {
            Ok(reservation) => reservation,
            Err((scope, remaining)) => {
                self.circuit.cancel_trial();
                warn!(agent = %self.agent, %scope, requested = tokens, remaining, "budget exceeded");
                emit(
                    &self.events,
                    EventKind::BudgetExceeded { agent: self.agent, scope, requested: tokens, remaining },
                );
                return Err(BulkheadError::BudgetExceeded { scope, requested: tokens, remaining });
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, operation).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                let charged = reservation.settle(value.tokens());
                self.account(charged, elapsed);
                let change = self.circuit.record_success();
                self.report(change);
                Ok(value)
            }
            Ok(Err(err)) => {
                let charged = reservation.settle(err.tokens());
                self.account(charged, elapsed);
                let change = self.circuit.record_failure();
                self.report(change);
                Err(BulkheadError::Failed(err))
            }
            Err(_) => {
                let charged = reservation.settle(tokens);
                self.account(charged, elapsed);
                warn!(agent = %self.agent, timeout = ?self.timeout, "operation timed out");
                emit(
                    &self.events,
                    EventKind::OperationTimedOut {
                        agent: self.agent,
                        timeout_ms: self.timeout.as_millis() as u64,
                    },
                );
                let change = self.circuit.record_failure();
                self.report(change);
                Err(BulkheadError::Timeout { limit: self.timeout })
            }
        }
    }

    fn account(&self, tokens: u64, elapsed: Duration) {
        let mut usage = self.usage.lock();
        usage.tokens += tokens;
        usage.wall_time += elapsed;
        usage.operations += 1;
    }

    fn report(&self, change: Option<CircuitChange>) {
        let Some(change) = change else { return };
        if change.to == CircuitState::Open {
            warn!(agent = %self.agent, failures = change.failures, "circuit opened");
        } else {
            debug!(agent = %self.agent, from = %change.from, to = %change.to, "circuit state changed");
        }
        emit(
            &self.events,
            EventKind::CircuitStateChanged {
                agent: self.agent,
                from: change.from,
                to: change.to,
                failures: change.failures,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::MemorySink;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Spent(u64);

    impl Metered for Spent {
        fn tokens(&self) -> u64 {
            self.0
        }
    }

    fn bulkhead(budget: u64, pool: u64) -> (Bulkhead, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let bh = Bulkhead::new(AgentId::new(), budget, Arc::new(TokenBudget::new(pool)), sink.clone());
        (bh, sink)
    }

    async fn fail(bh: &Bulkhead) -> BulkheadError<Spent> {
        bh.wrap(10, async { Err::<Spent, _>(Spent(1)) }).await.unwrap_err()
    }

    #[tokio::test]
    async fn test_refused_reservation_never_runs_operation() {
        let (bh, sink) = bulkhead(1000, 10_000);
        bh.wrap(100, async { Ok::<_, Spent>(Spent(900)) }).await.unwrap();
        assert_eq!(bh.budget().remaining(), 100);

        let ran = AtomicBool::new(false);
        let err = bh
            .wrap(150, async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, Spent>(Spent(150))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BulkheadError::BudgetExceeded { scope: BudgetScope::Agent, requested: 150, remaining: 100 }
        ));
        assert!(err.is_breach());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(bh.budget().used(), 900);
        assert_eq!(bh.pool().used(), 900);
        assert_eq!(sink.filter(|k| matches!(k, EventKind::BudgetExceeded { .. })).len(), 1);
    }

    #[tokio::test]
    async fn test_pool_refusal() {
        let (bh, _) = bulkhead(1000, 50);
        let err = bh.wrap(100, async { Ok::<_, Spent>(Spent(1)) }).await.unwrap_err();
        assert!(matches!(err, BulkheadError::BudgetExceeded { scope: BudgetScope::Pool, .. }));
        assert_eq!(bh.budget().used(), 0);
    }

    #[tokio::test]
    async fn test_budget_refusals_do_not_trip_circuit() {
        let (bh, _) = bulkhead(5, 1000);
        for _ in 0..5 {
            let _ = bh.wrap(10, async { Ok::<_, Spent>(Spent(1)) }).await;
        }
        assert_eq!(bh.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_partial_consumption_charged_on_failure() {
        let (bh, _) = bulkhead(1000, 1000);
        let err = bh.wrap(100, async { Err::<Spent, _>(Spent(40)) }).await.unwrap_err();
        assert!(matches!(err, BulkheadError::Failed(Spent(40))));
        assert!(!err.is_breach());
        assert_eq!(bh.budget().used(), 40);
        assert_eq!(bh.usage().tokens, 40);
        assert_eq!(bh.usage().operations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_charges_reservation() {
        let (bh, sink) = bulkhead(1000, 1000);
        let bh = bh.with_timeout(Duration::from_secs(1));
        let err = bh
            .wrap(200, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Spent>(Spent(1))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BulkheadError::Timeout { .. }));
        assert_eq!(bh.budget().used(), 200);
        assert_eq!(bh.pool().used(), 200);
        assert_eq!(
            sink.filter(|k| matches!(k, EventKind::OperationTimedOut { timeout_ms: 1000, .. })).len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_scenario() {
        let (bh, sink) = bulkhead(10_000, 10_000);
        for _ in 0..3 {
            assert!(matches!(fail(&bh).await, BulkheadError::Failed(_)));
        }
        assert_eq!(bh.circuit_state(), CircuitState::Open);

        let ran = AtomicBool::new(false);
        let err = bh
            .wrap(10, async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, Spent>(Spent(1))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BulkheadError::CircuitOpen { .. }));
        assert!(!ran.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_secs(61)).await;
        bh.wrap(10, async { Ok::<_, Spent>(Spent(1)) }).await.unwrap();
        assert_eq!(bh.circuit_state(), CircuitState::Closed);

        let changes: Vec<_> = sink
            .filter(|k| matches!(k, EventKind::CircuitStateChanged { .. }))
            .into_iter()
            .map(|k| match k {
                EventKind::CircuitStateChanged { to, .. } => to,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(changes, vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]);
        assert_eq!(sink.filter(|k| matches!(k, EventKind::CircuitRejected { .. })).len(), 1);
    }

    #[tokio::test]
    async fn test_budget_isolation() {
        let sink = Arc::new(MemorySink::new());
        let pool = Arc::new(TokenBudget::new(10_000));
        let greedy = Bulkhead::new(AgentId::new(), 100, pool.clone(), sink.clone());
        let modest = Bulkhead::new(AgentId::new(), 100, pool.clone(), sink.clone());

        greedy.wrap(100, async { Ok::<_, Spent>(Spent(100)) }).await.unwrap();
        assert!(greedy.wrap(1, async { Ok::<_, Spent>(Spent(1)) }).await.is_err());

        modest.wrap(80, async { Ok::<_, Spent>(Spent(80)) }).await.unwrap();
        assert_eq!(modest.budget().used(), 80);
        assert_eq!(pool.used(), 180);
    }

    #[tokio::test]
    async fn test_concurrent_agents_never_exceed_pool() {
        let sink = Arc::new(MemorySink::new());
        let pool = Arc::new(TokenBudget::new(500));
        let bulkheads: Vec<_> = (0..10)
            .map(|_| Bulkhead::new(AgentId::new(), 1000, pool.clone(), sink.clone()))
            .collect();

        let runs = bulkheads.iter().map(|bh| async move {
            bh.wrap(100, async {
                tokio::task::yield_now().await;
                Ok::<_, Spent>(Spent(100))
            })
            .await
            .is_ok()
        });
        let granted = futures::future::join_all(runs).await.into_iter().filter(|ok| *ok).count();
        assert_eq!(granted, 5);
        assert_eq!(pool.used(), 500);
    }
}
