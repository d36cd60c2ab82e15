use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::{
    EstimatorSession, ProgressObserver, Role, TransferResult, DEFAULT_CONNECTIONS,
    DEFAULT_PHASE_DURATION, DEFAULT_WINDOW_SPAN,
};

/// Shape of a throughput phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSettings {
    pub connections: usize,
    pub duration: Duration,
    pub window_span: Duration,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            connections: DEFAULT_CONNECTIONS,
            duration: DEFAULT_PHASE_DURATION,
            window_span: DEFAULT_WINDOW_SPAN,
        }
    }
}

impl PhaseSettings {
    /// Fresh estimator session for one run of a phase with these settings.
    pub fn new_session(
        &self,
        role: Role,
        observer: Arc<dyn ProgressObserver>,
    ) -> Arc<EstimatorSession> {
        Arc::new(EstimatorSession::new(
            role,
            self.window_span,
            self.duration,
            observer,
        ))
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The transfer finished on its own before the deadline.
    Completed,
    /// The deadline cancelled the in-flight operation.
    Aborted,
    /// A transport error stopped the connection.
    Errored,
}

/// Per-connection result, folded into the phase's [`TransferResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOutcome {
    pub bytes_transferred: u64,
    pub termination: Termination,
}

impl ConnectionOutcome {
    pub fn completed(bytes_transferred: u64) -> Self {
        Self {
            bytes_transferred,
            termination: Termination::Completed,
        }
    }

    pub fn aborted(bytes_transferred: u64) -> Self {
        Self {
            bytes_transferred,
            termination: Termination::Aborted,
        }
    }

    pub fn errored(bytes_transferred: u64) -> Self {
        Self {
            bytes_transferred,
            termination: Termination::Errored,
        }
    }
}

/// Everything a connection needs to take part in a phase.
#[derive(Clone)]
pub struct ConnectionContext {
    pub id: usize,
    /// Absolute deadline shared by every connection of the phase.
    pub deadline: Instant,
    pub session: Arc<EstimatorSession>,
}

impl ConnectionContext {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Logs a transport failure of this connection. Deadline cancellations
    /// must not go through here.
    pub fn report_error(&self, action: &str, error: &dyn Display) {
        let role = self.session.role();
        tracing::warn!(conn = self.id, %role, %error, "{action} failed");
        self.session
            .observer()
            .on_log(&format!("{role} connection {} error: {error}", self.id));
    }
}

/// Moves bytes on one connection until its deadline.
pub trait TransferStrategy: Send + Sync + 'static {
    fn run_connection(&self, conn: ConnectionContext) -> BoxFuture<'_, ConnectionOutcome>;
}

/// Phase result together with the individual connection outcomes.
#[derive(Debug, Clone)]
pub(crate) struct PhaseReport {
    pub result: TransferResult,
    pub outcomes: Vec<ConnectionOutcome>,
}

/// Runs several connections of the same strategy concurrently.
pub struct ConnectionPool<S> {
    strategy: Arc<S>,
}

impl<S: TransferStrategy> ConnectionPool<S> {
    pub fn new(strategy: S) -> Self {
        Self {
            strategy: Arc::new(strategy),
        }
    }

    /// Runs `connection_count` connections for at most `duration`, all
    /// feeding `session`, and waits for every one of them to finish.
    ///
    /// Failing connections never fail the phase; the bytes they moved before
    /// the error still count.
    pub async fn run(
        &self,
        connection_count: usize,
        duration: Duration,
        session: Arc<EstimatorSession>,
    ) -> TransferResult {
        self.run_phase(connection_count, duration, session)
            .await
            .result
    }

    pub(crate) async fn run_phase(
        &self,
        connection_count: usize,
        duration: Duration,
        session: Arc<EstimatorSession>,
    ) -> PhaseReport {
        let role = session.role();
        let start = Instant::now();
        let deadline = start + duration;

        let mut tasks = JoinSet::new();
        for id in 0..connection_count {
            let strategy = self.strategy.clone();
            let conn = ConnectionContext {
                id,
                deadline,
                session: session.clone(),
            };
            tasks.spawn(async move { strategy.run_connection(conn).await });
        }

        let mut outcomes = Vec::with_capacity(connection_count);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    tracing::debug!(
                        %role,
                        bytes = outcome.bytes_transferred,
                        termination = ?outcome.termination,
                        "connection finished"
                    );
                    outcomes.push(outcome);
                }
                Err(error) => {
                    tracing::error!(%role, %error, "connection task failed");
                    outcomes.push(ConnectionOutcome::errored(0));
                }
            }
        }

        let total_bytes: u64 = outcomes.iter().map(|o| o.bytes_transferred).sum();
        let elapsed = start.elapsed();
        let best_bps = session.snapshot().best_bps;
        let result = TransferResult::from_totals(total_bytes, elapsed, best_bps);

        let failed = outcomes
            .iter()
            .filter(|o| o.termination == Termination::Errored)
            .count();
        if failed == connection_count && connection_count > 0 {
            tracing::warn!(%role, "every connection failed");
        }
        tracing::info!(
            %role,
            connections = connection_count,
            failed,
            total_bytes,
            duration_secs = result.duration_seconds,
            "phase finished"
        );
        session.observer().on_log(&format!(
            "{role} finished: {total_bytes} bytes in {:.2}s ({connection_count} connections)",
            result.duration_seconds
        ));

        PhaseReport { result, outcomes }
    }
}
