//! Two-phase shutdown.
//!
//! ```text
//!   stop accepting
//!   block all connections ──► drain ordinary workers ──► flush hook
//!   block all connections ──► drain log writers ──► stop pools
//! ```
//!
//! Blocking a connection sets `stop_talk`, purges its queues, moves it to
//! `Closing` and interrupts its receivers and transaction. Each drain polls
//! the pools until no matching context is busy or the phase deadline
//! passes, after which the stragglers are force-terminated.

use crate::config::ShutdownConfig;
use crate::connection::{ConnectionEntry, ConnectionRegistry};
use crate::session::TransactionManager;
use crate::worker::{WorkerFilter, WorkerPool};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Workers,
    LogWriters,
}

impl ShutdownPhase {
    fn filter(self) -> WorkerFilter {
        match self {
            ShutdownPhase::Workers => WorkerFilter::ExceptLogWriter,
            ShutdownPhase::LogWriters => WorkerFilter::LogWriterOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPoll {
    Quiescent,
    Busy(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Drained,
    /// The deadline passed with `remaining` contexts still busy
    Forced { remaining: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub workers: PhaseOutcome,
    pub log_writers: PhaseOutcome,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.workers == PhaseOutcome::Drained && self.log_writers == PhaseOutcome::Drained
    }
}

type FlushHook = Box<dyn Fn() + Send + Sync>;
type TerminateHook = Box<dyn Fn(WorkerFilter) -> usize + Send + Sync>;

pub struct ShutdownCoordinator {
    registry: Arc<ConnectionRegistry>,
    pools: Vec<Arc<dyn WorkerPool>>,
    txn: Arc<dyn TransactionManager>,
    config: ShutdownConfig,
    accept: CancellationToken,
    flush: Option<FlushHook>,
    terminate: Option<TerminateHook>,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pools: Vec<Arc<dyn WorkerPool>>,
        txn: Arc<dyn TransactionManager>,
        config: ShutdownConfig,
        accept: CancellationToken,
    ) -> Self {
        ShutdownCoordinator {
            registry,
            pools,
            txn,
            config,
            accept,
            flush: None,
            terminate: None,
        }
    }

    /// Run between the phases, after ordinary workers are gone.
    pub fn with_flush_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.flush = Some(Box::new(hook));
        self
    }

    /// Replaces the default of aborting the matching pool tasks.
    pub fn with_terminate_hook(
        mut self,
        hook: impl Fn(WorkerFilter) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.terminate = Some(Box::new(hook));
        self
    }

    fn block(&self, conn: &ConnectionEntry) {
        conn.set_stop_talk(true);
        conn.end_request();
        conn.interrupt();
        if let Some(tran) = conn.transaction_index() {
            self.txn.interrupt_transaction(tran);
        }
    }

    /// Block every active connection. Returns how many were blocked.
    pub async fn block_all_active(&self) -> usize {
        let active = self.registry.active_connections();
        for conn in &active {
            self.block(conn);
            if !self.config.block_pause.is_zero() {
                tokio::time::sleep(self.config.block_pause).await;
            }
        }
        active.len()
    }

    pub fn poll(&self, phase: ShutdownPhase) -> DrainPoll {
        let busy: usize = self
            .pools
            .iter()
            .map(|pool| pool.busy_count(phase.filter()))
            .sum();
        if busy == 0 {
            DrainPoll::Quiescent
        } else {
            DrainPoll::Busy(busy)
        }
    }

    fn force_terminate(&self, filter: WorkerFilter) -> usize {
        match &self.terminate {
            Some(hook) => hook(filter),
            None => self.pools.iter().map(|pool| pool.abort_running(filter)).sum(),
        }
    }

    pub async fn drain(&self, phase: ShutdownPhase) -> PhaseOutcome {
        let deadline = Instant::now() + self.config.phase_deadline;
        loop {
            match self.poll(phase) {
                DrainPoll::Quiescent => {
                    info!(phase = ?phase, "shutdown phase drained");
                    return PhaseOutcome::Drained;
                }
                DrainPoll::Busy(remaining) if Instant::now() >= deadline => {
                    let killed = self.force_terminate(phase.filter());
                    warn!(phase = ?phase, remaining, killed, "shutdown deadline passed, terminating workers");
                    return PhaseOutcome::Forced { remaining };
                }
                DrainPoll::Busy(_) => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
    }

    pub async fn run(&self) -> ShutdownReport {
        info!(active = self.registry.active_count(), "shutdown started");
        self.accept.cancel();

        self.block_all_active().await;
        let workers = self.drain(ShutdownPhase::Workers).await;

        if let Some(flush) = &self.flush {
            flush();
        }

        self.block_all_active().await;
        let log_writers = self.drain(ShutdownPhase::LogWriters).await;

        for pool in &self.pools {
            pool.stop();
        }
        let report = ShutdownReport {
            workers,
            log_writers,
        };
        info!(clean = report.is_clean(), "shutdown complete");
        report
    }

    /// Block the one connection serving `tran_index`. False if none does.
    pub fn shutdown_by_transaction(&self, tran_index: usize) -> bool {
        match self.registry.find_by_transaction(tran_index) {
            Some(conn) => {
                info!(conn = conn.index(), tran_index, "shutting down connection of transaction");
                self.block(&conn);
                true
            }
            None => false,
        }
    }
}
