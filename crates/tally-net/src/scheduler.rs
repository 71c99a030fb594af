//! Bounded worker pool driving every ticket to completion.
//!
//! The scheduler owns the admission gate (a counting semaphore sized to
//! `max_concurrency`) and the in-flight counters. Its dispatch loop is:
//!
//! ```text
//! loop until store.is_complete():
//!     acquire permit
//!     take_next() ─ Some(ticket) ─► spawn attempt (permit travels with it)
//!                 └ None ─────────► give permit back, wait for progress signal
//! acquire every permit (all attempts have finished)
//! snapshot
//! ```
//!
//! A failed attempt puts its ticket back into the store's pending queue, so
//! the next free permit picks it up again. There is no retry limit and no
//! backoff: the run only ends when every ticket has succeeded.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use anyhow::Result;
use tally_core::{
    config::AppConfig,
    error::TallyError,
    store::ResultStore,
    types::{ResultSet, Ticket},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use crate::Exchange;
use crate::exchange::{self, Outcome};

/// Worker pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of tickets (ids `1..=tickets`).
    pub tickets: u32,
    /// Upper bound on concurrently running exchanges.
    pub max_concurrency: usize,
}

impl SchedulerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tickets: config.effective_tickets(),
            max_concurrency: config.effective_max_concurrency(),
        }
    }
}

/// Counters owned by one scheduler instance.
#[derive(Debug, Default)]
struct PoolStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl PoolStats {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Statistics of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub tickets: u32,
    pub attempts: u64,
    pub failures: u64,
    pub peak_in_flight: usize,
    pub elapsed: Duration,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tickets={} attempts={} failures={} peak_in_flight={} elapsed={:.3?}",
            self.tickets, self.attempts, self.failures, self.peak_in_flight, self.elapsed,
        )
    }
}

/// Results of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub results: ResultSet,
    pub summary: RunSummary,
}

/// Bounded worker pool over an [`Exchange`] implementation.
pub struct Scheduler<E> {
    config: SchedulerConfig,
    exchange: Arc<E>,
    stats: Arc<PoolStats>,
}

impl<E: Exchange + 'static> Scheduler<E> {
    pub fn new(config: SchedulerConfig, exchange: Arc<E>) -> Self {
        Self {
            config,
            exchange,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Exchanges currently running.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously running exchanges observed so far.
    pub fn peak_in_flight(&self) -> usize {
        self.stats.peak_in_flight.load(Ordering::Acquire)
    }

    /// Query every ticket until all of them succeed and return the results.
    pub async fn run(&self) -> Result<RunReport> {
        let SchedulerConfig { tickets, max_concurrency } = self.config;
        let permits = u32::try_from(max_concurrency)
            .ok()
            .filter(|&p| p > 0 && p as usize <= Semaphore::MAX_PERMITS)
            .ok_or_else(|| TallyError::Config(format!("invalid max_concurrency {max_concurrency}")))?;

        let started = Instant::now();
        let store = Arc::new(ResultStore::reserve(tickets));
        let gate = Arc::new(Semaphore::new(permits as usize));
        let mut progress = store.subscribe();

        info!("dispatching {tickets} ticket(s) with max_concurrency={max_concurrency}");

        while !store.is_complete() {
            let permit = gate
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| TallyError::Scheduler("admission gate closed".into()))?;

            match store.take_next() {
                Some(ticket) => self.spawn_attempt(ticket, permit, store.clone(), started),
                None => {
                    // Everything left is in flight; wait until one finishes.
                    drop(permit);
                    if store.is_complete() {
                        break;
                    }
                    progress
                        .changed()
                        .await
                        .map_err(|_| TallyError::Scheduler("progress signal dropped".into()))?;
                }
            }
        }

        // Stragglers still hold permits until their task returns.
        let _all = gate
            .acquire_many(permits)
            .await
            .map_err(|_| TallyError::Scheduler("admission gate closed".into()))?;

        let results = store.snapshot().map_err(TallyError::from)?;
        let summary = RunSummary {
            tickets,
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight(),
            elapsed: started.elapsed(),
        };
        info!("run complete: {summary}");

        Ok(RunReport { results, summary })
    }

    fn spawn_attempt(&self, ticket: Ticket, permit: OwnedSemaphorePermit, store: Arc<ResultStore>, started: Instant) {
        let exchange = self.exchange.clone();
        let stats = self.stats.clone();
        let total = store.len();

        tokio::spawn(async move {
            let _permit = permit;
            stats.enter();
            let outcome = exchange::attempt(exchange.as_ref(), ticket.id, &store).await;
            stats.exit();

            match outcome {
                Outcome::Success(value) => {
                    info!(
                        "[{:.3?}] ticket #{} completed, response: {value}, done: {}/{total}",
                        started.elapsed(),
                        ticket.id,
                        store.done_count(),
                    );
                }
                Outcome::Failure(cause) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = store.mark_failed(ticket.id) {
                        error!("ticket #{} could not be re-queued: {e}", ticket.id);
                        return;
                    }
                    warn!(
                        "[{:.3?}] ticket #{} attempt {} failed: {cause}; re-queued, done: {}/{total}",
                        started.elapsed(),
                        ticket.id,
                        ticket.attempt,
                        store.done_count(),
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tally_core::{
        config::EndpointConfig,
        stats::median,
        types::TicketId,
    };
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::exchange::{ExchangeError, TcpExchange, TcpExchangeConfig};

    /// Answers from a fixed table, optionally failing the first attempts of
    /// every ticket after writing junk digits.
    struct ScriptedExchange {
        values: HashMap<u32, u64>,
        failures_per_ticket: u32,
        delay: Duration,
        attempts: Mutex<HashMap<u32, u32>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl ScriptedExchange {
        fn new(values: impl IntoIterator<Item = (u32, u64)>) -> Self {
            Self {
                values: values.into_iter().collect(),
                failures_per_ticket: 0,
                delay: Duration::ZERO,
                attempts: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, times: u32) -> Self {
            self.failures_per_ticket = times;
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Exchange for ScriptedExchange {
        async fn exchange(&self, ticket: TicketId, store: &ResultStore) -> Result<(), ExchangeError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(ticket.0).or_insert(0);
                *n += 1;
                *n
            };

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let result = if attempt <= self.failures_per_ticket {
                store
                    .record_bytes(ticket, b"999")
                    .map_err(ExchangeError::from)
                    .and(Err(ExchangeError::ConnectionClosed))
            } else {
                let digits = self.values[&ticket.0].to_string();
                store.record_bytes(ticket, digits.as_bytes()).map_err(ExchangeError::from)
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn config(tickets: u32, max_concurrency: usize) -> SchedulerConfig {
        SchedulerConfig { tickets, max_concurrency }
    }

    #[tokio::test]
    async fn four_tickets_reduce_to_median() {
        let exchange = Arc::new(ScriptedExchange::new([(1, 3), (2, 1), (3, 4), (4, 1)]));
        let scheduler = Scheduler::new(config(4, 2), exchange);

        let report = scheduler.run().await.unwrap();
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.results[&TicketId(1)], 3);
        assert_eq!(report.results[&TicketId(4)], 1);
        assert_eq!(report.summary.attempts, 4);
        assert_eq!(report.summary.failures, 0);
        assert_eq!(median(report.results.values().copied()), Some(2.0));
    }

    #[tokio::test]
    async fn retries_keep_only_the_successful_value() {
        let exchange = Arc::new(ScriptedExchange::new((1..=20).map(|id| (id, u64::from(id) * 7))).failing(3));
        let scheduler = Scheduler::new(config(20, 4), exchange);

        let report = scheduler.run().await.unwrap();
        assert_eq!(report.results.len(), 20);
        for (id, value) in &report.results {
            assert_eq!(*value, u64::from(id.0) * 7);
        }
        assert_eq!(report.summary.attempts, 80);
        assert_eq!(report.summary.failures, 60);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn admission_gate_bounds_concurrency() {
        let exchange = Arc::new(
            ScriptedExchange::new((1..=120).map(|id| (id, u64::from(id))))
                .failing(1)
                .delayed(Duration::from_millis(2)),
        );
        let scheduler = Scheduler::new(config(120, 8), exchange.clone());

        let report = scheduler.run().await.unwrap();
        assert_eq!(report.results.len(), 120);
        assert!(exchange.max_running.load(Ordering::SeqCst) <= 8);
        assert!(scheduler.peak_in_flight() <= 8);
        assert!(scheduler.peak_in_flight() >= 1);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_fills_every_slot_while_tickets_remain() {
        let exchange = Arc::new(
            ScriptedExchange::new((1..=64).map(|id| (id, u64::from(id)))).delayed(Duration::from_millis(20)),
        );
        let scheduler = Scheduler::new(config(64, 8), exchange.clone());

        let report = scheduler.run().await.unwrap();
        assert_eq!(report.results.len(), 64);
        assert_eq!(scheduler.peak_in_flight(), 8);
        assert_eq!(report.summary.peak_in_flight, 8);
        assert_eq!(exchange.max_running.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn zero_tickets_complete_immediately() {
        let scheduler = Scheduler::new(config(0, 4), Arc::new(ScriptedExchange::new(Vec::new())));
        let report = scheduler.run().await.unwrap();
        assert!(report.results.is_empty());
        assert_eq!(report.summary.attempts, 0);
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let scheduler = Scheduler::new(config(1, 0), Arc::new(ScriptedExchange::new([(1, 1)])));
        assert!(scheduler.run().await.is_err());
    }

    /// Loopback server: the first attempt of every ticket either stalls past
    /// the receive timeout (odd ids) or hangs up (even ids); the second
    /// attempt answers `id * 10` split over two writes.
    async fn spawn_flaky_server() -> EndpointConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut reader = tokio::io::BufReader::new(stream);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.is_err() {
                        return;
                    }
                    let Ok(id) = line.trim_end().parse::<u32>() else {
                        return;
                    };
                    let attempt = {
                        let mut seen = seen.lock().unwrap();
                        let n = seen.entry(id).or_insert(0);
                        *n += 1;
                        *n
                    };

                    let mut stream = reader.into_inner();
                    match attempt {
                        1 if id % 2 == 1 => tokio::time::sleep(Duration::from_secs(1)).await,
                        1 => {}
                        _ => {
                            let answer = (id * 10).to_string();
                            let (head, tail) = answer.split_at(1);
                            let _ = stream.write_all(head.as_bytes()).await;
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            let _ = stream.write_all(format!("{tail}\r").as_bytes()).await;
                        }
                    }
                });
            }
        });

        EndpointConfig { host: "127.0.0.1".to_string(), port }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_failures_are_retried_until_success() {
        let endpoint = spawn_flaky_server().await;
        let exchange = Arc::new(TcpExchange::new(TcpExchangeConfig {
            endpoint,
            recv_timeout: Duration::from_millis(100),
            ..TcpExchangeConfig::default()
        }));
        let scheduler = Scheduler::new(config(10, 4), exchange);

        let report = scheduler.run().await.unwrap();
        assert_eq!(report.results.len(), 10);
        for (id, value) in &report.results {
            assert_eq!(*value, u64::from(id.0) * 10);
        }
        assert_eq!(report.summary.failures, 10);
        assert_eq!(report.summary.attempts, 20);
    }
}
