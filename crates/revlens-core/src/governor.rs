//! Request governor for one rate-limited upstream.
//!
//! Architecture: a single drainer task owns the receiving side of an
//! unbounded FIFO queue. Callers [`submit`](Governor::submit) work and get a
//! future that resolves once the drainer has run it. The drainer dispatches
//! one task at a time, spaces dispatches by `min_interval`, and on a throttle
//! signal backs off and re-runs the same task before moving on. Tasks behind
//! a throttled one wait for it.
//!
//! Spacing is a one-cell `governor` quota driven by tokio's clock, so tests
//! with a paused runtime see the same pacing as production.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::governor::clock::Clock;
use ::governor::nanos::Nanos;
use ::governor::state::{InMemoryState, NotKeyed};
use ::governor::middleware::NoOpMiddleware;
use ::governor::{Quota, RateLimiter};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::memory::deadline_after;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single attempt, as reported by a task.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The upstream asked us to slow down (HTTP 429 or equivalent).
    #[error("throttled by upstream{}", fmt_hint(.retry_after))]
    Throttled { retry_after: Option<Duration> },
    /// Any other failure. Not retried.
    #[error("upstream error: {0}")]
    Upstream(#[source] BoxError),
}

impl TaskError {
    pub fn throttled(retry_after: Option<Duration>) -> Self {
        TaskError::Throttled { retry_after }
    }

    pub fn upstream(err: impl Into<BoxError>) -> Self {
        TaskError::Upstream(err.into())
    }
}

fn fmt_hint(hint: &Option<Duration>) -> String {
    match hint {
        Some(d) => format!(", retry after {:.1}s", d.as_secs_f64()),
        None => String::new(),
    }
}

/// Why a submitted task did not produce a value.
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("upstream error: {0}")]
    Upstream(#[source] BoxError),
    #[error("still throttled after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("attempt exceeded timeout of {after:?}")]
    TimedOut { after: Duration },
    #[error("governor cancelled")]
    Cancelled,
    #[error("governor is shut down")]
    Closed,
}

/// Pacing and retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorConfig {
    /// Minimum time between the starts of two consecutive attempts.
    pub min_interval: Duration,
    /// Total executions allowed per task, including the first.
    pub max_retries: u32,
    /// Backoff for the first throttle without a `Retry-After` hint; doubles
    /// on each subsequent one.
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Extra random delay as a fraction of the computed cooldown (0.0-1.0).
    pub jitter: f64,
    /// Per-attempt timeout. `None` waits indefinitely.
    pub task_timeout: Option<Duration>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: 0.0,
            task_timeout: None,
        }
    }
}

impl GovernorConfig {
    /// Cooldown after the `attempt`-th execution was throttled.
    ///
    /// The upstream's hint wins when present; otherwise exponential backoff
    /// from `backoff_base`. Either way the result is capped at `max_backoff`.
    /// Jitter is added on top.
    pub fn cooldown(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let base = hint
            .unwrap_or_else(|| {
                let exp = attempt.saturating_sub(1).min(31);
                self.backoff_base.saturating_mul(1u32 << exp)
            })
            .min(self.max_backoff);
        if self.jitter > 0.0 {
            let extra = Duration::try_from_secs_f64(
                base.as_secs_f64() * self.jitter.min(1.0) * fastrand::f64(),
            )
            .unwrap_or(Duration::ZERO);
            base.saturating_add(extra)
        } else {
            base
        }
    }
}

/// Delivered to the observer each time the governor backs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleNotice {
    /// When the governor will resume dispatching.
    pub retry_after: Instant,
    pub cooldown: Duration,
    /// The execution that was throttled (1-based).
    pub attempt: u32,
    pub max_retries: u32,
}

/// Point-in-time view of the governor, for diagnostics and UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorStatus {
    /// Tasks waiting behind the one currently running.
    pub queue_length: usize,
    pub is_processing: bool,
    pub retry_after: Option<Instant>,
    pub is_rate_limited: bool,
}

type Observer = Arc<dyn Fn(ThrottleNotice) + Send + Sync>;

/// Serializes and paces calls to one upstream.
///
/// Construct inside a tokio runtime; the drainer task is spawned eagerly.
pub struct Governor {
    queue: async_channel::Sender<Box<dyn Job>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self::build(config, None)
    }

    /// Like [`new`](Self::new), with a callback invoked on every backoff.
    pub fn with_observer(
        config: GovernorConfig,
        observer: impl Fn(ThrottleNotice) + Send + Sync + 'static,
    ) -> Self {
        Self::build(config, Some(Arc::new(observer)))
    }

    fn build(config: GovernorConfig, observer: Option<Observer>) -> Self {
        let (tx, rx) = async_channel::unbounded::<Box<dyn Job>>();
        let clock = TokioClock::new();
        let spacer = Quota::with_period(config.min_interval)
            .map(|quota| RateLimiter::direct_with_clock(quota, clock.clone()));
        let shared = Arc::new(Shared {
            config,
            spacer,
            clock,
            retry_after: Mutex::new(None),
            processing: AtomicBool::new(false),
            observer,
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drain_loop(rx, shared.clone(), cancel.clone()));
        Self {
            queue: tx,
            shared,
            cancel,
            handle,
        }
    }

    /// Queue `task` and return a future for its result.
    ///
    /// The task is enqueued before this returns, so submission order is
    /// execution order even if the returned futures are polled out of order
    /// (or not at all). `task` is called once per attempt.
    pub fn submit<T, F, Fut>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, GovernorError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let entry: Box<dyn Job> = Box::new(QueueEntry {
            task,
            completion: Some(tx),
        });
        let queued = self.queue.try_send(entry).is_ok();
        if !queued {
            tracing::debug!("submit on closed governor");
        }
        async move {
            if !queued {
                return Err(GovernorError::Closed);
            }
            rx.await.unwrap_or(Err(GovernorError::Closed))
        }
    }

    pub fn status(&self) -> GovernorStatus {
        let retry_after = self.shared.retry_after();
        GovernorStatus {
            queue_length: self.queue.len(),
            is_processing: self.shared.processing.load(Ordering::Acquire),
            retry_after,
            is_rate_limited: retry_after.is_some_and(|t| t > Instant::now()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.shared.config
    }

    /// Reject queued and backing-off work with [`GovernorError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting work and wait for everything already queued to finish.
    pub async fn shutdown(self) {
        self.queue.close();
        let _ = self.handle.await;
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}

// ── Map an HTTP response to a throttle signal ──────────────────────────

/// `Err(TaskError::Throttled)` on 429, carrying `Retry-After` if present.
pub fn throttle_from_response(resp: &reqwest::Response) -> Result<(), TaskError> {
    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(TaskError::Throttled { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a `Retry-After` value: delay in seconds or an HTTP-date. A date in
/// the past means "now".
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

// ── Internals ──────────────────────────────────────────────────────────

/// `governor` clock reading tokio's timer, as nanoseconds since construction.
#[derive(Debug, Clone)]
struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(self.origin.elapsed())
    }
}

type Spacer = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<Nanos>>;

struct Shared {
    config: GovernorConfig,
    /// `None` when `min_interval` is zero.
    spacer: Option<Spacer>,
    clock: TokioClock,
    retry_after: Mutex<Option<Instant>>,
    processing: AtomicBool,
    observer: Option<Observer>,
}

impl Shared {
    fn retry_after(&self) -> Option<Instant> {
        *self.retry_after.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_retry_after(&self, until: Option<Instant>) {
        *self.retry_after.lock().unwrap_or_else(|e| e.into_inner()) = until;
    }

    /// Wait for a dispatch permit. Returns `false` on cancel.
    async fn acquire_slot(&self, cancel: &CancellationToken) -> bool {
        let Some(spacer) = &self.spacer else {
            return true;
        };
        while let Err(not_until) = spacer.check() {
            let wait = not_until.wait_time_from(self.clock.now());
            tracing::debug!(wait_ms = wait.as_millis() as u64, "pacing");
            if !sleep_until(deadline_after(Instant::now(), wait), cancel).await {
                return false;
            }
        }
        true
    }

    fn notify(&self, notice: ThrottleNotice) {
        if let Some(observer) = &self.observer {
            observer(notice);
        }
    }
}

enum Attempt {
    /// The entry has been settled (value, upstream error, or timeout).
    Done,
    Throttled(Option<Duration>),
}

/// Type-erased queue entry.
trait Job: Send {
    fn attempt(&mut self, timeout: Option<Duration>) -> BoxFuture<'_, Attempt>;
    fn reject(self: Box<Self>, err: GovernorError);
}

struct QueueEntry<T, F> {
    task: F,
    completion: Option<oneshot::Sender<Result<T, GovernorError>>>,
}

impl<T, F> QueueEntry<T, F> {
    fn settle(&mut self, result: Result<T, GovernorError>) {
        if let Some(tx) = self.completion.take() {
            // Caller may have dropped its future.
            let _ = tx.send(result);
        }
    }
}

impl<T, F, Fut> Job for QueueEntry<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
{
    fn attempt(&mut self, timeout: Option<Duration>) -> BoxFuture<'_, Attempt> {
        Box::pin(async move {
            let fut = (self.task)();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.settle(Err(GovernorError::TimedOut { after: limit }));
                        return Attempt::Done;
                    }
                },
                None => fut.await,
            };
            match result {
                Ok(value) => {
                    self.settle(Ok(value));
                    Attempt::Done
                }
                Err(TaskError::Throttled { retry_after }) => Attempt::Throttled(retry_after),
                Err(TaskError::Upstream(e)) => {
                    self.settle(Err(GovernorError::Upstream(e)));
                    Attempt::Done
                }
            }
        })
    }

    fn reject(mut self: Box<Self>, err: GovernorError) {
        self.settle(Err(err));
    }
}

async fn drain_loop(
    rx: async_channel::Receiver<Box<dyn Job>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    while let Ok(job) = rx.recv().await {
        if cancel.is_cancelled() {
            tracing::debug!("skipping queued task: cancelled");
            job.reject(GovernorError::Cancelled);
            continue;
        }
        shared.processing.store(true, Ordering::Release);
        run_job(job, &shared, &cancel).await;
        if rx.is_empty() {
            shared.processing.store(false, Ordering::Release);
        }
    }
    shared.processing.store(false, Ordering::Release);
    tracing::debug!("governor drainer exiting");
}

/// Sleep until `deadline` unless cancelled first. Returns `false` on cancel.
async fn sleep_until(deadline: Instant, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

async fn run_job(mut job: Box<dyn Job>, shared: &Shared, cancel: &CancellationToken) {
    let config = &shared.config;
    let mut attempt: u32 = 1;

    loop {
        if let Some(until) = shared.retry_after()
            && until > Instant::now()
            && !sleep_until(until, cancel).await
        {
            job.reject(GovernorError::Cancelled);
            return;
        }
        if !shared.acquire_slot(cancel).await {
            job.reject(GovernorError::Cancelled);
            return;
        }

        tracing::debug!(attempt, max_retries = config.max_retries, "dispatching task");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = job.attempt(config.task_timeout) => Some(outcome),
        };

        let hint = match outcome {
            None => {
                job.reject(GovernorError::Cancelled);
                return;
            }
            Some(Attempt::Done) => return,
            Some(Attempt::Throttled(hint)) => hint,
        };

        if attempt >= config.max_retries {
            tracing::warn!(attempts = attempt, "throttled; retries exhausted");
            job.reject(GovernorError::RetriesExhausted { attempts: attempt });
            return;
        }

        let cooldown = config.cooldown(attempt, hint);
        let until = deadline_after(Instant::now(), cooldown);
        shared.set_retry_after(Some(until));
        tracing::warn!(
            attempt,
            max_retries = config.max_retries,
            cooldown_ms = cooldown.as_millis() as u64,
            hinted = hint.is_some(),
            "throttled by upstream, backing off"
        );
        shared.notify(ThrottleNotice {
            retry_after: until,
            cooldown,
            attempt,
            max_retries: config.max_retries,
        });

        let slept = sleep_until(until, cancel).await;
        shared.set_retry_after(None);
        if !slept {
            job.reject(GovernorError::Cancelled);
            return;
        }
        attempt += 1;
    }
}
