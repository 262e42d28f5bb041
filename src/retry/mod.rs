//! Retry layer: classification-driven retries with per-operation circuit breakers.
//!
//! Every outbound call to the indexing or embedding service goes through
//! [`ErrorHandler::execute_with_retry`]. Failures are classified into a
//! category (network, backend, rate limit, ...) whose policy decides the
//! attempt budget and backoff shape; a per-operation circuit breaker stops
//! hammering a backend that is clearly down. The handler is an explicit
//! instance owned by the orchestrator, not process-global state.

pub mod breaker;
pub mod classify;

use std::{
   collections::{BTreeMap, HashMap},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use classify::{ErrorCategory, RetryPolicy, Severity, classify, policy_for, severity_for, should_retry};

use crate::{Result, config, error::Error};

/// Fraction of symmetric jitter applied to every backoff delay.
const JITTER_PCT: f64 = 0.2;

// ─── Backoff ────────────────────────────────────────────────────────────────

/// Backoff before the attempt following failure number `attempt` (1-based).
///
/// Exponential: `base * 2^(attempt-1)`, capped at the policy maximum, with
/// bounded symmetric jitter so synchronized workers fan out.
pub fn backoff_for_attempt(policy: RetryPolicy, attempt: u32) -> Duration {
   let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
   let base = policy.base_delay.checked_mul(exp).unwrap_or(policy.max_delay);
   apply_jitter(base.min(policy.max_delay), JITTER_PCT)
}

/// Apply bounded symmetric jitter to a duration.
fn apply_jitter(duration: Duration, jitter_pct: f64) -> Duration {
   if jitter_pct <= 0.0 || duration.is_zero() {
      return duration;
   }
   let unit = next_jitter_unit();
   let delta = unit.mul_add(2.0, -1.0) * jitter_pct;
   let base_ms = duration.as_millis() as f64;
   let jittered = (base_ms * (1.0 + delta)).max(1.0);
   Duration::from_millis(jittered.round() as u64)
}

// Small LCG so backoff jitter needs no RNG dependency.
fn next_jitter_unit() -> f64 {
   static SEED: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);
   let mut current = SEED.load(Ordering::Relaxed);
   loop {
      let next = current.wrapping_mul(6_364_136_223_846_793_005_u64).wrapping_add(1);
      match SEED.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
         Ok(_) => {
            // Top 53 bits give a uniform f64 in [0, 1).
            return ((next >> 11) as f64) / ((1_u64 << 53) as f64);
         }
         Err(actual) => current = actual,
      }
   }
}

// ─── Sleep seam ─────────────────────────────────────────────────────────────

/// Sleep abstraction so retry timing can be tested without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
   async fn sleep(&self, delay: Duration);
}

/// Production sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
   async fn sleep(&self, delay: Duration) {
      tokio::time::sleep(delay).await;
   }
}

// ─── Context ────────────────────────────────────────────────────────────────

/// Call-site context carried through a retried operation, for logging and
/// failure attribution.
#[derive(Debug, Clone)]
pub struct ErrorContext {
   pub operation: &'static str,
   pub path:      Option<String>,
   pub line_no:   Option<u64>,
   pub started:   Instant,
}

impl ErrorContext {
   pub fn new(operation: &'static str) -> Self {
      Self { operation, path: None, line_no: None, started: Instant::now() }
   }

   pub fn with_line(mut self, path: &str, line_no: u64) -> Self {
      self.path = Some(path.to_string());
      self.line_no = Some(line_no);
      self
   }
}

// ─── Stats ──────────────────────────────────────────────────────────────────

/// Aggregate view of everything the retry layer has seen.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
   pub total_failures: u64,
   pub total_retries:  u64,
   /// Failure counts keyed by category name; zero-count categories omitted.
   pub by_category: BTreeMap<&'static str, u64>,
   /// One snapshot per operation name that has been called at least once.
   pub breakers: BTreeMap<String, BreakerSnapshot>,
}

impl ErrorStats {
   /// Operation names whose circuit is not closed.
   pub fn open_circuits(&self) -> Vec<&str> {
      self
         .breakers
         .iter()
         .filter(|(_, snap)| snap.state != BreakerState::Closed)
         .map(|(op, _)| op.as_str())
         .collect()
   }
}

// ─── Handler ────────────────────────────────────────────────────────────────

/// Wraps fallible async operations with classification-driven retry and a
/// lazily created circuit breaker per operation name.
pub struct ErrorHandler {
   failure_threshold: u32,
   recovery:          Duration,
   breakers:       Mutex<HashMap<&'static str, Arc<CircuitBreaker>>>,
   category_counts: Mutex<HashMap<ErrorCategory, u64>>,
   total_failures: AtomicU64,
   total_retries:  AtomicU64,
   sleeper: Box<dyn Sleeper>,
}

impl ErrorHandler {
   pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
      Self {
         failure_threshold,
         recovery,
         breakers: Mutex::new(HashMap::new()),
         category_counts: Mutex::new(HashMap::new()),
         total_failures: AtomicU64::new(0),
         total_retries: AtomicU64::new(0),
         sleeper: Box::new(TokioSleeper),
      }
   }

   pub fn from_config() -> Self {
      let cfg = config::get();
      Self::new(cfg.breaker_failure_threshold, Duration::from_millis(cfg.breaker_recovery_ms))
   }

   /// Replaces the sleeper, for tests that must not wait in real time.
   pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
      self.sleeper = sleeper;
      self
   }

   /// Runs `call` with retry per the failure category's policy.
   ///
   /// The breaker for the operation name is consulted before every attempt:
   /// an open circuit fails fast with [`Error::CircuitOpen`] without invoking
   /// the call. Success closes the circuit. A failure is classified, counted,
   /// recorded against the breaker, and retried only while the pure decision
   /// function allows it, sleeping the backoff delay in between.
   pub async fn execute_with_retry<T, F, Fut>(&self, ctx: &ErrorContext, mut call: F) -> Result<T>
   where
      F: FnMut() -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      let breaker = self.breaker(ctx.operation);
      let mut attempt: u32 = 1;

      loop {
         if !breaker.try_acquire() {
            self.count_failure(ErrorCategory::Network);
            tracing::warn!(op = ctx.operation, "circuit open, failing fast");
            return Err(Error::CircuitOpen { op: ctx.operation });
         }

         match call().await {
            Ok(value) => {
               breaker.record_success();
               return Ok(value);
            }
            Err(err) => {
               let category = classify(&err);
               let severity = severity_for(category, attempt);
               self.count_failure(category);
               breaker.record_failure();

               if !should_retry(category, severity, attempt) {
                  tracing::warn!(
                     op = ctx.operation,
                     path = ctx.path.as_deref(),
                     category = category.as_str(),
                     severity = severity.as_str(),
                     attempt,
                     error = %err,
                     "giving up"
                  );
                  return Err(err);
               }

               let delay = backoff_for_attempt(policy_for(category), attempt);
               tracing::debug!(
                  op = ctx.operation,
                  path = ctx.path.as_deref(),
                  category = category.as_str(),
                  attempt,
                  delay_ms = delay.as_millis() as u64,
                  error = %err,
                  "retrying after backoff"
               );
               self.total_retries.fetch_add(1, Ordering::Relaxed);
               self.sleeper.sleep(delay).await;
               attempt += 1;
            }
         }
      }
   }

   /// Current aggregate statistics and breaker snapshots.
   pub fn stats(&self) -> ErrorStats {
      let counts = self.category_counts.lock();
      let by_category = ErrorCategory::ALL
         .iter()
         .filter_map(|cat| counts.get(cat).map(|n| (cat.as_str(), *n)))
         .collect();

      let breakers = self
         .breakers
         .lock()
         .iter()
         .map(|(op, breaker)| ((*op).to_string(), breaker.snapshot()))
         .collect();

      ErrorStats {
         total_failures: self.total_failures.load(Ordering::Relaxed),
         total_retries: self.total_retries.load(Ordering::Relaxed),
         by_category,
         breakers,
      }
   }

   /// Breaker for an operation name, created on first use.
   pub fn breaker(&self, operation: &'static str) -> Arc<CircuitBreaker> {
      self
         .breakers
         .lock()
         .entry(operation)
         .or_insert_with(|| {
            Arc::new(CircuitBreaker::new(self.failure_threshold, self.recovery))
         })
         .clone()
   }

   fn count_failure(&self, category: ErrorCategory) {
      *self.category_counts.lock().entry(category).or_insert(0) += 1;
      self.total_failures.fetch_add(1, Ordering::Relaxed);
   }
}

impl std::fmt::Debug for ErrorHandler {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ErrorHandler")
         .field("failure_threshold", &self.failure_threshold)
         .field("recovery", &self.recovery)
         .field("total_failures", &self.total_failures.load(Ordering::Relaxed))
         .finish_non_exhaustive()
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::AtomicU32;

   use super::*;

   /// Records requested delays instead of waiting.
   struct RecordingSleeper {
      delays: Mutex<Vec<Duration>>,
   }

   #[async_trait]
   impl Sleeper for RecordingSleeper {
      async fn sleep(&self, delay: Duration) {
         self.delays.lock().push(delay);
      }
   }

   fn handler() -> ErrorHandler {
      ErrorHandler::new(5, Duration::from_millis(60_000))
         .with_sleeper(Box::new(RecordingSleeper { delays: Mutex::new(Vec::new()) }))
   }

   fn network_error() -> Error {
      Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"))
   }

   #[test]
   fn backoff_grows_exponentially_within_cap() {
      let policy = policy_for(ErrorCategory::Backend);
      // Jitter is bounded at ±20%, so ranges are checkable.
      let first = backoff_for_attempt(policy, 1);
      assert!(first >= Duration::from_millis(1_600) && first <= Duration::from_millis(2_400));

      let second = backoff_for_attempt(policy, 2);
      assert!(second >= Duration::from_millis(3_200) && second <= Duration::from_millis(4_800));

      // Far past the cap: stays at max_delay ± jitter.
      let late = backoff_for_attempt(policy, 30);
      assert!(late <= Duration::from_millis(72_000));
   }

   #[tokio::test]
   async fn succeeds_after_transient_failures() {
      let handler = handler();
      let calls = AtomicU32::new(0);
      let ctx = ErrorContext::new("index_batch");

      let result: Result<u32> = handler
         .execute_with_retry(&ctx, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err(network_error()) } else { Ok(n) } }
         })
         .await;

      assert_eq!(result.unwrap(), 3);
      assert_eq!(calls.load(Ordering::SeqCst), 3);

      let stats = handler.stats();
      assert_eq!(stats.total_failures, 2);
      assert_eq!(stats.total_retries, 2);
      assert_eq!(stats.by_category.get("network"), Some(&2));
   }

   #[tokio::test]
   async fn validation_errors_are_not_retried() {
      let handler = handler();
      let calls = AtomicU32::new(0);
      let ctx = ErrorContext::new("index_batch");

      let result: Result<()> = handler
         .execute_with_retry(&ctx, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Validation { line_no: 1, reason: "bad op".into() }) }
         })
         .await;

      assert!(result.is_err());
      assert_eq!(calls.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn network_retries_respect_attempt_budget() {
      let handler = handler();
      let calls = AtomicU32::new(0);
      let ctx = ErrorContext::new("embed");

      let result: Result<()> = handler
         .execute_with_retry(&ctx, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(network_error()) }
         })
         .await;

      assert!(result.is_err());
      assert_eq!(calls.load(Ordering::SeqCst), 5);
   }

   #[tokio::test]
   async fn open_circuit_fails_fast_without_calling() {
      let handler = handler();
      let ctx = ErrorContext::new("index_batch");

      // Exhaust the budget once: five consecutive failures trip the breaker.
      let _: Result<()> = handler
         .execute_with_retry(&ctx, || async { Err(network_error()) })
         .await;
      assert_eq!(handler.breaker("index_batch").state(), BreakerState::Open);

      let calls = AtomicU32::new(0);
      let result: Result<()> = handler
         .execute_with_retry(&ctx, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
         })
         .await;

      assert!(matches!(result, Err(Error::CircuitOpen { op: "index_batch" })));
      assert_eq!(calls.load(Ordering::SeqCst), 0);
   }

   #[tokio::test]
   async fn breakers_are_independent_per_operation() {
      let handler = handler();

      let _: Result<()> = handler
         .execute_with_retry(&ErrorContext::new("index_batch"), || async {
            Err(network_error())
         })
         .await;
      assert_eq!(handler.breaker("index_batch").state(), BreakerState::Open);

      // A different operation name is unaffected.
      let result: Result<u32> = handler
         .execute_with_retry(&ErrorContext::new("embed"), || async { Ok(7) })
         .await;
      assert_eq!(result.unwrap(), 7);
      assert_eq!(handler.breaker("embed").state(), BreakerState::Closed);
   }

   #[tokio::test]
   async fn stats_surface_open_circuits() {
      let handler = handler();
      let _: Result<()> = handler
         .execute_with_retry(&ErrorContext::new("index_batch"), || async {
            Err(network_error())
         })
         .await;

      let stats = handler.stats();
      assert_eq!(stats.open_circuits(), vec!["index_batch"]);
      assert!(stats.breakers["index_batch"].trips >= 1);
   }
}
