//! Circuit breaker guarding one logical operation against a down backend.
//!
//! ```text
//!   Closed ──(threshold consecutive failures)──> Open
//!   Open ──(recovery timeout elapsed)──> HalfOpen (single probe)
//!   HalfOpen ──(probe succeeds)──> Closed
//!   HalfOpen ──(probe fails)──> Open
//! ```
//!
//! All transitions are atomic; concurrent workers share one breaker per
//! operation name without locks.

use std::{
   sync::atomic::{AtomicU32, AtomicU64, Ordering},
   time::{Duration, Instant},
};

use serde::Serialize;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum BreakerState {
   /// Normal: calls pass through.
   Closed = 0,
   /// Tripped: calls fail fast without touching the backend.
   Open = 1,
   /// Recovery probe in flight; further calls still fail fast.
   HalfOpen = 2,
}

impl BreakerState {
   const fn from_u32(v: u32) -> Self {
      match v {
         1 => Self::Open,
         2 => Self::HalfOpen,
         _ => Self::Closed,
      }
   }

   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Closed => "closed",
         Self::Open => "open",
         Self::HalfOpen => "half_open",
      }
   }
}

/// Point-in-time view of one breaker, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
   pub state:                BreakerState,
   pub consecutive_failures: u32,
   pub trips:                u64,
   pub fast_fails:           u64,
}

/// Per-operation circuit breaker with atomic state transitions.
pub struct CircuitBreaker {
   failure_threshold: u32,
   recovery:          Duration,
   /// 0=Closed, 1=Open, 2=HalfOpen.
   state:                AtomicU32,
   consecutive_failures: AtomicU32,
   /// Milliseconds since `epoch` when the circuit last tripped.
   last_trip_ms: AtomicU64,
   epoch:        Instant,
   trip_count:      AtomicU64,
   fast_fail_count: AtomicU64,
}

impl CircuitBreaker {
   pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
      Self {
         failure_threshold,
         recovery,
         state: AtomicU32::new(BreakerState::Closed as u32),
         consecutive_failures: AtomicU32::new(0),
         last_trip_ms: AtomicU64::new(0),
         epoch: Instant::now(),
         trip_count: AtomicU64::new(0),
         fast_fail_count: AtomicU64::new(0),
      }
   }

   /// Whether a call may proceed right now.
   ///
   /// Returns `false` when the circuit is open and the recovery window has
   /// not elapsed, and while a recovery probe is already in flight. When the
   /// window has elapsed, exactly one caller wins the transition to
   /// `HalfOpen` and becomes the probe.
   pub fn try_acquire(&self) -> bool {
      match self.current_state() {
         BreakerState::Closed => true,

         BreakerState::Open => {
            let elapsed = self.elapsed_ms();
            let tripped = self.last_trip_ms.load(Ordering::Acquire);
            if elapsed.saturating_sub(tripped) >= self.recovery.as_millis() as u64 {
               let won = self
                  .state
                  .compare_exchange(
                     BreakerState::Open as u32,
                     BreakerState::HalfOpen as u32,
                     Ordering::AcqRel,
                     Ordering::Acquire,
                  )
                  .is_ok();
               if won {
                  tracing::info!("circuit half-open: sending probe");
                  return true;
               }
            }
            self.fast_fail_count.fetch_add(1, Ordering::Relaxed);
            false
         }

         BreakerState::HalfOpen => {
            self.fast_fail_count.fetch_add(1, Ordering::Relaxed);
            false
         }
      }
   }

   /// Records a successful call; any state returns to `Closed`.
   pub fn record_success(&self) {
      let prior = self.state.swap(BreakerState::Closed as u32, Ordering::AcqRel);
      self.consecutive_failures.store(0, Ordering::Release);
      if prior != BreakerState::Closed as u32 {
         tracing::info!("circuit closed: backend recovered");
      }
   }

   /// Records a failed call, tripping the circuit at the threshold.
   pub fn record_failure(&self) {
      match self.current_state() {
         BreakerState::Closed => {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= self.failure_threshold {
               self.trip();
            }
         }
         BreakerState::HalfOpen => {
            // Probe failed: back to open with a fresh recovery window.
            self.trip();
         }
         BreakerState::Open => {}
      }
   }

   pub fn state(&self) -> BreakerState {
      self.current_state()
   }

   pub fn snapshot(&self) -> BreakerSnapshot {
      BreakerSnapshot {
         state:                self.current_state(),
         consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
         trips:                self.trip_count.load(Ordering::Relaxed),
         fast_fails:           self.fast_fail_count.load(Ordering::Relaxed),
      }
   }

   fn current_state(&self) -> BreakerState {
      BreakerState::from_u32(self.state.load(Ordering::Acquire))
   }

   fn elapsed_ms(&self) -> u64 {
      self.epoch.elapsed().as_millis() as u64
   }

   fn trip(&self) {
      self.state.store(BreakerState::Open as u32, Ordering::Release);
      self.last_trip_ms.store(self.elapsed_ms(), Ordering::Release);
      self.consecutive_failures.store(0, Ordering::Release);
      self.trip_count.fetch_add(1, Ordering::Relaxed);
      tracing::warn!(threshold = self.failure_threshold, "circuit open: failing fast");
   }
}

impl std::fmt::Debug for CircuitBreaker {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("CircuitBreaker")
         .field("state", &self.current_state())
         .field("consecutive_failures", &self.consecutive_failures.load(Ordering::Relaxed))
         .field("trips", &self.trip_count.load(Ordering::Relaxed))
         .finish_non_exhaustive()
   }
}
