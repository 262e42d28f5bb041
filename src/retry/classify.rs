//! Error classification: category, severity, and per-category retry policy.

use std::time::Duration;

use serde::Serialize;

use crate::error::Error;

/// Fault category assigned to every error the retry layer sees.
///
/// Categories drive the retry policy table: how many attempts a call gets
/// and how its backoff grows. Classification prefers structured signals
/// (error variant, HTTP status) and falls back to message patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
   /// Connection-level faults: refused, reset, DNS, unreachable.
   Network,
   /// The indexing backend answered with a server-side error.
   Backend,
   /// Deliberate throttling by the backend (HTTP 429 and friends).
   RateLimit,
   /// The call ran out of time.
   Timeout,
   /// Local file I/O failed.
   Filesystem,
   /// Content could not be decoded or transport-encoded.
   Encoding,
   /// Allocation failure while handling a payload.
   Memory,
   /// The input or request itself is malformed.
   Validation,
   /// Nothing else matched.
   Unknown,
}

impl ErrorCategory {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Network => "network",
         Self::Backend => "backend",
         Self::RateLimit => "rate_limit",
         Self::Timeout => "timeout",
         Self::Filesystem => "filesystem",
         Self::Encoding => "encoding",
         Self::Memory => "memory",
         Self::Validation => "validation",
         Self::Unknown => "unknown",
      }
   }

   /// All categories, for stats iteration.
   pub const ALL: [Self; 9] = [
      Self::Network,
      Self::Backend,
      Self::RateLimit,
      Self::Timeout,
      Self::Filesystem,
      Self::Encoding,
      Self::Memory,
      Self::Validation,
      Self::Unknown,
   ];
}

impl std::fmt::Display for ErrorCategory {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str(self.as_str())
   }
}

/// How serious a classified failure is, given how often it has recurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
   Low,
   Medium,
   High,
   /// Never retried, regardless of category policy.
   Critical,
}

impl Severity {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Low => "low",
         Self::Medium => "medium",
         Self::High => "high",
         Self::Critical => "critical",
      }
   }

   const fn bump(self) -> Self {
      match self {
         Self::Low => Self::Medium,
         Self::Medium => Self::High,
         Self::High | Self::Critical => Self::Critical,
      }
   }
}

/// Retry policy for one category: attempt budget and backoff shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
   pub max_attempts: u32,
   pub base_delay:   Duration,
   pub max_delay:    Duration,
}

impl RetryPolicy {
   const fn new(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
      Self {
         max_attempts,
         base_delay: Duration::from_millis(base_ms),
         max_delay: Duration::from_millis(max_ms),
      }
   }
}

/// Per-category policy table.
///
/// Rate limits back off longest because they are deliberate throttles;
/// encoding, memory, and validation faults are permanent and get a single
/// attempt.
pub const fn policy_for(category: ErrorCategory) -> RetryPolicy {
   match category {
      ErrorCategory::Network => RetryPolicy::new(5, 1_000, 30_000),
      ErrorCategory::Backend => RetryPolicy::new(3, 2_000, 60_000),
      ErrorCategory::RateLimit => RetryPolicy::new(5, 10_000, 300_000),
      ErrorCategory::Timeout => RetryPolicy::new(3, 5_000, 120_000),
      ErrorCategory::Filesystem => RetryPolicy::new(2, 500, 5_000),
      ErrorCategory::Encoding | ErrorCategory::Memory | ErrorCategory::Validation => {
         RetryPolicy::new(1, 0, 0)
      }
      ErrorCategory::Unknown => RetryPolicy::new(2, 1_000, 10_000),
   }
}

/// Base severity before attempt escalation.
const fn base_severity(category: ErrorCategory) -> Severity {
   match category {
      ErrorCategory::Network | ErrorCategory::RateLimit | ErrorCategory::Timeout => Severity::Low,
      ErrorCategory::Backend | ErrorCategory::Filesystem | ErrorCategory::Unknown => {
         Severity::Medium
      }
      ErrorCategory::Encoding | ErrorCategory::Validation => Severity::High,
      ErrorCategory::Memory => Severity::Critical,
   }
}

/// Severity for a failure on the given attempt (1-based).
///
/// Recurrence escalates: the same category gains one level every two
/// attempts, so a network error is low on attempts 1-2 and medium on 3-4.
pub const fn severity_for(category: ErrorCategory, attempt: u32) -> Severity {
   let mut severity = base_severity(category);
   let mut bumps = attempt.saturating_sub(1) / 2;
   while bumps > 0 {
      severity = severity.bump();
      bumps -= 1;
   }
   severity
}

/// Pure retry decision: does this failure earn another attempt?
///
/// Independent of wall time so it can be tested without sleeping.
pub const fn should_retry(category: ErrorCategory, severity: Severity, attempt: u32) -> bool {
   if matches!(severity, Severity::Critical) {
      return false;
   }
   attempt < policy_for(category).max_attempts
}

/// Assigns a category to an error.
///
/// Structured variants decide directly; HTTP statuses map next; everything
/// else falls back to case-insensitive message patterns.
pub fn classify(error: &Error) -> ErrorCategory {
   match error {
      Error::Io(io) => classify_io(io),
      Error::Encoding { .. } => ErrorCategory::Encoding,
      Error::Validation { .. } | Error::Json(_) => ErrorCategory::Validation,
      // Embedding responses that parse but are unusable are a backend fault.
      Error::Embed { .. } => ErrorCategory::Backend,
      // Open-circuit fast-fails count against the network for reporting.
      Error::CircuitOpen { .. } => ErrorCategory::Network,
      Error::Request(req) if req.is_timeout() => ErrorCategory::Timeout,
      Error::Request(req) if req.is_connect() => ErrorCategory::Network,
      _ => match error.http_status() {
         Some(status) => classify_status(status),
         None => classify_message(&error.to_string()),
      },
   }
}

fn classify_io(io: &std::io::Error) -> ErrorCategory {
   use std::io::ErrorKind;
   match io.kind() {
      ErrorKind::TimedOut => ErrorCategory::Timeout,
      ErrorKind::ConnectionRefused
      | ErrorKind::ConnectionReset
      | ErrorKind::ConnectionAborted
      | ErrorKind::NotConnected
      | ErrorKind::BrokenPipe => ErrorCategory::Network,
      ErrorKind::OutOfMemory => ErrorCategory::Memory,
      ErrorKind::InvalidData => ErrorCategory::Encoding,
      _ => ErrorCategory::Filesystem,
   }
}

const fn classify_status(status: u16) -> ErrorCategory {
   match status {
      429 => ErrorCategory::RateLimit,
      408 | 504 => ErrorCategory::Timeout,
      500..=599 => ErrorCategory::Backend,
      400..=499 => ErrorCategory::Validation,
      _ => ErrorCategory::Unknown,
   }
}

const MESSAGE_PATTERNS: &[(&str, ErrorCategory)] = &[
   ("rate limit", ErrorCategory::RateLimit),
   ("too many requests", ErrorCategory::RateLimit),
   ("quota", ErrorCategory::RateLimit),
   ("timed out", ErrorCategory::Timeout),
   ("timeout", ErrorCategory::Timeout),
   ("deadline", ErrorCategory::Timeout),
   ("connection refused", ErrorCategory::Network),
   ("connection reset", ErrorCategory::Network),
   ("dns", ErrorCategory::Network),
   ("unreachable", ErrorCategory::Network),
   ("broken pipe", ErrorCategory::Network),
   ("no such file", ErrorCategory::Filesystem),
   ("permission denied", ErrorCategory::Filesystem),
   ("is a directory", ErrorCategory::Filesystem),
   ("out of memory", ErrorCategory::Memory),
   ("allocation failed", ErrorCategory::Memory),
   ("utf-8", ErrorCategory::Encoding),
   ("base64", ErrorCategory::Encoding),
   ("invalid", ErrorCategory::Validation),
   ("malformed", ErrorCategory::Validation),
   ("missing field", ErrorCategory::Validation),
];

fn classify_message(message: &str) -> ErrorCategory {
   let lower = message.to_lowercase();
   for (pattern, category) in MESSAGE_PATTERNS {
      if lower.contains(pattern) {
         return *category;
      }
   }
   ErrorCategory::Unknown
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn policy_table_matches_taxonomy() {
      assert_eq!(policy_for(ErrorCategory::Network).max_attempts, 5);
      assert_eq!(policy_for(ErrorCategory::Network).base_delay, Duration::from_secs(1));
      assert_eq!(policy_for(ErrorCategory::Network).max_delay, Duration::from_secs(30));

      assert_eq!(policy_for(ErrorCategory::RateLimit).max_attempts, 5);
      assert_eq!(policy_for(ErrorCategory::RateLimit).max_delay, Duration::from_secs(300));

      assert_eq!(policy_for(ErrorCategory::Encoding).max_attempts, 1);
      assert_eq!(policy_for(ErrorCategory::Validation).max_attempts, 1);
      assert_eq!(policy_for(ErrorCategory::Memory).max_attempts, 1);

      assert_eq!(policy_for(ErrorCategory::Unknown).max_attempts, 2);
   }

   #[test]
   fn severity_escalates_with_attempts() {
      assert_eq!(severity_for(ErrorCategory::Network, 1), Severity::Low);
      assert_eq!(severity_for(ErrorCategory::Network, 2), Severity::Low);
      assert_eq!(severity_for(ErrorCategory::Network, 3), Severity::Medium);
      assert_eq!(severity_for(ErrorCategory::Network, 5), Severity::High);
      assert_eq!(severity_for(ErrorCategory::Backend, 3), Severity::High);
   }

   #[test]
   fn memory_is_always_critical() {
      assert_eq!(severity_for(ErrorCategory::Memory, 1), Severity::Critical);
      assert!(!should_retry(ErrorCategory::Memory, Severity::Critical, 1));
   }

   #[test]
   fn retry_decision_is_pure_and_bounded() {
      assert!(should_retry(ErrorCategory::Network, Severity::Low, 1));
      assert!(should_retry(ErrorCategory::Network, Severity::Low, 4));
      assert!(!should_retry(ErrorCategory::Network, Severity::Low, 5));

      // Critical overrides an otherwise retryable category.
      assert!(!should_retry(ErrorCategory::Network, Severity::Critical, 1));

      // Single-attempt categories never retry.
      assert!(!should_retry(ErrorCategory::Validation, Severity::High, 1));
      assert!(!should_retry(ErrorCategory::Encoding, Severity::High, 1));
   }

   #[test]
   fn status_codes_classify_structurally() {
      assert_eq!(classify_status(429), ErrorCategory::RateLimit);
      assert_eq!(classify_status(408), ErrorCategory::Timeout);
      assert_eq!(classify_status(504), ErrorCategory::Timeout);
      assert_eq!(classify_status(503), ErrorCategory::Backend);
      assert_eq!(classify_status(500), ErrorCategory::Backend);
      assert_eq!(classify_status(422), ErrorCategory::Validation);
   }

   #[test]
   fn error_variants_classify_structurally() {
      let err = Error::Backend { op: "index_batch", status: 503, reason: "unavailable".into() };
      assert_eq!(classify(&err), ErrorCategory::Backend);

      let err = Error::Backend { op: "index_batch", status: 429, reason: "slow down".into() };
      assert_eq!(classify(&err), ErrorCategory::RateLimit);

      let err = Error::Encoding { path: "a.bin".into(), reason: "bad base64".into() };
      assert_eq!(classify(&err), ErrorCategory::Encoding);

      let err = Error::Validation { line_no: 3, reason: "unknown op".into() };
      assert_eq!(classify(&err), ErrorCategory::Validation);

      let err = Error::CircuitOpen { op: "index_batch" };
      assert_eq!(classify(&err), ErrorCategory::Network);

      let err = Error::Embed { op: "embed", reason: "dimension mismatch".into() };
      assert_eq!(classify(&err), ErrorCategory::Backend);
   }

   #[test]
   fn io_errors_classify_by_kind() {
      use std::io::{Error as IoError, ErrorKind};

      let err = Error::Io(IoError::new(ErrorKind::NotFound, "no such file"));
      assert_eq!(classify(&err), ErrorCategory::Filesystem);

      let err = Error::Io(IoError::new(ErrorKind::ConnectionRefused, "refused"));
      assert_eq!(classify(&err), ErrorCategory::Network);

      let err = Error::Io(IoError::new(ErrorKind::TimedOut, "slow"));
      assert_eq!(classify(&err), ErrorCategory::Timeout);
   }

   #[test]
   fn message_patterns_are_the_fallback() {
      assert_eq!(classify_message("backend rate limit exceeded"), ErrorCategory::RateLimit);
      assert_eq!(classify_message("operation timed out after 30s"), ErrorCategory::Timeout);
      assert_eq!(classify_message("connection refused by peer"), ErrorCategory::Network);
      assert_eq!(classify_message("invalid utf-8 sequence"), ErrorCategory::Encoding);
      assert_eq!(classify_message("something odd"), ErrorCategory::Unknown);
   }
}
