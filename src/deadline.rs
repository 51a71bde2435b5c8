//! Wall-clock deadline for bounded-latency queries
//!
//! A `Deadline` is an `Instant` passed down the recall pipeline. Each stage
//! calls `check()` before expensive work and periodically during brute-force
//! scans. This works from any thread, unlike signal-based alarms which only
//! fire on the main thread and corrupt concurrent calls.

use std::time::{Duration, Instant};

use thiserror::Error;

/// Returned when an operation overruns its deadline.
///
/// The partial result set is discarded; only the error is surfaced.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation exceeded its deadline after {elapsed_ms}ms")]
pub struct DeadlineExceeded {
    /// Wall-clock milliseconds elapsed since the deadline was armed
    pub elapsed_ms: u64,
}

/// A wall-clock deadline. `timeout_ms = 0` means "no deadline".
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    expires: Option<Instant>,
}

impl Deadline {
    /// Arm a deadline `timeout_ms` from now. Zero disables it.
    pub fn after_ms(timeout_ms: u64) -> Self {
        let started = Instant::now();
        let expires = if timeout_ms == 0 {
            None
        } else {
            Some(started + Duration::from_millis(timeout_ms))
        };
        Self { started, expires }
    }

    /// A deadline that never expires.
    pub fn unbounded() -> Self {
        Self::after_ms(0)
    }

    /// Milliseconds since the deadline was armed.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        match self.expires {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Time left before expiry, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Error out if the deadline has passed.
    pub fn check(&self) -> Result<(), DeadlineExceeded> {
        if self.expired() {
            Err(DeadlineExceeded {
                elapsed_ms: self.elapsed_ms(),
            })
        } else {
            Ok(())
        }
    }
}
