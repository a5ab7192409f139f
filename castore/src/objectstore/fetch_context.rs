//! Per-request fetch context (spec §4.1), threaded explicitly through every
//! object-store call instead of living as global state — the "confine
//! global mutable state to an explicit per-process context" guidance in
//! spec §9.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportPriority {
    Low,
    Default,
    High,
}

impl ImportPriority {
    /// Shifts priority by `delta` steps, clamping at the ends of the
    /// enum (spec §4.1's `deprioritize(delta)`).
    pub fn deprioritize(self, delta: i32) -> Self {
        let levels = [ImportPriority::Low, ImportPriority::Default, ImportPriority::High];
        let idx = levels.iter().position(|&l| l == self).unwrap() as i32;
        let new_idx = (idx - delta).clamp(0, levels.len() as i32 - 1) as usize;
        levels[new_idx]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCause {
    Channel,
    Thrift,
    Prefetch,
}

/// Carries requester identity, cause, and deadline for a single
/// object-store request (spec §4.1, §5 cancellation/timeouts).
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub requester_pid: u32,
    pub cause: FetchCause,
    pub endpoint: &'static str,
    pub prefetch_metadata: bool,
    pub priority: ImportPriority,
    deadline: Option<Instant>,
}

impl FetchContext {
    pub fn new(requester_pid: u32, cause: FetchCause, endpoint: &'static str) -> Self {
        Self {
            requester_pid,
            cause,
            endpoint,
            prefetch_metadata: false,
            priority: ImportPriority::Default,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}
