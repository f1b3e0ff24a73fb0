//! Execution limits and cooperative cancellation.
//!
//! Limits come in two flavors with different visibility:
//!
//! - **Catchable**: collection-size ceilings, repetition caps, and the
//!   allocation budget raise `MemoryError` inside the program, which Python
//!   code may handle.
//! - **Uncatchable**: instruction budget, deadline, and cancellation stop the
//!   dispatch loop outright and surface to the embedder. No `finally` or
//!   `__exit__` handlers run; a caller wanting graceful cleanup catches the
//!   abort and drives cleanup itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::exceptions::PyExc;

/// String repetition cap in bytes.
pub const STR_REPEAT_CAP: usize = 100_000_000;
/// List/tuple/bytes repetition cap in items.
pub const SEQ_REPEAT_CAP: usize = 10_000_000;

/// Resource limits applied to every execution on a VM.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Limits {
    /// Maximum bytecode instructions per execution, `None` for unlimited.
    pub max_instructions: Option<u64>,
    /// Maximum call depth for Python-level calls.
    pub max_recursion: usize,
    /// Ceiling on list/tuple growth, `None` for unlimited.
    pub max_collection_size: Option<usize>,
    /// Total container-element allocation budget per execution.
    pub max_allocations: Option<u64>,
    /// Instructions between cancellation/deadline checks. Minimum 1.
    pub check_interval: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_instructions: None,
            max_recursion: 1000,
            max_collection_size: None,
            max_allocations: None,
            check_interval: 1000,
        }
    }
}

impl Limits {
    pub fn with_max_instructions(mut self, n: u64) -> Self {
        self.max_instructions = Some(n);
        self
    }

    pub fn with_max_recursion(mut self, n: usize) -> Self {
        self.max_recursion = n;
        self
    }

    pub fn with_max_collection_size(mut self, n: usize) -> Self {
        self.max_collection_size = Some(n);
        self
    }

    pub fn with_max_allocations(mut self, n: u64) -> Self {
        self.max_allocations = Some(n);
        self
    }
}

/// Cloneable cancellation handle. Tripping it stops the dispatch loop at the
/// next check boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-execution accounting: instruction count, deadline, cancellation, and
/// the allocation budget.
pub(crate) struct Budget {
    pub instructions: u64,
    pub allocations: u64,
    pub started: Instant,
    pub deadline: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl Budget {
    pub fn new(deadline: Option<Duration>, cancel: Option<CancelToken>) -> Self {
        Self {
            instructions: 0,
            allocations: 0,
            started: Instant::now(),
            deadline,
            cancel,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Charge `n` allocated elements against the budget.
    pub fn charge_allocation(&mut self, limits: &Limits, n: u64) -> Result<(), PyExc> {
        self.allocations = self.allocations.saturating_add(n);
        if let Some(max) = limits.max_allocations {
            if self.allocations > max {
                return Err(PyExc::memory_error(format!(
                    "allocation budget exceeded ({max} elements)"
                )));
            }
        }
        Ok(())
    }
}

/// Check a prospective collection length against the configured ceiling.
pub(crate) fn check_collection_size(limits: &Limits, len: usize) -> Result<(), PyExc> {
    if let Some(max) = limits.max_collection_size {
        if len > max {
            return Err(PyExc::memory_error(format!(
                "collection size {len} exceeds limit of {max}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_permissive() {
        let limits = Limits::default();
        assert!(limits.max_instructions.is_none());
        assert_eq!(limits.check_interval, 1000);
        assert!(check_collection_size(&limits, usize::MAX).is_ok());
    }

    #[test]
    fn collection_ceiling_trips() {
        let limits = Limits::default().with_max_collection_size(10);
        assert!(check_collection_size(&limits, 10).is_ok());
        assert!(check_collection_size(&limits, 11).is_err());
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
