//! The plan and its compiled (active) form.
//!
//! `Plan` is what a caller builds and hands to [`crate::Session::new`]:
//! syscall number -> `Outcome`, a thread-eligibility selector, and a
//! thread-discovery strategy. `ActivePlan` is the lookup-optimized form the
//! dispatcher actually consults — errno weights pre-summed into a sorted
//! cumulative array, so picking one is a single draw plus a binary search.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sysfail_shared::errors::{SysfailError, SysfailResult};

use crate::invocation::{InvocationPredicate, RegisterFrame};
use crate::thread_monitor::ThreadDiscovery;

/// A Linux syscall number, as it appears in `RAX` when trapped.
pub type Syscall = i64;

/// An errno value, as negated into `RAX` on failure.
pub type Errno = i32;

/// The chance an outcome fires at all, and how that firing mass splits
/// between "apply before entering the kernel" and "apply after the kernel
/// returns".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probability {
    pub p: f64,
    pub after_bias: f64,
}

impl Probability {
    pub const NEVER: Probability = Probability {
        p: 0.0,
        after_bias: 0.0,
    };

    pub fn new(p: f64, after_bias: f64) -> SysfailResult<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(SysfailError::InvalidArgument(format!(
                "probability p must be in [0, 1], got {p}"
            )));
        }
        if !(0.0..=1.0).contains(&after_bias) {
            return Err(SysfailError::InvalidArgument(format!(
                "after_bias must be in [0, 1], got {after_bias}"
            )));
        }
        Ok(Self { p, after_bias })
    }
}

/// The outcome assigned to one syscall number.
#[derive(Clone)]
pub struct Outcome {
    pub fail: Probability,
    pub delay: Probability,
    pub max_delay: Duration,
    pub error_weights: HashMap<Errno, f64>,
    pub eligible: Option<InvocationPredicate>,
}

impl Outcome {
    pub fn new(
        fail: Probability,
        delay: Probability,
        max_delay: Duration,
        error_weights: HashMap<Errno, f64>,
        eligible: Option<InvocationPredicate>,
    ) -> SysfailResult<Self> {
        if fail.p > 0.0 && error_weights.is_empty() {
            return Err(SysfailError::InvalidArgument(
                "fail.p > 0 requires a non-empty error-weight distribution".into(),
            ));
        }
        for (&errno, &weight) in &error_weights {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(SysfailError::InvalidArgument(format!(
                    "error weight for errno {errno} must be positive and finite, got {weight}"
                )));
            }
        }
        if delay.p > 0.0 && max_delay.is_zero() {
            return Err(SysfailError::InvalidArgument(
                "delay.p > 0 requires a non-zero max_delay".into(),
            ));
        }

        Ok(Self {
            fail,
            delay,
            max_delay,
            error_weights,
            eligible,
        })
    }

    /// Convenience constructor for a pure failure outcome with no delay and
    /// no per-invocation filtering.
    pub fn fail_with(fail: Probability, error_weights: HashMap<Errno, f64>) -> SysfailResult<Self> {
        Self::new(fail, Probability::NEVER, Duration::ZERO, error_weights, None)
    }
}

/// The dispatcher's lookup-optimized form of an [`Outcome`]: errno weights
/// are pre-summed into a sorted cumulative array, so a single uniform draw
/// plus a lower-bound search selects the errno in O(log k).
pub struct ActiveOutcome {
    pub fail: Probability,
    pub delay: Probability,
    pub max_delay: Duration,
    /// Sorted ascending by cumulative weight; last entry's cumulative
    /// weight is the total.
    cumulative_errors: Vec<(f64, Errno)>,
    eligible: Option<InvocationPredicate>,
}

impl ActiveOutcome {
    fn compile(o: &Outcome) -> Self {
        let mut entries: Vec<(Errno, f64)> = o.error_weights.iter().map(|(&e, &w)| (e, w)).collect();
        entries.sort_by_key(|&(errno, _)| errno);

        let mut cumulative = 0.0;
        let cumulative_errors = entries
            .into_iter()
            .map(|(errno, weight)| {
                cumulative += weight;
                (cumulative, errno)
            })
            .collect();

        Self {
            fail: o.fail,
            delay: o.delay,
            max_delay: o.max_delay,
            cumulative_errors,
            eligible: o.eligible.clone(),
        }
    }

    pub fn eligible(&self, regs: &RegisterFrame) -> bool {
        match &self.eligible {
            Some(pred) => pred(regs),
            None => true,
        }
    }

    pub fn total_weight(&self) -> f64 {
        self.cumulative_errors
            .last()
            .map(|&(cum, _)| cum)
            .unwrap_or(0.0)
    }

    /// Select the errno whose cumulative-weight bucket contains `draw`,
    /// where `draw` is expected in `[0, total_weight())`.
    pub fn errno_for(&self, draw: f64) -> Option<Errno> {
        let idx = self.cumulative_errors.partition_point(|&(cum, _)| cum < draw);
        self.cumulative_errors.get(idx).map(|&(_, errno)| errno)
    }
}

/// Immutable plan handed to [`crate::Session::new`].
pub struct Plan {
    pub outcomes: HashMap<Syscall, Outcome>,
    pub selector: Arc<dyn Fn(libc::pid_t) -> bool + Send + Sync>,
    pub thread_discovery: ThreadDiscovery,
}

impl Plan {
    pub fn new(
        outcomes: HashMap<Syscall, Outcome>,
        selector: Arc<dyn Fn(libc::pid_t) -> bool + Send + Sync>,
        thread_discovery: ThreadDiscovery,
    ) -> Self {
        Self {
            outcomes,
            selector,
            thread_discovery,
        }
    }
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            outcomes: HashMap::new(),
            selector: Arc::new(|_tid| true),
            thread_discovery: ThreadDiscovery::None,
        }
    }
}

/// The syscall-number space on x86-64 Linux is small and dense (< 550
/// numbers at present); a flat array indexed by syscall number gives
/// lookup in one load rather than a hash.
const MAX_SYSCALL_NR: usize = 1024;

/// Build-time-compiled form of a [`Plan`].
pub struct ActivePlan {
    outcomes: Vec<Option<ActiveOutcome>>,
    pub selector: Arc<dyn Fn(libc::pid_t) -> bool + Send + Sync>,
}

impl ActivePlan {
    pub fn compile(plan: &Plan) -> Self {
        let mut outcomes: Vec<Option<ActiveOutcome>> = (0..MAX_SYSCALL_NR).map(|_| None).collect();
        for (&syscall, outcome) in &plan.outcomes {
            if syscall >= 0 && (syscall as usize) < MAX_SYSCALL_NR {
                outcomes[syscall as usize] = Some(ActiveOutcome::compile(outcome));
            }
        }
        Self {
            outcomes,
            selector: plan.selector.clone(),
        }
    }

    pub fn get(&self, syscall: Syscall) -> Option<&ActiveOutcome> {
        if syscall < 0 {
            return None;
        }
        self.outcomes.get(syscall as usize).and_then(|o| o.as_ref())
    }
}

/// Ergonomic, validated assembly of a [`Plan`] without constructing the raw
/// `HashMap<Syscall, Outcome>` by hand. Cannot produce an invalid `Plan`:
/// every `with_outcome` call runs the same validation `Outcome::new` does.
pub struct PlanBuilder {
    outcomes: HashMap<Syscall, Outcome>,
    selector: Arc<dyn Fn(libc::pid_t) -> bool + Send + Sync>,
    thread_discovery: ThreadDiscovery,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            outcomes: HashMap::new(),
            selector: Arc::new(|_tid| true),
            thread_discovery: ThreadDiscovery::None,
        }
    }

    pub fn with_outcome(mut self, syscall: Syscall, outcome: Outcome) -> Self {
        self.outcomes.insert(syscall, outcome);
        self
    }

    pub fn with_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(libc::pid_t) -> bool + Send + Sync + 'static,
    {
        self.selector = Arc::new(selector);
        self
    }

    pub fn with_thread_discovery(mut self, strategy: ThreadDiscovery) -> Self {
        self.thread_discovery = strategy;
        self
    }

    pub fn build(self) -> Plan {
        Plan::new(self.outcomes, self.selector, self.thread_discovery)
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}
