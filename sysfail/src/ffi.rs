//! The C ABI.
//!
//! A field-for-field match of the `sysfail.h` struct layout, so a C test
//! harness (or anything else linking against `libsysfail.so`/`.a`) can build
//! a plan and drive a session without touching Rust types. This module
//! performs no validation beyond what
//! [`crate::plan::Outcome::new`] already does; a malformed outcome is
//! silently dropped from the compiled plan rather than surfaced, since
//! there is no error channel back across this boundary other than a null
//! return from [`sysfail_start`].

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::raw::{c_double, c_int, c_uint};
use std::sync::Arc;
use std::time::Duration;

use crate::invocation::{InvocationPredicate, RegisterFrame};
use crate::plan::{Outcome, Plan, Probability};
use crate::session::Session;
use crate::thread_monitor::ThreadDiscovery;

pub type SysfailTid = libc::pid_t;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SysfailProbability {
    pub p: c_double,
    pub after_bias: c_double,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SysfailErrorWeight {
    pub nerror: c_int,
    pub weight: c_double,
}

pub type SysfailInvocationPredicate =
    Option<unsafe extern "C" fn(*mut c_void, *const libc::greg_t) -> c_int>;

#[repr(C)]
pub struct SysfailOutcome {
    pub fail: SysfailProbability,
    pub delay: SysfailProbability,
    pub max_delay_usec: c_uint,
    pub ctx: *mut c_void,
    pub eligible: SysfailInvocationPredicate,
    pub num_errors: c_uint,
    pub error_wts: *const SysfailErrorWeight,
}

pub type SysfailThreadPredicate = Option<unsafe extern "C" fn(*mut c_void, SysfailTid) -> c_int>;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SysfailThreadDiscoveryStrategy {
    None = 0,
    Poll = 1,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SysfailThreadDiscoveryConfig {
    pub poll_itvl_usec: c_uint,
}

#[repr(C)]
pub struct SysfailSyscallOutcome {
    pub next: *mut SysfailSyscallOutcome,
    pub syscall: c_int,
    pub outcome: SysfailOutcome,
}

#[repr(C)]
pub struct SysfailPlan {
    pub strategy: SysfailThreadDiscoveryStrategy,
    pub config: SysfailThreadDiscoveryConfig,
    pub ctx: *mut c_void,
    pub selector: SysfailThreadPredicate,
    pub syscall_outcomes: *mut SysfailSyscallOutcome,
}

/// Opaque handle returned by [`sysfail_start`]. The function-pointer table
/// matches `sysfail_session_t` exactly; `data` is the boxed [`Session`].
#[repr(C)]
pub struct SysfailSession {
    data: *mut c_void,
    stop: unsafe extern "C" fn(*mut SysfailSession),
    add_this_thread: unsafe extern "C" fn(*mut SysfailSession),
    remove_this_thread: unsafe extern "C" fn(*mut SysfailSession),
    add_thread: unsafe extern "C" fn(*mut SysfailSession, SysfailTid),
    remove_thread: unsafe extern "C" fn(*mut SysfailSession, SysfailTid),
    discover_threads: unsafe extern "C" fn(*mut SysfailSession),
}

/// A raw pointer handed across the FFI boundary as opaque user data. Not
/// `Send`/`Sync` on its own; sound here only because the C caller is
/// contractually responsible for the pointee's lifetime and thread-safety,
/// exactly as `sysfail_userdata_t` documents.
struct CtxPtr(*mut c_void);
unsafe impl Send for CtxPtr {}
unsafe impl Sync for CtxPtr {}

fn wrap_invocation_predicate(
    f: unsafe extern "C" fn(*mut c_void, *const libc::greg_t) -> c_int,
    ctx: *mut c_void,
) -> InvocationPredicate {
    let ctx = CtxPtr(ctx);
    Arc::new(move |regs: &RegisterFrame| unsafe { f(ctx.0, regs.as_raw()) != 0 })
}

fn build_outcome(raw: &SysfailOutcome) -> Option<Outcome> {
    let fail = Probability::new(raw.fail.p, raw.fail.after_bias).ok()?;
    let delay = Probability::new(raw.delay.p, raw.delay.after_bias).ok()?;
    let max_delay = Duration::from_micros(raw.max_delay_usec as u64);

    let mut error_weights = HashMap::new();
    if !raw.error_wts.is_null() && raw.num_errors > 0 {
        let weights = unsafe { std::slice::from_raw_parts(raw.error_wts, raw.num_errors as usize) };
        for w in weights {
            error_weights.insert(w.nerror, w.weight);
        }
    }

    let eligible = raw.eligible.map(|f| wrap_invocation_predicate(f, raw.ctx));
    Outcome::new(fail, delay, max_delay, error_weights, eligible).ok()
}

unsafe fn with_session<F: FnOnce(&Session)>(handle: *mut SysfailSession, f: F) {
    if handle.is_null() {
        return;
    }
    let session = unsafe { &*((*handle).data as *const Session) };
    f(session);
}

unsafe extern "C" fn ffi_stop(handle: *mut SysfailSession) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { Box::from_raw(handle) };
    let _session = unsafe { Box::from_raw(handle.data as *mut Session) };
}

unsafe extern "C" fn ffi_add_this_thread(handle: *mut SysfailSession) {
    unsafe {
        with_session(handle, |s| {
            if let Err(err) = s.add() {
                tracing::warn!(%err, "sysfail_start: add_this_thread failed");
            }
        })
    }
}

unsafe extern "C" fn ffi_remove_this_thread(handle: *mut SysfailSession) {
    unsafe {
        with_session(handle, |s| {
            if let Err(err) = s.remove() {
                tracing::warn!(%err, "sysfail_start: remove_this_thread failed");
            }
        })
    }
}

unsafe extern "C" fn ffi_add_thread(handle: *mut SysfailSession, tid: SysfailTid) {
    unsafe {
        with_session(handle, |s| {
            if let Err(err) = s.add_thread(tid) {
                tracing::warn!(%err, tid, "sysfail_start: add_thread failed");
            }
        })
    }
}

unsafe extern "C" fn ffi_remove_thread(handle: *mut SysfailSession, tid: SysfailTid) {
    unsafe { with_session(handle, |s| s.remove_thread(tid)) }
}

unsafe extern "C" fn ffi_discover_threads(handle: *mut SysfailSession) {
    unsafe {
        with_session(handle, |s| {
            if let Err(err) = s.rescan_threads() {
                tracing::warn!(%err, "sysfail_start: discover_threads failed");
            }
        })
    }
}

/// Start failure injection in the process per `plan`, matching
/// `sysfail_start` exactly. Returns null on any failure (invalid plan,
/// another session already active, kernel refusal); the caller owns the
/// returned handle and must release it through its own `stop` function
/// pointer.
///
/// # Safety
/// `plan` must point to a valid `sysfail_plan_t` for the duration of this
/// call; its `syscall_outcomes` linked list and `error_wts` arrays must be
/// well-formed per `sysfail.h`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sysfail_start(plan: *const SysfailPlan) -> *mut SysfailSession {
    if plan.is_null() {
        return std::ptr::null_mut();
    }
    let plan = unsafe { &*plan };

    let mut outcomes = HashMap::new();
    let mut node = plan.syscall_outcomes;
    while !node.is_null() {
        let entry = unsafe { &*node };
        if let Some(outcome) = build_outcome(&entry.outcome) {
            outcomes.insert(entry.syscall as i64, outcome);
        }
        node = entry.next;
    }

    let selector: Arc<dyn Fn(libc::pid_t) -> bool + Send + Sync> = match plan.selector {
        Some(f) => {
            let ctx = CtxPtr(plan.ctx);
            Arc::new(move |tid| unsafe { f(ctx.0, tid) != 0 })
        }
        None => Arc::new(|_| true),
    };

    let thread_discovery = match plan.strategy {
        SysfailThreadDiscoveryStrategy::None => ThreadDiscovery::None,
        SysfailThreadDiscoveryStrategy::Poll => {
            let micros = unsafe { plan.config.poll_itvl_usec };
            ThreadDiscovery::PeriodicPoll {
                interval: Duration::from_micros(micros as u64),
            }
        }
    };

    let session = match Session::new(Plan::new(outcomes, selector, thread_discovery)) {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(%err, "sysfail_start failed");
            return std::ptr::null_mut();
        }
    };

    let data = Box::into_raw(Box::new(session)) as *mut c_void;
    Box::into_raw(Box::new(SysfailSession {
        data,
        stop: ffi_stop,
        add_this_thread: ffi_add_this_thread,
        remove_this_thread: ffi_remove_this_thread,
        add_thread: ffi_add_thread,
        remove_thread: ffi_remove_thread,
        discover_threads: ffi_discover_threads,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_plan_returns_null_handle() {
        let handle = unsafe { sysfail_start(std::ptr::null()) };
        assert!(handle.is_null());
    }

    #[test]
    fn build_outcome_converts_error_weight_table() {
        let weights = [
            SysfailErrorWeight {
                nerror: libc::EIO,
                weight: 1.0,
            },
            SysfailErrorWeight {
                nerror: libc::EINVAL,
                weight: 3.0,
            },
        ];
        let raw = SysfailOutcome {
            fail: SysfailProbability {
                p: 1.0,
                after_bias: 0.0,
            },
            delay: SysfailProbability {
                p: 0.0,
                after_bias: 0.0,
            },
            max_delay_usec: 0,
            ctx: std::ptr::null_mut(),
            eligible: None,
            num_errors: weights.len() as c_uint,
            error_wts: weights.as_ptr(),
        };

        let outcome = build_outcome(&raw).expect("well-formed outcome should convert");
        assert_eq!(outcome.error_weights.len(), 2);
        assert_eq!(outcome.error_weights[&libc::EIO], 1.0);
        assert_eq!(outcome.error_weights[&libc::EINVAL], 3.0);
    }

    #[test]
    fn build_outcome_rejects_invalid_probability() {
        let raw = SysfailOutcome {
            fail: SysfailProbability {
                p: 2.0, // out of [0, 1]
                after_bias: 0.0,
            },
            delay: SysfailProbability {
                p: 0.0,
                after_bias: 0.0,
            },
            max_delay_usec: 0,
            ctx: std::ptr::null_mut(),
            eligible: None,
            num_errors: 0,
            error_wts: std::ptr::null(),
        };

        assert!(build_outcome(&raw).is_none());
    }

    #[test]
    fn build_outcome_rejects_fail_probability_with_no_error_weights() {
        let raw = SysfailOutcome {
            fail: SysfailProbability {
                p: 1.0,
                after_bias: 0.0,
            },
            delay: SysfailProbability {
                p: 0.0,
                after_bias: 0.0,
            },
            max_delay_usec: 0,
            ctx: std::ptr::null_mut(),
            eligible: None,
            num_errors: 0,
            error_wts: std::ptr::null(),
        };

        assert!(build_outcome(&raw).is_none());
    }
}
