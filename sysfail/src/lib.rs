//! In-process Linux syscall failure injection via `PR_SET_SYSCALL_USER_DISPATCH`.
//!
//! A process that links this crate and starts a [`Session`] can have chosen
//! syscalls on chosen threads probabilistically fail with a chosen mix of
//! errnos, or be delayed, without any ptrace, seccomp-bpf, or `LD_PRELOAD`
//! shim. The kernel redirects every syscall instruction outside this
//! crate's own compiled text to `SIGSYS`; the handler there either lets the
//! call through unchanged or rewrites its outcome before resuming the
//! trapped thread.
//!
//! ```text
//!                 +-------------------------------------------+
//!                 |  thread armed via Session::add/add_thread |
//!                 +-------------------------------------------+
//!                                    |
//!                        syscall instruction outside
//!                        self-text, toggle == BLOCK
//!                                    v
//!                 +-------------------------------------------+
//!                 |         kernel -> SIGSYS (handle_sigsys)   |
//!                 +-------------------------------------------+
//!                           /              |              \
//!                  pass-through     fail_maybe(regs)   rt_sigprocmask
//!                (exit, sigreturn)    /         \       SIGSYS workaround
//!                            continue      rewrite RAX  (disarm + SIG_REARM)
//!                            syscall        to -errno
//!                          (raw gate)
//! ```
//!
//! Linux x86-64 only: `PR_SET_SYSCALL_USER_DISPATCH` and the raw syscall
//! gate this crate relies on are both architecture- and kernel-specific.
//!
//! See [`Session`], [`Plan`]/[`PlanBuilder`], and [`Outcome`] for the public
//! surface; `ffi` exposes the same functionality as a C ABI built around a
//! `sysfail.h` struct layout.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

pub mod ffi;
pub mod invocation;
pub mod kabi;
mod memmap;
mod plan;
mod raw;
mod rtsignal;
mod session;
mod thread_monitor;
mod thread_state;

pub use invocation::{
    arity0, arity1, arity2, arity3, arity4, arity5, arity6, InvocationPredicate, RegisterFrame,
};
pub use memmap::{get_mmap, AddrRange, Mapping};
pub use plan::{ActiveOutcome, ActivePlan, Errno, Outcome, Plan, PlanBuilder, Probability, Syscall};
pub use session::Session;
pub use sysfail_shared::errors::{SysfailError, SysfailResult};
pub use thread_monitor::{DiscoveredThreadState, ThreadDiscovery};

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Install a `tracing-subscriber` `fmt` layer on stderr, filtered by
/// `RUST_LOG` (defaulting to `info`). Idempotent: later calls, and a caller
/// who has already set their own global subscriber, are both no-ops. Never
/// called from signal-handler context — see `session.rs`'s module doc for
/// why that path is restricted to [`raw::signal_safe_eprint`] instead.
pub fn init_logging() {
    LOGGING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // If a global subscriber is already installed (e.g. by the host
        // binary), this returns an error we deliberately ignore rather than
        // panic or override it.
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

/// Probe whether the running kernel supports
/// `PR_SET_SYSCALL_USER_DISPATCH`, without arming anything. Intended for
/// tests and callers that want to skip gracefully rather than fail on older
/// kernels (Linux < 5.11) or restrictive sandboxes.
pub fn syscall_user_dispatch_supported() -> bool {
    // Turning dispatch off is harmless even when it was never on; the
    // kernel only rejects the opcode itself (EINVAL) when the feature does
    // not exist.
    let ret = unsafe {
        libc::prctl(
            kabi::PR_SET_SYSCALL_USER_DISPATCH,
            kabi::PR_SYS_DISPATCH_OFF,
            0u64,
            0u64,
            0u64,
        )
    };
    ret == 0
}

#[cfg(not(target_os = "linux"))]
compile_error!("sysfail only supports Linux");

#[cfg(not(target_arch = "x86_64"))]
compile_error!("sysfail only supports x86-64");
