//! Kernel ABI constants for `PR_SET_SYSCALL_USER_DISPATCH`.
//!
//! None of these are choices this crate makes; they are the kernel's
//! calling convention for the feature (see `prctl(2)` and
//! `Documentation/admin-guide/syscall-user-dispatch.rst`). `libc` does not
//! yet expose them, so they live here as the one place that would need to
//! change if that changes.

/// `prctl(2)` opcode selecting the syscall user-dispatch feature.
pub const PR_SET_SYSCALL_USER_DISPATCH: libc::c_int = 59;

/// Disable syscall user-dispatch for the calling thread.
pub const PR_SYS_DISPATCH_OFF: libc::c_ulong = 0;

/// Enable syscall user-dispatch for the calling thread.
pub const PR_SYS_DISPATCH_ON: libc::c_ulong = 1;

/// Toggle-byte value meaning "let this one syscall through without a trap".
pub const SYSCALL_DISPATCH_FILTER_ALLOW: u8 = 0;

/// Toggle-byte value meaning "trap this syscall to `SIGSYS`".
pub const SYSCALL_DISPATCH_FILTER_BLOCK: u8 = 1;

/// Realtime signal used to enable injection on a thread other than the
/// caller (the per-thread remote enable protocol).
pub fn sig_enable() -> i32 {
    unsafe { libc::SIGRTMIN() + 4 }
}

/// Realtime signal used to disable injection on a thread other than the
/// caller.
pub fn sig_disable() -> i32 {
    unsafe { libc::SIGRTMIN() + 5 }
}

/// Realtime signal used to re-arm a thread's toggle after the `SIGSYS`
/// handler has disarmed it to let a `rt_sigprocmask(SIGSYS, ...)` call
/// through (the libc signal-mask workaround).
pub fn sig_rearm() -> i32 {
    unsafe { libc::SIGRTMIN() + 6 }
}
