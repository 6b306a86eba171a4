//! Signal plumbing.
//!
//! Two primitives: installing a `SA_SIGINFO` handler, and delivering a
//! queued realtime signal carrying a payload pointer to a specific thread.
//! The three control signals this crate uses (`SIG_ENABLE`, `SIG_DISABLE`,
//! `SIG_REARM`) are `SIGRTMIN + n`, which is a runtime-computed signal
//! number outside the fixed set `nix::sys::signal::Signal` models, so
//! installation goes through raw `libc::sigaction` rather than `nix`.

use std::ffi::c_void;
use std::mem;

use sysfail_shared::errors::{SysfailError, SysfailResult};

use crate::raw::{self, tgsigqueueinfo};

pub type SigactionHandler =
    unsafe extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void);

/// Install `handler` for `signal` with `SA_SIGINFO | SA_NODEFER` and an
/// empty signal mask, as every handler in this crate requires: each one may
/// need to run while the very signal it handles is still logically "in
/// flight" on the same thread (e.g. `SIG_REARM` racing a fresh `SIGSYS`).
pub fn install(signal: i32, handler: SigactionHandler) -> SysfailResult<()> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            let err = std::io::Error::last_os_error();
            return Err(SysfailError::SignalInstallFailed(format!(
                "signal {signal}: {err}"
            )));
        }
    }
    Ok(())
}

/// Send a queued realtime `signal` to `tid` in this process, carrying
/// `payload` in the `sival_ptr` slot, via the raw syscall gate.
///
/// If the kernel reports `ESRCH` (the target thread has already exited),
/// `on_missing_thread` is invoked with `payload` so the caller can release
/// any semaphore it would otherwise wait on forever, and this returns
/// `true`. Any other negative return aborts the process — the kernel ABI
/// contract has been violated and there is no safe way to continue.
///
/// `handle_sigsys` calls this directly on the trapped thread to deliver
/// `SIG_REARM`, so the error path below must stay async-signal-safe: no
/// `tracing`, only [`raw::signal_safe_eprint`].
pub fn deliver(
    tid: libc::pid_t,
    signal: i32,
    payload: *mut c_void,
    on_missing_thread: impl FnOnce(*mut c_void),
) -> bool {
    let ret = unsafe { tgsigqueueinfo(tid, signal, payload) };
    if ret == 0 {
        return false;
    }
    if ret == -(libc::ESRCH as i64) {
        on_missing_thread(payload);
        return true;
    }
    raw::signal_safe_eprint("sysfail: tgsigqueueinfo failed unexpectedly\n");
    std::process::abort();
}

/// Extract the `sival_ptr` payload out of a `siginfo_t` delivered by
/// [`deliver`]'s underlying `rt_tgsigqueueinfo`, matching the layout
/// [`crate::raw::tgsigqueueinfo`] writes.
pub fn payload_of(info: *mut libc::siginfo_t) -> *mut c_void {
    #[repr(C)]
    struct RawSiginfo {
        si_signo: i32,
        si_errno: i32,
        si_code: i32,
        _pad: i32,
        si_pid: i32,
        si_uid: u32,
        sival_ptr: *mut c_void,
    }
    unsafe { (*(info as *const RawSiginfo)).sival_ptr }
}
