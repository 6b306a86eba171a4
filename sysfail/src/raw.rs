//! The raw syscall gate and the register-restoring trampoline.
//!
//! Both primitives in this module are the *only* way the rest of this crate
//! talks to the kernel from inside a signal handler. Going through libc's
//! wrappers here would be self-defeating: those wrappers are themselves
//! subject to interception once a thread is armed, and calling them from a
//! handler running on the signal stack can re-enter this crate's own
//! dispatcher.

use std::arch::asm;

/// Issue a raw x86-64 syscall, bypassing libc entirely.
///
/// The returned value is the kernel's raw return: negative values in
/// `-1..=-4095` are encoded errnos, not something routed through the
/// thread-local `errno` slot. Clobbers `rcx` and `r11` (which the `syscall`
/// instruction overwrites unconditionally) and leaves every other
/// caller-saved register untouched.
///
/// # Safety
///
/// The caller is responsible for the arguments being meaningful for `nr`.
#[inline(always)]
pub unsafe fn raw_syscall6(nr: i64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64) -> i64 {
    let ret: i64;
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4, // kernel uses r10 in place of rcx for syscall args
            in("r8") a5,
            in("r9") a6,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

/// Convenience wrapper for syscalls with fewer than six arguments.
#[inline(always)]
pub unsafe fn raw_syscall3(nr: i64, a1: u64, a2: u64, a3: u64) -> i64 {
    unsafe { raw_syscall6(nr, a1, a2, a3, 0, 0, 0) }
}

/// Re-issue the syscall currently parked in a trapped register frame, in
/// place, writing the kernel's return value back into `RAX`.
///
/// `regs` follows the x86-64 Linux syscall argument order: `RDI, RSI, RDX,
/// R10, R8, R9`, with the syscall number in `RAX`.
pub unsafe fn continue_syscall(regs: &mut super::invocation::RegisterFrame) {
    let rax = unsafe {
        raw_syscall6(
            regs.rax(),
            regs.rdi() as u64,
            regs.rsi() as u64,
            regs.rdx() as u64,
            regs.r10() as u64,
            regs.r8() as u64,
            regs.r9() as u64,
        )
    };
    regs.set_rax(rax);
}

/// Send `signal` to `tid` in this process, carrying `payload` in the
/// `sival_ptr` slot, via the raw `rt_tgsigqueueinfo` syscall (never libc's
/// `sigqueue`, for the same re-entrancy reason as everything else here).
///
/// Returns the kernel's raw result: `0` on success, `-ESRCH` if the target
/// thread had already exited, some other negative errno on unexpected
/// failure.
pub unsafe fn tgsigqueueinfo(tid: libc::pid_t, signal: i32, payload: *mut std::ffi::c_void) -> i64 {
    #[repr(C)]
    struct RawSiginfo {
        si_signo: i32,
        si_errno: i32,
        si_code: i32,
        // padding to the union, which starts at offset 12 on x86-64
        _pad: i32,
        si_pid: i32,
        si_uid: u32,
        sival_ptr: *mut std::ffi::c_void,
    }

    const SI_QUEUE: i32 = -1;

    let pid = unsafe { libc::getpid() };
    let info = RawSiginfo {
        si_signo: signal,
        si_errno: 0,
        si_code: SI_QUEUE,
        _pad: 0,
        si_pid: pid,
        si_uid: unsafe { libc::getuid() },
        sival_ptr: payload,
    };

    unsafe {
        raw_syscall6(
            libc::SYS_rt_tgsigqueueinfo,
            pid as u64,
            tid as u64,
            signal as u64,
            &info as *const RawSiginfo as u64,
            0,
            0,
        )
    }
}

/// Write `msg` to stderr via the raw syscall gate, bypassing libc's
/// buffered/allocating `stderr` entirely.
///
/// The only logging primitive usable from inside a signal handler; `tracing`
/// macros are not async-signal-safe and must never be called from the
/// handler path (see `session.rs`).
pub fn signal_safe_eprint(msg: &str) {
    unsafe {
        raw_syscall6(
            libc::SYS_write,
            libc::STDERR_FILENO as u64,
            msg.as_ptr() as u64,
            msg.len() as u64,
            0,
            0,
            0,
        );
    }
}

/// Restore every general-purpose register from `gregs` (laid out exactly
/// like `libc::mcontext_t::gregs`, i.e. indexable by the `libc::REG_*`
/// constants) and jump to the saved instruction pointer.
///
/// This replaces the kernel's ordinary `sigreturn` path. A signal handler
/// that has rewritten the saved frame (e.g. to overwrite `RAX` with a
/// negated errno) cannot return through the normal signal-return mechanism
/// without the kernel clobbering those edits; it must instead transfer
/// control here directly.
///
/// # Safety
///
/// `gregs` must point to a valid, fully-populated `NGREG`-element (23 on
/// x86-64) register save area. This function does not return to its
/// caller; it diverges into whatever `RIP` it was given.
#[unsafe(naked)]
pub unsafe extern "C" fn restore(gregs: *mut libc::greg_t) -> ! {
    std::arch::naked_asm!(
        // Switch onto the saved stack first so everything below this point
        // runs on the frame the trapped thread was actually using.
        "mov rsp, [rdi + 15*8]", // REG_RSP
        "mov rax, [rdi + 16*8]", // REG_RIP
        "push rax",
        "mov rax, [rdi + 17*8]", // REG_EFL
        "push rax",
        "popfq",
        "mov r8,  [rdi + 0*8]",  // REG_R8
        "mov r9,  [rdi + 1*8]",  // REG_R9
        "mov r10, [rdi + 2*8]",  // REG_R10
        "mov r11, [rdi + 3*8]",  // REG_R11
        "mov r12, [rdi + 4*8]",  // REG_R12
        "mov r13, [rdi + 5*8]",  // REG_R13
        "mov r14, [rdi + 6*8]",  // REG_R14
        "mov r15, [rdi + 7*8]",  // REG_R15
        "mov rsi, [rdi + 9*8]",  // REG_RSI
        "mov rbp, [rdi + 10*8]", // REG_RBP
        "mov rbx, [rdi + 11*8]", // REG_RBX
        "mov rdx, [rdi + 12*8]", // REG_RDX
        "mov rax, [rdi + 13*8]", // REG_RAX
        "mov rcx, [rdi + 14*8]", // REG_RCX
        "mov rdi, [rdi + 8*8]",  // REG_RDI -- last, clobbers the base pointer
        "ret",                   // pops the RIP we pushed above
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_syscall_getpid_matches_libc() {
        let nr = unsafe { raw_syscall6(libc::SYS_getpid, 0, 0, 0, 0, 0, 0) };
        assert_eq!(nr as libc::pid_t, unsafe { libc::getpid() });
    }

    #[test]
    fn raw_syscall_rejects_bad_fd_with_encoded_errno() {
        // read(2) on an invalid fd must come back as -EBADF, entirely
        // through the raw gate, with no libc involvement.
        let mut buf = [0u8; 1];
        let ret = unsafe {
            raw_syscall6(
                libc::SYS_read,
                9999,
                buf.as_mut_ptr() as u64,
                buf.len() as u64,
                0,
                0,
                0,
            )
        };
        assert_eq!(ret, -(libc::EBADF as i64));
    }
}
