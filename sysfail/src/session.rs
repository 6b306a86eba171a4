//! The session core.
//!
//! Ties every other component together: owns the compiled plan, the
//! self-text range, the per-thread state table and the thread monitor, and
//! is where the four signal handlers (`SIGSYS`, `SIG_ENABLE`, `SIG_DISABLE`,
//! `SIG_REARM`) actually live. Exactly one [`Session`] may be active in a
//! process at a time; the global slot backing that rule is also what the
//! handlers consult, since they have no other way to reach this state.
//!
//! Everything reachable from a signal handler in this module is restricted
//! to the raw syscall gate (`crate::raw`) and plain field access — no
//! libc wrapper calls, no allocation, no `tracing`. `tracing` is only used
//! off the handler path (`Session::new`, `add`, `remove`, `rescan_threads`,
//! `Drop`).

use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use sysfail_shared::errors::{SysfailError, SysfailResult};

use crate::invocation::RegisterFrame;
use crate::kabi::{self, SYSCALL_DISPATCH_FILTER_ALLOW, SYSCALL_DISPATCH_FILTER_BLOCK};
use crate::memmap::{get_mmap, AddrRange};
use crate::plan::{ActivePlan, Plan};
use crate::raw;
use crate::rtsignal;
use crate::thread_monitor::{DiscoveredThreadState, ThreadDiscovery, ThreadMonitor};
use crate::thread_state::{ThreadState, ThreadTable};

/// The process-wide session, if one is active. Every signal handler in this
/// module reads this; `Session::new`/`Drop` are the only writers.
static GLOBAL_SESSION: RwLock<Option<Arc<ActiveSessionInner>>> = RwLock::new(None);

struct ActiveSessionInner {
    active_plan: ActivePlan,
    self_text: AddrRange,
    thread_table: ThreadTable,
    /// Guards `add`/`remove`/`rescan_threads` against the exclusive access
    /// `Drop` needs to tear the session down cleanly. Distinct from
    /// `GLOBAL_SESSION`'s own lock, which only ever guards the slot itself.
    access: RwLock<()>,
    monitor: std::sync::Mutex<Option<ThreadMonitor>>,
}

impl ActiveSessionInner {
    /// Build the thread monitor and run its first scan. Split out of
    /// construction because the monitor's callback needs a weak handle back
    /// into this session, which only exists once this session is already
    /// behind an `Arc`.
    fn initialize(self: &Arc<Self>, strategy: ThreadDiscovery) -> SysfailResult<()> {
        let weak = Arc::downgrade(self);
        let handler: crate::thread_monitor::ThreadEventHandler = Arc::new(move |tid, event| {
            if let Some(inner) = weak.upgrade() {
                inner.thd_track(tid, event);
            }
        });
        let monitor = ThreadMonitor::new(strategy, handler)?;
        *self.monitor.lock().unwrap() = Some(monitor);
        Ok(())
    }

    fn thd_track(&self, tid: libc::pid_t, event: DiscoveredThreadState) {
        match event {
            DiscoveredThreadState::Existing | DiscoveredThreadState::Spawned => {
                if let Err(err) = self.thd_enable_remote(tid) {
                    tracing::warn!(tid, %err, "failed to enable syscall dispatch on discovered thread");
                }
            }
            DiscoveredThreadState::Terminated => {
                self.thd_disable_remote(tid);
            }
            // The monitor's own thread is reported for visibility only; a
            // plan that wants it injected can still call `add_thread` on it
            // explicitly.
            DiscoveredThreadState::SelfThread => {}
        }
    }

    // -- calling-thread (no signal round trip needed) --------------------

    fn thd_enable_self(&self) -> SysfailResult<()> {
        let tid = unsafe { libc::gettid() };
        if !(self.active_plan.selector)(tid) {
            return Ok(());
        }
        let Some(st) = self.thread_table.insert_if_absent(tid) else {
            return Ok(());
        };
        st.toggle.set(SYSCALL_DISPATCH_FILTER_ALLOW);
        if let Err(err) = prctl_enable(&self.self_text, st.toggle.as_ptr()) {
            self.thread_table.remove(tid);
            return Err(err);
        }
        st.toggle.set(SYSCALL_DISPATCH_FILTER_BLOCK);
        Ok(())
    }

    fn thd_disable_self(&self) -> SysfailResult<()> {
        let tid = unsafe { libc::gettid() };
        let Some(st) = self.thread_table.get(tid) else {
            return Ok(());
        };
        st.toggle.set(SYSCALL_DISPATCH_FILTER_ALLOW);
        prctl_disable()?;
        self.thread_table.remove(tid);
        Ok(())
    }

    // -- remote-thread protocol, via signal + rendezvous semaphore --------

    fn thd_enable_remote(&self, tid: libc::pid_t) -> SysfailResult<()> {
        if !(self.active_plan.selector)(tid) {
            return Ok(());
        }
        let Some(st) = self.thread_table.insert_if_absent(tid) else {
            return Ok(());
        };
        st.sig_coord.acquire();
        let payload = Arc::as_ptr(&st) as *mut c_void;
        let esrch = rtsignal::deliver(tid, kabi::sig_enable(), payload, |payload| {
            let st = unsafe { &*(payload as *const ThreadState) };
            st.sig_coord.release();
        });
        st.sig_coord.acquire();
        st.sig_coord.release();
        if esrch {
            self.thread_table.remove(tid);
        }
        Ok(())
    }

    fn thd_disable_remote(&self, tid: libc::pid_t) {
        let Some(st) = self.thread_table.get(tid) else {
            return;
        };
        st.sig_coord.acquire();
        let payload = Arc::as_ptr(&st) as *mut c_void;
        rtsignal::deliver(tid, kabi::sig_disable(), payload, |payload| {
            let st = unsafe { &*(payload as *const ThreadState) };
            st.sig_coord.release();
        });
        st.sig_coord.acquire();
        st.sig_coord.release();
        self.thread_table.remove(tid);
    }

    // -- dispatch, called from the SIGSYS handler on the trapped thread ---

    fn fail_maybe(&self, regs: &mut RegisterFrame) {
        let syscall = regs.syscall();
        let Some(outcome) = self.active_plan.get(syscall) else {
            unsafe { raw::continue_syscall(regs) };
            return;
        };
        if !outcome.eligible(regs) {
            unsafe { raw::continue_syscall(regs) };
            return;
        }

        let mut rng = rand::rng();
        let mut delay_after: Option<Duration> = None;

        if outcome.delay.p > 0.0 && rng.random::<f64>() < outcome.delay.p {
            let max_micros = (outcome.max_delay.as_micros() as u64).max(1);
            let delay = Duration::from_micros(rng.random_range(0..=max_micros));
            if outcome.delay.after_bias > 0.0 && rng.random::<f64>() < outcome.delay.after_bias {
                delay_after = Some(delay);
            } else {
                std::thread::sleep(delay);
            }
        }

        let mut fail_after: Option<i32> = None;
        let mut fail_before: Option<i32> = None;
        if outcome.fail.p > 0.0 && rng.random::<f64>() < outcome.fail.p {
            let draw = rng.random::<f64>() * outcome.total_weight();
            if let Some(errno) = outcome.errno_for(draw) {
                if outcome.fail.after_bias > 0.0 && rng.random::<f64>() < outcome.fail.after_bias {
                    fail_after = Some(errno);
                } else {
                    fail_before = Some(errno);
                }
            }
        }

        if let Some(errno) = fail_before {
            regs.set_rax(-(errno as i64));
            return;
        }

        unsafe { raw::continue_syscall(regs) };

        if let Some(delay) = delay_after {
            std::thread::sleep(delay);
        }
        if let Some(errno) = fail_after {
            regs.set_rax(-(errno as i64));
        }
    }

    fn disarm_calling_thread(&self) -> libc::pid_t {
        let tid = unsafe { libc::gettid() };
        if let Some(st) = self.thread_table.get(tid) {
            st.toggle.set(SYSCALL_DISPATCH_FILTER_ALLOW);
        }
        tid
    }

    fn rearm_calling_thread(&self) {
        let tid = unsafe { libc::gettid() };
        if let Some(st) = self.thread_table.get(tid) {
            st.toggle.set(SYSCALL_DISPATCH_FILTER_BLOCK);
        }
    }
}

/// Issue the real `prctl(PR_SET_SYSCALL_USER_DISPATCH, ...)` syscall
/// through the raw syscall gate, never libc's wrapper: this is called
/// from both ordinary code and from inside the `SIG_ENABLE`/`SIG_DISABLE`
/// handlers, and a thread whose toggle is already armed would trip its own
/// filter re-entering libc's `prctl` symbol.
fn prctl_enable(self_text: &AddrRange, toggle_ptr: *mut u8) -> SysfailResult<()> {
    let ret = unsafe {
        raw::raw_syscall6(
            libc::SYS_prctl,
            kabi::PR_SET_SYSCALL_USER_DISPATCH as u64,
            kabi::PR_SYS_DISPATCH_ON as u64,
            self_text.start as u64,
            self_text.length as u64,
            toggle_ptr as u64,
            0,
        )
    };
    if ret < 0 {
        return Err(SysfailError::KernelRefusedDispatch(-ret as i32));
    }
    Ok(())
}

fn prctl_disable() -> SysfailResult<()> {
    let ret = unsafe {
        raw::raw_syscall6(
            libc::SYS_prctl,
            kabi::PR_SET_SYSCALL_USER_DISPATCH as u64,
            kabi::PR_SYS_DISPATCH_OFF as u64,
            0,
            0,
            0,
            0,
        )
    };
    if ret < 0 {
        return Err(SysfailError::KernelRefusedDispatch(-ret as i32));
    }
    Ok(())
}

/// RAII guard releasing a thread's rendezvous semaphore on drop, so a panic
/// or early return partway through a handler still wakes the initiator
/// instead of hanging it forever.
struct NotifyHandlerDone<'a>(&'a ThreadState);

impl Drop for NotifyHandlerDone<'_> {
    fn drop(&mut self) {
        self.0.sig_coord.release();
    }
}

fn regs_from_ucontext(ucontext: *mut c_void) -> (RegisterFrame, *mut libc::greg_t) {
    let ctx = ucontext as *mut libc::ucontext_t;
    let gregs_ptr = unsafe { (*ctx).uc_mcontext.gregs.as_mut_ptr() };
    (unsafe { RegisterFrame::new(gregs_ptr) }, gregs_ptr)
}

/// `SIGSYS` handler: the kernel lands every intercepted syscall here.
extern "C" fn handle_sigsys(_sig: i32, _info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let (mut regs, gregs_ptr) = regs_from_ucontext(ucontext);
    let syscall = regs.syscall();

    let session = GLOBAL_SESSION.read().clone();
    match &session {
        None => {
            raw::signal_safe_eprint("sysfail: SIGSYS trapped with no active session\n");
            unsafe { raw::continue_syscall(&mut regs) };
        }
        Some(session) => {
            if syscall == libc::SYS_rt_sigprocmask && blocks_sigsys(&regs) {
                let tid = session.disarm_calling_thread();
                unsafe { raw::continue_syscall(&mut regs) };
                rtsignal::deliver(tid, kabi::sig_rearm(), std::ptr::null_mut(), |_| {});
            } else if syscall == libc::SYS_rt_sigreturn || syscall == libc::SYS_exit {
                unsafe { raw::continue_syscall(&mut regs) };
            } else {
                session.fail_maybe(&mut regs);
            }
        }
    }

    unsafe { raw::restore(gregs_ptr) }
}

/// `true` if this `rt_sigprocmask(how, set, ...)` would block or replace the
/// mask to include `SIGSYS` — the one libc operation that would otherwise
/// permanently wedge this thread's own dispatcher.
fn blocks_sigsys(regs: &RegisterFrame) -> bool {
    let how = regs.rdi() as i32;
    if how != libc::SIG_BLOCK && how != libc::SIG_SETMASK {
        return false;
    }
    let set = regs.rsi() as *const libc::sigset_t;
    if set.is_null() {
        return false;
    }
    unsafe { libc::sigismember(set, libc::SIGSYS) == 1 }
}

/// `SIG_REARM` handler: re-applies the toggle `handle_sigsys` cleared to let
/// a `rt_sigprocmask(SIGSYS, ...)` call through.
extern "C" fn reenable_sysfail(_sig: i32, _info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let (_, gregs_ptr) = regs_from_ucontext(ucontext);
    if let Some(session) = GLOBAL_SESSION.read().clone() {
        session.rearm_calling_thread();
    }
    unsafe { raw::restore(gregs_ptr) }
}

/// `SIG_ENABLE` handler: arms syscall user-dispatch on the thread it runs
/// on, on behalf of a different thread's `add_thread` call.
extern "C" fn enable_sysfail(_sig: i32, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let (_, gregs_ptr) = regs_from_ucontext(ucontext);
    let st = unsafe { &*(rtsignal::payload_of(info) as *const ThreadState) };
    {
        let _done = NotifyHandlerDone(st);
        match GLOBAL_SESSION.read().clone() {
            None => raw::signal_safe_eprint("sysfail: SIG_ENABLE with no active session\n"),
            Some(session) => {
                st.toggle.set(SYSCALL_DISPATCH_FILTER_ALLOW);
                match prctl_enable(&session.self_text, st.toggle.as_ptr()) {
                    Ok(()) => st.toggle.set(SYSCALL_DISPATCH_FILTER_BLOCK),
                    Err(_) => {
                        raw::signal_safe_eprint("sysfail: kernel refused dispatch enable\n");
                        std::process::abort();
                    }
                }
            }
        }
    }
    unsafe { raw::restore(gregs_ptr) }
}

/// `SIG_DISABLE` handler: disarms syscall user-dispatch on the thread it
/// runs on, on behalf of a different thread's `remove_thread` call.
extern "C" fn disable_sysfail(_sig: i32, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let (_, gregs_ptr) = regs_from_ucontext(ucontext);
    let st = unsafe { &*(rtsignal::payload_of(info) as *const ThreadState) };
    {
        let _done = NotifyHandlerDone(st);
        st.toggle.set(SYSCALL_DISPATCH_FILTER_ALLOW);
        if prctl_disable().is_err() {
            raw::signal_safe_eprint("sysfail: kernel refused dispatch disable\n");
            std::process::abort();
        }
    }
    unsafe { raw::restore(gregs_ptr) }
}

/// A live fault-injection session. Exactly one may exist per process;
/// [`Session::new`] fails with [`SysfailError::AlreadyActive`] if another is
/// already live. Dropping a `Session` disables every thread it armed and
/// stops its thread monitor; the destructor never fails outright — per-
/// thread teardown that finds a thread already gone is logged and skipped.
pub struct Session {
    inner: Arc<ActiveSessionInner>,
}

impl Session {
    /// Compile `plan`, locate this shared object's own executable mapping,
    /// install the four control-signal handlers, and start the configured
    /// thread-discovery strategy.
    pub fn new(plan: Plan) -> SysfailResult<Self> {
        let pid = unsafe { libc::getpid() };
        let mapping = get_mmap(pid)?;
        let self_text = mapping.self_text()?;
        let active_plan = ActivePlan::compile(&plan);

        rtsignal::install(libc::SIGSYS, handle_sigsys)?;
        rtsignal::install(kabi::sig_enable(), enable_sysfail)?;
        rtsignal::install(kabi::sig_disable(), disable_sysfail)?;
        rtsignal::install(kabi::sig_rearm(), reenable_sysfail)?;

        let inner = Arc::new(ActiveSessionInner {
            active_plan,
            self_text,
            thread_table: ThreadTable::new(),
            access: RwLock::new(()),
            monitor: std::sync::Mutex::new(None),
        });

        {
            let mut slot = GLOBAL_SESSION.write();
            if slot.is_some() {
                return Err(SysfailError::AlreadyActive);
            }
            *slot = Some(inner.clone());
        }

        if let Err(err) = inner.initialize(plan.thread_discovery) {
            *GLOBAL_SESSION.write() = None;
            return Err(err);
        }

        tracing::info!("sysfail session started");
        Ok(Self { inner })
    }

    /// Arm syscall user-dispatch on the calling thread.
    pub fn add(&self) -> SysfailResult<()> {
        let _guard = self.inner.access.read();
        self.inner.thd_enable_self()
    }

    /// Disarm syscall user-dispatch on the calling thread.
    pub fn remove(&self) -> SysfailResult<()> {
        let _guard = self.inner.access.read();
        self.inner.thd_disable_self()
    }

    /// Arm syscall user-dispatch on `tid`, a thread other than the caller.
    pub fn add_thread(&self, tid: libc::pid_t) -> SysfailResult<()> {
        let _guard = self.inner.access.read();
        self.inner.thd_enable_remote(tid)
    }

    /// Disarm syscall user-dispatch on `tid`, a thread other than the
    /// caller.
    pub fn remove_thread(&self, tid: libc::pid_t) {
        let _guard = self.inner.access.read();
        self.inner.thd_disable_remote(tid)
    }

    /// Trigger one synchronous thread-discovery pass.
    pub fn rescan_threads(&self) -> SysfailResult<()> {
        let _guard = self.inner.access.read();
        let monitor = self.inner.monitor.lock().unwrap();
        match monitor.as_ref() {
            Some(monitor) => monitor.rescan(),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _guard = self.inner.access.write();

        if let Some(monitor) = self.inner.monitor.lock().unwrap().take() {
            drop(monitor); // joins the poller thread, if any
        }

        for tid in self.inner.thread_table.snapshot_tids() {
            self.inner.thd_disable_remote(tid);
        }

        if !self.inner.thread_table.is_empty() {
            tracing::warn!("sysfail session dropped with threads still tracked");
        }

        *GLOBAL_SESSION.write() = None;
        tracing::info!("sysfail session stopped");
    }
}
