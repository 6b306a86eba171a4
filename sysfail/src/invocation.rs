//! The trapped register frame and the invocation-predicate adapters that let
//! a plan restrict an outcome to a subset of calls by inspecting arguments.
//!
//! Everything here operates on the `gregs` array out of a `ucontext_t`, the
//! same layout [`crate::raw::restore`] consumes to jump back into the
//! trapped thread. Argument order follows the x86-64 Linux syscall ABI:
//! syscall number in `RAX`, arguments in `RDI, RSI, RDX, R10, R8, R9`.

use std::sync::Arc;

/// A view over the general-purpose registers saved for a trapped syscall.
///
/// Borrowed for the lifetime of one dispatch; never stored past the handler
/// call that produced it.
pub struct RegisterFrame {
    gregs: *mut libc::greg_t,
}

impl RegisterFrame {
    /// # Safety
    /// `gregs` must point at a valid, fully-populated `NGREG`-element
    /// register save area (as found in `ucontext_t::uc_mcontext.gregs`) for
    /// the lifetime of the returned `RegisterFrame`.
    pub unsafe fn new(gregs: *mut libc::greg_t) -> Self {
        Self { gregs }
    }

    #[inline]
    fn get(&self, idx: usize) -> i64 {
        unsafe { *self.gregs.add(idx) }
    }

    #[inline]
    fn set(&mut self, idx: usize, v: i64) {
        unsafe { *self.gregs.add(idx) = v };
    }

    pub fn rax(&self) -> i64 {
        self.get(libc::REG_RAX as usize)
    }

    pub fn set_rax(&mut self, v: i64) {
        self.set(libc::REG_RAX as usize, v);
    }

    pub fn rdi(&self) -> i64 {
        self.get(libc::REG_RDI as usize)
    }

    pub fn rsi(&self) -> i64 {
        self.get(libc::REG_RSI as usize)
    }

    pub fn rdx(&self) -> i64 {
        self.get(libc::REG_RDX as usize)
    }

    pub fn r10(&self) -> i64 {
        self.get(libc::REG_R10 as usize)
    }

    pub fn r8(&self) -> i64 {
        self.get(libc::REG_R8 as usize)
    }

    pub fn r9(&self) -> i64 {
        self.get(libc::REG_R9 as usize)
    }

    /// The syscall number currently parked in `RAX`.
    pub fn syscall(&self) -> i64 {
        self.rax()
    }

    /// The raw `gregs` pointer backing this frame, for handing to a C
    /// `sysfail_invocation_predicate_t` callback across the FFI boundary.
    pub fn as_raw(&self) -> *const libc::greg_t {
        self.gregs as *const _
    }
}

/// A per-invocation eligibility check: given the trapped register frame,
/// should this call be considered for failure injection at all?
///
/// Wrapped in an `Arc` rather than a bare `Box` because `ActiveOutcome` is
/// cloned into the dispatch table read by every armed thread.
pub type InvocationPredicate = Arc<dyn Fn(&RegisterFrame) -> bool + Send + Sync>;

/// Wrap a predicate that only looks at the syscall number.
pub fn arity0<F>(f: F) -> InvocationPredicate
where
    F: Fn(i64) -> bool + Send + Sync + 'static,
{
    Arc::new(move |r| f(r.syscall()))
}

/// Wrap a predicate over the syscall number and its first argument.
pub fn arity1<F>(f: F) -> InvocationPredicate
where
    F: Fn(i64, i64) -> bool + Send + Sync + 'static,
{
    Arc::new(move |r| f(r.syscall(), r.rdi()))
}

/// Wrap a predicate over the syscall number and its first two arguments.
pub fn arity2<F>(f: F) -> InvocationPredicate
where
    F: Fn(i64, i64, i64) -> bool + Send + Sync + 'static,
{
    Arc::new(move |r| f(r.syscall(), r.rdi(), r.rsi()))
}

/// Wrap a predicate over the syscall number and its first three arguments.
pub fn arity3<F>(f: F) -> InvocationPredicate
where
    F: Fn(i64, i64, i64, i64) -> bool + Send + Sync + 'static,
{
    Arc::new(move |r| f(r.syscall(), r.rdi(), r.rsi(), r.rdx()))
}

/// Wrap a predicate over the syscall number and its first four arguments.
pub fn arity4<F>(f: F) -> InvocationPredicate
where
    F: Fn(i64, i64, i64, i64, i64) -> bool + Send + Sync + 'static,
{
    Arc::new(move |r| f(r.syscall(), r.rdi(), r.rsi(), r.rdx(), r.r10()))
}

/// Wrap a predicate over the syscall number and its first five arguments.
pub fn arity5<F>(f: F) -> InvocationPredicate
where
    F: Fn(i64, i64, i64, i64, i64, i64) -> bool + Send + Sync + 'static,
{
    Arc::new(move |r| f(r.syscall(), r.rdi(), r.rsi(), r.rdx(), r.r10(), r.r8()))
}

/// Wrap a predicate over the syscall number and all six arguments.
pub fn arity6<F>(f: F) -> InvocationPredicate
where
    F: Fn(i64, i64, i64, i64, i64, i64, i64) -> bool + Send + Sync + 'static,
{
    Arc::new(move |r| {
        f(
            r.syscall(),
            r.rdi(),
            r.rsi(),
            r.rdx(),
            r.r10(),
            r.r8(),
            r.r9(),
        )
    })
}
