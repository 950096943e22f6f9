//! Recovery from actor stack overflow.
//!
//! An actor that runs through its bottom canary touches the `PROT_NONE`
//! guard page below it and the kernel raises `SIGSEGV` (or `SIGBUS`). The
//! handler installed here runs on a per-thread alternate signal stack. When
//! the fault address lies in the guard page of the actor being dispatched on
//! this thread, it records the fault, restores the interrupted signal mask
//! and switches straight back to the scheduler context. The scheduler then
//! marks the actor dead with [`ExitReason::StackOverflow`]. The actor's
//! frames are abandoned without unwinding.
//!
//! Any other fault is handed to the action that was installed before ours.
//!
//! # Async-signal-safety
//!
//! The handler only calls `pthread_getspecific`, `pthread_sigmask`,
//! `sigaction`, `raise` and `abort`, all async-signal-safe, plus atomic
//! loads and stores and the register-level [`coro::switch`]. Per-thread state is
//! reached through a pthread key rather than `thread_local!`.
//!
//! [`ExitReason::StackOverflow`]: crate::message::ExitReason::StackOverflow

use std::ffi::c_void;
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::coro::{self, SwitchContext};

/// Alternate signal stack per scheduler thread.
const ALT_STACK_SIZE: usize = 64 * 1024;

const FAULT_SIGNALS: [libc::c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

// ── Process-wide handlers ───────────────────────────────────────────────────

struct Handlers {
    key: libc::pthread_key_t,
    /// Actions replaced by ours, in `FAULT_SIGNALS` order.
    previous: [libc::sigaction; 2],
}

static HANDLERS: OnceLock<Option<Handlers>> = OnceLock::new();

fn install() -> Option<Handlers> {
    let mut key: libc::pthread_key_t = 0;
    // SAFETY: `key` is a valid out-pointer and `drop_recovery` matches the
    // destructor signature.
    let ret = unsafe { libc::pthread_key_create(&raw mut key, Some(drop_recovery)) };
    if ret != 0 {
        warn!(error = ret, "pthread_key_create failed, stack overflow recovery disabled");
        return None;
    }

    // SAFETY: all-zero is a valid `sigaction` for use as an out-parameter.
    let mut previous: [libc::sigaction; 2] = unsafe { std::mem::zeroed() };
    for (sig, old) in FAULT_SIGNALS.into_iter().zip(previous.iter_mut()) {
        // SAFETY: `sa` is fully initialised before use and `sig` is a valid
        // signal number; `old` is a valid out-pointer.
        let ret = unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&raw mut sa.sa_mask);
            sa.sa_sigaction = on_fault
                as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)
                as usize;
            libc::sigaction(sig, &raw const sa, old)
        };
        if ret != 0 {
            warn!(signal = sig, "sigaction failed, stack overflow recovery disabled");
            return None;
        }
    }
    debug!("stack overflow handlers installed");
    Some(Handlers { key, previous })
}

fn handlers() -> Option<&'static Handlers> {
    HANDLERS.get_or_init(install).as_ref()
}

// ── Per-thread recovery state ───────────────────────────────────────────────

/// What the handler needs to abandon the running actor.
///
/// Written by the scheduler between dispatches and read by the handler on
/// the same thread; atomics keep the compiler from reordering the two.
struct Recovery {
    armed: AtomicBool,
    guard_lo: AtomicUsize,
    guard_hi: AtomicUsize,
    actor: AtomicPtr<SwitchContext>,
    sched: AtomicPtr<SwitchContext>,
    overflowed: AtomicBool,
    fault_addr: AtomicUsize,
    alt_stack: *mut c_void,
}

/// pthread key destructor: release the alternate stack and the state.
unsafe extern "C" fn drop_recovery(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` came from `Box::into_raw` in `thread_recovery`.
    let recovery = unsafe { Box::from_raw(ptr.cast::<Recovery>()) };
    // SAFETY: all-zero is a valid `stack_t`.
    let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
    // SAFETY: query only; `current` is a valid out-pointer.
    unsafe { libc::sigaltstack(ptr::null(), &raw mut current) };
    if current.ss_sp == recovery.alt_stack {
        let disable = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: ALT_STACK_SIZE,
        };
        // SAFETY: the thread is exiting and no longer on the alternate stack.
        unsafe { libc::sigaltstack(&raw const disable, ptr::null_mut()) };
    }
    // SAFETY: `alt_stack` is the mapping made in `thread_recovery`, no
    // longer installed on any thread.
    unsafe { libc::munmap(recovery.alt_stack, ALT_STACK_SIZE) };
}

/// This thread's recovery state, set up on first use.
fn thread_recovery() -> Option<&'static Recovery> {
    let handlers = handlers()?;
    // SAFETY: the key was created in `install`.
    let existing = unsafe { libc::pthread_getspecific(handlers.key) }.cast::<Recovery>();
    if !existing.is_null() {
        // SAFETY: set below on this thread; freed only when it exits.
        return Some(unsafe { &*existing });
    }

    // SAFETY: anonymous private mapping; `fd = -1`, `offset = 0`.
    let alt_stack = unsafe {
        libc::mmap(
            ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if alt_stack == libc::MAP_FAILED {
        warn!("failed to map a signal stack, stack overflow recovery disabled");
        return None;
    }
    let ss = libc::stack_t {
        ss_sp: alt_stack,
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    // SAFETY: `ss` describes the mapping just created.
    if unsafe { libc::sigaltstack(&raw const ss, ptr::null_mut()) } != 0 {
        warn!("sigaltstack failed, stack overflow recovery disabled");
        // SAFETY: `alt_stack` was returned by mmap above.
        unsafe { libc::munmap(alt_stack, ALT_STACK_SIZE) };
        return None;
    }

    let recovery = Box::into_raw(Box::new(Recovery {
        armed: AtomicBool::new(false),
        guard_lo: AtomicUsize::new(0),
        guard_hi: AtomicUsize::new(0),
        actor: AtomicPtr::new(ptr::null_mut()),
        sched: AtomicPtr::new(ptr::null_mut()),
        overflowed: AtomicBool::new(false),
        fault_addr: AtomicUsize::new(0),
        alt_stack,
    }));
    // SAFETY: the key is valid and `recovery` is a live heap pointer.
    if unsafe { libc::pthread_setspecific(handlers.key, recovery.cast()) } != 0 {
        // SAFETY: never published; reclaim it along with the stack.
        unsafe { drop_recovery(recovery.cast()) };
        return None;
    }
    // SAFETY: freed only by the key destructor when this thread exits.
    Some(unsafe { &*recovery })
}

// ── Dispatch hooks ──────────────────────────────────────────────────────────

/// Watch `guard` while the actor whose context is `actor` runs. A fault in
/// the guard switches to `sched`.
pub(crate) fn arm(guard: Range<usize>, actor: *mut SwitchContext, sched: *mut SwitchContext) {
    if guard.is_empty() {
        return;
    }
    let Some(recovery) = thread_recovery() else {
        return;
    };
    recovery.guard_lo.store(guard.start, Ordering::Relaxed);
    recovery.guard_hi.store(guard.end, Ordering::Relaxed);
    recovery.actor.store(actor, Ordering::Relaxed);
    recovery.sched.store(sched, Ordering::Relaxed);
    recovery.overflowed.store(false, Ordering::Relaxed);
    recovery.armed.store(true, Ordering::Release);
}

/// Stop watching. Returns the fault address if the actor overflowed.
pub(crate) fn disarm() -> Option<usize> {
    let handlers = HANDLERS.get()?.as_ref()?;
    // SAFETY: the key was created in `install`.
    let recovery = unsafe { libc::pthread_getspecific(handlers.key) }.cast::<Recovery>();
    // SAFETY: set by `thread_recovery` on this thread.
    let recovery = unsafe { recovery.as_ref() }?;
    recovery.armed.store(false, Ordering::Release);
    recovery
        .overflowed
        .swap(false, Ordering::Acquire)
        .then(|| recovery.fault_addr.load(Ordering::Relaxed))
}

// ── Handler ─────────────────────────────────────────────────────────────────

extern "C" fn on_fault(sig: libc::c_int, info: *mut libc::siginfo_t, uctx: *mut c_void) {
    let Some(Some(handlers)) = HANDLERS.get() else {
        // SAFETY: all-zero with `SIG_DFL` is a valid default action.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(sig, &raw const sa, ptr::null_mut());
        }
        return;
    };
    let addr = if info.is_null() {
        0
    } else {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        unsafe { (*info).si_addr() as usize }
    };

    // SAFETY: the key is valid; pthread_getspecific is async-signal-safe.
    let recovery = unsafe { libc::pthread_getspecific(handlers.key) }.cast::<Recovery>();
    // SAFETY: set by `thread_recovery` on this thread.
    if let Some(recovery) = unsafe { recovery.as_ref() } {
        let in_guard = recovery.armed.load(Ordering::Acquire)
            && addr >= recovery.guard_lo.load(Ordering::Relaxed)
            && addr < recovery.guard_hi.load(Ordering::Relaxed);
        if in_guard {
            recovery.armed.store(false, Ordering::Relaxed);
            recovery.fault_addr.store(addr, Ordering::Relaxed);
            recovery.overflowed.store(true, Ordering::Release);
            let actor = recovery.actor.load(Ordering::Relaxed);
            let sched = recovery.sched.load(Ordering::Relaxed);
            if !uctx.is_null() {
                // The handler never returns, so the mask the kernel would
                // restore on sigreturn is restored here.
                // SAFETY: `uctx` is the ucontext the kernel passed in.
                unsafe {
                    libc::pthread_sigmask(
                        libc::SIG_SETMASK,
                        &raw const (*uctx.cast::<libc::ucontext_t>()).uc_sigmask,
                        ptr::null_mut(),
                    );
                }
            }
            // SAFETY: `sched` holds the scheduler context saved by the
            // dispatch that armed us; it waits on the scheduler stack.
            unsafe { coro::switch(actor, sched) };
            // An overflowed actor is never resumed.
            // SAFETY: abort is async-signal-safe.
            unsafe { libc::abort() };
        }
    }

    // Not ours: reinstate the previous action and let the fault recur.
    let Some(index) = FAULT_SIGNALS.iter().position(|&s| s == sig) else {
        return;
    };
    // SAFETY: restoring an action saved by `install`.
    unsafe { libc::sigaction(sig, &raw const handlers.previous[index], ptr::null_mut()) };
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let sent = !info.is_null() && unsafe { (*info).si_code } <= 0;
    if sent {
        // A sent signal does not recur by returning; deliver it again.
        // SAFETY: raise is async-signal-safe.
        unsafe { libc::raise(sig) };
    }
}
