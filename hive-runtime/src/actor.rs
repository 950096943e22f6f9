//! Actor identity, control blocks and the coroutine entry trampoline.
//!
//! Each actor owns a stack, a mailbox, a link list and a monitor list, all
//! recorded in a [`ControlBlock`] that lives in the kernel's actor table. The
//! table is a fixed [`Pool`](crate::pool::Pool); an actor's slot index is
//! embedded in its [`ActorId`] next to a serial number, so a recycled slot
//! never answers to a stale id.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use tracing::{debug, warn};

use crate::bus::BusId;
use crate::config::{Priority, SpawnOptions};
use crate::coro::{self, CoroStack};
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::io::IoValue;
use crate::list::List;
use crate::message::{Class, ExitReason, Filter, Header};
use crate::scheduler::Kernel;
use crate::timer::TimerId;

const SLOT_BITS: u32 = 16;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

// ── ActorId ─────────────────────────────────────────────────────────────────

/// Identity of an actor: `serial << 16 | slot`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    /// Sender of runtime-generated messages (timer ticks, exit and down
    /// notifications). No actor ever has this id.
    pub const SYSTEM: ActorId = ActorId(0);

    pub(crate) fn new(serial: u64, slot: usize) -> Self {
        ActorId((serial << SLOT_BITS) | (slot as u64 & SLOT_MASK))
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "masked to 16 bits before the cast"
    )]
    pub(crate) fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    /// Raw 64-bit value, as carried in exit notifications.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id from [`as_u64`](Self::as_u64).
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        ActorId(raw)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == ActorId::SYSTEM {
            f.write_str("<system>")
        } else {
            write!(f, "<{}.{}>", self.0 >> SLOT_BITS, self.0 & SLOT_MASK)
        }
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId{self}")
    }
}

// ── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Runnable, waiting for the scheduler.
    Ready,
    /// Currently executing.
    Running,
    /// Blocked on a receive, synchronous send, bus read or I/O.
    Waiting,
    /// Finished; awaiting reaping.
    Dead,
}

/// What a waiting actor is blocked on. Decides which events make it ready.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wait {
    Receive {
        filter: Filter,
        timeout: Option<TimerId>,
        peer: Option<ActorId>,
    },
    SyncSend {
        token: u64,
        target: ActorId,
    },
    Bus {
        bus: BusId,
        timeout: Option<TimerId>,
    },
    Io,
}

impl Wait {
    /// Whether delivering a message with `header` from `sender` satisfies
    /// this wait.
    pub(crate) fn wakes_on(&self, sender: ActorId, header: Header) -> bool {
        match self {
            Wait::Receive {
                filter, timeout, ..
            } => filter.matches(sender, header) || is_tick(*timeout, sender, header),
            Wait::Bus { timeout, .. } => is_tick(*timeout, sender, header),
            Wait::SyncSend { .. } | Wait::Io => false,
        }
    }
}

/// Whether the message is the tick of timeout timer `timer`.
pub(crate) fn is_tick(timer: Option<TimerId>, sender: ActorId, header: Header) -> bool {
    timer.is_some_and(|t| {
        sender == ActorId::SYSTEM && header.class() == Some(Class::Timer) && header.tag() == t.tag()
    })
}

// ── Control block ───────────────────────────────────────────────────────────

/// Boxed actor body.
pub(crate) type ActorEntry = Box<dyn for<'a> FnOnce(&Ctx<'a>)>;

/// Per-actor bookkeeping.
pub(crate) struct ControlBlock {
    pub(crate) id: ActorId,
    pub(crate) name: Option<String>,
    pub(crate) priority: Priority,
    pub(crate) state: ActorState,
    pub(crate) started: bool,
    pub(crate) stack: CoroStack,
    pub(crate) entry: Option<ActorEntry>,
    pub(crate) mailbox: List,
    pub(crate) links: List,
    pub(crate) monitors: List,
    pub(crate) wait: Option<Wait>,
    /// Status handed to a blocked call by whoever woke it.
    pub(crate) resume: Option<Error>,
    pub(crate) io: Option<io::Result<IoValue>>,
    /// Sender and token of the last synchronous message handed out and not
    /// yet released.
    pub(crate) active_sync: Option<(ActorId, u64)>,
    pub(crate) exit_reason: Option<ExitReason>,
    pub(crate) kill: bool,
}

impl ControlBlock {
    fn new(options: SpawnOptions, stack: CoroStack, entry: ActorEntry) -> Self {
        ControlBlock {
            id: ActorId::SYSTEM,
            name: options.name,
            priority: options.priority,
            state: ActorState::Ready,
            started: false,
            stack,
            entry: Some(entry),
            mailbox: List::new(),
            links: List::new(),
            monitors: List::new(),
            wait: None,
            resume: None,
            io: None,
            active_sync: None,
            exit_reason: None,
            kill: false,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state != ActorState::Dead
    }

    /// Record the exit reason unless one was already set.
    pub(crate) fn set_exit(&mut self, reason: ExitReason) {
        self.state = ActorState::Dead;
        self.exit_reason.get_or_insert(reason);
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("mailbox", &self.mailbox.len())
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

// ── Spawn ───────────────────────────────────────────────────────────────────

/// Unwind payload used by [`Ctx::exit`] and teardown to leave an actor body.
pub(crate) struct ExitSignal(pub(crate) ExitReason);

impl Kernel {
    pub(crate) fn spawn(&self, options: SpawnOptions, entry: ActorEntry) -> Result<ActorId> {
        let size = options.stack_size.unwrap_or(self.config.stack_size);
        let source = options.stack_source.unwrap_or(self.config.stack_source);
        let priority = options.priority;

        let mut st = self.state();
        if st.tearing_down {
            return Err(Error::Closed);
        }
        if st.actors.is_full() {
            return Err(Error::ResourceExhausted("actor table"));
        }
        let stack = CoroStack::new(size, source).map_err(|err| {
            warn!(error = %err, size, "actor stack allocation failed");
            Error::ResourceExhausted("actor stack")
        })?;
        let sp = stack.initial_sp();
        let usable = stack.usable_size();
        let slot = st
            .actors
            .alloc(ControlBlock::new(options, stack, entry))
            .map_err(|_| Error::ResourceExhausted("actor table"))?;
        st.serial += 1;
        let id = ActorId::new(st.serial, slot);
        let Some(cb) = st.actors.get_mut(slot) else {
            return Err(Error::ResourceExhausted("actor table"));
        };
        cb.id = id;
        debug!(actor = %id, ?priority, name = cb.name.as_deref(), stack = usable, "spawned");

        // SAFETY: the context cell of `slot` is only switched to once the
        // actor is dispatched, and the stack lives in the control block until
        // the actor is reaped. The kernel is boxed and outlives every actor.
        unsafe {
            coro::init(
                self.context(slot),
                sp,
                actor_entry,
                ptr::from_ref(self).cast_mut().cast(),
            );
        }
        st.stats.spawned += 1;
        Ok(id)
    }

    /// Hand the running actor its body, exactly once.
    fn take_entry(&self) -> Option<(ActorId, Option<ActorEntry>)> {
        let mut st = self.state();
        let slot = st.current?;
        let cb = st.actors.get_mut(slot)?;
        Some((cb.id, cb.entry.take()))
    }

    /// Mark the running actor dead with `reason`.
    fn finish_current(&self, id: ActorId, reason: ExitReason) {
        let mut st = self.state();
        if let Some(cb) = st.actors.get_mut(id.slot()) {
            if cb.id == id {
                cb.set_exit(reason);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

/// First frame of every actor stack.
///
/// Runs the body under `catch_unwind`. [`ExitSignal`] unwinds carry the exit
/// reason; any other panic, or returning normally, is a crash. Control then
/// goes back to the scheduler for good.
extern "C" fn actor_entry(arg: *mut u8) -> ! {
    // SAFETY: `arg` is the kernel pointer passed to `coro::init` in `spawn`.
    let kernel: &Kernel = unsafe { &*arg.cast_const().cast::<Kernel>() };
    let Some((id, entry)) = kernel.take_entry() else {
        std::process::abort();
    };

    if let Some(entry) = entry {
        let ctx = Ctx::new(kernel, id);
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| entry(&ctx))) {
            Ok(()) => {
                warn!(actor = %id, "actor returned without calling exit");
                ExitReason::Crash
            }
            Err(payload) => match payload.downcast::<ExitSignal>() {
                Ok(signal) => signal.0,
                Err(payload) => {
                    warn!(actor = %id, panic = panic_message(&*payload), "actor panicked");
                    ExitReason::Crash
                }
            },
        };
        kernel.finish_current(id, reason);
    }

    kernel.leave(id.slot());
    // A dead actor is never switched back to.
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_packs_serial_and_slot() {
        let id = ActorId::new(7, 3);
        assert_eq!(id.slot(), 3);
        assert_eq!(id.as_u64(), (7 << 16) | 3);
        assert_eq!(ActorId::from_raw(id.as_u64()), id);
        assert_eq!(id.to_string(), "<7.3>");
        assert_eq!(ActorId::SYSTEM.to_string(), "<system>");
    }

    #[test]
    fn recycled_slot_gets_new_id() {
        let a = ActorId::new(1, 5);
        let b = ActorId::new(2, 5);
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a, b);
    }

    #[test]
    fn receive_wait_wakes_on_filter_or_own_tick() {
        let peer = ActorId::new(1, 1);
        let timer = TimerId::from_tag(9);
        let wait = Wait::Receive {
            filter: Filter::any().class(Class::Reply),
            timeout: Some(timer),
            peer: None,
        };
        assert!(wait.wakes_on(peer, Header::new(Class::Reply, 4)));
        assert!(!wait.wakes_on(peer, Header::new(Class::Notify, 4)));
        assert!(wait.wakes_on(ActorId::SYSTEM, Header::new(Class::Timer, 9)));
        assert!(!wait.wakes_on(ActorId::SYSTEM, Header::new(Class::Timer, 10)));
        assert!(!wait.wakes_on(peer, Header::new(Class::Timer, 9)));
    }

    #[test]
    fn sync_and_io_waits_ignore_messages() {
        let peer = ActorId::new(1, 1);
        let h = Header::new(Class::Notify, 0);
        assert!(!Wait::Io.wakes_on(peer, h));
        assert!(!Wait::SyncSend {
            token: 1,
            target: peer
        }
        .wakes_on(peer, h));
    }
}
