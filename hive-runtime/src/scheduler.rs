//! Single-threaded cooperative scheduler.
//!
//! All mutable runtime state lives in one [`KernelState`] behind a `RefCell`
//! inside the [`Kernel`]. The scheduler and the running actor take turns on
//! one OS thread: the scheduler switches into an actor, the actor runs until
//! it yields, blocks or exits, and switches back. A borrow of the state is
//! never held across a context switch.
//!
//! # Loop
//!
//! Each iteration:
//!
//! 1. retries deferred notifications and timer ticks, collects ready event sources from the
//!    poller without waiting and drains file I/O completions, waking the
//!    actors they belong to;
//! 2. runs one scheduling round: for each priority level, highest first, at
//!    most one `Ready` actor, picked round-robin after the level's
//!    last-dispatched slot;
//! 3. after each switch back, checks whether the actor overflowed its stack
//!    (guard page fault or broken canary) and reaps it if it is dead;
//! 4. if nothing ran, waits on the poller for up to `idle_poll`, or reports a
//!    deadlock when no event source could ever wake a waiting actor.
//!
//! The loop ends when no actor is left or shutdown was requested.

use std::cell::{RefCell, RefMut, UnsafeCell};
use std::os::fd::RawFd;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::actor::{ActorId, ActorState, ControlBlock, ExitSignal, Wait};
use crate::bus::Bus;
use crate::config::{Priority, RuntimeConfig};
use crate::coro::{self, SwitchContext};
use crate::error::{Error, Result};
use crate::io::IoState;
use crate::list::{List, Node};
use crate::mailbox::{MailEntry, Notice};
use crate::message::{ExitReason, Header};
use crate::monitor::MonitorEntry;
use crate::poller::{Poller, Token};
use crate::pool::{BufferPool, Pool};
use crate::runtime::RuntimeStats;
use crate::signal;
use crate::timer::{TimerId, TimerTable};

/// What a poller token stands for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Source {
    Timer(TimerId),
    Socket { actor: ActorId, fd: RawFd },
}

/// Every table and pool of one runtime instance.
#[derive(Debug)]
pub(crate) struct KernelState {
    pub(crate) actors: Pool<ControlBlock>,
    pub(crate) mail: Pool<Node<MailEntry>>,
    pub(crate) buffers: BufferPool,
    /// Per message buffer: the actor holding it as a received message.
    pub(crate) held: Box<[Option<ActorId>]>,
    pub(crate) link_nodes: Pool<Node<ActorId>>,
    pub(crate) monitor_nodes: Pool<Node<MonitorEntry>>,
    /// Exit and down notifications waiting for a free buffer, oldest first.
    pub(crate) notices: List,
    pub(crate) notice_nodes: Pool<Node<Notice>>,
    pub(crate) timers: TimerTable,
    pub(crate) buses: Pool<Bus>,
    pub(crate) sources: Pool<Source>,
    pub(crate) poller: Poller,
    pub(crate) io: IoState,
    /// Slot of the running actor.
    pub(crate) current: Option<usize>,
    /// Last dispatched slot per priority level.
    cursors: [usize; 4],
    pub(crate) serial: u64,
    pub(crate) next_request_tag: u32,
    pub(crate) next_sync_token: u64,
    pub(crate) next_monitor_ref: u64,
    pub(crate) bus_generation: u16,
    pub(crate) stats: RuntimeStats,
    pub(crate) tearing_down: bool,
    torn_down: bool,
    pub(crate) message_size_max: usize,
    ready: Vec<Token>,
}

impl KernelState {
    /// Make a waiting actor runnable; `status` is what its blocked call
    /// returns.
    pub(crate) fn wake(&mut self, slot: usize, status: Option<Error>) {
        if let Some(cb) = self.actors.get_mut(slot) {
            if cb.state == ActorState::Waiting {
                cb.state = ActorState::Ready;
                cb.resume = status;
                trace!(actor = %cb.id, "woken");
            }
        }
    }

    /// Next ready actor at `priority`, round-robin after the last one.
    fn pick(&mut self, priority: Priority) -> Option<usize> {
        let capacity = self.actors.capacity();
        let level = priority.index();
        let last = self.cursors[level];
        for step in 1..=capacity {
            let slot = (last + step) % capacity;
            if self
                .actors
                .get(slot)
                .is_some_and(|cb| cb.priority == priority && cb.state == ActorState::Ready)
            {
                self.cursors[level] = slot;
                return Some(slot);
            }
        }
        None
    }

    /// No timer, socket wait or file job could ever make an actor ready.
    fn is_quiescent(&self) -> bool {
        self.sources.is_empty() && self.io.in_flight == 0
    }

    /// Free a dead actor's slot and everything it owned.
    ///
    /// Exit and down notifications go out unless the runtime is tearing
    /// down. The control block is returned so the caller can drop the stack
    /// and any unstarted body after releasing the state borrow.
    pub(crate) fn reap(&mut self, slot: usize) -> Option<ControlBlock> {
        let default_reason = if self.tearing_down {
            ExitReason::Shutdown
        } else {
            ExitReason::Crash
        };
        let cb = self.actors.get_mut(slot)?;
        cb.set_exit(default_reason);
        let id = cb.id;
        let reason = cb.exit_reason.unwrap_or(default_reason);
        let notify = !self.tearing_down;

        self.cancel_owned_timers(id);
        self.propagate_exit(id, reason, notify);
        self.notify_monitors(id, reason, notify);
        self.discard_monitors(id);
        self.release_waiters(id);
        self.drop_subscriptions(id);
        self.release_sockets(id);

        if let Some(cb) = self.actors.get_mut(slot) {
            let mut mailbox = std::mem::take(&mut cb.mailbox);
            while let Some(entry) = mailbox.pop_front(&mut self.mail) {
                self.buffers.free(entry.buf.as_ptr());
            }
        }
        let reclaimed = self.reclaim_held(id);
        let cb = self.actors.free(slot)?;

        self.stats.reaped += 1;
        if reason.is_abnormal() {
            self.stats.crashed += 1;
            warn!(actor = %id, name = cb.name.as_deref(), %reason, reclaimed, "actor died");
        } else {
            debug!(actor = %id, name = cb.name.as_deref(), %reason, "actor exited");
        }
        Some(cb)
    }
}

/// One runtime instance: configuration, state and the saved contexts.
///
/// Always boxed; actor stacks and [`Ctx`](crate::Ctx) handles point at it.
pub(crate) struct Kernel {
    pub(crate) config: RuntimeConfig,
    state: RefCell<KernelState>,
    contexts: Box<[UnsafeCell<SwitchContext>]>,
    sched_context: UnsafeCell<SwitchContext>,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl Kernel {
    pub(crate) fn new(config: RuntimeConfig) -> Result<Box<Kernel>> {
        config.validate()?;
        let poller = Poller::new()?;
        let state = KernelState {
            actors: Pool::with_capacity(config.max_actors),
            mail: Pool::with_capacity(config.message_capacity),
            buffers: BufferPool::new(
                config.message_capacity,
                Header::SIZE + config.message_size_max,
            ),
            held: vec![None; config.message_capacity].into_boxed_slice(),
            link_nodes: Pool::with_capacity(config.max_links),
            monitor_nodes: Pool::with_capacity(config.max_monitors),
            notices: List::new(),
            notice_nodes: Pool::with_capacity(config.max_links + config.max_monitors),
            timers: TimerTable::with_capacity(config.max_timers),
            buses: Pool::with_capacity(config.max_buses),
            sources: Pool::with_capacity(config.max_timers + config.max_actors),
            poller,
            io: IoState::default(),
            current: None,
            cursors: [config.max_actors - 1; 4],
            serial: 0,
            next_request_tag: 0,
            next_sync_token: 0,
            next_monitor_ref: 0,
            bus_generation: 0,
            stats: RuntimeStats::default(),
            tearing_down: false,
            torn_down: false,
            message_size_max: config.message_size_max,
            ready: Vec::new(),
        };
        let contexts = (0..config.max_actors)
            .map(|_| UnsafeCell::new(SwitchContext::new()))
            .collect();
        debug!(
            max_actors = config.max_actors,
            message_capacity = config.message_capacity,
            message_size_max = config.message_size_max,
            "runtime initialised"
        );
        Ok(Box::new(Kernel {
            config,
            state: RefCell::new(state),
            contexts,
            sched_context: UnsafeCell::new(SwitchContext::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// Borrow the state. Never held across a context switch.
    pub(crate) fn state(&self) -> RefMut<'_, KernelState> {
        self.state.borrow_mut()
    }

    pub(crate) fn try_state(&self) -> Option<RefMut<'_, KernelState>> {
        self.state.try_borrow_mut().ok()
    }

    pub(crate) fn context(&self, slot: usize) -> *mut SwitchContext {
        self.contexts[slot].get()
    }

    /// Slot of `me`, which must be the running actor.
    pub(crate) fn current_slot(&self, me: ActorId) -> Result<usize> {
        let st = self.state();
        match st.current {
            Some(slot)
                if slot == me.slot() && st.actors.get(slot).is_some_and(|cb| cb.id == me) =>
            {
                Ok(slot)
            }
            _ => Err(Error::InvalidArgument("not called from the running actor")),
        }
    }

    pub(crate) fn stats(&self) -> RuntimeStats {
        let st = self.state();
        RuntimeStats {
            live: st.actors.len(),
            buffers_in_use: st.buffers.len(),
            ..st.stats
        }
    }

    // ── Actor side ──────────────────────────────────────────────────────

    fn killed(&self, slot: usize) -> bool {
        self.state().actors.get(slot).is_some_and(|cb| cb.kill)
    }

    /// Unwind out of the actor body if teardown asked it to stop.
    fn check_kill(&self, slot: usize) -> Result<()> {
        if !self.killed(slot) {
            return Ok(());
        }
        if !thread::panicking() {
            panic::resume_unwind(Box::new(ExitSignal(ExitReason::Shutdown)));
        }
        Err(Error::Closed)
    }

    /// Switch from actor `slot` back to the scheduler.
    fn suspend(&self, slot: usize) {
        // SAFETY: called on the running actor's own stack; the scheduler
        // context was saved by `dispatch`, which is waiting for this switch.
        unsafe { coro::switch(self.context(slot), self.sched_context.get()) };
        if self.killed(slot) && !thread::panicking() {
            panic::resume_unwind(Box::new(ExitSignal(ExitReason::Shutdown)));
        }
    }

    /// Final switch of a finished actor.
    pub(crate) fn leave(&self, slot: usize) {
        // SAFETY: as in `suspend`. The actor is dead and is never resumed.
        unsafe { coro::switch(self.context(slot), self.sched_context.get()) };
    }

    pub(crate) fn yield_now(&self, me: ActorId) -> Result<()> {
        let slot = self.current_slot(me)?;
        self.check_kill(slot)?;
        self.suspend(slot);
        Ok(())
    }

    /// Park the running actor until something satisfying `wait` wakes it.
    /// Returns the status the waker left.
    pub(crate) fn block(&self, slot: usize, wait: Wait) -> Result<()> {
        self.check_kill(slot)?;
        {
            let mut st = self.state();
            let cb = st.actors.get_mut(slot).ok_or(Error::Closed)?;
            cb.state = ActorState::Waiting;
            cb.wait = Some(wait);
            cb.resume = None;
        }
        self.suspend(slot);
        let mut st = self.state();
        let cb = st.actors.get_mut(slot).ok_or(Error::Closed)?;
        cb.wait = None;
        cb.resume.take().map_or(Ok(()), Err)
    }

    // ── Scheduler side ──────────────────────────────────────────────────

    /// Run actor `slot` until it switches back, then settle its state.
    fn dispatch(&self, slot: usize) {
        {
            let mut st = self.state();
            let Some(cb) = st.actors.get_mut(slot) else {
                return;
            };
            cb.state = ActorState::Running;
            cb.started = true;
            trace!(actor = %cb.id, "switch in");
            let guard = cb.stack.guard_range();
            st.current = Some(slot);
            st.stats.context_switches += 1;
            signal::arm(guard, self.context(slot), self.sched_context.get());
        }
        // SAFETY: the slot's context was set up by `spawn` or saved by the
        // actor's last switch out, and its stack is owned by the control
        // block, which outlives this call.
        unsafe { coro::switch(self.sched_context.get(), self.context(slot)) };
        let overflow = signal::disarm();

        let dead = {
            let Some(mut st) = self.try_state() else {
                // Only an actor abandoned mid-call can leave the state
                // borrowed, and the tables may be half updated.
                error!(slot, "stack overflow inside a runtime call, aborting");
                std::process::abort();
            };
            st.current = None;
            let Some(cb) = st.actors.get_mut(slot) else {
                return;
            };
            if let Some(addr) = overflow {
                warn!(actor = %cb.id, fault = format_args!("{addr:#x}"), "stack overflow");
                cb.state = ActorState::Dead;
                cb.exit_reason = Some(ExitReason::StackOverflow);
            } else if !cb.stack.canaries_intact() {
                warn!(actor = %cb.id, "stack guard overwritten");
                cb.state = ActorState::Dead;
                cb.exit_reason = Some(ExitReason::StackOverflow);
            }
            match cb.state {
                ActorState::Running => {
                    cb.state = ActorState::Ready;
                    false
                }
                ActorState::Dead => true,
                ActorState::Ready | ActorState::Waiting => false,
            }
        };
        if dead {
            self.reap(slot);
        }
    }

    fn reap(&self, slot: usize) {
        let cb = self.state().reap(slot);
        drop(cb);
    }

    fn run_round(&self) -> usize {
        let mut ran = 0;
        for priority in Priority::ALL {
            let picked = self.state().pick(priority);
            if let Some(slot) = picked {
                self.dispatch(slot);
                ran += 1;
            }
        }
        ran
    }

    /// Collect events: deferred ticks, poller readiness, file completions.
    fn pump(&self, timeout: Option<Duration>) -> Result<()> {
        let mut guard = self.state();
        let st = &mut *guard;
        st.retry_notices();
        st.retry_pending_timers();
        let mut ready = std::mem::take(&mut st.ready);
        let polled = st.poller.poll(&mut ready, timeout);
        for &token in &ready {
            match st.sources.get(token).copied() {
                Some(Source::Timer(id)) => st.fire_timer(id),
                Some(Source::Socket { .. }) => st.socket_ready(token),
                None => {}
            }
        }
        ready.clear();
        st.ready = ready;
        st.drain_completions();
        polled.map_err(Error::from)
    }

    pub(crate) fn run(&self) -> Result<()> {
        if self.state().tearing_down {
            return Err(Error::Closed);
        }
        info!(actors = self.state().actors.len(), "scheduler started");
        let result = loop {
            if self.shutdown.load(Ordering::Acquire) {
                info!("shutdown requested");
                break Ok(());
            }
            if self.state().actors.is_empty() {
                break Ok(());
            }
            if let Err(err) = self.pump(Some(Duration::ZERO)) {
                break Err(err);
            }
            if self.run_round() > 0 {
                continue;
            }
            let st = self.state();
            if st.is_quiescent() {
                let blocked = st.actors.len();
                warn!(blocked, "all actors wait on events that can never arrive");
                break Err(Error::Deadlock { blocked });
            }
            drop(st);
            if let Err(err) = self.pump(Some(self.config.idle_poll)) {
                break Err(err);
            }
        };
        info!(?result, "scheduler stopped");
        result
    }

    /// Stop every actor and release all resources. Idempotent.
    ///
    /// Suspended actors are resumed with their kill flag set, which unwinds
    /// their stacks from the blocking call they were parked in. Actors that
    /// never ran, or that refuse to unwind, are freed in place.
    pub(crate) fn teardown(&self) {
        {
            let mut st = self.state();
            if st.torn_down {
                return;
            }
            st.tearing_down = true;
            info!(live = st.actors.len(), "tearing down");
        }
        for _ in 0..2 {
            for slot in 0..self.config.max_actors {
                let started = {
                    let mut st = self.state();
                    match st.actors.get_mut(slot) {
                        Some(cb) if cb.started => {
                            cb.kill = true;
                            cb.state = ActorState::Ready;
                            cb.resume = Some(Error::Closed);
                            true
                        }
                        _ => false,
                    }
                };
                if started {
                    self.dispatch(slot);
                }
            }
        }
        for slot in 0..self.config.max_actors {
            let cb = {
                let mut st = self.state();
                if let Some(cb) = st.actors.get(slot).filter(|cb| cb.started) {
                    warn!(actor = %cb.id, "actor did not unwind, abandoning its stack");
                }
                st.reap(slot)
            };
            drop(cb);
        }
        let worker = self.state().io.worker.take();
        if let Some(mut worker) = worker {
            worker.shutdown();
        }
        let mut guard = self.state();
        let st = &mut *guard;
        st.io.in_flight = 0;
        st.notices.clear(&mut st.notice_nodes);
        if !st.buffers.is_empty() {
            warn!(held = st.buffers.len(), "message buffers outlived their actors");
        }
        st.torn_down = true;
        info!("torn down");
    }
}
