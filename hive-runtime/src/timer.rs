//! One-shot and periodic timers delivered as `Timer`-class messages.
//!
//! A timer is an entry in a fixed table plus an event source in the poller
//! (a `timerfd` on Linux). When the poller reports it ready the owner gets a
//! message from [`ActorId::SYSTEM`] with class [`Class::Timer`] and the timer
//! id as tag. Receive and bus-read timeouts are ordinary one-shot timers. If
//! the owner is still parked on the call that armed one when it fires, the
//! owner is woken with [`Error::Timeout`] and no message is involved, so a
//! timeout expires even when the message pool is exhausted. Otherwise the
//! tick is queued and consumed by the call instead of being handed to the
//! actor.
//!
//! A tick that cannot be delivered because the message pool is full stays
//! pending on its timer and is retried at the start of every scheduler
//! iteration. Expirations of a periodic timer that pile up meanwhile are
//! coalesced into that one tick.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::actor::{is_tick, ActorId, ActorState, Wait};
use crate::error::{Error, Result};
use crate::message::{Class, Header, RUNTIME_TAG_BIT};
use crate::poller::{TimerHandle, Token};
use crate::pool::Pool;
use crate::scheduler::{KernelState, Source};

/// Identity of an armed timer; also the tag of its tick messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

impl TimerId {
    /// Tag carried by this timer's ticks.
    #[must_use]
    pub fn tag(self) -> u32 {
        self.0
    }

    pub(crate) fn from_tag(tag: u32) -> Self {
        TimerId(tag)
    }
}

#[derive(Debug)]
pub(crate) struct TimerEntry {
    id: TimerId,
    owner: ActorId,
    token: Token,
    handle: TimerHandle,
    periodic: bool,
    pending: bool,
}

/// Fixed table of armed timers.
#[derive(Debug)]
pub(crate) struct TimerTable {
    entries: Pool<TimerEntry>,
    last_id: u32,
}

impl TimerTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        TimerTable {
            entries: Pool::with_capacity(capacity),
            last_id: 0,
        }
    }

    fn index_of(&self, id: TimerId) -> Option<usize> {
        self.entries.position(|e| e.id == id)
    }

    /// Next id in `1..2^27`, skipping ids still armed.
    fn next_id(&mut self) -> TimerId {
        loop {
            self.last_id = (self.last_id + 1) % RUNTIME_TAG_BIT;
            let id = TimerId::from_tag(self.last_id);
            if self.last_id != 0 && self.index_of(id).is_none() {
                return id;
            }
        }
    }
}

enum Tick {
    Delivered,
    Deferred,
    OwnerGone,
}

impl KernelState {
    /// Arm a timer for `owner`: first tick after `delay`, then every
    /// `interval` if given.
    pub(crate) fn start_timer(
        &mut self,
        owner: ActorId,
        delay: Duration,
        interval: Option<Duration>,
    ) -> Result<TimerId> {
        if interval.is_some_and(|i| i.is_zero()) {
            return Err(Error::InvalidArgument("timer interval must be non-zero"));
        }
        if self.timers.entries.is_full() {
            return Err(Error::ResourceExhausted("timer table"));
        }
        let id = self.timers.next_id();
        let token = self
            .sources
            .alloc(Source::Timer(id))
            .map_err(|_| Error::ResourceExhausted("event sources"))?;
        let handle = match self.poller.add_timer(token, delay, interval) {
            Ok(handle) => handle,
            Err(err) => {
                self.sources.free(token);
                return Err(err.into());
            }
        };
        let entry = TimerEntry {
            id,
            owner,
            token,
            handle,
            periodic: interval.is_some(),
            pending: false,
        };
        if let Err(entry) = self.timers.entries.alloc(entry) {
            self.poller.remove_timer(entry.handle);
            self.sources.free(token);
            return Err(Error::ResourceExhausted("timer table"));
        }
        trace!(timer = id.0, %owner, ?delay, ?interval, "timer armed");
        Ok(id)
    }

    /// Cancel `owner`'s timer `id` and drop any tick of it not yet received.
    pub(crate) fn cancel_timer(&mut self, owner: ActorId, id: TimerId) -> Result<()> {
        let index = self
            .timers
            .entries
            .position(|e| e.id == id && e.owner == owner)
            .ok_or(Error::InvalidArgument("unknown timer"))?;
        self.remove_timer_at(index);
        self.purge_ticks(owner, id);
        Ok(())
    }

    /// Disarm a timeout timer whether or not it already fired.
    pub(crate) fn cancel_timeout(&mut self, owner: ActorId, id: TimerId) {
        if let Some(index) = self.timers.index_of(id) {
            self.remove_timer_at(index);
        }
        self.purge_ticks(owner, id);
    }

    fn remove_timer_at(&mut self, index: usize) {
        if let Some(entry) = self.timers.entries.free(index) {
            self.sources.free(entry.token);
            self.poller.remove_timer(entry.handle);
        }
    }

    /// Remove undelivered ticks of `id` from `owner`'s mailbox.
    fn purge_ticks(&mut self, owner: ActorId, id: TimerId) {
        let slot = owner.slot();
        let Some(cb) = self.actors.get_mut(slot) else {
            return;
        };
        if cb.id != owner {
            return;
        }
        let mut cursor = cb.mailbox.head();
        while let Some(index) = cursor {
            let Some(node) = self.mail.get(index) else {
                break;
            };
            cursor = node.next();
            let entry = node.value();
            // SAFETY: queued entries own live pool buffers.
            let header = unsafe { Header::read(entry.buf) };
            if is_tick(Some(id), entry.sender, header) {
                if let Some(entry) = cb.mailbox.remove(&mut self.mail, index) {
                    self.buffers.free(entry.buf.as_ptr());
                }
            }
        }
    }

    /// The poller reported timer `id` ready.
    pub(crate) fn fire_timer(&mut self, id: TimerId) {
        let Some(index) = self.timers.index_of(id) else {
            return;
        };
        let expirations = self
            .timers
            .entries
            .get(index)
            .map_or(0, |e| self.poller.ack_timer(&e.handle));
        if expirations == 0 {
            return;
        }
        self.deliver_tick(index);
    }

    /// Wake `owner` with `Timeout` if it is parked on timeout `id`.
    fn expire_wait(&mut self, owner: ActorId, id: TimerId) -> bool {
        let slot = owner.slot();
        let parked = self.actors.get(slot).is_some_and(|cb| {
            cb.id == owner
                && cb.state == ActorState::Waiting
                && matches!(
                    cb.wait,
                    Some(Wait::Receive { timeout, .. } | Wait::Bus { timeout, .. }) if timeout == Some(id)
                )
        });
        if parked {
            trace!(timer = id.0, %owner, "timeout expired");
            self.wake(slot, Some(Error::Timeout));
        }
        parked
    }

    fn deliver_tick(&mut self, index: usize) {
        let Some(entry) = self.timers.entries.get(index) else {
            return;
        };
        let (id, owner, periodic) = (entry.id, entry.owner, entry.periodic);
        if !periodic && self.expire_wait(owner, id) {
            self.remove_timer_at(index);
            return;
        }
        let outcome = match self.deliver(
            ActorId::SYSTEM,
            owner,
            Header::new(Class::Timer, id.0),
            &[],
            None,
        ) {
            Ok(()) => Tick::Delivered,
            Err(Error::ResourceExhausted(_)) => Tick::Deferred,
            Err(_) => Tick::OwnerGone,
        };
        match outcome {
            Tick::Delivered if periodic => {
                if let Some(entry) = self.timers.entries.get_mut(index) {
                    entry.pending = false;
                }
            }
            Tick::Delivered | Tick::OwnerGone => self.remove_timer_at(index),
            Tick::Deferred => {
                if let Some(entry) = self.timers.entries.get_mut(index) {
                    if !entry.pending {
                        warn!(timer = id.0, %owner, "message pool full, timer tick deferred");
                    }
                    entry.pending = true;
                }
            }
        }
    }

    /// Retry ticks deferred by pool exhaustion.
    pub(crate) fn retry_pending_timers(&mut self) {
        for index in 0..self.timers.entries.capacity() {
            if self.timers.entries.get(index).is_some_and(|e| e.pending) {
                self.deliver_tick(index);
            }
        }
    }

    /// Force-cancel every timer owned by `owner`.
    pub(crate) fn cancel_owned_timers(&mut self, owner: ActorId) {
        let mut cancelled = 0_usize;
        for index in 0..self.timers.entries.capacity() {
            if self.timers.entries.get(index).is_some_and(|e| e.owner == owner) {
                self.remove_timer_at(index);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(%owner, cancelled, "cancelled timers of dead actor");
        }
    }

    /// Whether `owner`'s mailbox holds the tick of timeout `id`; removes it.
    pub(crate) fn take_tick(&mut self, owner: ActorId, id: TimerId) -> bool {
        let slot = owner.slot();
        let Some(cb) = self.actors.get(slot) else {
            return false;
        };
        let found = cb.mailbox.find(&self.mail, |entry| {
            // SAFETY: queued entries own live pool buffers.
            let header = unsafe { Header::read(entry.buf) };
            is_tick(Some(id), entry.sender, header)
        });
        if found.is_none() {
            return false;
        }
        self.cancel_timeout(owner, id);
        true
    }
}
