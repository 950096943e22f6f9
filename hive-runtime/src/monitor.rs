//! Unidirectional monitors.
//!
//! When actor A monitors B, an entry `{ref, target: B}` goes into A's monitor
//! list. If B dies while the entry exists, the entry is removed and A gets a
//! `System`/[`DOWN_TAG`] message carrying B's id, its exit reason and the
//! monitor ref. A's own death just discards its entries.

use std::fmt;

use tracing::trace;

use crate::actor::ActorId;
use crate::error::{Error, Result};
use crate::message::{ExitReason, DOWN_TAG};
use crate::scheduler::{Kernel, KernelState};

/// Handle returned by [`Ctx::monitor`](crate::Ctx::monitor).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorRef(u64);

impl MonitorRef {
    /// Raw value, as carried in down notifications.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild a ref from [`as_u64`](Self::as_u64).
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        MonitorRef(raw)
    }
}

impl fmt::Debug for MonitorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MonitorRef(#{})", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MonitorEntry {
    reference: MonitorRef,
    target: ActorId,
}

impl KernelState {
    pub(crate) fn monitor(&mut self, me: ActorId, target: ActorId) -> Result<MonitorRef> {
        if target == me {
            return Err(Error::InvalidArgument("monitor of self"));
        }
        if !self.is_live(target) {
            return Err(Error::InvalidArgument("monitor target is not alive"));
        }
        self.next_monitor_ref += 1;
        let reference = MonitorRef(self.next_monitor_ref);
        let cb = self
            .actors
            .get_mut(me.slot())
            .ok_or(Error::InvalidArgument("unknown actor"))?;
        cb.monitors
            .append(&mut self.monitor_nodes, MonitorEntry { reference, target })
            .map_err(|_| Error::ResourceExhausted("monitor entries"))?;
        trace!(%me, %target, ?reference, "monitoring");
        Ok(reference)
    }

    pub(crate) fn demonitor(&mut self, me: ActorId, reference: MonitorRef) {
        if let Some(cb) = self.actors.get_mut(me.slot()) {
            cb.monitors
                .find_remove(&mut self.monitor_nodes, |e| e.reference == reference);
        }
    }

    /// Remove every entry targeting `dead` and, unless `notify` is false,
    /// send each watcher a down message.
    pub(crate) fn notify_monitors(&mut self, dead: ActorId, reason: ExitReason, notify: bool) {
        for slot in 0..self.actors.capacity() {
            loop {
                let Some(cb) = self.actors.get_mut(slot) else {
                    break;
                };
                let watcher = cb.id;
                let Some(entry) = cb
                    .monitors
                    .find_remove(&mut self.monitor_nodes, |e| e.target == dead)
                else {
                    break;
                };
                if !notify || !cb.is_alive() {
                    continue;
                }
                self.send_notice(watcher, DOWN_TAG, dead, reason, Some(entry.reference));
            }
        }
    }

    /// Drop the monitors `dead` held on others.
    pub(crate) fn discard_monitors(&mut self, dead: ActorId) {
        if let Some(cb) = self.actors.get_mut(dead.slot()) {
            cb.monitors.clear(&mut self.monitor_nodes);
        }
    }
}

impl Kernel {
    pub(crate) fn monitor(&self, me: ActorId, target: ActorId) -> Result<MonitorRef> {
        self.current_slot(me)?;
        self.state().monitor(me, target)
    }

    pub(crate) fn demonitor(&self, me: ActorId, reference: MonitorRef) -> Result<()> {
        self.current_slot(me)?;
        self.state().demonitor(me, reference);
        Ok(())
    }
}
