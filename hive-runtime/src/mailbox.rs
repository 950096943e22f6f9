//! Mailboxes and the IPC primitives built on them.
//!
//! Delivery copies the payload into a buffer from the shared message pool and
//! appends a [`MailEntry`] to the receiver's mailbox list. Receive scans the
//! list head to tail for the first entry matching a [`Filter`], unlinks it
//! (selective receive may take from the middle) and hands the buffer to the
//! caller as a [`Message`].
//!
//! Everything else is layered on those two steps:
//!
//! - request/reply tags each request with a fresh runtime tag and receives
//!   the matching reply by tag, so conversations never block on each other;
//! - a synchronous send parks the sender until the receiver releases the
//!   message, releases it implicitly with its next receive, or dies;
//! - exit and down notifications that find the pool exhausted wait in a
//!   pending queue and go out, in order, as soon as buffers free up.

use std::ptr::{self, NonNull};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::actor::{is_tick, ActorId, ActorState, Wait};
use crate::error::{Error, Result};
use crate::message::{
    encode_exit, Class, ExitReason, Filter, Header, Message, DOWN_PAYLOAD_LEN, MAX_USER_TAG,
    RUNTIME_TAG_BIT,
};
use crate::monitor::MonitorRef;
use crate::scheduler::{Kernel, KernelState};
use crate::timer::TimerId;

/// One queued message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MailEntry {
    pub(crate) sender: ActorId,
    pub(crate) buf: NonNull<u8>,
    pub(crate) len: usize,
    /// Token of a synchronous send; the sender is parked on it.
    pub(crate) sync: Option<u64>,
}

/// An exit or down notification waiting for a free buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Notice {
    to: ActorId,
    tag: u32,
    payload: [u8; DOWN_PAYLOAD_LEN],
    len: usize,
}

/// Outcome of one pass over a mailbox.
enum Scan {
    Found(MailEntry),
    TimedOut,
    Empty,
}

impl KernelState {
    /// Whether `id` names a live actor.
    pub(crate) fn is_live(&self, id: ActorId) -> bool {
        self.actors
            .get(id.slot())
            .is_some_and(|cb| cb.id == id && cb.is_alive())
    }

    /// Copy `payload` into a pool buffer and queue it for `to`.
    pub(crate) fn deliver(
        &mut self,
        from: ActorId,
        to: ActorId,
        header: Header,
        payload: &[u8],
        sync: Option<u64>,
    ) -> Result<()> {
        if payload.len() > self.message_size_max {
            return Err(Error::InvalidArgument("payload exceeds message_size_max"));
        }
        if !self.is_live(to) {
            return Err(Error::InvalidArgument("unknown or dead actor"));
        }
        let buf = self
            .buffers
            .alloc()
            .ok_or(Error::ResourceExhausted("message pool"))?;
        // SAFETY: every buffer holds `Header::SIZE + message_size_max` bytes
        // and `payload` was checked against that bound above.
        unsafe {
            header.write(buf);
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                buf.as_ptr().add(Header::SIZE),
                payload.len(),
            );
        }
        let entry = MailEntry {
            sender: from,
            buf,
            len: payload.len(),
            sync,
        };
        let slot = to.slot();
        let Some(cb) = self.actors.get_mut(slot) else {
            self.buffers.free(buf.as_ptr());
            return Err(Error::InvalidArgument("unknown or dead actor"));
        };
        if cb.mailbox.append(&mut self.mail, entry).is_err() {
            self.buffers.free(buf.as_ptr());
            return Err(Error::ResourceExhausted("mailbox entries"));
        }
        let wakes = cb.state == ActorState::Waiting
            && cb.wait.is_some_and(|w| w.wakes_on(from, header));
        self.stats.messages_sent += 1;
        trace!(%from, %to, class = ?header.class(), tag = header.tag(), len = payload.len(), "delivered");
        if wakes {
            self.wake(slot, None);
        }
        Ok(())
    }

    fn deliver_notice(&mut self, notice: &Notice) -> Result<()> {
        self.deliver(
            ActorId::SYSTEM,
            notice.to,
            Header::new(Class::System, notice.tag),
            &notice.payload[..notice.len],
            None,
        )
    }

    /// Tell `to` that `dead` is gone. Held back while the pool is exhausted
    /// or earlier notices to `to` are still waiting.
    pub(crate) fn send_notice(
        &mut self,
        to: ActorId,
        tag: u32,
        dead: ActorId,
        reason: ExitReason,
        monitor: Option<MonitorRef>,
    ) {
        let (payload, len) = encode_exit(dead, reason, monitor);
        let notice = Notice {
            to,
            tag,
            payload,
            len,
        };
        if self.notices.find(&self.notice_nodes, |n| n.to == to).is_none() {
            match self.deliver_notice(&notice) {
                Ok(()) => return,
                Err(Error::ResourceExhausted(_)) => {}
                Err(err) => {
                    trace!(actor = %to, %dead, error = %err, "notification dropped");
                    return;
                }
            }
        }
        if self.notices.append(&mut self.notice_nodes, notice).is_err() {
            warn!(actor = %to, %dead, tag, "notice queue full, notification lost");
        } else {
            debug!(actor = %to, %dead, tag, "message pool full, notification deferred");
        }
    }

    /// Deliver held-back notifications in order until the pool runs dry.
    pub(crate) fn retry_notices(&mut self) {
        while let Some(index) = self.notices.head() {
            let Some(notice) = self.notice_nodes.get(index).map(|node| *node.value()) else {
                break;
            };
            match self.deliver_notice(&notice) {
                Err(Error::ResourceExhausted(_)) => break,
                Ok(()) => {}
                Err(err) => trace!(actor = %notice.to, error = %err, "deferred notification dropped"),
            }
            self.notices.pop_front(&mut self.notice_nodes);
        }
    }

    /// Find and unlink the first entry matching `filter`, or the tick of
    /// timeout `timer` if that comes first.
    fn scan_mailbox(&mut self, slot: usize, filter: &Filter, timer: Option<TimerId>) -> Scan {
        let Some(cb) = self.actors.get_mut(slot) else {
            return Scan::Empty;
        };
        let mut hit = None;
        for (index, entry) in cb.mailbox.iter(&self.mail) {
            // SAFETY: queued entries own live pool buffers.
            let header = unsafe { Header::read(entry.buf) };
            if header.class().is_none() {
                continue;
            }
            if is_tick(timer, entry.sender, header) {
                hit = Some((index, true));
                break;
            }
            if filter.matches(entry.sender, header) {
                hit = Some((index, false));
                break;
            }
        }
        let Some((index, timed_out)) = hit else {
            return Scan::Empty;
        };
        let Some(entry) = cb.mailbox.remove(&mut self.mail, index) else {
            return Scan::Empty;
        };
        if timed_out {
            self.buffers.free(entry.buf.as_ptr());
            return Scan::TimedOut;
        }
        Scan::Found(entry)
    }

    /// Record that `owner` now holds `entry`'s buffer.
    fn checkout(&mut self, slot: usize, entry: &MailEntry) {
        if let Some(index) = self.buffers.index_of(entry.buf.as_ptr()) {
            if let Some(held) = self.held.get_mut(index) {
                *held = self.actors.get(slot).map(|cb| cb.id);
            }
        }
        if let (Some(cb), Some(token)) = (self.actors.get_mut(slot), entry.sync) {
            cb.active_sync = Some((entry.sender, token));
        }
        self.stats.messages_received += 1;
    }

    /// Let the sender of the last synchronous message `slot` received go.
    fn settle_sync(&mut self, slot: usize) {
        if let Some((sender, token)) = self.actors.get_mut(slot).and_then(|cb| cb.active_sync.take()) {
            self.ack_sync(sender, token);
        }
    }

    /// Resume `sender` if it is still parked on `token`.
    fn ack_sync(&mut self, sender: ActorId, token: u64) {
        let slot = sender.slot();
        let parked = self.actors.get(slot).is_some_and(|cb| {
            cb.id == sender
                && cb.state == ActorState::Waiting
                && matches!(cb.wait, Some(Wait::SyncSend { token: t, .. }) if t == token)
        });
        if parked {
            trace!(actor = %sender, token, "sync send released");
            self.wake(slot, None);
        }
    }

    /// Wake every actor blocked on `dead` with `Closed`: synchronous
    /// senders targeting it and requests awaiting its reply.
    pub(crate) fn release_waiters(&mut self, dead: ActorId) {
        for slot in 0..self.actors.capacity() {
            let blocked = self.actors.get(slot).is_some_and(|cb| {
                cb.state == ActorState::Waiting
                    && match cb.wait {
                        Some(Wait::SyncSend { target, .. }) => target == dead,
                        Some(Wait::Receive { peer, .. }) => peer == Some(dead),
                        _ => false,
                    }
            });
            if blocked {
                self.wake(slot, Some(Error::Closed));
            }
        }
    }

    /// Return every buffer `dead` still held to the pool.
    pub(crate) fn reclaim_held(&mut self, dead: ActorId) -> usize {
        let mut reclaimed = 0;
        for index in 0..self.held.len() {
            if self.held[index] != Some(dead) {
                continue;
            }
            self.held[index] = None;
            if let Some(buf) = self.buffers.slot_ptr(index) {
                self.buffers.free(buf.as_ptr());
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

impl Kernel {
    fn next_request_tag(&self) -> u32 {
        let mut st = self.state();
        st.next_request_tag = (st.next_request_tag + 1) & MAX_USER_TAG;
        RUNTIME_TAG_BIT | st.next_request_tag
    }

    pub(crate) fn notify(&self, me: ActorId, to: ActorId, tag: u32, payload: &[u8]) -> Result<()> {
        self.current_slot(me)?;
        if tag > MAX_USER_TAG {
            return Err(Error::InvalidArgument("tag collides with runtime tags"));
        }
        self.state()
            .deliver(me, to, Header::new(Class::Notify, tag), payload, None)
    }

    /// Selective receive.
    ///
    /// `peer`, when set, makes the wait fail with `Closed` once that actor
    /// is gone.
    pub(crate) fn receive(
        &self,
        me: ActorId,
        filter: Filter,
        timeout: Option<Duration>,
        peer: Option<ActorId>,
    ) -> Result<Message<'_>> {
        let slot = self.current_slot(me)?;
        self.state().settle_sync(slot);

        let mut timer: Option<TimerId> = None;
        loop {
            let mut st = self.state();
            match st.scan_mailbox(slot, &filter, timer) {
                Scan::Found(entry) => {
                    if let Some(t) = timer {
                        st.cancel_timeout(me, t);
                    }
                    st.checkout(slot, &entry);
                    drop(st);
                    return Ok(Message::new(self, me, entry.sender, entry.buf, entry.len, entry.sync));
                }
                Scan::TimedOut => return Err(Error::Timeout),
                Scan::Empty => {}
            }
            if peer.is_some_and(|p| !st.is_live(p)) {
                if let Some(t) = timer {
                    st.cancel_timeout(me, t);
                }
                return Err(Error::Closed);
            }
            match timeout {
                Some(d) if d.is_zero() => return Err(Error::WouldBlock),
                Some(d) if timer.is_none() => timer = Some(st.start_timer(me, d, None)?),
                _ => {}
            }
            drop(st);

            let wait = Wait::Receive {
                filter,
                timeout: timer,
                peer,
            };
            if let Err(err) = self.block(slot, wait) {
                if let Some(t) = timer {
                    self.state().cancel_timeout(me, t);
                }
                return Err(err);
            }
        }
    }

    pub(crate) fn request(
        &self,
        me: ActorId,
        to: ActorId,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Message<'_>> {
        self.current_slot(me)?;
        if to == me {
            return Err(Error::InvalidArgument("request to self"));
        }
        let tag = self.next_request_tag();
        self.state()
            .deliver(me, to, Header::new(Class::Request, tag), payload, None)?;
        let filter = Filter::any().sender(to).class(Class::Reply).tag(tag);
        self.receive(me, filter, timeout, Some(to))
    }

    pub(crate) fn reply(&self, me: ActorId, original: &Message<'_>, payload: &[u8]) -> Result<()> {
        self.current_slot(me)?;
        if original.owner() != me || original.class() != Class::Request {
            return Err(Error::InvalidArgument("reply target is not a request"));
        }
        self.state().deliver(
            me,
            original.sender(),
            Header::new(Class::Reply, original.tag()),
            payload,
            None,
        )
    }

    pub(crate) fn send_sync(&self, me: ActorId, to: ActorId, tag: u32, payload: &[u8]) -> Result<()> {
        let slot = self.current_slot(me)?;
        if to == me {
            return Err(Error::InvalidArgument("synchronous send to self"));
        }
        if tag > MAX_USER_TAG {
            return Err(Error::InvalidArgument("tag collides with runtime tags"));
        }
        let token = {
            let mut st = self.state();
            st.next_sync_token += 1;
            let token = st.next_sync_token;
            st.deliver(me, to, Header::new(Class::Notify, tag), payload, Some(token))?;
            token
        };
        self.block(slot, Wait::SyncSend { token, target: to })
    }

    /// Return a message buffer; called from [`Message`]'s `Drop`.
    pub(crate) fn release_message(
        &self,
        owner: ActorId,
        sender: ActorId,
        buf: NonNull<u8>,
        sync: Option<u64>,
    ) {
        // Only reachable while the state is borrowed if a handle is dropped
        // from inside the kernel; leaking the buffer beats panicking there.
        let Some(mut st) = self.try_state() else {
            return;
        };
        if let Some(index) = st.buffers.index_of(buf.as_ptr()) {
            if st.held.get(index).copied().flatten() != Some(owner) {
                // Reclaimed when the owner was reaped.
                return;
            }
            st.held[index] = None;
        }
        st.buffers.free(buf.as_ptr());
        st.retry_notices();
        if let Some(token) = sync {
            let slot = owner.slot();
            let pending = st
                .actors
                .get_mut(slot)
                .filter(|cb| cb.id == owner)
                .and_then(|cb| cb.active_sync.take_if(|(s, t)| *s == sender && *t == token))
                .is_some();
            if pending {
                st.ack_sync(sender, token);
            }
        }
    }
}
