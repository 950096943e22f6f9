//! [`Ctx`]: what an actor body sees of the runtime.
//!
//! Every call is made from the actor's own coroutine. Blocking calls park
//! the actor and switch to the scheduler; other actors run until the
//! awaited event arrives.

use std::net::SocketAddr;
use std::panic;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::actor::{ActorId, ExitSignal};
use crate::bus::{BusConfig, BusId};
use crate::config::SpawnOptions;
use crate::error::{Error, Result};
use crate::io::{FileHandle, OpenMode};
use crate::message::{Class, ExitReason, Filter, Message};
use crate::monitor::MonitorRef;
use crate::net::{TcpListener, TcpStream};
use crate::scheduler::Kernel;
use crate::timer::TimerId;

/// Handle passed to an actor body.
///
/// Only valid on the actor it was created for; calls that need the running
/// actor fail with [`Error::InvalidArgument`] otherwise.
#[derive(Clone, Copy)]
pub struct Ctx<'k> {
    kernel: &'k Kernel,
    me: ActorId,
}

impl<'k> Ctx<'k> {
    pub(crate) fn new(kernel: &'k Kernel, me: ActorId) -> Self {
        Ctx { kernel, me }
    }

    #[cfg(test)]
    pub(crate) fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// This actor's id.
    #[must_use]
    pub fn id(&self) -> ActorId {
        self.me
    }

    /// Spawn a sibling actor with default options.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] if the actor table is full or the stack
    /// cannot be allocated.
    pub fn spawn<F>(&self, body: F) -> Result<ActorId>
    where
        F: for<'a> FnOnce(&Ctx<'a>) + 'static,
    {
        self.spawn_with(SpawnOptions::new(), body)
    }

    /// Spawn with explicit options.
    ///
    /// # Errors
    ///
    /// As [`spawn`](Self::spawn).
    pub fn spawn_with<F>(&self, options: SpawnOptions, body: F) -> Result<ActorId>
    where
        F: for<'a> FnOnce(&Ctx<'a>) + 'static,
    {
        self.kernel.spawn(options, Box::new(body))
    }

    /// Let other ready actors run; this one stays ready.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when not called from this actor.
    pub fn yield_now(&self) -> Result<()> {
        self.kernel.yield_now(self.me)
    }

    /// Terminate normally. Unwinds the actor's stack, dropping everything
    /// it owns.
    pub fn exit(&self) -> ! {
        self.exit_with(ExitReason::Normal)
    }

    /// Terminate with `reason`. Linked and monitoring actors see it.
    pub fn exit_with(&self, reason: ExitReason) -> ! {
        panic::resume_unwind(Box::new(ExitSignal(reason)))
    }

    /// Whether `id` names a live actor.
    #[must_use]
    pub fn is_alive(&self, id: ActorId) -> bool {
        self.kernel.state().is_live(id)
    }

    /// Ask the scheduler to stop after the current round.
    pub fn shutdown(&self) {
        self.kernel.shutdown.store(true, Ordering::Release);
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Send `payload` to `to` with tag 0.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown or dead target or an
    /// oversized payload; [`Error::ResourceExhausted`] when the message pool
    /// is full.
    pub fn notify(&self, to: ActorId, payload: &[u8]) -> Result<()> {
        self.notify_tagged(to, 0, payload)
    }

    /// Send `payload` to `to` with a user tag.
    ///
    /// # Errors
    ///
    /// As [`notify`](Self::notify); also [`Error::InvalidArgument`] for a tag
    /// above [`MAX_USER_TAG`](crate::MAX_USER_TAG).
    pub fn notify_tagged(&self, to: ActorId, tag: u32, payload: &[u8]) -> Result<()> {
        self.kernel.notify(self.me, to, tag, payload)
    }

    /// Receive the oldest message.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when `timeout` elapses first,
    /// [`Error::WouldBlock`] for a zero timeout with an empty mailbox.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Message<'k>> {
        self.recv_match(Filter::any(), timeout)
    }

    /// Receive without blocking.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] if the mailbox is empty.
    pub fn try_recv(&self) -> Result<Message<'k>> {
        self.recv(Some(Duration::ZERO))
    }

    /// Receive the oldest message matching `filter`, leaving others queued.
    ///
    /// # Errors
    ///
    /// As [`recv`](Self::recv).
    pub fn recv_match(&self, filter: Filter, timeout: Option<Duration>) -> Result<Message<'k>> {
        self.kernel.receive(self.me, filter, timeout, None)
    }

    /// Send a request to `to` and wait for its reply.
    ///
    /// Other messages arriving meanwhile stay queued.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a request to self or an unknown
    /// target; [`Error::Closed`] if `to` dies before replying;
    /// [`Error::Timeout`] when `timeout` elapses.
    pub fn request(&self, to: ActorId, payload: &[u8], timeout: Option<Duration>) -> Result<Message<'k>> {
        self.kernel.request(self.me, to, payload, timeout)
    }

    /// Answer a `Request`-class message.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `request` is not a request received by
    /// this actor or its sender is gone.
    pub fn reply(&self, request: &Message<'_>, payload: &[u8]) -> Result<()> {
        self.kernel.reply(self.me, request, payload)
    }

    /// Send and block until the receiver has released the message.
    ///
    /// # Errors
    ///
    /// As [`notify_tagged`](Self::notify_tagged), plus
    /// [`Error::InvalidArgument`] for a send to self and [`Error::Closed`]
    /// if the receiver dies first.
    pub fn send_sync(&self, to: ActorId, tag: u32, payload: &[u8]) -> Result<()> {
        self.kernel.send_sync(self.me, to, tag, payload)
    }

    /// Release a received message now, unblocking a synchronous sender.
    pub fn release(&self, msg: Message<'k>) {
        drop(msg);
    }

    // ── Links and monitors ──────────────────────────────────────────────

    /// Link with `target`: each side is told when the other dies.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for self or a dead target,
    /// [`Error::ResourceExhausted`] when the link pool is full.
    pub fn link(&self, target: ActorId) -> Result<()> {
        self.kernel.link(self.me, target)
    }

    /// Remove a link. A missing link is not an error.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when not called from this actor.
    pub fn unlink(&self, target: ActorId) -> Result<()> {
        self.kernel.unlink(self.me, target)
    }

    /// Be told when `target` dies.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for self or a dead target,
    /// [`Error::ResourceExhausted`] when the monitor pool is full.
    pub fn monitor(&self, target: ActorId) -> Result<MonitorRef> {
        self.kernel.monitor(self.me, target)
    }

    /// Cancel a monitor. An unknown ref is not an error.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when not called from this actor.
    pub fn demonitor(&self, reference: MonitorRef) -> Result<()> {
        self.kernel.demonitor(self.me, reference)
    }

    // ── Timers ──────────────────────────────────────────────────────────

    fn start_timer(&self, delay: Duration, interval: Option<Duration>) -> Result<TimerId> {
        self.kernel.current_slot(self.me)?;
        self.kernel.state().start_timer(self.me, delay, interval)
    }

    /// One `Timer`-class message after `delay`, tagged with the timer id.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] when the timer table is full.
    pub fn after(&self, delay: Duration) -> Result<TimerId> {
        self.start_timer(delay, None)
    }

    /// A `Timer`-class message every `interval` until cancelled.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero interval,
    /// [`Error::ResourceExhausted`] when the timer table is full.
    pub fn every(&self, interval: Duration) -> Result<TimerId> {
        self.start_timer(interval, Some(interval))
    }

    /// Disarm a timer and drop its undelivered ticks.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if this actor owns no such timer.
    pub fn cancel_timer(&self, id: TimerId) -> Result<()> {
        self.kernel.current_slot(self.me)?;
        self.kernel.state().cancel_timer(self.me, id)
    }

    /// Block for `duration`. Messages arriving meanwhile stay queued.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] when the timer table is full.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return self.yield_now();
        }
        // Timer ids start at 1: no tick ever carries tag 0.
        let nothing = Filter::any()
            .sender(ActorId::SYSTEM)
            .class(Class::Timer)
            .tag(0);
        match self.recv_match(nothing, Some(duration)) {
            Err(Error::Timeout) => Ok(()),
            other => other.map(drop),
        }
    }

    // ── Bus ─────────────────────────────────────────────────────────────

    /// Create a bus.
    ///
    /// # Errors
    ///
    /// See [`Runtime::bus_create`](crate::Runtime::bus_create).
    pub fn bus_create(&self, config: BusConfig) -> Result<BusId> {
        self.kernel.state().bus_create(config)
    }

    /// Destroy a bus with no subscribers.
    ///
    /// # Errors
    ///
    /// See [`Runtime::bus_destroy`](crate::Runtime::bus_destroy).
    pub fn bus_destroy(&self, id: BusId) -> Result<()> {
        self.kernel.state().bus_destroy(id)
    }

    /// Publish on a bus, waking blocked subscribers.
    ///
    /// # Errors
    ///
    /// See [`Runtime::bus_publish`](crate::Runtime::bus_publish).
    pub fn bus_publish(&self, id: BusId, payload: &[u8]) -> Result<()> {
        self.kernel.state().bus_publish(id, payload)
    }

    /// Subscribe; only entries published from now on are visible.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown bus,
    /// [`Error::ResourceExhausted`] when the bus has no free subscriber slot.
    pub fn bus_subscribe(&self, id: BusId) -> Result<()> {
        self.kernel.bus_subscribe(self.me, id)
    }

    /// Unsubscribe. Not subscribed is not an error.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown bus.
    pub fn bus_unsubscribe(&self, id: BusId) -> Result<()> {
        self.kernel.bus_unsubscribe(self.me, id)
    }

    /// Copy the next unread entry into `out` and return its length.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] when nothing is unread,
    /// [`Error::InvalidArgument`] if not subscribed or `out` is too small.
    pub fn bus_read(&self, id: BusId, out: &mut [u8]) -> Result<usize> {
        self.kernel.bus_read(self.me, id, out)
    }

    /// As [`bus_read`](Self::bus_read), blocking until a publish.
    ///
    /// # Errors
    ///
    /// As [`bus_read`](Self::bus_read), with [`Error::Timeout`] instead of
    /// `WouldBlock` once `timeout` elapses.
    pub fn bus_read_wait(&self, id: BusId, out: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.kernel.bus_read_wait(self.me, id, out, timeout)
    }

    /// Entries currently held by a bus.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown bus.
    pub fn bus_entry_count(&self, id: BusId) -> Result<usize> {
        self.kernel.state().bus_entry_count(id)
    }

    // ── Files ───────────────────────────────────────────────────────────

    /// Open a file on the I/O worker.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] from the open, [`Error::ResourceExhausted`] when the
    /// I/O queue is full.
    pub fn file_open(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<FileHandle> {
        self.kernel.file_open(self.me, path.as_ref(), mode)
    }

    /// Read up to `max` bytes; empty at end of file.
    ///
    /// # Errors
    ///
    /// As [`file_open`](Self::file_open); [`Error::Closed`] for a closed
    /// handle.
    pub fn file_read(&self, file: &mut FileHandle, max: usize) -> Result<Vec<u8>> {
        self.kernel.file_read(self.me, file, max)
    }

    /// Write `data`, returning how much was written.
    ///
    /// # Errors
    ///
    /// As [`file_read`](Self::file_read).
    pub fn file_write(&self, file: &mut FileHandle, data: &[u8]) -> Result<usize> {
        self.kernel.file_write(self.me, file, data)
    }

    /// Flush file data and metadata to disk.
    ///
    /// # Errors
    ///
    /// As [`file_read`](Self::file_read).
    pub fn file_sync(&self, file: &mut FileHandle) -> Result<()> {
        self.kernel.file_sync(self.me, file)
    }

    /// Close on the worker, reporting errors from the close.
    ///
    /// # Errors
    ///
    /// As [`file_read`](Self::file_read).
    pub fn file_close(&self, file: FileHandle) -> Result<()> {
        self.kernel.file_close(self.me, file)
    }

    // ── TCP ─────────────────────────────────────────────────────────────

    /// Bind and listen on `addr`.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] from socket, bind or listen.
    pub fn tcp_listen(&self, addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
        self.kernel.tcp_listen(self.me, addr, backlog)
    }

    /// Accept one connection, blocking until a peer connects.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] from accept.
    pub fn tcp_accept(&self, listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
        self.kernel.tcp_accept(self.me, listener)
    }

    /// Connect to `addr`, blocking until established.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the connection fails.
    pub fn tcp_connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        self.kernel.tcp_connect(self.me, addr)
    }

    /// Receive into `buf`; `0` means the peer closed.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] from recv.
    pub fn tcp_recv(&self, stream: &TcpStream, buf: &mut [u8]) -> Result<usize> {
        self.kernel.tcp_recv(self.me, stream, buf)
    }

    /// Send from `data`, returning how much the kernel accepted.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] from send.
    pub fn tcp_send(&self, stream: &TcpStream, data: &[u8]) -> Result<usize> {
        self.kernel.tcp_send(self.me, stream, data)
    }

    /// Send all of `data`.
    ///
    /// # Errors
    ///
    /// As [`tcp_send`](Self::tcp_send); [`Error::Closed`] if the peer stops
    /// accepting bytes.
    pub fn tcp_send_all(&self, stream: &TcpStream, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.tcp_send(stream, data)? {
                0 => return Err(Error::Closed),
                n => data = &data[n..],
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Ctx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx").field("id", &self.me).finish_non_exhaustive()
    }
}
