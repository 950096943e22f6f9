//! The [`Runtime`] handle: construction, spawning from outside the actor
//! world, the run loop and teardown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::actor::ActorId;
use crate::bus::{BusConfig, BusId};
use crate::config::{RuntimeConfig, SpawnOptions};
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::message::{Class, Header, MAX_USER_TAG};
use crate::poller::Waker;
use crate::scheduler::Kernel;

/// Counters kept by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Actors currently allocated.
    pub live: usize,
    /// Message buffers queued or held by a receiver.
    pub buffers_in_use: usize,
    /// Actors spawned since start.
    pub spawned: u64,
    /// Actors reaped since start.
    pub reaped: u64,
    /// Reaped actors whose exit reason was abnormal.
    pub crashed: u64,
    /// Messages queued, including runtime-generated ones.
    pub messages_sent: u64,
    /// Messages taken out of a mailbox by a receive.
    pub messages_received: u64,
    /// Switches from the scheduler into an actor.
    pub context_switches: u64,
}

/// Stops a running [`Runtime`] from any thread.
///
/// The scheduler notices at the top of its next iteration; a scheduler
/// blocked waiting for events is woken.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Request shutdown.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// An actor runtime instance.
///
/// Everything runs on the thread that calls [`run`](Self::run). Dropping the
/// runtime (or calling [`cleanup`](Self::cleanup)) stops every remaining
/// actor and frees all resources.
///
/// ```no_run
/// use hive_runtime::{Ctx, Runtime, RuntimeConfig};
///
/// let rt = Runtime::new(RuntimeConfig::default())?;
/// let echo = rt.spawn(|ctx: &Ctx<'_>| {
///     if let Ok(msg) = ctx.recv(None) {
///         println!("got {:?}", msg.payload());
///     }
///     ctx.exit();
/// })?;
/// rt.notify(echo, 0, b"hello")?;
/// rt.run()?;
/// # Ok::<(), hive_runtime::Error>(())
/// ```
pub struct Runtime {
    kernel: Box<Kernel>,
}

impl Runtime {
    /// Create a runtime with fixed capacities from `config`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the configuration does not validate,
    /// [`Error::Io`] if the event poller cannot be created.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let kernel = Kernel::new(config)?;
        Ok(Runtime { kernel })
    }

    /// The configuration this runtime was built with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.kernel.config
    }

    /// Spawn an actor with default options.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] if the actor table is full or the stack
    /// cannot be allocated; [`Error::Closed`] after teardown began.
    pub fn spawn<F>(&self, body: F) -> Result<ActorId>
    where
        F: for<'a> FnOnce(&Ctx<'a>) + 'static,
    {
        self.spawn_with(SpawnOptions::new(), body)
    }

    /// Spawn an actor with explicit options.
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

    /// Run the scheduler until no actor is left or shutdown is requested.
    ///
    /// May be called again after it returns, e.g. after spawning more
    /// actors.
    ///
    /// # Errors
    ///
    /// [`Error::Deadlock`] when every remaining actor waits for something no
    /// event source can deliver; [`Error::Io`] if polling fails.
    pub fn run(&self) -> Result<()> {
        if self.kernel.state().current.is_some() {
            return Err(Error::InvalidArgument("run called from inside an actor"));
        }
        self.kernel.run()
    }

    /// Ask [`run`](Self::run) to return at its next iteration.
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    /// A `Send + Sync` handle that can stop the runtime from other threads.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.kernel.shutdown),
            waker: self.kernel.state().poller.waker(),
        }
    }

    /// Stop every actor and release all resources now.
    pub fn cleanup(self) {
        drop(self);
    }

    /// Whether `id` names a live actor.
    #[must_use]
    pub fn is_alive(&self, id: ActorId) -> bool {
        self.kernel.state().is_live(id)
    }

    /// Number of allocated actors.
    #[must_use]
    pub fn live_actors(&self) -> usize {
        self.kernel.state().actors.len()
    }

    /// Scheduler counters.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        self.kernel.stats()
    }

    /// Queue a `Notify` message for `to` from [`ActorId::SYSTEM`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown or dead target, a tag above
    /// [`MAX_USER_TAG`] or an oversized payload;
    /// [`Error::ResourceExhausted`] when the message pool is full.
    pub fn notify(&self, to: ActorId, tag: u32, payload: &[u8]) -> Result<()> {
        if tag > MAX_USER_TAG {
            return Err(Error::InvalidArgument("tag collides with runtime tags"));
        }
        self.kernel.state().deliver(
            ActorId::SYSTEM,
            to,
            Header::new(Class::Notify, tag),
            payload,
            None,
        )
    }

    /// Create a bus.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an invalid config,
    /// [`Error::ResourceExhausted`] when the bus table is full.
    pub fn bus_create(&self, config: BusConfig) -> Result<BusId> {
        self.kernel.state().bus_create(config)
    }

    /// Destroy a bus that has no subscribers left.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown bus or one still subscribed.
    pub fn bus_destroy(&self, id: BusId) -> Result<()> {
        self.kernel.state().bus_destroy(id)
    }

    /// Publish `payload` on a bus.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown bus or oversized payload.
    pub fn bus_publish(&self, id: BusId, payload: &[u8]) -> Result<()> {
        self.kernel.state().bus_publish(id, payload)
    }

    /// Entries currently held by a bus, after age expiry.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown bus.
    pub fn bus_entry_count(&self, id: BusId) -> Result<usize> {
        self.kernel.state().bus_entry_count(id)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.kernel.teardown();
        let stats = self.kernel.stats();
        info!(
            spawned = stats.spawned,
            crashed = stats.crashed,
            messages = stats.messages_sent,
            "runtime dropped"
        );
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.kernel.config)
            .field("stats", &self.kernel.stats())
            .finish()
    }
}
