//! Runtime and per-actor configuration.
//!
//! Every capacity in the runtime is fixed when [`Runtime::new`] runs: the
//! actor table, the message pool and the link, monitor, timer and bus tables
//! are all allocated up front from a [`RuntimeConfig`]. Nothing grows after
//! initialisation, so a full pool surfaces as
//! [`Error::ResourceExhausted`](crate::Error::ResourceExhausted) instead of an
//! allocation.
//!
//! [`Runtime::new`]: crate::Runtime::new

use std::time::Duration;

use crate::error::{Error, Result};

/// Smallest stack an actor may request.
pub const MIN_STACK_SIZE: usize = 16 * 1024;
/// Upper bound on the actor table; slot indices must fit in 16 bits.
pub const MAX_ACTORS_LIMIT: usize = u16::MAX as usize;

// ── Priority ────────────────────────────────────────────────────────────────

/// Scheduling priority of an actor.
///
/// Each scheduling round visits the levels in declaration order and runs at
/// most one ready actor per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Runs first in every round.
    Critical = 0,
    /// Runs after critical actors.
    High = 1,
    /// The default level.
    #[default]
    Normal = 2,
    /// Runs last in every round.
    Low = 3,
}

impl Priority {
    /// All levels, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

// ── StackSource ─────────────────────────────────────────────────────────────

/// Where actor stacks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackSource {
    /// Anonymous `mmap` region with a `PROT_NONE` guard page below the stack.
    #[default]
    Mmap,
    /// Global allocator. Overflow detection relies on canaries alone.
    Heap,
}

// ── RuntimeConfig ───────────────────────────────────────────────────────────

/// Capacities and tunables fixed at runtime initialisation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Size of the actor table.
    pub max_actors: usize,
    /// Default stack size for spawned actors, in bytes.
    pub stack_size: usize,
    /// Default stack source for spawned actors.
    pub stack_source: StackSource,
    /// Number of message buffers (and mailbox entries) in the shared pool.
    pub message_capacity: usize,
    /// Largest payload a single message may carry, in bytes.
    pub message_size_max: usize,
    /// Link entries available. Each link consumes two.
    pub max_links: usize,
    /// Monitor entries available.
    pub max_monitors: usize,
    /// Timers that may be armed at once, including receive timeouts.
    pub max_timers: usize,
    /// Buses that may exist at once.
    pub max_buses: usize,
    /// Depth of the file I/O job and completion queues.
    pub io_queue_depth: usize,
    /// Upper bound on one idle wait of the scheduler.
    pub idle_poll: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_actors: 64,
            stack_size: 256 * 1024,
            stack_source: StackSource::default(),
            message_capacity: 1024,
            message_size_max: 256,
            max_links: 256,
            max_monitors: 256,
            max_timers: 256,
            max_buses: 16,
            io_queue_depth: 64,
            idle_poll: Duration::from_millis(10),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `HIVE_*` environment variables.
    ///
    /// Recognised: `HIVE_MAX_ACTORS`, `HIVE_STACK_SIZE`,
    /// `HIVE_MESSAGE_CAPACITY`, `HIVE_MESSAGE_SIZE_MAX`, `HIVE_IDLE_POLL_MS`.
    /// Values that do not parse as a positive integer are ignored with a
    /// warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_usize("HIVE_MAX_ACTORS") {
            config.max_actors = n.min(MAX_ACTORS_LIMIT);
        }
        if let Some(n) = env_usize("HIVE_STACK_SIZE") {
            config.stack_size = n.max(MIN_STACK_SIZE);
        }
        if let Some(n) = env_usize("HIVE_MESSAGE_CAPACITY") {
            config.message_capacity = n;
        }
        if let Some(n) = env_usize("HIVE_MESSAGE_SIZE_MAX") {
            config.message_size_max = n;
        }
        if let Some(ms) = env_usize("HIVE_IDLE_POLL_MS") {
            config.idle_poll = Duration::from_millis(ms as u64);
        }
        config
    }

    /// Set the actor table size.
    #[must_use]
    pub fn with_max_actors(mut self, n: usize) -> Self {
        self.max_actors = n;
        self
    }

    /// Set the default actor stack size.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the default stack source.
    #[must_use]
    pub fn with_stack_source(mut self, source: StackSource) -> Self {
        self.stack_source = source;
        self
    }

    /// Set the number of message buffers.
    #[must_use]
    pub fn with_message_capacity(mut self, n: usize) -> Self {
        self.message_capacity = n;
        self
    }

    /// Set the largest message payload.
    #[must_use]
    pub fn with_message_size_max(mut self, bytes: usize) -> Self {
        self.message_size_max = bytes;
        self
    }

    /// Set the number of link entries.
    #[must_use]
    pub fn with_max_links(mut self, n: usize) -> Self {
        self.max_links = n;
        self
    }

    /// Set the number of monitor entries.
    #[must_use]
    pub fn with_max_monitors(mut self, n: usize) -> Self {
        self.max_monitors = n;
        self
    }

    /// Set the number of timers.
    #[must_use]
    pub fn with_max_timers(mut self, n: usize) -> Self {
        self.max_timers = n;
        self
    }

    /// Set the number of buses.
    #[must_use]
    pub fn with_max_buses(mut self, n: usize) -> Self {
        self.max_buses = n;
        self
    }

    /// Set the file I/O queue depth.
    #[must_use]
    pub fn with_io_queue_depth(mut self, n: usize) -> Self {
        self.io_queue_depth = n;
        self
    }

    /// Set the idle wait bound.
    #[must_use]
    pub fn with_idle_poll(mut self, idle: Duration) -> Self {
        self.idle_poll = idle;
        self
    }

    /// Reject configurations the runtime cannot be built from.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_actors == 0 || self.max_actors > MAX_ACTORS_LIMIT {
            return Err(Error::InvalidArgument("max_actors must be in 1..=65535"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidArgument("stack_size below minimum"));
        }
        if self.message_size_max == 0 {
            return Err(Error::InvalidArgument("message_size_max must be non-zero"));
        }
        if self.io_queue_depth == 0 {
            return Err(Error::InvalidArgument("io_queue_depth must be non-zero"));
        }
        if self.idle_poll.is_zero() {
            return Err(Error::InvalidArgument("idle_poll must be non-zero"));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    match val.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(var = name, value = %val, "invalid value, using default");
            None
        }
    }
}

// ── SpawnOptions ────────────────────────────────────────────────────────────

/// Per-actor options for [`Runtime::spawn_with`](crate::Runtime::spawn_with)
/// and [`Ctx::spawn_with`](crate::Ctx::spawn_with).
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Stack size; the runtime default when `None`.
    pub stack_size: Option<usize>,
    /// Stack source; the runtime default when `None`.
    pub stack_source: Option<StackSource>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Name used in log output.
    pub name: Option<String>,
}

impl SpawnOptions {
    /// Options with every field at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stack size.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Set the stack source.
    #[must_use]
    pub fn stack_source(mut self, source: StackSource) -> Self {
        self.stack_source = Some(source);
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the log name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
