//! Single-threaded cooperative actor runtime.
//!
//! Actors are stackful coroutines that share one OS thread. Each owns a
//! private stack and a mailbox; they communicate only by copying messages
//! through a fixed-capacity pool, and switch only at explicit points: a
//! yield, a blocking receive, a synchronous send, a timer wait or an I/O
//! call. Every table (actors, messages, links, monitors, timers, buses) is
//! sized once from [`RuntimeConfig`], so steady-state operation never
//! allocates and exhaustion is reported as [`Error::ResourceExhausted`].
//!
//! # Architecture
//!
//! ```text
//! Layer 0: error, config, pool, list (no internal deps)
//! Layer 1: coro (stacks, context switch), poller (epoll, timerfd, eventfd),
//!          signal (guard page fault recovery)
//! Layer 2: actor, message, scheduler (L0+L1)
//! Layer 3: mailbox, link, monitor, timer, bus (L2)
//! Layer 4: io (file worker thread), net (non-blocking TCP)
//! Layer 5: runtime, ctx (public surface)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hive_runtime::{Ctx, Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::default())?;
//! let server = rt.spawn(|ctx: &Ctx<'_>| {
//!     while let Ok(req) = ctx.recv(Some(Duration::from_secs(1))) {
//!         let _ = ctx.reply(&req, req.payload());
//!     }
//!     ctx.exit();
//! })?;
//! rt.spawn(move |ctx: &Ctx<'_>| {
//!     let answer = ctx.request(server, b"ping", None).unwrap();
//!     assert_eq!(answer.payload(), b"ping");
//!     ctx.exit();
//! })?;
//! rt.run()?;
//! # Ok::<(), hive_runtime::Error>(())
//! ```
//!
//! # Platform
//!
//! Linux on `x86_64` or `aarch64`: the context switch is hand-written for
//! those two ABIs and the event loop is built on epoll.

#[cfg(not(target_os = "linux"))]
compile_error!("hive-runtime requires Linux (epoll, timerfd, eventfd)");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("hive-runtime supports only x86_64 and aarch64");

// ── Foundations ─────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
mod list;
mod pool;

// ── Execution ───────────────────────────────────────────────────────────────

pub mod actor;
mod coro;
pub mod message;
mod poller;
mod scheduler;
mod signal;

// ── IPC and fault propagation ───────────────────────────────────────────────

pub mod bus;
mod link;
mod mailbox;
pub mod monitor;
pub mod timer;

// ── External collaborators ──────────────────────────────────────────────────

pub mod io;
pub mod net;

// ── Public surface ──────────────────────────────────────────────────────────

pub mod ctx;
pub mod runtime;

pub use actor::{ActorId, ActorState};
pub use bus::{BusConfig, BusId, MAX_SUBSCRIBERS};
pub use config::{Priority, RuntimeConfig, SpawnOptions, StackSource};
pub use ctx::Ctx;
pub use error::{Error, Result};
pub use io::{FileHandle, OpenMode};
pub use message::{
    decode_exit, Class, ExitNotice, ExitReason, Filter, Message, DOWN_TAG, EXIT_TAG,
    MAX_USER_TAG,
};
pub use monitor::MonitorRef;
pub use net::{TcpListener, TcpStream};
pub use runtime::{Runtime, RuntimeStats, ShutdownHandle};
pub use timer::TimerId;
