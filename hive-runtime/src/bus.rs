//! Publish/subscribe bus.
//!
//! A bus is a ring of `max_entries` slots backed by its own [`BufferPool`].
//! Entries are numbered by a monotonically increasing sequence; entry `seq`
//! lives in slot `seq % max_entries`, so publishing into a full ring evicts
//! the oldest entry. Each entry records which subscriber slots have read it
//! in a 64-bit mask. A subscriber's cursor starts at the write head when it
//! subscribes: there is no backfill.
//!
//! Entries are reclaimed in three ways: evicted by a newer publish, aged out
//! after `max_age`, or freed eagerly once `max_readers` subscribers have read
//! them (when `max_readers > 0`).

use std::fmt;
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::actor::{ActorId, ActorState, Wait};
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::scheduler::{Kernel, KernelState};
use crate::timer::TimerId;

/// Most subscribers a bus can have; one bit each in an entry's reader mask.
pub const MAX_SUBSCRIBERS: usize = 64;

/// Identity of a bus: `generation << 16 | slot`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId(u32);

impl BusId {
    fn new(generation: u16, slot: usize) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "bus slots fit in 16 bits")]
        let slot = slot as u16;
        BusId((u32::from(generation) << 16) | u32::from(slot))
    }

    fn slot(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }
}

impl fmt::Debug for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusId({}.{})", self.0 >> 16, self.0 & 0xFFFF)
    }
}

/// Shape of a bus, fixed at creation.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Ring capacity.
    pub max_entries: usize,
    /// Largest payload one entry may carry.
    pub entry_size_max: usize,
    /// Subscriber slots, at most [`MAX_SUBSCRIBERS`].
    pub max_subscribers: usize,
    /// Free an entry once this many subscribers have read it; 0 keeps
    /// entries until they are evicted or expire.
    pub max_readers: usize,
    /// Entries older than this are dropped; `None` never expires entries.
    pub max_age: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_entries: 16,
            entry_size_max: 256,
            max_subscribers: 8,
            max_readers: 0,
            max_age: None,
        }
    }
}

impl BusConfig {
    fn validate(&self) -> Result<()> {
        if self.max_entries == 0 || self.entry_size_max == 0 {
            return Err(Error::InvalidArgument("bus needs entries of non-zero size"));
        }
        if self.max_subscribers == 0 || self.max_subscribers > MAX_SUBSCRIBERS {
            return Err(Error::InvalidArgument("max_subscribers must be in 1..=64"));
        }
        if self.max_readers > self.max_subscribers {
            return Err(Error::InvalidArgument("max_readers exceeds max_subscribers"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BusEntry {
    seq: u64,
    buf: NonNull<u8>,
    len: usize,
    published: Instant,
    reads: usize,
    readers: u64,
}

#[derive(Debug, Clone, Copy)]
struct Subscriber {
    actor: ActorId,
    cursor: u64,
    waiting: bool,
}

/// One bus.
#[derive(Debug)]
pub(crate) struct Bus {
    id: BusId,
    config: BusConfig,
    ring: Box<[Option<BusEntry>]>,
    pool: BufferPool,
    subscribers: Box<[Option<Subscriber>]>,
    next_seq: u64,
    count: usize,
}

impl Bus {
    fn new(id: BusId, config: BusConfig) -> Self {
        Bus {
            id,
            ring: std::iter::repeat_with(|| None)
                .take(config.max_entries)
                .collect(),
            pool: BufferPool::new(config.max_entries, config.entry_size_max),
            subscribers: vec![None; config.max_subscribers].into_boxed_slice(),
            next_seq: 0,
            count: 0,
            config,
        }
    }

    #[expect(clippy::cast_possible_truncation, reason = "result is below ring length")]
    fn ring_index(&self, seq: u64) -> usize {
        (seq % self.ring.len() as u64) as usize
    }

    fn free_at(&mut self, index: usize) {
        if let Some(entry) = self.ring[index].take() {
            self.pool.free(entry.buf.as_ptr());
            self.count -= 1;
        }
    }

    fn expire(&mut self, now: Instant) {
        let Some(max_age) = self.config.max_age else {
            return;
        };
        for index in 0..self.ring.len() {
            if self.ring[index]
                .as_ref()
                .is_some_and(|e| now.duration_since(e.published) >= max_age)
            {
                self.free_at(index);
            }
        }
    }

    fn publish(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        if payload.len() > self.config.entry_size_max {
            return Err(Error::InvalidArgument("payload exceeds entry_size_max"));
        }
        self.expire(now);
        let index = self.ring_index(self.next_seq);
        self.free_at(index);
        let buf = self
            .pool
            .alloc()
            .ok_or(Error::ResourceExhausted("bus entries"))?;
        // SAFETY: the buffer holds `entry_size_max` bytes, checked above.
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), buf.as_ptr(), payload.len()) };
        self.ring[index] = Some(BusEntry {
            seq: self.next_seq,
            buf,
            len: payload.len(),
            published: now,
            reads: 0,
            readers: 0,
        });
        self.next_seq += 1;
        self.count += 1;
        Ok(())
    }

    fn subscriber_index(&self, actor: ActorId) -> Option<usize> {
        self.subscribers
            .iter()
            .position(|s| s.is_some_and(|s| s.actor == actor))
    }

    fn subscribe(&mut self, actor: ActorId) -> Result<()> {
        if self.subscriber_index(actor).is_some() {
            return Ok(());
        }
        let slot = self
            .subscribers
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted("bus subscribers"))?;
        self.subscribers[slot] = Some(Subscriber {
            actor,
            cursor: self.next_seq,
            waiting: false,
        });
        Ok(())
    }

    fn unsubscribe(&mut self, actor: ActorId) -> bool {
        match self.subscriber_index(actor) {
            Some(i) => {
                self.subscribers[i] = None;
                true
            }
            None => false,
        }
    }

    fn has_subscribers(&self) -> bool {
        self.subscribers.iter().any(Option::is_some)
    }

    fn read(&mut self, actor: ActorId, out: &mut [u8], now: Instant) -> Result<usize> {
        let sub = self
            .subscriber_index(actor)
            .ok_or(Error::InvalidArgument("not subscribed to bus"))?;
        self.expire(now);
        let bit = 1u64 << sub;
        let oldest = self.next_seq.saturating_sub(self.ring.len() as u64);
        let start = self.subscribers[sub].map_or(self.next_seq, |s| s.cursor.max(oldest));

        for seq in start..self.next_seq {
            let index = self.ring_index(seq);
            let Some(entry) = self.ring[index].as_mut() else {
                continue;
            };
            if entry.seq != seq || entry.readers & bit != 0 {
                continue;
            }
            if entry.len > out.len() {
                return Err(Error::InvalidArgument("read buffer smaller than entry"));
            }
            // SAFETY: the entry's buffer holds `len` payload bytes.
            unsafe { ptr::copy_nonoverlapping(entry.buf.as_ptr(), out.as_mut_ptr(), entry.len) };
            let len = entry.len;
            entry.readers |= bit;
            entry.reads += 1;
            let done = self.config.max_readers > 0 && entry.reads >= self.config.max_readers;
            if let Some(s) = self.subscribers[sub].as_mut() {
                s.cursor = seq + 1;
            }
            if done {
                self.free_at(index);
            }
            return Ok(len);
        }
        if let Some(s) = self.subscribers[sub].as_mut() {
            s.cursor = self.next_seq;
        }
        Err(Error::WouldBlock)
    }

    fn set_waiting(&mut self, actor: ActorId, waiting: bool) {
        if let Some(s) = self
            .subscriber_index(actor)
            .and_then(|i| self.subscribers[i].as_mut())
        {
            s.waiting = waiting;
        }
    }

    fn entry_count(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.count
    }
}

// ── Kernel integration ──────────────────────────────────────────────────────

impl KernelState {
    fn bus_mut(&mut self, id: BusId) -> Result<&mut Bus> {
        self.buses
            .get_mut(id.slot())
            .filter(|b| b.id == id)
            .ok_or(Error::InvalidArgument("unknown bus"))
    }

    pub(crate) fn bus_create(&mut self, config: BusConfig) -> Result<BusId> {
        config.validate()?;
        if self.buses.is_full() {
            return Err(Error::ResourceExhausted("bus table"));
        }
        self.bus_generation = self.bus_generation.wrapping_add(1);
        let placeholder = BusId(0);
        let slot = self
            .buses
            .alloc(Bus::new(placeholder, config))
            .map_err(|_| Error::ResourceExhausted("bus table"))?;
        let id = BusId::new(self.bus_generation, slot);
        if let Some(bus) = self.buses.get_mut(slot) {
            bus.id = id;
        }
        debug!(bus = ?id, "bus created");
        Ok(id)
    }

    pub(crate) fn bus_destroy(&mut self, id: BusId) -> Result<()> {
        if self.bus_mut(id)?.has_subscribers() {
            return Err(Error::InvalidArgument("bus still has subscribers"));
        }
        self.buses.free(id.slot());
        debug!(bus = ?id, "bus destroyed");
        Ok(())
    }

    pub(crate) fn bus_publish(&mut self, id: BusId, payload: &[u8]) -> Result<()> {
        let bus = self.bus_mut(id)?;
        bus.publish(payload, Instant::now())?;
        let subscribers = bus.subscribers.len();
        trace!(bus = ?id, len = payload.len(), "published");
        for i in 0..subscribers {
            let Some(sub) = self.bus_mut(id)?.subscribers[i] else {
                continue;
            };
            if !sub.waiting {
                continue;
            }
            let slot = sub.actor.slot();
            let blocked = self.actors.get(slot).is_some_and(|cb| {
                cb.id == sub.actor
                    && cb.state == ActorState::Waiting
                    && matches!(cb.wait, Some(Wait::Bus { bus, .. }) if bus == id)
            });
            if blocked {
                self.wake(slot, None);
            }
        }
        Ok(())
    }

    pub(crate) fn bus_entry_count(&mut self, id: BusId) -> Result<usize> {
        Ok(self.bus_mut(id)?.entry_count(Instant::now()))
    }

    /// Release every subscription `dead` held.
    pub(crate) fn drop_subscriptions(&mut self, dead: ActorId) {
        for (_, bus) in self.buses.iter_mut() {
            if bus.unsubscribe(dead) {
                debug!(bus = ?bus.id, actor = %dead, "subscription released");
            }
        }
    }
}

impl Kernel {
    pub(crate) fn bus_subscribe(&self, me: ActorId, id: BusId) -> Result<()> {
        self.current_slot(me)?;
        self.state().bus_mut(id)?.subscribe(me)
    }

    pub(crate) fn bus_unsubscribe(&self, me: ActorId, id: BusId) -> Result<()> {
        self.current_slot(me)?;
        self.state().bus_mut(id)?.unsubscribe(me);
        Ok(())
    }

    pub(crate) fn bus_read(&self, me: ActorId, id: BusId, out: &mut [u8]) -> Result<usize> {
        self.current_slot(me)?;
        self.state().bus_mut(id)?.read(me, out, Instant::now())
    }

    /// Read, blocking until a publish or the timeout if nothing is pending.
    pub(crate) fn bus_read_wait(
        &self,
        me: ActorId,
        id: BusId,
        out: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let slot = self.current_slot(me)?;
        let mut timer: Option<TimerId> = None;
        loop {
            let mut st = self.state();
            let read = st
                .bus_mut(id)
                .and_then(|bus| bus.read(me, out, Instant::now()));
            match read {
                Err(Error::WouldBlock) => {}
                other => {
                    if let Some(t) = timer {
                        st.cancel_timeout(me, t);
                    }
                    return other;
                }
            }
            if timer.is_some_and(|t| st.take_tick(me, t)) {
                return Err(Error::Timeout);
            }
            match timeout {
                Some(d) if d.is_zero() => return Err(Error::WouldBlock),
                Some(d) if timer.is_none() => timer = Some(st.start_timer(me, d, None)?),
                _ => {}
            }
            if let Err(err) = st.bus_mut(id).map(|bus| bus.set_waiting(me, true)) {
                if let Some(t) = timer {
                    st.cancel_timeout(me, t);
                }
                return Err(err);
            }
            drop(st);

            let woke = self.block(slot, Wait::Bus { bus: id, timeout: timer });
            let mut st = self.state();
            if let Ok(bus) = st.bus_mut(id) {
                bus.set_waiting(me, false);
            }
            if let Err(err) = woke {
                if let Some(t) = timer {
                    st.cancel_timeout(me, t);
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(max_entries: usize, max_readers: usize) -> Bus {
        Bus::new(
            BusId::new(1, 0),
            BusConfig {
                max_entries,
                entry_size_max: 8,
                max_subscribers: 4,
                max_readers,
                max_age: None,
            },
        )
    }

    fn actor(n: usize) -> ActorId {
        ActorId::new(1, n)
    }

    fn read(bus: &mut Bus, who: ActorId) -> Result<Vec<u8>> {
        let mut out = [0u8; 8];
        let n = bus.read(who, &mut out, Instant::now())?;
        Ok(out[..n].to_vec())
    }

    #[test]
    fn oldest_entry_is_evicted_when_full() {
        let mut b = bus(2, 0);
        b.subscribe(actor(1)).unwrap();
        let now = Instant::now();
        for p in [b"one", b"two", b"thr"] {
            b.publish(p, now).unwrap();
        }
        assert_eq!(b.entry_count(now), 2);
        assert_eq!(read(&mut b, actor(1)).unwrap(), b"two");
        assert_eq!(read(&mut b, actor(1)).unwrap(), b"thr");
        assert!(matches!(read(&mut b, actor(1)), Err(Error::WouldBlock)));
    }

    #[test]
    fn late_subscriber_sees_no_history() {
        let mut b = bus(4, 0);
        let now = Instant::now();
        b.publish(b"old", now).unwrap();
        b.subscribe(actor(1)).unwrap();
        assert!(matches!(read(&mut b, actor(1)), Err(Error::WouldBlock)));
        b.publish(b"new", now).unwrap();
        assert_eq!(read(&mut b, actor(1)).unwrap(), b"new");
    }

    #[test]
    fn entry_freed_after_max_readers() {
        let mut b = bus(4, 2);
        for n in 1..=3 {
            b.subscribe(actor(n)).unwrap();
        }
        let now = Instant::now();
        b.publish(b"x", now).unwrap();
        read(&mut b, actor(1)).unwrap();
        assert_eq!(b.entry_count(now), 1);
        read(&mut b, actor(2)).unwrap();
        assert_eq!(b.entry_count(now), 0);
        assert!(matches!(read(&mut b, actor(3)), Err(Error::WouldBlock)));
        assert!(b.pool.is_empty());
    }

    #[test]
    fn entries_age_out() {
        let mut b = Bus::new(
            BusId::new(1, 0),
            BusConfig {
                max_age: Some(Duration::from_millis(5)),
                ..BusConfig::default()
            },
        );
        b.subscribe(actor(1)).unwrap();
        let t0 = Instant::now();
        b.publish(b"stale", t0).unwrap();
        let later = t0 + Duration::from_millis(10);
        assert_eq!(b.entry_count(later), 0);
        let mut out = [0u8; 8];
        assert!(matches!(b.read(actor(1), &mut out, later), Err(Error::WouldBlock)));
    }

    #[test]
    fn each_subscriber_reads_each_entry_once() {
        let mut b = bus(4, 0);
        b.subscribe(actor(1)).unwrap();
        b.subscribe(actor(2)).unwrap();
        b.publish(b"a", Instant::now()).unwrap();
        assert_eq!(read(&mut b, actor(1)).unwrap(), b"a");
        assert!(matches!(read(&mut b, actor(1)), Err(Error::WouldBlock)));
        assert_eq!(read(&mut b, actor(2)).unwrap(), b"a");
    }

    #[test]
    fn config_and_membership_checks() {
        let mut b = bus(2, 0);
        assert!(matches!(read(&mut b, actor(9)), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            b.publish(&[0; 9], Instant::now()),
            Err(Error::InvalidArgument(_))
        ));
        let too_wide = BusConfig {
            max_subscribers: 65,
            ..BusConfig::default()
        };
        assert!(too_wide.validate().is_err());
        for n in 0..4 {
            b.subscribe(actor(n)).unwrap();
        }
        assert!(matches!(b.subscribe(actor(5)), Err(Error::ResourceExhausted(_))));
        assert!(b.unsubscribe(actor(0)));
        assert!(!b.unsubscribe(actor(0)));
        b.subscribe(actor(5)).unwrap();
    }

    #[test]
    fn bus_ids_carry_generation() {
        let id = BusId::new(3, 7);
        assert_eq!(id.slot(), 7);
        assert_ne!(id, BusId::new(4, 7));
    }

    #[test]
    fn vanished_bus_cancels_the_read_timeout() {
        use std::cell::Cell;
        use std::rc::Rc;

        use crate::config::{RuntimeConfig, SpawnOptions};
        use crate::ctx::Ctx;

        let k = Kernel::new(RuntimeConfig::default().with_max_actors(2)).unwrap();
        let outcome = Rc::new(Cell::new(None));
        let sink = outcome.clone();
        let reader = k
            .spawn(
                SpawnOptions::new(),
                Box::new(move |ctx: &Ctx<'_>| {
                    let id = ctx.bus_create(BusConfig::default()).unwrap();
                    ctx.bus_subscribe(id).unwrap();
                    let mut out = [0u8; 8];
                    let res = ctx.bus_read_wait(id, &mut out, Some(Duration::from_secs(30)));
                    let disarmed = ctx.kernel().state().sources.is_empty();
                    sink.set(Some((matches!(res, Err(Error::InvalidArgument(_))), disarmed)));
                    ctx.exit();
                }),
            )
            .unwrap();
        k.spawn(
            SpawnOptions::new(),
            Box::new(move |ctx: &Ctx<'_>| {
                let mut st = ctx.kernel().state();
                let index = st.buses.position(|_| true).unwrap();
                st.buses.free(index);
                st.wake(reader.slot(), None);
                drop(st);
                ctx.exit();
            }),
        )
        .unwrap();
        k.run().unwrap();
        assert_eq!(outcome.get(), Some((true, true)));
        assert_eq!(k.stats().crashed, 0);
    }
}
