//! Timers, receive timeouts and the publish/subscribe bus.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use common::{log, run_clean, runtime};
use hive_runtime::{ActorId, BusConfig, Class, Ctx, Error, Filter, Runtime, RuntimeConfig};

const TICK: Duration = Duration::from_millis(10);

#[test]
fn one_shot_timer_delivers_a_tick() {
    let rt = runtime(2);
    let ok = Rc::new(Cell::new(false));
    let flag = ok.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let start = Instant::now();
        let timer = ctx.after(TICK).unwrap();
        let msg = ctx.recv(None).unwrap();
        assert_eq!(msg.sender(), ActorId::SYSTEM);
        assert_eq!((msg.class(), msg.tag()), (Class::Timer, timer.tag()));
        assert!(msg.payload().is_empty());
        assert!(start.elapsed() >= TICK);
        drop(msg);
        // One-shot timers remove themselves after firing.
        assert!(matches!(ctx.cancel_timer(timer), Err(Error::InvalidArgument(_))));
        flag.set(true);
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert!(ok.get());
}

#[test]
fn periodic_timer_ticks_until_cancelled() {
    let rt = runtime(2);
    let ticks = Rc::new(Cell::new(0));
    let count = ticks.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let timer = ctx.every(Duration::from_millis(3)).unwrap();
        let filter = Filter::any().class(Class::Timer).tag(timer.tag());
        for _ in 0..3 {
            drop(ctx.recv_match(filter, None).unwrap());
            count.set(count.get() + 1);
        }
        ctx.cancel_timer(timer).unwrap();
        assert!(matches!(
            ctx.recv_match(filter, Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(ticks.get(), 3);
}

#[test]
fn zero_interval_is_rejected() {
    let rt = runtime(2);
    rt.spawn(|ctx: &Ctx<'_>| {
        assert!(matches!(ctx.every(Duration::ZERO), Err(Error::InvalidArgument(_))));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
}

#[test]
fn receive_timeout_and_non_blocking_receive() {
    let rt = runtime(2);
    rt.spawn(|ctx: &Ctx<'_>| {
        assert!(matches!(ctx.try_recv(), Err(Error::WouldBlock)));
        let start = Instant::now();
        assert!(matches!(ctx.recv(Some(TICK)), Err(Error::Timeout)));
        assert!(start.elapsed() >= TICK);
        // The consumed timeout leaves nothing behind.
        assert!(matches!(ctx.try_recv(), Err(Error::WouldBlock)));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
}

#[test]
fn message_arriving_before_the_timeout_wins() {
    let rt = runtime(4);
    let got = Rc::new(Cell::new(false));
    let flag = got.clone();
    let waiter = rt
        .spawn(move |ctx: &Ctx<'_>| {
            let msg = ctx.recv(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(msg.payload(), b"early");
            drop(msg);
            // The armed timeout was cancelled with its tick.
            assert!(matches!(ctx.recv(Some(TICK)), Err(Error::Timeout)));
            flag.set(true);
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.sleep(Duration::from_millis(2)).unwrap();
        ctx.notify(waiter, b"early").unwrap();
        ctx.exit();
    })
    .unwrap();
    let start = Instant::now();
    run_clean(&rt);
    assert!(got.get());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn sleep_leaves_other_messages_queued() {
    let rt = runtime(2);
    rt.spawn(|ctx: &Ctx<'_>| {
        let me = ctx.id();
        ctx.notify(me, b"kept").unwrap();
        let start = Instant::now();
        ctx.sleep(TICK).unwrap();
        assert!(start.elapsed() >= TICK);
        let msg = ctx.try_recv().unwrap();
        assert_eq!(msg.payload(), b"kept");
        drop(msg);
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
}

#[test]
fn timers_of_a_dead_actor_are_cancelled() {
    let rt = runtime(2);
    rt.spawn(|ctx: &Ctx<'_>| {
        ctx.every(Duration::from_millis(1)).unwrap();
        ctx.after(Duration::from_secs(60)).unwrap();
        ctx.exit();
    })
    .unwrap();
    let start = Instant::now();
    run_clean(&rt);
    // Nothing is left to wait for once the owner is gone.
    assert!(start.elapsed() < Duration::from_secs(60));
    assert_eq!(rt.live_actors(), 0);
}

fn ring(max_entries: usize) -> BusConfig {
    BusConfig {
        max_entries,
        entry_size_max: 16,
        ..BusConfig::default()
    }
}

#[test]
fn full_bus_evicts_the_oldest_entry() {
    let rt = runtime(2);
    let bus = rt.bus_create(ring(2)).unwrap();
    let seen = log();
    let sink = seen.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.bus_subscribe(bus).unwrap();
        for payload in [b"one", b"two", b"six"] {
            ctx.bus_publish(bus, payload).unwrap();
        }
        assert_eq!(ctx.bus_entry_count(bus).unwrap(), 2);
        let mut out = [0u8; 16];
        loop {
            match ctx.bus_read(bus, &mut out) {
                Ok(n) => sink.borrow_mut().push(out[..n].to_vec()),
                Err(Error::WouldBlock) => break,
                Err(err) => panic!("unexpected {err}"),
            }
        }
        ctx.bus_unsubscribe(bus).unwrap();
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(*seen.borrow(), [b"two".to_vec(), b"six".to_vec()]);
    rt.bus_destroy(bus).unwrap();
}

#[test]
fn late_subscriber_sees_no_history() {
    let rt = runtime(2);
    let bus = rt.bus_create(ring(4)).unwrap();
    rt.bus_publish(bus, b"old").unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.bus_subscribe(bus).unwrap();
        let mut out = [0u8; 16];
        assert!(matches!(ctx.bus_read(bus, &mut out), Err(Error::WouldBlock)));
        ctx.bus_publish(bus, b"new").unwrap();
        let n = ctx.bus_read(bus, &mut out).unwrap();
        assert_eq!(&out[..n], b"new");
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
}

#[test]
fn blocked_reader_is_woken_by_publish() {
    let rt = runtime(4);
    let bus = rt.bus_create(ring(4)).unwrap();
    let got = log();
    let sink = got.clone();
    let reader = rt
        .spawn(move |ctx: &Ctx<'_>| {
            ctx.bus_subscribe(bus).unwrap();
            let mut out = [0u8; 16];
            let n = ctx.bus_read_wait(bus, &mut out, None).unwrap();
            sink.borrow_mut().push(out[..n].to_vec());
            assert!(matches!(
                ctx.bus_read_wait(bus, &mut out, Some(TICK)),
                Err(Error::Timeout)
            ));
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.yield_now().unwrap();
        assert!(ctx.is_alive(reader));
        ctx.bus_publish(bus, b"wake").unwrap();
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(*got.borrow(), [b"wake".to_vec()]);
}

#[test]
fn destroy_fails_while_subscribed_and_death_unsubscribes() {
    let rt = runtime(2);
    let bus = rt.bus_create(ring(2)).unwrap();
    let refused = Rc::new(Cell::new(false));
    let flag = refused.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.bus_subscribe(bus).unwrap();
        flag.set(matches!(ctx.bus_destroy(bus), Err(Error::InvalidArgument(_))));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert!(refused.get());
    rt.bus_destroy(bus).unwrap();
    assert!(matches!(rt.bus_publish(bus, b"x"), Err(Error::InvalidArgument(_))));
}

#[test]
fn entries_are_freed_after_max_readers() {
    let rt = runtime(4);
    let bus = rt
        .bus_create(BusConfig {
            max_readers: 2,
            ..ring(4)
        })
        .unwrap();
    for _ in 0..2 {
        rt.spawn(move |ctx: &Ctx<'_>| {
            ctx.bus_subscribe(bus).unwrap();
            let mut out = [0u8; 16];
            ctx.bus_read_wait(bus, &mut out, None).unwrap();
            ctx.bus_unsubscribe(bus).unwrap();
            ctx.exit();
        })
        .unwrap();
    }
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.yield_now().unwrap();
        ctx.bus_publish(bus, b"shared").unwrap();
        assert_eq!(ctx.bus_entry_count(bus).unwrap(), 1);
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(rt.bus_entry_count(bus).unwrap(), 0);
}

#[test]
fn bounded_waits_expire_with_the_message_pool_exhausted() {
    common::init_tracing();
    let rt = Runtime::new(
        RuntimeConfig::default()
            .with_max_actors(2)
            .with_message_capacity(2),
    )
    .unwrap();
    let finished = Rc::new(Cell::new(false));
    let flag = finished.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let me = ctx.id();
        ctx.notify(me, b"a").unwrap();
        ctx.notify(me, b"b").unwrap();
        assert!(matches!(ctx.notify(me, b"c"), Err(Error::ResourceExhausted(_))));

        let start = Instant::now();
        assert!(matches!(
            ctx.recv_match(Filter::any().tag(99), Some(TICK)),
            Err(Error::Timeout)
        ));
        let bus = ctx.bus_create(ring(4)).unwrap();
        ctx.bus_subscribe(bus).unwrap();
        let mut out = [0u8; 16];
        assert!(matches!(
            ctx.bus_read_wait(bus, &mut out, Some(TICK)),
            Err(Error::Timeout)
        ));
        ctx.sleep(TICK).unwrap();
        assert!(start.elapsed() >= 3 * TICK);

        // Nothing queued was consumed by the waits.
        let first = ctx.try_recv().unwrap();
        assert_eq!(first.payload(), b"a");
        drop(first);
        ctx.bus_unsubscribe(bus).unwrap();
        ctx.bus_destroy(bus).unwrap();
        flag.set(true);
        ctx.exit();
    })
    .unwrap();
    let handle = rt.shutdown_handle();
    let _watchdog = thread::spawn(move || {
        thread::sleep(Duration::from_secs(5));
        handle.shutdown();
    });
    run_clean(&rt);
    assert!(finished.get(), "a bounded wait never expired");
}
