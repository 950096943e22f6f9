//! Links, monitors, exit reasons and scheduling behaviour.

mod common;

use std::cell::{Cell, RefCell};
use std::hint::black_box;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use common::{log, run_clean, runtime};
use hive_runtime::{
    decode_exit, Class, Ctx, Error, ExitNotice, ExitReason, Filter, Priority, Runtime,
    RuntimeConfig, SpawnOptions, DOWN_TAG, EXIT_TAG,
};

#[test]
fn linked_partner_gets_exactly_one_exit_message() {
    let rt = runtime(4);
    let notices: Rc<RefCell<Vec<ExitNotice>>> = log();
    let sink = notices.clone();

    let b = rt
        .spawn(|ctx: &Ctx<'_>| {
            ctx.yield_now().unwrap();
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.link(b).unwrap();
        ctx.link(b).unwrap();
        let msg = ctx.recv(None).unwrap();
        assert_eq!((msg.class(), msg.tag()), (Class::System, EXIT_TAG));
        sink.borrow_mut().push(decode_exit(&msg).unwrap());
        drop(msg);
        assert!(matches!(ctx.try_recv(), Err(Error::WouldBlock)));
        // Both halves are gone; unlinking again is a no-op.
        ctx.unlink(b).unwrap();
        ctx.exit();
    })
    .unwrap();

    run_clean(&rt);
    let notices = notices.borrow();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].actor, b);
    assert_eq!(notices[0].reason, ExitReason::Normal);
    assert_eq!(notices[0].monitor, None);
}

#[test]
fn unlinked_actor_is_not_notified() {
    let rt = runtime(4);
    let quiet = Rc::new(Cell::new(false));
    let flag = quiet.clone();
    let b = rt
        .spawn(|ctx: &Ctx<'_>| {
            ctx.yield_now().unwrap();
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.link(b).unwrap();
        ctx.unlink(b).unwrap();
        ctx.sleep(Duration::from_millis(5)).unwrap();
        flag.set(matches!(ctx.try_recv(), Err(Error::WouldBlock)));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert!(quiet.get());
}

#[test]
fn panic_and_implicit_return_are_crashes() {
    let rt = runtime(4);
    let reasons = log();
    let sink = reasons.clone();

    let panicker = rt
        .spawn(|ctx: &Ctx<'_>| {
            ctx.yield_now().unwrap();
            panic!("deliberate");
        })
        .unwrap();
    let returner = rt
        .spawn(|ctx: &Ctx<'_>| {
            ctx.yield_now().unwrap();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.link(panicker).unwrap();
        ctx.link(returner).unwrap();
        for _ in 0..2 {
            let msg = ctx.recv_match(Filter::any().class(Class::System), None).unwrap();
            let notice = msg.exit_notice().unwrap();
            sink.borrow_mut().push((notice.actor, notice.reason));
        }
        ctx.exit();
    })
    .unwrap();

    rt.run().unwrap();
    let mut reasons = reasons.borrow().clone();
    reasons.sort_by_key(|(id, _)| *id);
    let mut expected = vec![(panicker, ExitReason::Crash), (returner, ExitReason::Crash)];
    expected.sort_by_key(|(id, _)| *id);
    assert_eq!(reasons, expected);
    assert_eq!(rt.stats().crashed, 2);
}

#[test]
fn monitor_reports_exit_reason_and_ref() {
    let rt = runtime(4);
    let seen = Rc::new(Cell::new(None));
    let sink = seen.clone();

    let worker = rt
        .spawn(|ctx: &Ctx<'_>| {
            ctx.yield_now().unwrap();
            ctx.exit_with(ExitReason::Error(7));
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let reference = ctx.monitor(worker).unwrap();
        let msg = ctx.recv(None).unwrap();
        assert_eq!(msg.tag(), DOWN_TAG);
        let notice = msg.exit_notice().unwrap();
        sink.set(Some((notice.actor, notice.reason, notice.monitor == Some(reference))));
        drop(msg);
        // A monitor is one-shot; the dead target cannot be monitored again.
        assert!(matches!(ctx.monitor(worker), Err(Error::InvalidArgument(_))));
        ctx.exit();
    })
    .unwrap();

    rt.run().unwrap();
    assert_eq!(seen.get(), Some((worker, ExitReason::Error(7), true)));
    assert_eq!(rt.stats().crashed, 1);
}

#[test]
fn demonitor_suppresses_the_notification() {
    let rt = runtime(4);
    let quiet = Rc::new(Cell::new(false));
    let flag = quiet.clone();
    let worker = rt
        .spawn(|ctx: &Ctx<'_>| {
            ctx.yield_now().unwrap();
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let reference = ctx.monitor(worker).unwrap();
        ctx.demonitor(reference).unwrap();
        ctx.demonitor(reference).unwrap();
        ctx.sleep(Duration::from_millis(5)).unwrap();
        flag.set(matches!(ctx.try_recv(), Err(Error::WouldBlock)));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert!(quiet.get());
}

#[test]
fn critical_runs_every_round_and_normals_alternate() {
    let rt = runtime(4);
    let order = log();
    for name in ["n1", "n2"] {
        let order = order.clone();
        rt.spawn(move |ctx: &Ctx<'_>| {
            for _ in 0..6 {
                order.borrow_mut().push(name);
                ctx.yield_now().unwrap();
            }
            ctx.exit();
        })
        .unwrap();
    }
    let o = order.clone();
    rt.spawn_with(
        SpawnOptions::new().priority(Priority::Critical).name("critical"),
        move |ctx: &Ctx<'_>| {
            for _ in 0..6 {
                o.borrow_mut().push("c");
                ctx.yield_now().unwrap();
            }
            ctx.exit();
        },
    )
    .unwrap();

    run_clean(&rt);
    let order = order.borrow();
    assert_eq!(
        order[..12],
        ["c", "n1", "c", "n2", "c", "n1", "c", "n2", "c", "n1", "c", "n2"]
    );
    assert_eq!(order.iter().filter(|n| **n == "n1").count(), 6);
    assert_eq!(order.iter().filter(|n| **n == "n2").count(), 6);
}

#[test]
fn low_priority_is_not_starved() {
    let rt = runtime(4);
    let low_ran = Rc::new(Cell::new(false));
    let flag = low_ran.clone();
    let stop = Rc::new(Cell::new(false));
    let done = stop.clone();
    rt.spawn_with(SpawnOptions::new().priority(Priority::High), move |ctx: &Ctx<'_>| {
        while !done.get() {
            ctx.yield_now().unwrap();
        }
        ctx.exit();
    })
    .unwrap();
    rt.spawn_with(SpawnOptions::new().priority(Priority::Low), move |ctx: &Ctx<'_>| {
        flag.set(true);
        stop.set(true);
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert!(low_ran.get());
}

#[test]
fn actor_table_exhaustion_is_reported() {
    let rt = runtime(2);
    rt.spawn(|ctx: &Ctx<'_>| ctx.exit()).unwrap();
    rt.spawn(|ctx: &Ctx<'_>| ctx.exit()).unwrap();
    let err = rt.spawn(|ctx: &Ctx<'_>| ctx.exit()).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    run_clean(&rt);
    // Slots are reusable once reaped, under fresh ids.
    let again = rt.spawn(|ctx: &Ctx<'_>| ctx.exit()).unwrap();
    assert!(rt.is_alive(again));
    run_clean(&rt);
    assert_eq!(rt.stats().spawned, 3);
}

#[test]
fn everyone_waiting_is_a_deadlock() {
    let rt = runtime(4);
    let a = rt
        .spawn(|ctx: &Ctx<'_>| {
            let _ = ctx.recv(None);
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let _ = ctx.recv_match(Filter::any().sender(a), None);
        ctx.exit();
    })
    .unwrap();
    assert!(matches!(rt.run(), Err(Error::Deadlock { blocked: 2 })));
    assert_eq!(rt.live_actors(), 2);
}

#[test]
fn shutdown_handle_stops_run_from_another_thread() {
    let rt = runtime(2);
    rt.spawn(|ctx: &Ctx<'_>| loop {
        ctx.sleep(Duration::from_millis(2)).unwrap();
    })
    .unwrap();
    let handle = rt.shutdown_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        handle.shutdown();
    });
    rt.run().unwrap();
    stopper.join().unwrap();
    assert!(rt.shutdown_handle().is_shutdown());
    assert_eq!(rt.live_actors(), 1);
}

#[test]
fn cleanup_unwinds_suspended_actors_without_notifications() {
    struct Guard(Rc<Cell<u32>>);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    let rt = runtime(4);
    let drops = Rc::new(Cell::new(0));
    let (g1, g2) = (Guard(drops.clone()), Guard(drops.clone()));
    let sleeper = rt
        .spawn(move |ctx: &Ctx<'_>| {
            let _guard = g1;
            let _ = ctx.recv(None);
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let _guard = g2;
        ctx.link(sleeper).unwrap();
        let _ = ctx.recv(None);
        ctx.exit();
    })
    .unwrap();
    assert!(matches!(rt.run(), Err(Error::Deadlock { .. })));
    assert_eq!(drops.get(), 0);
    rt.cleanup();
    assert_eq!(drops.get(), 2);
}

#[test]
fn exit_and_down_notices_wait_for_a_free_buffer() {
    common::init_tracing();
    let rt = Runtime::new(
        RuntimeConfig::default()
            .with_max_actors(4)
            .with_message_capacity(1),
    )
    .unwrap();
    let seen = log();
    let sink = seen.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let me = ctx.id();
        let partner = ctx.spawn(|ctx: &Ctx<'_>| ctx.exit()).unwrap();
        ctx.link(partner).unwrap();
        let reference = ctx.monitor(partner).unwrap();
        ctx.notify(me, b"fill").unwrap();
        while ctx.is_alive(partner) {
            ctx.yield_now().unwrap();
        }

        let filler = ctx.try_recv().unwrap();
        assert_eq!(filler.payload(), b"fill");
        drop(filler);
        for _ in 0..2 {
            let msg = ctx.try_recv().unwrap();
            let notice = decode_exit(&msg).unwrap();
            assert_eq!((notice.actor, notice.reason), (partner, ExitReason::Normal));
            sink.borrow_mut()
                .push((msg.tag(), notice.monitor == Some(reference)));
        }
        assert!(matches!(ctx.try_recv(), Err(Error::WouldBlock)));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(*seen.borrow(), [(EXIT_TAG, false), (DOWN_TAG, true)]);
}

/// Recurse with a large live frame until the stack runs out.
#[inline(never)]
fn descend(depth: u64) -> u64 {
    let frame = black_box([depth.to_le_bytes()[0]; 512]);
    if depth == 0 {
        return u64::from(frame[0]);
    }
    descend(depth - 1).wrapping_add(u64::from(black_box(&frame)[511]))
}

#[test]
fn stack_overflow_kills_only_the_overflowing_actor() {
    let rt = runtime(4);
    let reason = Rc::new(Cell::new(None));
    let sink = reason.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let deep = ctx
            .spawn_with(SpawnOptions::new().stack_size(64 * 1024), |ctx: &Ctx<'_>| {
                black_box(descend(1_000_000));
                ctx.exit();
            })
            .unwrap();
        ctx.monitor(deep).unwrap();
        let msg = ctx.recv(None).unwrap();
        sink.set(decode_exit(&msg).map(|n| n.reason));
        drop(msg);
        ctx.exit();
    })
    .unwrap();
    rt.run().unwrap();
    assert_eq!(reason.get(), Some(ExitReason::StackOverflow));
    assert_eq!(rt.stats().crashed, 1);

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        flag.set(true);
        ctx.exit();
    })
    .unwrap();
    rt.run().unwrap();
    assert!(ran.get());
    let stats = rt.stats();
    assert_eq!((stats.live, stats.crashed, stats.buffers_in_use), (0, 1, 0));
}
