//! Mailbox ordering, selective receive, request/reply and synchronous send.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use common::{log, run_clean, runtime};
use hive_runtime::{Class, Ctx, Error, Filter, Runtime, RuntimeConfig};

#[test]
fn notify_order_is_fifo() {
    let rt = runtime(4);
    let seen = log();
    let sink = seen.clone();
    let receiver = rt
        .spawn(move |ctx: &Ctx<'_>| {
            for _ in 0..5 {
                let msg = ctx.recv(None).unwrap();
                sink.borrow_mut().push(msg.payload()[0]);
            }
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        for n in 0..5_u8 {
            ctx.notify(receiver, &[n]).unwrap();
        }
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(*seen.borrow(), [0, 1, 2, 3, 4]);
}

#[test]
fn selective_receive_skips_ahead_and_keeps_the_rest() {
    let rt = runtime(2);
    let seen = log();
    let sink = seen.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let me = ctx.id();
        ctx.notify_tagged(me, 1, b"A").unwrap();
        ctx.notify_tagged(me, 2, b"B").unwrap();
        ctx.notify_tagged(me, 1, b"C").unwrap();

        let ones = Filter::any().tag(1);
        for _ in 0..2 {
            let msg = ctx.recv_match(ones, None).unwrap();
            sink.borrow_mut().push(msg.payload().to_vec());
        }
        assert!(matches!(ctx.recv_match(ones, Some(Duration::ZERO)), Err(Error::WouldBlock)));
        let rest = ctx.try_recv().unwrap();
        sink.borrow_mut().push(rest.payload().to_vec());
        drop(rest);
        assert!(matches!(ctx.try_recv(), Err(Error::WouldBlock)));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(*seen.borrow(), [b"A".to_vec(), b"C".to_vec(), b"B".to_vec()]);
}

#[test]
fn pool_exhaustion_is_deterministic_and_recoverable() {
    init();
    let rt = Runtime::new(
        RuntimeConfig::default()
            .with_max_actors(2)
            .with_message_capacity(4),
    )
    .unwrap();
    let counts = Rc::new(Cell::new((0, 0)));
    let out = counts.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let me = ctx.id();
        let mut first = 0;
        let err = loop {
            match ctx.notify(me, b"x") {
                Ok(()) => first += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert!(err.is_retryable());

        for _ in 0..2 {
            drop(ctx.recv(None).unwrap());
        }
        let mut second = 0;
        while ctx.notify(me, b"y").is_ok() {
            second += 1;
        }
        out.set((first, second));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(counts.get(), (4, 2));
}

#[test]
fn notify_to_self_is_allowed_but_sync_send_is_not() {
    let rt = runtime(2);
    rt.spawn(|ctx: &Ctx<'_>| {
        let me = ctx.id();
        assert!(matches!(ctx.send_sync(me, 0, b"loop"), Err(Error::InvalidArgument(_))));
        assert!(matches!(ctx.request(me, b"loop", None), Err(Error::InvalidArgument(_))));
        ctx.notify(me, b"hello me").unwrap();
        let msg = ctx.try_recv().unwrap();
        assert_eq!((msg.sender(), msg.payload()), (me, &b"hello me"[..]));
        drop(msg);
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
}

#[test]
fn sending_to_a_dead_actor_is_rejected() {
    let rt = runtime(4);
    let gone = rt.spawn(|ctx: &Ctx<'_>| ctx.exit()).unwrap();
    rt.run().unwrap();
    assert!(!rt.is_alive(gone));
    assert!(matches!(rt.notify(gone, 0, b""), Err(Error::InvalidArgument(_))));
}

#[test]
fn oversized_payload_is_rejected() {
    init();
    let rt = Runtime::new(
        RuntimeConfig::default()
            .with_max_actors(2)
            .with_message_size_max(8),
    )
    .unwrap();
    rt.spawn(|ctx: &Ctx<'_>| {
        let me = ctx.id();
        assert!(matches!(ctx.notify(me, &[0; 9]), Err(Error::InvalidArgument(_))));
        ctx.notify(me, &[0; 8]).unwrap();
        drop(ctx.try_recv().unwrap());
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
}

#[test]
fn ping_pong_round_trip() {
    const ROUNDS: u32 = 100;
    let rt = runtime(4);
    let tally = Rc::new(Cell::new((0_u32, 0_u32, 0_u32, 0_u32)));

    let t = tally.clone();
    let pong = rt
        .spawn(move |ctx: &Ctx<'_>| {
            let (mut sent, mut received) = (0, 0);
            while received < ROUNDS {
                let msg = ctx.recv(None).unwrap();
                received += 1;
                let from = msg.sender();
                drop(msg);
                ctx.notify(from, b"pong").unwrap();
                sent += 1;
            }
            let (a, b, _, _) = t.get();
            t.set((a, b, sent, received));
            ctx.exit();
        })
        .unwrap();

    let t = tally.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let (mut sent, mut received) = (0, 0);
        for _ in 0..ROUNDS {
            ctx.notify(pong, b"ping").unwrap();
            sent += 1;
            let msg = ctx.recv(None).unwrap();
            assert_eq!(msg.payload(), b"pong");
            received += 1;
        }
        let (_, _, c, d) = t.get();
        t.set((sent, received, c, d));
        ctx.exit();
    })
    .unwrap();

    run_clean(&rt);
    assert_eq!(tally.get(), (ROUNDS, ROUNDS, ROUNDS, ROUNDS));
    let stats = rt.stats();
    assert_eq!(stats.messages_sent, u64::from(2 * ROUNDS));
    assert_eq!(stats.messages_received, u64::from(2 * ROUNDS));
    assert_eq!(stats.buffers_in_use, 0);
}

#[test]
fn request_reply_matches_by_tag_not_arrival_order() {
    let rt = runtime(4);
    let answers = log();
    let sink = answers.clone();

    // Replies to two requests in reverse order.
    let server = rt
        .spawn(|ctx: &Ctx<'_>| {
            let first = ctx.recv_match(Filter::any().class(Class::Request), None).unwrap();
            let second = ctx.recv_match(Filter::any().class(Class::Request), None).unwrap();
            ctx.reply(&second, second.payload()).unwrap();
            ctx.reply(&first, first.payload()).unwrap();
            ctx.exit();
        })
        .unwrap();

    rt.spawn(move |ctx: &Ctx<'_>| {
        // A helper issues its own request first so the server holds two.
        ctx.spawn(move |ctx: &Ctx<'_>| {
            let reply = ctx.request(server, b"helper", None).unwrap();
            assert_eq!(reply.payload(), b"helper");
            ctx.exit();
        })
        .unwrap();
        ctx.yield_now().unwrap();
        let reply = ctx.request(server, b"main", None).unwrap();
        assert_eq!(reply.class(), Class::Reply);
        sink.borrow_mut().push(reply.payload().to_vec());
        assert!(reply.tag() > hive_runtime::MAX_USER_TAG);
        ctx.exit();
    })
    .unwrap();

    run_clean(&rt);
    assert_eq!(*answers.borrow(), [b"main".to_vec()]);
}

#[test]
fn reply_requires_a_request() {
    let rt = runtime(2);
    rt.spawn(|ctx: &Ctx<'_>| {
        let me = ctx.id();
        ctx.notify(me, b"plain").unwrap();
        let msg = ctx.try_recv().unwrap();
        assert!(matches!(ctx.reply(&msg, b"no"), Err(Error::InvalidArgument(_))));
        drop(msg);
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
}

#[test]
fn request_to_an_actor_that_dies_is_closed() {
    let rt = runtime(4);
    let outcome = Rc::new(Cell::new(None));
    let out = outcome.clone();
    let callee = rt
        .spawn(|ctx: &Ctx<'_>| {
            let _req = ctx.recv(None).unwrap();
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let result = ctx.request(callee, b"never answered", None);
        out.set(Some(matches!(result, Err(Error::Closed))));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(outcome.get(), Some(true));
}

#[test]
fn request_times_out() {
    let rt = runtime(4);
    let outcome = Rc::new(Cell::new(false));
    let out = outcome.clone();
    let silent = rt
        .spawn(|ctx: &Ctx<'_>| {
            let _req = ctx.recv(None).unwrap();
            ctx.sleep(Duration::from_millis(50)).unwrap();
            ctx.exit();
        })
        .unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let result = ctx.request(silent, b"?", Some(Duration::from_millis(10)));
        out.set(matches!(result, Err(Error::Timeout)));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert!(outcome.get());
}

#[test]
fn sync_send_blocks_until_release() {
    let rt = runtime(4);
    let events = log();

    let ev = events.clone();
    let receiver = rt
        .spawn(move |ctx: &Ctx<'_>| {
            let msg = ctx.recv(None).unwrap();
            assert!(msg.is_sync());
            ev.borrow_mut().push("received");
            for _ in 0..3 {
                ctx.yield_now().unwrap();
            }
            ev.borrow_mut().push("releasing");
            ctx.release(msg);
            ctx.yield_now().unwrap();
            ctx.exit();
        })
        .unwrap();

    let ev = events.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.send_sync(receiver, 3, b"payload").unwrap();
        ev.borrow_mut().push("sender resumed");
        ctx.exit();
    })
    .unwrap();

    run_clean(&rt);
    assert_eq!(*events.borrow(), ["received", "releasing", "sender resumed"]);
}

#[test]
fn next_receive_releases_a_sync_sender() {
    let rt = runtime(4);
    let resumed = Rc::new(Cell::new(false));

    let flag = resumed.clone();
    let receiver = rt
        .spawn(move |ctx: &Ctx<'_>| {
            let held = ctx.recv(None).unwrap();
            assert!(held.is_sync());
            // Still holding the handle; a new receive frees the sender.
            let me = ctx.id();
            ctx.notify(me, b"self").unwrap();
            let _other = ctx.recv(None).unwrap();
            ctx.yield_now().unwrap();
            assert!(flag.get());
            drop(held);
            ctx.exit();
        })
        .unwrap();

    let flag = resumed.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        ctx.send_sync(receiver, 0, b"x").unwrap();
        flag.set(true);
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert!(resumed.get());
}

#[test]
fn sync_sender_is_released_when_receiver_dies() {
    let rt = runtime(4);
    let outcome = Rc::new(Cell::new(None));

    let receiver = rt
        .spawn(|ctx: &Ctx<'_>| {
            ctx.yield_now().unwrap();
            ctx.yield_now().unwrap();
            ctx.exit();
        })
        .unwrap();
    let out = outcome.clone();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let result = ctx.send_sync(receiver, 0, b"orphan");
        out.set(Some(matches!(result, Err(Error::Closed))));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(outcome.get(), Some(true));
}

#[test]
fn link_to_a_dead_actor_is_rejected() {
    let rt = runtime(4);
    let outcome = Rc::new(Cell::new(None));
    let out = outcome.clone();
    let first = rt.spawn(|ctx: &Ctx<'_>| ctx.exit()).unwrap();
    rt.spawn(move |ctx: &Ctx<'_>| {
        let result = ctx.link(first);
        out.set(Some(matches!(result, Err(Error::InvalidArgument(_)))));
        ctx.exit();
    })
    .unwrap();
    run_clean(&rt);
    assert_eq!(outcome.get(), Some(true));
}

fn init() {
    common::init_tracing();
}
