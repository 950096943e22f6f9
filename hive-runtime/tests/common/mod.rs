//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use hive_runtime::{Runtime, RuntimeConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn runtime(max_actors: usize) -> Runtime {
    init_tracing();
    Runtime::new(RuntimeConfig::default().with_max_actors(max_actors)).unwrap()
}

/// Run to completion and fail if any actor died abnormally; assertions
/// inside actor bodies surface as crashes.
pub fn run_clean(rt: &Runtime) {
    rt.run().unwrap();
    assert_eq!(rt.stats().crashed, 0, "an actor crashed");
}

/// Append-only log shared between actors of one test.
pub type Log<T> = Rc<RefCell<Vec<T>>>;

pub fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}
