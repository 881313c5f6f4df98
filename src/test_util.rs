//! Helpers for in-crate tests: a worker over a capturing DUT transform.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::ctx::ThreadCtx;
use crate::plugin::PluginRegistry;
use crate::plugins::register_defaults;
use crate::transport::{DutTransform, SimTransport, Transport};
use crate::worker::Worker;

/// Worker with the stock plugin set over a DUT that records and drops
/// every tx frame.
pub fn capture_env() -> (Worker, Rc<RefCell<Vec<Vec<u8>>>>) {
    let captured: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = captured.clone();
    let transform: DutTransform = Box::new(move |pool, m| {
        sink.borrow_mut().push(m.to_vec());
        pool.free(m);
        None
    });
    let mut registry = PluginRegistry::new();
    register_defaults(&mut registry).unwrap();
    let ctx = ThreadCtx::new(
        RuntimeConfig::default(),
        registry,
        Box::new(SimTransport::with_transform(transform)),
    );
    (Worker::new(ctx), captured)
}

/// Queue a frame on the simulated rx side.
pub fn inject_rx(ctx: &Rc<ThreadCtx>, vport: u16, frame: &[u8]) {
    let m = ctx.mpool.borrow_mut().alloc_from(vport, frame);
    let mut veth = ctx.veth.borrow_mut();
    veth.as_any().downcast_mut::<SimTransport>().expect("test transport is the sim").inject_rx(m);
}
