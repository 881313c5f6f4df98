//! Loopback transport for simulations and tests.
//!
//! Queued tx frames are pushed through a configurable device-under-test
//! transform on flush; whatever comes back lands on the rx queue. RPC
//! requests are injected directly by the harness.

use std::any::Any;
use std::collections::VecDeque;
use std::time::Duration;

use crate::mbuf::{Mbuf, MbufPool};
use crate::transport::Transport;

/// Simulated DUT. Takes ownership of each flushed frame; returning `None`
/// means the DUT swallowed it (the transform must free it in that case).
pub type DutTransform = Box<dyn FnMut(&mut MbufPool, Mbuf) -> Option<Mbuf>>;

pub struct SimTransport {
    txq: Vec<Mbuf>,
    rxq: VecDeque<Mbuf>,
    rpcq: VecDeque<Vec<u8>>,
    replies: Vec<Vec<u8>>,
    transform: DutTransform,
}

impl SimTransport {
    pub fn with_transform(transform: DutTransform) -> Self {
        SimTransport {
            txq: Vec::new(),
            rxq: VecDeque::new(),
            rpcq: VecDeque::new(),
            replies: Vec::new(),
            transform,
        }
    }

    /// Identity DUT: every tx frame comes straight back on rx.
    pub fn loopback() -> Self {
        Self::with_transform(Box::new(|_pool, m| Some(m)))
    }

    /// Dummy veth: the DUT drops everything.
    pub fn sink() -> Self {
        Self::with_transform(Box::new(|pool, m| {
            pool.free(m);
            None
        }))
    }

    /// Inject a received frame, as if the DUT had sent it.
    pub fn inject_rx(&mut self, m: Mbuf) {
        self.rxq.push_back(m);
    }

    /// Inject an RPC request envelope.
    pub fn push_rpc(&mut self, req: Vec<u8>) {
        self.rpcq.push_back(req);
    }

    /// Take the RPC responses produced so far.
    pub fn take_replies(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.replies)
    }
}

impl Transport for SimTransport {
    fn tx_push(&mut self, _pool: &mut MbufPool, m: Mbuf) {
        self.txq.push(m);
    }

    fn tx_flush(&mut self, pool: &mut MbufPool) {
        for m in self.txq.drain(..) {
            if let Some(back) = (self.transform)(pool, m) {
                self.rxq.push_back(back);
            }
        }
    }

    fn rx_poll(&mut self, _pool: &mut MbufPool, max: usize, out: &mut Vec<Mbuf>) {
        for _ in 0..max {
            match self.rxq.pop_front() {
                Some(m) => out.push(m),
                None => break,
            }
        }
    }

    fn rpc_poll(&mut self, out: &mut Vec<Vec<u8>>) {
        out.extend(self.rpcq.drain(..));
    }

    fn rpc_reply(&mut self, data: Vec<u8>) {
        self.replies.push(data);
    }

    fn wait(&mut self, _timeout: Duration) {}

    fn shutdown(&mut self, pool: &mut MbufPool) {
        for m in self.txq.drain(..) {
            pool.free(m);
        }
        while let Some(m) = self.rxq.pop_front() {
            pool.free(m);
        }
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}
