//! Packet transport abstraction.
//!
//! The worker sees the outside world as four operations: push/flush on the
//! tx side, a non-blocking rx poll and an RPC envelope poll. Ownership of
//! every consumed mbuf moves into the transport, which returns it to the
//! pool once emitted.
//!
//! Wire format (production transports): each message is a u32 big-endian
//! length, then a 2-byte big-endian virtual port, then the raw L2 frame.
//! A message whose payload is only the port (or empty) is a heartbeat and
//! is discarded.

pub mod ipc;
pub mod sim;
pub mod tcp;

use std::any::Any;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::counter_rec;
use crate::counters::{Counter, CounterDb, Severity};
use crate::mbuf::{Mbuf, MbufPool};

pub use sim::{DutTransform, SimTransport};

/// Data-plane and control-plane statistics of the worker's port.
#[derive(Debug, Default, Clone)]
pub struct VethStats {
    pub tx_pkts: Counter<u64>,
    pub tx_bytes: Counter<u64>,
    pub rx_pkts: Counter<u64>,
    pub rx_bytes: Counter<u64>,
    pub rx_parse_err: Counter<u64>,
    pub rx_que_err: Counter<u64>,
    pub rx_batch: Counter<u64>,
    pub tx_batch: Counter<u64>,
    pub tx_drop_not_resolve: Counter<u64>,
}

impl VethStats {
    pub fn new_db(&self) -> CounterDb {
        let mut db = CounterDb::new("veth");
        db.add(counter_rec!(self.tx_pkts, "TxPkts", "transmitted packets", "pkts", Severity::Info));
        db.add(counter_rec!(self.tx_bytes, "TxBytes", "transmitted bytes", "bytes", Severity::Info));
        db.add(counter_rec!(self.rx_pkts, "RxPkts", "received packets", "pkts", Severity::Info));
        db.add(counter_rec!(self.rx_bytes, "RxBytes", "received bytes", "bytes", Severity::Info));
        db.add(counter_rec!(
            self.rx_parse_err,
            "RxParseErr",
            "frames dropped by the parser",
            "pkts",
            Severity::Error
        ));
        db.add(counter_rec!(
            self.rx_que_err,
            "RxQueErr",
            "frames dropped on the rx queue",
            "pkts",
            Severity::Error
        ));
        db.add(counter_rec!(self.rx_batch, "RxBatch", "rx batches", "ops", Severity::Info));
        db.add(counter_rec!(self.tx_batch, "TxBatch", "tx batches", "ops", Severity::Info));
        db.add(counter_rec!(
            self.tx_drop_not_resolve,
            "TxDropNotResolve",
            "unicast drops with unresolved gateway",
            "pkts",
            Severity::Error
        ));
        db
    }
}

/// Send/receive of raw frames plus the control-plane RPC envelope.
pub trait Transport {
    /// Queue one owned frame for emission.
    fn tx_push(&mut self, pool: &mut MbufPool, m: Mbuf);

    /// Emit everything queued since the last flush.
    fn tx_flush(&mut self, pool: &mut MbufPool);

    /// Move up to `max` received frames into `out`. Never blocks.
    fn rx_poll(&mut self, pool: &mut MbufPool, max: usize, out: &mut Vec<Mbuf>);

    /// Frames the transport had to drop since the last call (rx queue
    /// overflow).
    fn drain_rx_drops(&mut self) -> u64 {
        0
    }

    /// Move pending RPC request envelopes into `out`. Never blocks.
    fn rpc_poll(&mut self, out: &mut Vec<Vec<u8>>);

    /// Queue one RPC response envelope.
    fn rpc_reply(&mut self, data: Vec<u8>);

    /// Block until data may be readable or `timeout` elapses.
    fn wait(&mut self, timeout: Duration);

    /// Drop everything still owned by the transport.
    fn shutdown(&mut self, pool: &mut MbufPool);

    /// Concrete-type access for simulation harnesses.
    fn as_any(&mut self) -> &mut dyn Any;
}

/// Control-plane endpoint shared by the production transports: a TCP
/// listener serving one client at a time, one framed response per framed
/// request.
pub struct RpcChannel {
    requests: crossbeam_channel::Receiver<Vec<u8>>,
    replies: crossbeam_channel::Sender<Vec<u8>>,
    pending: std::collections::VecDeque<Vec<u8>>,
}

impl RpcChannel {
    pub fn serve(port: u16, shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>) -> io::Result<Self> {
        let (req_tx, req_rx) = crossbeam_channel::bounded(64);
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(64);
        tcp::spawn_rpc_server(port, req_tx, reply_rx, shutdown)?;
        Ok(RpcChannel { requests: req_rx, replies: reply_tx, pending: std::collections::VecDeque::new() })
    }

    pub fn poll(&mut self, out: &mut Vec<Vec<u8>>) {
        out.extend(self.pending.drain(..));
        while let Ok(req) = self.requests.try_recv() {
            out.push(req);
        }
    }

    pub fn reply(&mut self, data: Vec<u8>) {
        if self.replies.send(data).is_err() {
            tracing::warn!("rpc reply channel closed");
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn receiver(&self) -> &crossbeam_channel::Receiver<Vec<u8>> {
        &self.requests
    }

    pub(crate) fn stash(&mut self, req: Vec<u8>) {
        self.pending.push_back(req);
    }
}

pub(crate) fn write_msg(w: &mut impl Write, vport: u16, frame: &[u8]) -> io::Result<()> {
    let len = (frame.len() + 2) as u32;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&vport.to_be_bytes())?;
    w.write_all(frame)
}

/// Largest message accepted off the wire: a max-size frame plus the
/// vport prefix.
pub(crate) const MAX_MSG_LEN: usize = crate::mbuf::MAX_PACKET_SIZE as usize + 2;

/// Read one length-framed message: `(vport, frame)`. A heartbeat returns
/// an empty frame.
pub(crate) fn read_msg(r: &mut impl Read) -> io::Result<(u16, Vec<u8>)> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_MSG_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("message of {} bytes", len)));
    }
    if len <= 2 {
        let mut skip = vec![0u8; len];
        r.read_exact(&mut skip)?;
        return Ok((0, Vec::new()));
    }
    let mut vport = [0u8; 2];
    r.read_exact(&mut vport)?;
    let mut frame = vec![0u8; len - 2];
    r.read_exact(&mut frame)?;
    Ok((u16::from_be_bytes(vport), frame))
}
