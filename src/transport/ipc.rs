//! Unix-domain-socket production transport.
//!
//! The default data plane when TCP framing is not requested: the same
//! length-framed messages as the TCP transport, carried over two stream
//! sockets under `/tmp` keyed by the data port. The RPC side stays on TCP
//! (the control client is usually remote).

use std::any::Any;
use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded, select};
use tracing::{info, warn};

use crate::mbuf::{Mbuf, MbufPool};
use crate::transport::tcp::{RX_QUEUE_DEPTH, TransportError, spawn_rx_pump};
use crate::transport::{RpcChannel, Transport, write_msg};

/// Socket path for one direction of the data plane.
pub fn sock_path(port: u16) -> PathBuf {
    PathBuf::from(format!("/tmp/netemu-{}.ipc", port))
}

pub struct IpcTransport {
    tx: BufWriter<UnixStream>,
    rx_sock: UnixStream,
    rx: Receiver<(u16, Vec<u8>)>,
    pending_rx: VecDeque<(u16, Vec<u8>)>,
    rpc: RpcChannel,
    shutdown: Arc<AtomicBool>,
    rx_drops: Arc<AtomicU64>,
}

impl IpcTransport {
    /// Connect to the packet server's sockets — rx on `data_port`, tx on
    /// `data_port + 1` — and serve RPC on `rpc_port`.
    pub fn connect(data_port: u16, rpc_port: u16) -> Result<Self, TransportError> {
        let rx_path = sock_path(data_port);
        let tx_path = sock_path(data_port + 1);

        let rx_sock = UnixStream::connect(&rx_path).map_err(|source| TransportError::Connect {
            addr: rx_path.display().to_string(),
            source,
        })?;
        let tx_sock = UnixStream::connect(&tx_path).map_err(|source| TransportError::Connect {
            addr: tx_path.display().to_string(),
            source,
        })?;

        info!(rx = %rx_path.display(), tx = %tx_path.display(), "ipc data plane connected");

        let shutdown = Arc::new(AtomicBool::new(false));
        let rx_drops = Arc::new(AtomicU64::new(0));
        let (frame_tx, frame_rx) = bounded(RX_QUEUE_DEPTH);
        spawn_rx_pump(rx_sock.try_clone()?, frame_tx, shutdown.clone(), rx_drops.clone());

        let rpc = RpcChannel::serve(rpc_port, shutdown.clone())?;

        Ok(IpcTransport {
            tx: BufWriter::new(tx_sock),
            rx_sock,
            rx: frame_rx,
            pending_rx: VecDeque::new(),
            rpc,
            shutdown,
            rx_drops,
        })
    }

}

impl Transport for IpcTransport {
    fn tx_push(&mut self, pool: &mut MbufPool, m: Mbuf) {
        let data = m.to_vec();
        if let Err(e) = write_msg(&mut self.tx, m.vport(), &data) {
            warn!(error = %e, "tx write failed");
        }
        pool.free(m);
    }

    fn tx_flush(&mut self, _pool: &mut MbufPool) {
        if let Err(e) = self.tx.flush() {
            warn!(error = %e, "tx flush failed");
        }
    }

    fn rx_poll(&mut self, pool: &mut MbufPool, max: usize, out: &mut Vec<Mbuf>) {
        while out.len() < max {
            let (vport, frame) = match self.pending_rx.pop_front() {
                Some(f) => f,
                None => match self.rx.try_recv() {
                    Ok(f) => f,
                    Err(_) => break,
                },
            };
            out.push(pool.alloc_from(vport, &frame));
        }
    }

    fn drain_rx_drops(&mut self) -> u64 {
        self.rx_drops.swap(0, Ordering::Relaxed)
    }

    fn rpc_poll(&mut self, out: &mut Vec<Vec<u8>>) {
        self.rpc.poll(out);
    }

    fn rpc_reply(&mut self, data: Vec<u8>) {
        self.rpc.reply(data);
    }

    fn wait(&mut self, timeout: Duration) {
        if !self.pending_rx.is_empty() || self.rpc.has_pending() {
            return;
        }
        let rx = self.rx.clone();
        let rpc_rx = self.rpc.receiver().clone();
        select! {
            recv(rx) -> msg => {
                if let Ok(m) = msg {
                    self.pending_rx.push_back(m);
                }
            }
            recv(rpc_rx) -> msg => {
                if let Ok(m) = msg {
                    self.rpc.stash(m);
                }
            }
            default(timeout) => {}
        }
    }

    fn shutdown(&mut self, _pool: &mut MbufPool) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.rx_sock.shutdown(std::net::Shutdown::Both);
        let _ = self.tx.flush();
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}
