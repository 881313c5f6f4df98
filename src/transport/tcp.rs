//! TCP-framed production transport.
//!
//! Data plane: two stream connections to the packet server — rx on the
//! data port, tx on the data port + 1 — carrying length-framed messages
//! (see the module docs in `transport`). A dedicated rx thread reads
//! frames and hands them to the worker over a bounded channel, so the
//! worker itself never blocks on the socket.
//!
//! Control plane: a listener on the RPC port accepting one client at a
//! time; each length-framed request is answered with exactly one framed
//! response produced by the worker.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mbuf::{Mbuf, MbufPool};
use crate::transport::{RpcChannel, Transport, read_msg, write_msg};

/// Frames the rx thread may buffer ahead of the worker.
pub const RX_QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: std::io::Error },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TcpTransport {
    tx: BufWriter<TcpStream>,
    rx_sock: TcpStream,
    rx: Receiver<(u16, Vec<u8>)>,
    pending_rx: VecDeque<(u16, Vec<u8>)>,
    rpc: RpcChannel,
    shutdown: Arc<AtomicBool>,
    rx_drops: Arc<AtomicU64>,
}

impl TcpTransport {
    /// Connect the data plane to `server` and serve RPC on `rpc_port`.
    pub fn connect(server: &str, data_port: u16, rpc_port: u16) -> Result<Self, TransportError> {
        let rx_addr = format!("{}:{}", server, data_port);
        let tx_addr = format!("{}:{}", server, data_port + 1);

        let rx_sock = TcpStream::connect(&rx_addr)
            .map_err(|source| TransportError::Connect { addr: rx_addr.clone(), source })?;
        rx_sock.set_nodelay(true)?;
        let tx_sock = TcpStream::connect(&tx_addr)
            .map_err(|source| TransportError::Connect { addr: tx_addr.clone(), source })?;
        tx_sock.set_nodelay(true)?;

        info!(rx = %rx_addr, tx = %tx_addr, rpc_port, "data plane connected");

        let shutdown = Arc::new(AtomicBool::new(false));
        let rx_drops = Arc::new(AtomicU64::new(0));
        let (frame_tx, frame_rx) = bounded(RX_QUEUE_DEPTH);
        spawn_rx_pump(rx_sock.try_clone()?, frame_tx, shutdown.clone(), rx_drops.clone());

        let rpc = RpcChannel::serve(rpc_port, shutdown.clone())?;

        Ok(TcpTransport {
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

impl Transport for TcpTransport {
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

pub(crate) fn spawn_rx_pump(
    mut reader: impl Read + Send + 'static,
    frames: Sender<(u16, Vec<u8>)>,
    shutdown: Arc<AtomicBool>,
    drops: Arc<AtomicU64>,
) {
    std::thread::Builder::new()
        .name("netemu-rx".into())
        .spawn(move || {
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match read_msg(&mut reader) {
                    Ok((_, frame)) if frame.is_empty() => continue, // heartbeat
                    Ok(msg) => {
                        if frames.try_send(msg).is_err() {
                            drops.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        if !shutdown.load(Ordering::SeqCst) {
                            debug!(error = %e, "rx stream closed");
                        }
                        break;
                    }
                }
            }
        })
        .expect("spawn rx thread");
}

pub(crate) fn spawn_rpc_server(
    port: u16,
    requests: Sender<Vec<u8>>,
    replies: Receiver<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    info!(port, "rpc server listening");
    std::thread::Builder::new().name("netemu-rpc".into()).spawn(move || {
        for conn in listener.incoming() {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let mut conn = match conn {
                Ok(c) => c,
                Err(_) => continue,
            };
            debug!("rpc client connected");
            serve_rpc_conn(&mut conn, &requests, &replies);
            debug!("rpc client disconnected");
        }
    })?;
    Ok(())
}

fn serve_rpc_conn(
    conn: &mut TcpStream,
    requests: &Sender<Vec<u8>>,
    replies: &Receiver<Vec<u8>>,
) {
    // envelopes are json; anything past this is a broken client
    const MAX_RPC_LEN: usize = 1 << 20;

    loop {
        let mut len = [0u8; 4];
        if conn.read_exact(&mut len).is_err() {
            return;
        }
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_RPC_LEN {
            warn!(len, "oversized rpc envelope, dropping client");
            return;
        }
        let mut req = vec![0u8; len];
        if conn.read_exact(&mut req).is_err() {
            return;
        }
        if requests.send(req).is_err() {
            return;
        }
        // the worker produces exactly one response per envelope
        let reply = match replies.recv_timeout(Duration::from_secs(10)) {
            Ok(r) => r,
            Err(_) => {
                warn!("no rpc reply within deadline, dropping client");
                return;
            }
        };
        if conn.write_all(&(reply.len() as u32).to_be_bytes()).is_err()
            || conn.write_all(&reply).is_err()
            || conn.flush().is_err()
        {
            return;
        }
    }
}
