//! Client-scoped ICMPv6 echo initiator.
//!
//! A ping run sends `amount` requests at `pace` packets per second
//! through the client's resolved gateway and counts the replies routed
//! back by the namespace plugin.

use serde::Deserialize;
use serde_json::{Value, json};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, Icmpv6Packet, Icmpv6Repr, IpProtocol, Ipv6Address, Ipv6Packet, Ipv6Repr,
};

use crate::netns::{Client, Ipv6Key, MacKey};
use crate::parser::ETH_TYPE_IPV6;
use crate::plugins::eth_header;
use crate::rpc::RpcError;

/// Identifier stamped into every generated echo request.
pub const PING_IDENT: u16 = 0xbeef;

const PING_PAYLOAD: &[u8] = b"netemu-ping";

#[derive(Debug, Deserialize)]
pub struct PingParams {
    pub dst: [u8; 16],
    #[serde(default = "default_amount")]
    pub amount: u32,
    /// Packets per second.
    #[serde(default = "default_pace")]
    pub pace: f64,
}

fn default_amount() -> u32 {
    5
}

fn default_pace() -> f64 {
    1.0
}

impl PingParams {
    pub fn parse(params: &Value) -> Result<Self, RpcError> {
        let p: PingParams = serde_json::from_value(params.clone())
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;
        if p.amount == 0 || !(p.pace > 0.0) {
            return Err(RpcError::invalid_params("amount and pace must be positive"));
        }
        Ok(p)
    }

    pub fn period_ticks(&self, tick_period_sec: f64) -> u32 {
        ((1.0 / self.pace) / tick_period_sec).max(1.0) as u32
    }
}

#[derive(Debug)]
pub struct PingRun {
    pub dst: Ipv6Key,
    pub amount: u32,
    pub period_ticks: u32,
    pub next_seq: u16,
    pub sent: u64,
    pub received: u64,
    pub active: bool,
}

impl PingRun {
    pub fn new(dst: Ipv6Key, amount: u32, period_ticks: u32) -> Self {
        PingRun { dst, amount, period_ticks, next_seq: 0, sent: 0, received: 0, active: true }
    }

    /// Build the next request frame, or `None` when the run is done.
    /// Ethernet addresses are placeholders; the unicast send path fills
    /// them from the client and its gateway.
    pub fn next_request(&mut self, client: &Client) -> Option<Vec<u8>> {
        if self.sent >= u64::from(self.amount) {
            self.active = false;
            return None;
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.sent += 1;

        let ns = client.namespace()?;
        let src: Ipv6Address = client.ipv6.get().into();
        let dst: Ipv6Address = self.dst.into();

        let echo = Icmpv6Repr::EchoRequest { ident: PING_IDENT, seq_no: seq, data: PING_PAYLOAD };
        let ip = Ipv6Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: IpProtocol::Icmpv6,
            payload_len: echo.buffer_len(),
            hop_limit: 64,
        };

        let mut frame = eth_header(MacKey([0; 6]), client.mac, &ns.key, ETH_TYPE_IPV6);
        let off = frame.len();
        frame.resize(off + ip.buffer_len() + echo.buffer_len(), 0);
        let mut ip_pkt = Ipv6Packet::new_unchecked(&mut frame[off..]);
        ip.emit(&mut ip_pkt);
        let mut icmp_pkt = Icmpv6Packet::new_unchecked(ip_pkt.payload_mut());
        echo.emit(
            &IpAddress::Ipv6(src),
            &IpAddress::Ipv6(dst),
            &mut icmp_pkt,
            &ChecksumCapabilities::default(),
        );

        Some(frame)
    }

    /// Replies keep counting after the last send; `active` only tracks
    /// whether requests are still going out.
    pub fn on_reply(&mut self, ident: u16, _seq: u16, src: Ipv6Key) {
        if ident == PING_IDENT && src == self.dst && self.received < self.sent {
            self.received += 1;
        }
    }

    pub fn stats(&self) -> Value {
        json!({
            "dst": self.dst.0.to_vec(),
            "sent": self.sent,
            "received": self.received,
            "active": self.active,
        })
    }
}
