//! ICMPv4 echo responder for client-owned addresses.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::Value;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr,
};
use tracing::debug;

use crate::counter_rec;
use crate::counters::{Counter, CounterDb, Severity};
use crate::ctx::ThreadCtx;
use crate::mbuf::Mbuf;
use crate::netns::{MacKey, Namespace};
use crate::parser::{ETH_TYPE_IPV4, IP_PROTO_ICMP, ParseCtx};
use crate::plugin::{Layer, ParserHook, Plugin, PluginError, PluginFactory, PluginRef, RxVerdict};
use crate::plugins::eth_header;

pub const ICMP_PLUG: &str = "icmp";

#[derive(Debug, Default, Clone)]
struct IcmpStats {
    rx_pkts: Counter<u64>,
    tx_pkts: Counter<u64>,
    rx_parse_err: Counter<u64>,
    rx_no_owner: Counter<u64>,
}

impl IcmpStats {
    fn new_db(&self) -> CounterDb {
        let mut db = CounterDb::new("icmp");
        db.add(counter_rec!(self.rx_pkts, "RxPkts", "icmp packets received", "pkts", Severity::Info));
        db.add(counter_rec!(self.tx_pkts, "TxPkts", "icmp packets sent", "pkts", Severity::Info));
        db.add(counter_rec!(
            self.rx_parse_err,
            "RxParseErr",
            "malformed icmp packets",
            "pkts",
            Severity::Error
        ));
        db.add(counter_rec!(
            self.rx_no_owner,
            "RxNoOwner",
            "echo for an address no client owns",
            "pkts",
            Severity::Warn
        ));
        db
    }
}

pub struct IcmpNsPlugin {
    ns: Weak<Namespace>,
    stats: IcmpStats,
    cdb: Rc<CounterDb>,
}

impl IcmpNsPlugin {
    fn new(ns: &Rc<Namespace>) -> Self {
        let stats = IcmpStats::default();
        let cdb = Rc::new(stats.new_db());
        IcmpNsPlugin { ns: Rc::downgrade(ns), stats, cdb }
    }
}

impl Plugin for IcmpNsPlugin {
    fn on_rx(&mut self, ctx: &Rc<ThreadCtx>, m: &Mbuf, pc: &ParseCtx) -> RxVerdict {
        self.stats.rx_pkts.inc();
        let Some(ns) = self.ns.upgrade() else {
            return RxVerdict::Pass;
        };

        let data = &m.data()[pc.l3_off..];
        let Ok(ip) = Ipv4Packet::new_checked(data) else {
            self.stats.rx_parse_err.inc();
            return RxVerdict::Consumed;
        };
        let caps = ChecksumCapabilities::default();
        let Ok(icmp) = Icmpv4Packet::new_checked(ip.payload()) else {
            self.stats.rx_parse_err.inc();
            return RxVerdict::Consumed;
        };
        if icmp.msg_type() != Icmpv4Message::EchoRequest {
            return RxVerdict::Consumed;
        }

        let Some(owner) = ns.client_by_ipv4(ip.dst_addr().into()) else {
            self.stats.rx_no_owner.inc();
            return RxVerdict::Consumed;
        };

        let reply = Icmpv4Repr::EchoReply {
            ident: icmp.echo_ident(),
            seq_no: icmp.echo_seq_no(),
            data: icmp.data(),
        };
        let ip_reply = Ipv4Repr {
            src_addr: ip.dst_addr(),
            dst_addr: ip.src_addr(),
            next_header: IpProtocol::Icmp,
            payload_len: reply.buffer_len(),
            hop_limit: 64,
        };

        let mut frame = eth_header(pc.src_mac, owner.mac, &ns.key, ETH_TYPE_IPV4);
        let off = frame.len();
        frame.resize(off + ip_reply.buffer_len() + reply.buffer_len(), 0);
        let mut ip_pkt = Ipv4Packet::new_unchecked(&mut frame[off..]);
        ip_reply.emit(&mut ip_pkt, &caps);
        let mut icmp_pkt = Icmpv4Packet::new_unchecked(ip_pkt.payload_mut());
        reply.emit(&mut icmp_pkt, &caps);

        debug!(dst = %ip.src_addr(), "echo reply");
        ctx.send_buffer(false, &owner, &frame);
        self.stats.tx_pkts.inc();
        RxVerdict::Consumed
    }

    fn counters(&self) -> Option<Rc<CounterDb>> {
        Some(self.cdb.clone())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct IcmpFactory;

impl PluginFactory for IcmpFactory {
    fn name(&self) -> &'static str {
        ICMP_PLUG
    }

    fn hooks(&self) -> Vec<ParserHook> {
        vec![ParserHook::new(Layer::L3, u16::from(IP_PROTO_ICMP))]
    }

    fn create_ns(
        &self,
        _ctx: &Rc<ThreadCtx>,
        ns: &Rc<Namespace>,
        _init: &Value,
    ) -> Result<PluginRef, PluginError> {
        Ok(Rc::new(RefCell::new(IcmpNsPlugin::new(ns))))
    }
}
