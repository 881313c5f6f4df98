//! ARP: responder for client-owned IPv4 addresses and resolution of
//! client default gateways.
//!
//! The namespace instance answers requests and learns from replies; each
//! client with an unresolved IPv4 gateway gets a query timer that retries
//! once a second until a reply resolves it.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::Value;
use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetAddress, Ipv4Address};
use tracing::debug;

use crate::counter_rec;
use crate::counters::{Counter, CounterDb, Severity};
use crate::ctx::ThreadCtx;
use crate::mbuf::Mbuf;
use crate::netns::{Client, MacKey, Namespace};
use crate::parser::ETH_TYPE_ARP;
use crate::plugin::{
    Layer, ParserHook, Plugin, PluginError, PluginFactory, PluginRef, RxVerdict,
};
use crate::plugins::eth_header;
use crate::parser::ParseCtx;
use crate::timerw::{TimerCallback, TimerId};

pub const ARP_PLUG: &str = "arp";

/// Query retry period for unresolved gateways, in ticks.
const QUERY_RETRY_TICKS: u32 = 1000;

#[derive(Debug, Default, Clone)]
struct ArpStats {
    rx_query: Counter<u64>,
    tx_reply: Counter<u64>,
    rx_reply: Counter<u64>,
    tx_query: Counter<u64>,
    rx_err: Counter<u64>,
}

impl ArpStats {
    fn new_db(&self) -> CounterDb {
        let mut db = CounterDb::new("arp");
        db.add(counter_rec!(self.rx_query, "RxQuery", "queries received", "pkts", Severity::Info));
        db.add(counter_rec!(self.tx_reply, "TxReply", "replies sent", "pkts", Severity::Info));
        db.add(counter_rec!(self.rx_reply, "RxReply", "replies received", "pkts", Severity::Info));
        db.add(counter_rec!(self.tx_query, "TxQuery", "queries sent", "pkts", Severity::Info));
        db.add(counter_rec!(self.rx_err, "RxErr", "malformed arp frames", "pkts", Severity::Error));
        db
    }
}

fn build_arp_frame(tun: &crate::netns::TunnelKey, eth_dst: MacKey, repr: &ArpRepr) -> Vec<u8> {
    let src_mac = match repr {
        ArpRepr::EthernetIpv4 { source_hardware_addr, .. } => *source_hardware_addr,
        _ => unreachable!("only ethernet/ipv4 arp is built"),
    };
    let mut frame = eth_header(eth_dst, MacKey(src_mac.0), tun, ETH_TYPE_ARP);
    let off = frame.len();
    frame.resize(off + repr.buffer_len(), 0);
    let mut pkt = ArpPacket::new_unchecked(&mut frame[off..]);
    repr.emit(&mut pkt);
    frame
}

/// Namespace-scoped side: answers queries, learns from replies.
pub struct ArpNsPlugin {
    ns: Weak<Namespace>,
    stats: ArpStats,
    cdb: Rc<CounterDb>,
}

impl ArpNsPlugin {
    fn new(ns: &Rc<Namespace>) -> Self {
        let stats = ArpStats::default();
        let cdb = Rc::new(stats.new_db());
        ArpNsPlugin { ns: Rc::downgrade(ns), stats, cdb }
    }

    fn handle_request(
        &mut self,
        ctx: &Rc<ThreadCtx>,
        ns: &Rc<Namespace>,
        source_hardware_addr: EthernetAddress,
        source_protocol_addr: Ipv4Address,
        target_protocol_addr: Ipv4Address,
    ) -> RxVerdict {
        self.stats.rx_query.inc();
        let Some(owner) = ns.client_by_ipv4(target_protocol_addr.into()) else {
            return RxVerdict::Pass;
        };
        let reply = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: owner.mac.into(),
            source_protocol_addr: target_protocol_addr,
            target_hardware_addr: source_hardware_addr,
            target_protocol_addr: source_protocol_addr,
        };
        debug!(ip = %target_protocol_addr, mac = %owner.mac, "answering arp query");
        let frame = build_arp_frame(&ns.key, MacKey(source_hardware_addr.0), &reply);
        ctx.send_buffer(false, &owner, &frame);
        self.stats.tx_reply.inc();
        RxVerdict::Consumed
    }

    fn handle_reply(
        &mut self,
        ns: &Rc<Namespace>,
        sender_mac: EthernetAddress,
        sender_ip: Ipv4Address,
    ) -> RxVerdict {
        self.stats.rx_reply.inc();
        let sender_ip = crate::netns::Ipv4Key::from(sender_ip);
        for client in ns.clients() {
            let mut dgw = client.dgw_v4.borrow_mut();
            if dgw.ip == Some(sender_ip) && !dgw.resolved {
                debug!(client = %client.mac, gw = %sender_ip, mac = %MacKey(sender_mac.0), "gateway resolved");
                dgw.resolve(MacKey(sender_mac.0));
            }
        }
        RxVerdict::Consumed
    }
}

impl Plugin for ArpNsPlugin {
    fn on_rx(&mut self, ctx: &Rc<ThreadCtx>, m: &Mbuf, pc: &ParseCtx) -> RxVerdict {
        let Some(ns) = self.ns.upgrade() else {
            return RxVerdict::Pass;
        };
        let data = &m.data()[pc.l3_off..];
        let repr = match ArpPacket::new_checked(data).and_then(|p| ArpRepr::parse(&p)) {
            Ok(r) => r,
            Err(_) => {
                self.stats.rx_err.inc();
                return RxVerdict::Consumed;
            }
        };
        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = repr
        else {
            self.stats.rx_err.inc();
            return RxVerdict::Consumed;
        };
        match operation {
            ArpOperation::Request => self.handle_request(
                ctx,
                &ns,
                source_hardware_addr,
                source_protocol_addr,
                target_protocol_addr,
            ),
            ArpOperation::Reply => self.handle_reply(&ns, source_hardware_addr, source_protocol_addr),
            _ => {
                self.stats.rx_err.inc();
                RxVerdict::Consumed
            }
        }
    }

    fn counters(&self) -> Option<Rc<CounterDb>> {
        Some(self.cdb.clone())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// Client-scoped side: drives gateway resolution with a retry timer.
pub struct ArpClientPlugin {
    client: Weak<Client>,
    timer: Option<TimerId>,
    stats: ArpStats,
    cdb: Rc<CounterDb>,
}

struct QueryTimer {
    plugin: Weak<RefCell<ArpClientPlugin>>,
}

impl TimerCallback<Rc<ThreadCtx>> for QueryTimer {
    fn on_timer(&self, ctx: &Rc<ThreadCtx>) {
        if let Some(plugin) = self.plugin.upgrade() {
            plugin.borrow_mut().query_tick(ctx);
        }
    }
}

impl ArpClientPlugin {
    fn create(ctx: &Rc<ThreadCtx>, client: &Rc<Client>) -> PluginRef {
        let stats = ArpStats::default();
        let cdb = Rc::new(stats.new_db());
        let plugin = Rc::new(RefCell::new(ArpClientPlugin {
            client: Rc::downgrade(client),
            timer: None,
            stats,
            cdb,
        }));
        let timer =
            ctx.new_client_timer(client, Rc::new(QueryTimer { plugin: Rc::downgrade(&plugin) }));
        plugin.borrow_mut().timer = Some(timer);
        if needs_resolution(client) {
            ctx.start_timer(timer, 1);
        }
        plugin
    }

    fn query_tick(&mut self, ctx: &Rc<ThreadCtx>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if !needs_resolution(&client) {
            return;
        }
        let Some(ns) = client.namespace() else {
            return;
        };
        let gw_ip = client.dgw_v4.borrow().ip.expect("checked by needs_resolution");
        let query = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: client.mac.into(),
            source_protocol_addr: client.ipv4.get().into(),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: gw_ip.into(),
        };
        let frame = build_arp_frame(&ns.key, MacKey::BROADCAST, &query);
        ctx.send_buffer(false, &client, &frame);
        self.stats.tx_query.inc();
        if let Some(timer) = self.timer {
            ctx.start_timer(timer, QUERY_RETRY_TICKS);
        }
    }
}

fn needs_resolution(client: &Client) -> bool {
    let dgw = client.dgw_v4.borrow();
    dgw.ip.is_some() && !dgw.resolved
}

impl Plugin for ArpClientPlugin {
    fn on_destroy(&mut self, ctx: &Rc<ThreadCtx>) {
        if let Some(timer) = self.timer {
            ctx.stop_timer(timer);
        }
    }

    fn counters(&self) -> Option<Rc<CounterDb>> {
        Some(self.cdb.clone())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct ArpFactory;

impl PluginFactory for ArpFactory {
    fn name(&self) -> &'static str {
        ARP_PLUG
    }

    fn hooks(&self) -> Vec<ParserHook> {
        vec![ParserHook::new(Layer::L2, ETH_TYPE_ARP)]
    }

    fn create_ns(
        &self,
        _ctx: &Rc<ThreadCtx>,
        ns: &Rc<Namespace>,
        _init: &Value,
    ) -> Result<PluginRef, PluginError> {
        Ok(Rc::new(RefCell::new(ArpNsPlugin::new(ns))))
    }

    fn create_client(
        &self,
        ctx: &Rc<ThreadCtx>,
        client: &Rc<Client>,
        _init: &Value,
    ) -> Result<PluginRef, PluginError> {
        Ok(ArpClientPlugin::create(ctx, client))
    }
}
