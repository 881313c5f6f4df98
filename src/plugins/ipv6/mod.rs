//! IPv6 control-plane plugin: neighbor discovery, MLDv2 membership and
//! ICMPv6 echo.
//!
//! The namespace instance answers Neighbor Solicitations and echo
//! requests for client-owned addresses, learns from Neighbor
//! Advertisements (resolving client gateways), and owns the MLDv2 group
//! state with its delayed report timer. The client instance drives
//! gateway solicitation and the echo initiator.

pub mod mld;
pub mod nd;
pub mod ping;

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::Deserialize;
use serde_json::{Value, json};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, Icmpv6Packet, Icmpv6Repr, IpProtocol, Ipv6Address, Ipv6Packet, Ipv6Repr,
    NdiscNeighborFlags, NdiscRepr, RawHardwareAddress,
};
use tracing::debug;

use crate::counter_rec;
use crate::counters::{Counter, CounterDb, Severity};
use crate::ctx::ThreadCtx;
use crate::mbuf::Mbuf;
use crate::netns::{Client, Ipv6Key, MacKey, Namespace};
use crate::parser::ETH_TYPE_IPV6;
use crate::plugin::{
    Layer, ParserHook, Plugin, PluginError, PluginFactory, PluginRef, RpcScope, RxVerdict,
};
use crate::plugins::eth_header;
use crate::parser::ParseCtx;
use crate::rpc::RpcError;
use crate::timerw::{TimerCallback, TimerId};

use mld::{CHANGE_TO_INCLUDE, MODE_IS_EXCLUDE, MldState, REPORT_DELAY_TICKS};
use nd::{NdTable, solicited_node};
use ping::{PingParams, PingRun};

pub const IPV6_PLUG: &str = "ipv6";

/// Gateway solicitation retry period, in ticks.
const RESOLVE_RETRY_TICKS: u32 = 1000;

const ICMPV6_ECHO_REQUEST: u16 = 128;
const ICMPV6_ECHO_REPLY: u16 = 129;
const ICMPV6_MLD_QUERY: u16 = 130;
const ICMPV6_MLDV1_REPORT: u16 = 131;
const ICMPV6_MLDV1_DONE: u16 = 132;
const ICMPV6_NEIGHBOR_SOLICIT: u16 = 135;
const ICMPV6_NEIGHBOR_ADVERT: u16 = 136;
const ICMPV6_MLDV2_REPORT: u16 = 143;

const ALL_NODES: Ipv6Key = Ipv6Key([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

#[derive(Debug, Default, Clone)]
struct Ipv6Stats {
    rx_pkts: Counter<u64>,
    tx_pkts: Counter<u64>,
    rx_parse_err: Counter<u64>,
    rx_no_owner: Counter<u64>,
    rx_neighbor_solicit: Counter<u64>,
    rx_neighbor_advert: Counter<u64>,
    rx_echo_req: Counter<u64>,
    rx_mld_query: Counter<u64>,
    tx_neighbor_advert: Counter<u64>,
    tx_mld_report: Counter<u64>,
}

impl Ipv6Stats {
    fn new_db(&self) -> CounterDb {
        let mut db = CounterDb::new("ipv6");
        db.add(counter_rec!(self.rx_pkts, "RxPkts", "icmpv6 frames received", "pkts", Severity::Info));
        db.add(counter_rec!(self.tx_pkts, "TxPkts", "icmpv6 frames sent", "pkts", Severity::Info));
        db.add(counter_rec!(
            self.rx_parse_err,
            "RxParseErr",
            "malformed icmpv6 frames",
            "pkts",
            Severity::Error
        ));
        db.add(counter_rec!(
            self.rx_no_owner,
            "RxNoOwner",
            "frames for addresses no client owns",
            "pkts",
            Severity::Warn
        ));
        db.add(counter_rec!(
            self.rx_neighbor_solicit,
            "RxNeighborSolicit",
            "neighbor solicitations received",
            "pkts",
            Severity::Info
        ));
        db.add(counter_rec!(
            self.rx_neighbor_advert,
            "RxNeighborAdvert",
            "neighbor advertisements received",
            "pkts",
            Severity::Info
        ));
        db.add(counter_rec!(
            self.rx_echo_req,
            "RxEchoReq",
            "echo requests received",
            "pkts",
            Severity::Info
        ));
        db.add(counter_rec!(
            self.rx_mld_query,
            "RxMldQuery",
            "mld queries received",
            "pkts",
            Severity::Info
        ));
        db.add(counter_rec!(
            self.tx_neighbor_advert,
            "TxNeighborAdvert",
            "neighbor advertisements sent",
            "pkts",
            Severity::Info
        ));
        db.add(counter_rec!(
            self.tx_mld_report,
            "TxMldReport",
            "mldv2 reports sent",
            "pkts",
            Severity::Info
        ));
        db
    }
}

pub struct Ipv6NsPlugin {
    ns: Weak<Namespace>,
    pub nd: NdTable,
    pub mld: MldState,
    dmac: Option<MacKey>,
    report_timer: Option<TimerId>,
    stats: Ipv6Stats,
    cdb: Rc<CounterDb>,
}

/// Delayed MLD report: resolves the plugin by name at fire time, so a
/// torn-down namespace makes the callback inert.
struct MldReportTimer {
    ns: Weak<Namespace>,
}

impl TimerCallback<Rc<ThreadCtx>> for MldReportTimer {
    fn on_timer(&self, ctx: &Rc<ThreadCtx>) {
        let Some(ns) = self.ns.upgrade() else {
            return;
        };
        let Some(plug) = ns.plugins.get(IPV6_PLUG) else {
            return;
        };
        let mut plug = plug.borrow_mut();
        if let Some(me) = plug.as_any().downcast_mut::<Ipv6NsPlugin>() {
            me.send_mld_report(ctx);
        }
    }
}

impl Ipv6NsPlugin {
    fn create(ctx: &Rc<ThreadCtx>, ns: &Rc<Namespace>, dmac: Option<MacKey>) -> PluginRef {
        let stats = Ipv6Stats::default();
        let cdb = Rc::new(stats.new_db());
        let plugin = Rc::new(RefCell::new(Ipv6NsPlugin {
            ns: Rc::downgrade(ns),
            nd: NdTable::default(),
            mld: MldState::default(),
            dmac,
            report_timer: None,
            stats,
            cdb,
        }));
        let timer = ctx.new_ns_timer(ns, Rc::new(MldReportTimer { ns: Rc::downgrade(ns) }));
        plugin.borrow_mut().report_timer = Some(timer);
        plugin
    }

    fn designated(&self, ns: &Namespace) -> Option<Rc<Client>> {
        if let Some(mac) = self.dmac {
            return ns.client_by_mac(mac);
        }
        ns.client_macs().first().and_then(|m| ns.client_by_mac(*m))
    }

    fn send(&self, ctx: &Rc<ThreadCtx>, client: &Client, frame: &[u8]) {
        ctx.send_buffer(false, client, frame);
        self.stats.tx_pkts.inc();
    }

    fn schedule_report(&mut self, ctx: &Rc<ThreadCtx>) {
        if self.mld.mark_pending() {
            if let Some(timer) = self.report_timer {
                ctx.start_timer(timer, REPORT_DELAY_TICKS);
            }
        }
    }

    /// Emit the full membership as MODE_IS_EXCLUDE records.
    fn send_mld_report(&mut self, ctx: &Rc<ThreadCtx>) {
        self.mld.clear_pending();
        let Some(ns) = self.ns.upgrade() else {
            return;
        };
        if self.mld.is_empty() {
            return;
        }
        let Some(client) = self.designated(&ns) else {
            return;
        };
        let records: Vec<(u8, Ipv6Key)> =
            self.mld.groups().map(|g| (MODE_IS_EXCLUDE, *g)).collect();
        let frame = mld::build_report(&ns.key, client.mac, &records);
        self.send(ctx, &client, &frame);
        self.stats.tx_mld_report.inc();
    }

    /// Emit leave records for groups just removed.
    fn send_mld_leave(&mut self, ctx: &Rc<ThreadCtx>, removed: &[Ipv6Key]) {
        let Some(ns) = self.ns.upgrade() else {
            return;
        };
        let Some(client) = self.designated(&ns) else {
            return;
        };
        let records: Vec<(u8, Ipv6Key)> =
            removed.iter().map(|g| (CHANGE_TO_INCLUDE, *g)).collect();
        let frame = mld::build_report(&ns.key, client.mac, &records);
        self.send(ctx, &client, &frame);
        self.stats.tx_mld_report.inc();
    }

    fn handle_neighbor_solicit(
        &mut self,
        ctx: &Rc<ThreadCtx>,
        ns: &Rc<Namespace>,
        pc: &ParseCtx,
        ip: &Ipv6Packet<&[u8]>,
        repr: &Icmpv6Repr<'_>,
    ) {
        self.stats.rx_neighbor_solicit.inc();
        let Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit { target_addr, .. }) = repr else {
            return;
        };
        let Some(owner) = ns.client_by_ipv6((*target_addr).into()) else {
            self.stats.rx_no_owner.inc();
            return;
        };

        let (dst_ip, dst_mac) = if ip.src_addr().is_unspecified() {
            (ALL_NODES.into(), MacKey::from_ipv6_mcast(ALL_NODES))
        } else {
            (ip.src_addr(), pc.src_mac)
        };
        let adv = Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
            flags: NdiscNeighborFlags::SOLICITED | NdiscNeighborFlags::OVERRIDE,
            target_addr: *target_addr,
            lladdr: Some(RawHardwareAddress::from_bytes(&owner.mac.0)),
        });
        debug!(target = %target_addr, mac = %owner.mac, "answering neighbor solicitation");
        let frame = build_icmpv6(&ns.key, dst_mac, owner.mac, *target_addr, dst_ip, 255, &adv);
        self.send(ctx, &owner, &frame);
        self.stats.tx_neighbor_advert.inc();
    }

    fn handle_neighbor_advert(&mut self, ns: &Rc<Namespace>, repr: &Icmpv6Repr<'_>) {
        self.stats.rx_neighbor_advert.inc();
        let Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert { target_addr, lladdr, .. }) = repr else {
            return;
        };
        let Some(ll) = lladdr else {
            return;
        };
        let bytes = ll.as_bytes();
        if bytes.len() < 6 {
            return;
        }
        let mac = MacKey(bytes[..6].try_into().unwrap());
        self.nd.learn(ns, (*target_addr).into(), mac);
    }

    fn handle_echo_request(
        &mut self,
        ctx: &Rc<ThreadCtx>,
        ns: &Rc<Namespace>,
        pc: &ParseCtx,
        ip: &Ipv6Packet<&[u8]>,
        repr: &Icmpv6Repr<'_>,
    ) {
        self.stats.rx_echo_req.inc();
        let Icmpv6Repr::EchoRequest { ident, seq_no, data } = repr else {
            return;
        };
        let Some(owner) = ns.client_by_ipv6(ip.dst_addr().into()) else {
            self.stats.rx_no_owner.inc();
            return;
        };
        let reply = Icmpv6Repr::EchoReply { ident: *ident, seq_no: *seq_no, data: *data };
        let frame =
            build_icmpv6(&ns.key, pc.src_mac, owner.mac, ip.dst_addr(), ip.src_addr(), 64, &reply);
        self.send(ctx, &owner, &frame);
    }

    fn handle_echo_reply(&mut self, ns: &Rc<Namespace>, ip: &Ipv6Packet<&[u8]>, repr: &Icmpv6Repr<'_>) {
        let Icmpv6Repr::EchoReply { ident, seq_no, .. } = repr else {
            return;
        };
        let Some(client) = ns.client_by_ipv6(ip.dst_addr().into()) else {
            self.stats.rx_no_owner.inc();
            return;
        };
        let Some(plug) = client.plugins.get(IPV6_PLUG) else {
            return;
        };
        let mut plug = plug.borrow_mut();
        if let Some(cp) = plug.as_any().downcast_mut::<Ipv6ClientPlugin>() {
            cp.on_echo_reply(*ident, *seq_no, ip.src_addr().into());
        }
    }
}

impl Plugin for Ipv6NsPlugin {
    fn on_rx(&mut self, ctx: &Rc<ThreadCtx>, m: &Mbuf, pc: &ParseCtx) -> RxVerdict {
        self.stats.rx_pkts.inc();
        let Some(ns) = self.ns.upgrade() else {
            return RxVerdict::Pass;
        };

        // MLD carries a hop-by-hop header smoltcp's ICMPv6 parser does
        // not see through; the query path only needs the type byte
        if pc.selector == ICMPV6_MLD_QUERY {
            self.stats.rx_mld_query.inc();
            self.schedule_report(ctx);
            return RxVerdict::Consumed;
        }
        if matches!(pc.selector, ICMPV6_MLDV1_REPORT | ICMPV6_MLDV1_DONE | ICMPV6_MLDV2_REPORT) {
            return RxVerdict::Consumed;
        }

        let data = &m.data()[pc.l3_off..];
        let parsed = Ipv6Packet::new_checked(data).ok().and_then(|ip| {
            let icmp = Icmpv6Packet::new_checked(ip.payload()).ok()?;
            let repr = Icmpv6Repr::parse(
                &IpAddress::Ipv6(ip.src_addr()),
                &IpAddress::Ipv6(ip.dst_addr()),
                &icmp,
                &ChecksumCapabilities::default(),
            )
            .ok()?;
            Some((ip, repr))
        });
        let Some((ip, repr)) = parsed else {
            self.stats.rx_parse_err.inc();
            return RxVerdict::Consumed;
        };

        match pc.selector {
            ICMPV6_NEIGHBOR_SOLICIT => self.handle_neighbor_solicit(ctx, &ns, pc, &ip, &repr),
            ICMPV6_NEIGHBOR_ADVERT => self.handle_neighbor_advert(&ns, &repr),
            ICMPV6_ECHO_REQUEST => self.handle_echo_request(ctx, &ns, pc, &ip, &repr),
            ICMPV6_ECHO_REPLY => self.handle_echo_reply(&ns, &ip, &repr),
            _ => {}
        }
        RxVerdict::Consumed
    }

    fn counters(&self) -> Option<Rc<CounterDb>> {
        Some(self.cdb.clone())
    }

    fn on_rpc(
        &mut self,
        ctx: &Rc<ThreadCtx>,
        method: &str,
        params: &Value,
    ) -> Result<Value, RpcError> {
        match method {
            "ipv6_mld_ns_add" | "ipv6_mld_ns_remove" => {
                #[derive(Deserialize)]
                struct GroupVec {
                    vec: Vec<[u8; 16]>,
                }
                let groups: GroupVec = serde_json::from_value(params.clone())
                    .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                let vec: Vec<Ipv6Key> = groups.vec.into_iter().map(Ipv6Key).collect();
                let ns = self.ns.upgrade().ok_or_else(|| RpcError::internal("namespace gone"))?;
                if method == "ipv6_mld_ns_add" {
                    let added = self.mld.add(vec);
                    if let Some(c) = self.designated(&ns) {
                        for g in &added {
                            ns.mcast_join(MacKey::from_ipv6_mcast(*g), c.mac);
                        }
                    }
                    if !added.is_empty() {
                        self.schedule_report(ctx);
                    }
                } else {
                    let removed = self.mld.remove(vec);
                    if let Some(c) = self.designated(&ns) {
                        for g in &removed {
                            ns.mcast_leave(MacKey::from_ipv6_mcast(*g), c.mac);
                        }
                    }
                    if !removed.is_empty() {
                        self.send_mld_leave(ctx, &removed);
                    }
                }
                Ok(Value::Null)
            }
            "ipv6_mld_ns_iter" => Ok(self.mld.marshal()),
            "ipv6_nd_ns_iter" => Ok(self.nd.marshal()),
            "ipv6_ns_cnt" => {
                let zero = params.get("zero").and_then(Value::as_bool).unwrap_or(false);
                Ok(Value::Object(self.cdb.marshal_values(zero)))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn on_destroy(&mut self, ctx: &Rc<ThreadCtx>) {
        if let Some(timer) = self.report_timer {
            ctx.stop_timer(timer);
        }
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// Build an Ethernet(+vlans)/IPv6/ICMPv6 frame via the smoltcp
/// representations, checksums included.
fn build_icmpv6(
    tun: &crate::netns::TunnelKey,
    dst_mac: MacKey,
    src_mac: MacKey,
    src_ip: Ipv6Address,
    dst_ip: Ipv6Address,
    hop_limit: u8,
    repr: &Icmpv6Repr<'_>,
) -> Vec<u8> {
    let ip = Ipv6Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Icmpv6,
        payload_len: repr.buffer_len(),
        hop_limit,
    };
    let mut frame = eth_header(dst_mac, src_mac, tun, ETH_TYPE_IPV6);
    let off = frame.len();
    frame.resize(off + ip.buffer_len() + repr.buffer_len(), 0);
    let mut ip_pkt = Ipv6Packet::new_unchecked(&mut frame[off..]);
    ip.emit(&mut ip_pkt);
    let mut icmp_pkt = Icmpv6Packet::new_unchecked(ip_pkt.payload_mut());
    repr.emit(
        &IpAddress::Ipv6(src_ip),
        &IpAddress::Ipv6(dst_ip),
        &mut icmp_pkt,
        &ChecksumCapabilities::default(),
    );
    frame
}

pub struct Ipv6ClientPlugin {
    client: Weak<Client>,
    ping: Option<PingRun>,
    ping_timer: Option<TimerId>,
    resolve_timer: Option<TimerId>,
}

struct PingTimer {
    plugin: Weak<RefCell<Ipv6ClientPlugin>>,
}

impl TimerCallback<Rc<ThreadCtx>> for PingTimer {
    fn on_timer(&self, ctx: &Rc<ThreadCtx>) {
        if let Some(plugin) = self.plugin.upgrade() {
            plugin.borrow_mut().ping_tick(ctx);
        }
    }
}

struct ResolveTimer {
    plugin: Weak<RefCell<Ipv6ClientPlugin>>,
}

impl TimerCallback<Rc<ThreadCtx>> for ResolveTimer {
    fn on_timer(&self, ctx: &Rc<ThreadCtx>) {
        if let Some(plugin) = self.plugin.upgrade() {
            plugin.borrow_mut().resolve_tick(ctx);
        }
    }
}

impl Ipv6ClientPlugin {
    fn create(ctx: &Rc<ThreadCtx>, client: &Rc<Client>) -> PluginRef {
        let plugin = Rc::new(RefCell::new(Ipv6ClientPlugin {
            client: Rc::downgrade(client),
            ping: None,
            ping_timer: None,
            resolve_timer: None,
        }));
        let ping_timer =
            ctx.new_client_timer(client, Rc::new(PingTimer { plugin: Rc::downgrade(&plugin) }));
        let resolve_timer =
            ctx.new_client_timer(client, Rc::new(ResolveTimer { plugin: Rc::downgrade(&plugin) }));
        {
            let mut p = plugin.borrow_mut();
            p.ping_timer = Some(ping_timer);
            p.resolve_timer = Some(resolve_timer);
        }
        if needs_resolution(client) {
            ctx.start_timer(resolve_timer, 1);
        }
        plugin
    }

    fn resolve_tick(&mut self, ctx: &Rc<ThreadCtx>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if !needs_resolution(&client) {
            return;
        }
        let Some(ns) = client.namespace() else {
            return;
        };
        let gw = client.dgw_v6.borrow().ip.expect("checked by needs_resolution");
        let sol_node = solicited_node(gw);
        let solicit = Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit {
            target_addr: gw.into(),
            lladdr: Some(RawHardwareAddress::from_bytes(&client.mac.0)),
        });
        let frame = build_icmpv6(
            &ns.key,
            MacKey::from_ipv6_mcast(sol_node),
            client.mac,
            client.ipv6.get().into(),
            sol_node.into(),
            255,
            &solicit,
        );
        ctx.send_buffer(false, &client, &frame);
        if let Some(timer) = self.resolve_timer {
            ctx.start_timer(timer, RESOLVE_RETRY_TICKS);
        }
    }

    fn ping_tick(&mut self, ctx: &Rc<ThreadCtx>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let Some(run) = self.ping.as_mut() else {
            return;
        };
        match run.next_request(&client) {
            Some(frame) => {
                ctx.send_buffer(true, &client, &frame);
                if let Some(timer) = self.ping_timer {
                    ctx.start_timer(timer, run.period_ticks);
                }
            }
            None => {
                debug!(client = %client.mac, "ping run finished");
            }
        }
    }

    pub(crate) fn on_echo_reply(&mut self, ident: u16, seq: u16, src: Ipv6Key) {
        if let Some(run) = self.ping.as_mut() {
            run.on_reply(ident, seq, src);
        }
    }
}

fn needs_resolution(client: &Client) -> bool {
    let dgw = client.dgw_v6.borrow();
    dgw.ip.is_some() && !dgw.resolved
}

impl Plugin for Ipv6ClientPlugin {
    fn on_rpc(
        &mut self,
        ctx: &Rc<ThreadCtx>,
        method: &str,
        params: &Value,
    ) -> Result<Value, RpcError> {
        match method {
            "ipv6_start_ping" => {
                if self.ping.as_ref().is_some_and(|r| r.active) {
                    return Err(RpcError::invalid_params("ping already running"));
                }
                let p = PingParams::parse(params)?;
                let period = p.period_ticks(ctx.cfg.tick_period_sec());
                self.ping = Some(PingRun::new(Ipv6Key(p.dst), p.amount, period));
                if let Some(timer) = self.ping_timer {
                    ctx.start_timer(timer, 1);
                }
                Ok(Value::Null)
            }
            "ipv6_get_ping_stats" => match self.ping.as_ref() {
                Some(run) => Ok(run.stats()),
                None => Ok(json!({"sent": 0, "received": 0, "active": false})),
            },
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn on_destroy(&mut self, ctx: &Rc<ThreadCtx>) {
        if let Some(timer) = self.ping_timer {
            ctx.stop_timer(timer);
        }
        if let Some(timer) = self.resolve_timer {
            ctx.stop_timer(timer);
        }
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct Ipv6Factory;

impl PluginFactory for Ipv6Factory {
    fn name(&self) -> &'static str {
        IPV6_PLUG
    }

    fn hooks(&self) -> Vec<ParserHook> {
        [
            ICMPV6_ECHO_REQUEST,
            ICMPV6_ECHO_REPLY,
            ICMPV6_MLD_QUERY,
            ICMPV6_MLDV1_REPORT,
            ICMPV6_MLDV1_DONE,
            ICMPV6_NEIGHBOR_SOLICIT,
            ICMPV6_NEIGHBOR_ADVERT,
            ICMPV6_MLDV2_REPORT,
        ]
        .iter()
        .map(|t| ParserHook::new(Layer::Icmpv6, *t))
        .collect()
    }

    fn rpc_methods(&self) -> Vec<(&'static str, RpcScope)> {
        vec![
            ("ipv6_mld_ns_add", RpcScope::Ns),
            ("ipv6_mld_ns_remove", RpcScope::Ns),
            ("ipv6_mld_ns_iter", RpcScope::Ns),
            ("ipv6_nd_ns_iter", RpcScope::Ns),
            ("ipv6_ns_cnt", RpcScope::Ns),
            ("ipv6_start_ping", RpcScope::Client),
            ("ipv6_get_ping_stats", RpcScope::Client),
        ]
    }

    fn create_ns(
        &self,
        ctx: &Rc<ThreadCtx>,
        ns: &Rc<Namespace>,
        init: &Value,
    ) -> Result<PluginRef, PluginError> {
        let dmac = init
            .get("dmac")
            .map(|v| {
                serde_json::from_value::<[u8; 6]>(v.clone())
                    .map(MacKey)
                    .map_err(|e| PluginError::Init(e.to_string()))
            })
            .transpose()?;
        Ok(Ipv6NsPlugin::create(ctx, ns, dmac))
    }

    fn create_client(
        &self,
        ctx: &Rc<ThreadCtx>,
        client: &Rc<Client>,
        _init: &Value,
    ) -> Result<PluginRef, PluginError> {
        Ok(Ipv6ClientPlugin::create(ctx, client))
    }
}
