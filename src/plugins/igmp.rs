//! IGMPv2 namespace membership.
//!
//! Keeps the namespace's IPv4 multicast group set, emits a membership
//! report when a group is joined (and on general queries) and a leave
//! when it is removed. Reports are sourced from a designated client: the
//! one matching the `dmac` init field, else the first client present at
//! send time.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use serde::Deserialize;
use serde_json::{Value, json};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv4Repr};
use tracing::debug;

use crate::counter_rec;
use crate::counters::{Counter, CounterDb, Severity};
use crate::csum;
use crate::ctx::ThreadCtx;
use crate::mbuf::Mbuf;
use crate::netns::{Client, Ipv4Key, MacKey, Namespace};
use crate::parser::{ETH_TYPE_IPV4, IP_PROTO_IGMP, ParseCtx};
use crate::plugin::{Layer, ParserHook, Plugin, PluginError, PluginFactory, PluginRef, RpcScope, RxVerdict};
use crate::plugins::eth_header;
use crate::rpc::RpcError;

pub const IGMP_PLUG: &str = "igmp";

const IGMP_TYPE_QUERY: u8 = 0x11;
const IGMP_TYPE_REPORT_V2: u8 = 0x16;
const IGMP_TYPE_LEAVE: u8 = 0x17;

/// Leave-group messages go to the all-routers group.
const ALL_ROUTERS: Ipv4Key = Ipv4Key([224, 0, 0, 2]);

#[derive(Debug, Default, Clone)]
struct IgmpStats {
    rx_query: Counter<u64>,
    tx_report: Counter<u64>,
    tx_leave: Counter<u64>,
    no_designated: Counter<u64>,
}

impl IgmpStats {
    fn new_db(&self) -> CounterDb {
        let mut db = CounterDb::new("igmp");
        db.add(counter_rec!(self.rx_query, "RxQuery", "queries received", "pkts", Severity::Info));
        db.add(counter_rec!(self.tx_report, "TxReport", "reports sent", "pkts", Severity::Info));
        db.add(counter_rec!(self.tx_leave, "TxLeave", "leaves sent", "pkts", Severity::Info));
        db.add(counter_rec!(
            self.no_designated,
            "NoDesignated",
            "sends skipped without a designated client",
            "pkts",
            Severity::Error
        ));
        db
    }
}

pub struct IgmpNsPlugin {
    ns: Weak<Namespace>,
    groups: BTreeSet<Ipv4Key>,
    dmac: Option<MacKey>,
    stats: IgmpStats,
    cdb: Rc<CounterDb>,
}

impl IgmpNsPlugin {
    fn new(ns: &Rc<Namespace>, dmac: Option<MacKey>) -> Self {
        let stats = IgmpStats::default();
        let cdb = Rc::new(stats.new_db());
        IgmpNsPlugin { ns: Rc::downgrade(ns), groups: BTreeSet::new(), dmac, stats, cdb }
    }

    fn designated(&self, ns: &Namespace) -> Option<Rc<Client>> {
        if let Some(mac) = self.dmac {
            return ns.client_by_mac(mac);
        }
        ns.client_macs().first().and_then(|m| ns.client_by_mac(*m))
    }

    fn send_message(&mut self, ctx: &Rc<ThreadCtx>, msg_type: u8, group: Ipv4Key, dst: Ipv4Key) {
        let Some(ns) = self.ns.upgrade() else {
            return;
        };
        let Some(client) = self.designated(&ns) else {
            self.stats.no_designated.inc();
            return;
        };

        let mut igmp = [0u8; 8];
        igmp[0] = msg_type;
        igmp[4..8].copy_from_slice(&group.0);
        let ck = csum::checksum(&igmp);
        igmp[2..4].copy_from_slice(&ck.to_be_bytes());

        let ip = Ipv4Repr {
            src_addr: client.ipv4.get().into(),
            dst_addr: dst.into(),
            next_header: IpProtocol::Igmp,
            payload_len: igmp.len(),
            hop_limit: 1,
        };
        let mut frame =
            eth_header(MacKey::from_ipv4_mcast(dst), client.mac, &ns.key, ETH_TYPE_IPV4);
        let off = frame.len();
        frame.resize(off + ip.buffer_len() + igmp.len(), 0);
        let mut ip_pkt = Ipv4Packet::new_unchecked(&mut frame[off..]);
        ip.emit(&mut ip_pkt, &ChecksumCapabilities::default());
        ip_pkt.payload_mut().copy_from_slice(&igmp);

        ctx.send_buffer(false, &client, &frame);
        match msg_type {
            IGMP_TYPE_LEAVE => self.stats.tx_leave.inc(),
            _ => self.stats.tx_report.inc(),
        }
    }

    fn add_groups(&mut self, ctx: &Rc<ThreadCtx>, vec: Vec<Ipv4Key>) {
        for group in vec {
            if self.groups.insert(group) {
                if let Some(ns) = self.ns.upgrade() {
                    if let Some(c) = self.designated(&ns) {
                        ns.mcast_join(MacKey::from_ipv4_mcast(group), c.mac);
                    }
                }
                debug!(%group, "igmp join");
                self.send_message(ctx, IGMP_TYPE_REPORT_V2, group, group);
            }
        }
    }

    fn remove_groups(&mut self, ctx: &Rc<ThreadCtx>, vec: Vec<Ipv4Key>) {
        for group in vec {
            if self.groups.remove(&group) {
                if let Some(ns) = self.ns.upgrade() {
                    if let Some(c) = self.designated(&ns) {
                        ns.mcast_leave(MacKey::from_ipv4_mcast(group), c.mac);
                    }
                }
                debug!(%group, "igmp leave");
                self.send_message(ctx, IGMP_TYPE_LEAVE, group, ALL_ROUTERS);
            }
        }
    }
}

#[derive(Deserialize)]
struct GroupVec {
    vec: Vec<[u8; 4]>,
}

impl Plugin for IgmpNsPlugin {
    fn on_rx(&mut self, ctx: &Rc<ThreadCtx>, m: &Mbuf, pc: &ParseCtx) -> RxVerdict {
        let data = &m.data()[pc.l4_off..];
        if data.is_empty() || data[0] != IGMP_TYPE_QUERY {
            return RxVerdict::Consumed;
        }
        self.stats.rx_query.inc();
        for group in self.groups.clone() {
            self.send_message(ctx, IGMP_TYPE_REPORT_V2, group, group);
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
            "igmp_ns_add" | "igmp_ns_remove" => {
                let groups: GroupVec = serde_json::from_value(params.clone())
                    .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                let vec: Vec<Ipv4Key> = groups.vec.into_iter().map(Ipv4Key).collect();
                if method == "igmp_ns_add" {
                    self.add_groups(ctx, vec);
                } else {
                    self.remove_groups(ctx, vec);
                }
                Ok(Value::Null)
            }
            "igmp_ns_iter" => {
                let vec: Vec<Value> = self.groups.iter().map(|g| json!(g.0.to_vec())).collect();
                Ok(json!({"vec": vec}))
            }
            "igmp_ns_cnt" => {
                let zero = params.get("zero").and_then(Value::as_bool).unwrap_or(false);
                Ok(Value::Object(self.cdb.marshal_values(zero)))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct IgmpFactory;

impl PluginFactory for IgmpFactory {
    fn name(&self) -> &'static str {
        IGMP_PLUG
    }

    fn hooks(&self) -> Vec<ParserHook> {
        vec![ParserHook::new(Layer::L3, u16::from(IP_PROTO_IGMP))]
    }

    fn rpc_methods(&self) -> Vec<(&'static str, RpcScope)> {
        vec![
            ("igmp_ns_add", RpcScope::Ns),
            ("igmp_ns_remove", RpcScope::Ns),
            ("igmp_ns_iter", RpcScope::Ns),
            ("igmp_ns_cnt", RpcScope::Ns),
        ]
    }

    fn create_ns(
        &self,
        _ctx: &Rc<ThreadCtx>,
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
        Ok(Rc::new(RefCell::new(IgmpNsPlugin::new(ns, dmac))))
    }
}
