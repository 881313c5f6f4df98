//! The per-worker ownership root.
//!
//! `ThreadCtx` owns the mbuf pool, the timer wheel, the transport, the
//! namespace registry and the plugin registry. The worker is single
//! threaded, so everything mutable sits behind `RefCell` and components
//! reach each other through a shared `Rc<ThreadCtx>`. The borrow
//! discipline is: a cell is only held across a call into a *different*
//! cell (pool + veth, never pool + pool); timer callbacks and plugin
//! hooks run with no cell borrowed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::capture::{Recorder, k12_dump};
use crate::config::RuntimeConfig;
use crate::counter_rec;
use crate::counters::{Counter, CounterDb, CounterDbVec, Severity};
use crate::mbuf::{Mbuf, MbufPool};
use crate::netns::{Client, Ipv4Key, Ipv6Key, MacKey, Namespace, RegistryError, TunnelKey};
use crate::parser::{ETH_TYPE_IPV6, ETH_TYPE_QINQ, ETH_TYPE_VLAN, IP_PROTO_ICMPV6, parse_frame};
use crate::plugin::{Layer, PluginRegistry, RpcScope, RxVerdict};
use crate::rpc::{self, RpcError};
use crate::timerw::{TimerCallback, TimerId, TimerWheel};
use crate::transport::{Transport, VethStats};

/// The wheel instantiated with the worker context as callback argument.
pub type EmuTimerWheel = TimerWheel<Rc<ThreadCtx>>;
pub type EmuTimerCb = Rc<dyn TimerCallback<Rc<ThreadCtx>>>;

/// Ingress steering counters.
#[derive(Debug, Default, Clone)]
pub struct CtxStats {
    pub rx_no_namespace: Counter<u64>,
    pub rx_no_plugin: Counter<u64>,
    pub rpc_reqs: Counter<u64>,
    pub rpc_errs: Counter<u64>,
}

impl CtxStats {
    fn new_db(&self) -> CounterDb {
        let mut db = CounterDb::new("ctx");
        db.add(counter_rec!(
            self.rx_no_namespace,
            "RxNoNamespace",
            "frames dropped on unknown tunnel key",
            "pkts",
            Severity::Error
        ));
        db.add(counter_rec!(
            self.rx_no_plugin,
            "RxNoPlugin",
            "frames with no plugin owning the selector",
            "pkts",
            Severity::Warn
        ));
        db.add(counter_rec!(self.rpc_reqs, "RpcReqs", "rpc requests served", "ops", Severity::Info));
        db.add(counter_rec!(self.rpc_errs, "RpcErrs", "rpc error responses", "ops", Severity::Info));
        db
    }
}

pub struct ThreadCtx {
    pub cfg: RuntimeConfig,
    pub mpool: RefCell<MbufPool>,
    pub timerw: RefCell<EmuTimerWheel>,
    pub veth: RefCell<Box<dyn Transport>>,
    pub veth_stats: VethStats,
    pub ctx_stats: CtxStats,
    pub registry: PluginRegistry,
    namespaces: RefCell<HashMap<TunnelKey, Rc<Namespace>>>,
    counters: RefCell<CounterDbVec>,
    recorder: RefCell<Option<Rc<Recorder>>>,
    monitor: RefCell<Option<Box<dyn Write>>>,
    ticks: Cell<u64>,
}

impl ThreadCtx {
    pub fn new(
        cfg: RuntimeConfig,
        registry: PluginRegistry,
        veth: Box<dyn Transport>,
    ) -> Rc<ThreadCtx> {
        let mpool = MbufPool::new(cfg.mbuf_cache);
        let timerw = TimerWheel::new(cfg.wheel_size, cfg.wheel_level1_div, cfg.wheel_levels)
            .expect("timer wheel configuration is validated by the caller");

        let veth_stats = VethStats::default();
        let ctx_stats = CtxStats::default();
        let mut counters = CounterDbVec::new("emu");
        for db in mpool.counter_dbs() {
            counters.add(db);
        }
        counters.add(Rc::new(veth_stats.new_db()));
        counters.add(Rc::new(ctx_stats.new_db()));

        Rc::new(ThreadCtx {
            cfg,
            mpool: RefCell::new(mpool),
            timerw: RefCell::new(timerw),
            veth: RefCell::new(veth),
            veth_stats,
            ctx_stats,
            registry,
            namespaces: RefCell::new(HashMap::new()),
            counters: RefCell::new(counters),
            recorder: RefCell::new(None),
            monitor: RefCell::new(None),
            ticks: Cell::new(0),
        })
    }

    /// Ticks processed since start; the simulation clock.
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    /// Seconds of emulated time, derived from the tick count so captures
    /// are reproducible.
    pub fn now_sec(&self) -> f64 {
        self.ticks.get() as f64 * self.cfg.tick_period_sec()
    }

    pub fn enable_capture(&self) -> Rc<Recorder> {
        let rec = Rc::new(Recorder::new());
        *self.recorder.borrow_mut() = Some(rec.clone());
        rec
    }

    pub fn recorder(&self) -> Option<Rc<Recorder>> {
        self.recorder.borrow().clone()
    }

    pub fn set_monitor(&self, w: Box<dyn Write>) {
        *self.monitor.borrow_mut() = Some(w);
    }

    pub fn counters(&self) -> std::cell::Ref<'_, CounterDbVec> {
        self.counters.borrow()
    }

    pub fn add_counter_db(&self, db: Rc<CounterDb>) {
        self.counters.borrow_mut().add(db);
    }

    // ---- namespaces & clients ------------------------------------------

    pub fn add_ns(&self, key: TunnelKey) -> Result<Rc<Namespace>, RegistryError> {
        let mut namespaces = self.namespaces.borrow_mut();
        if namespaces.contains_key(&key) {
            return Err(RegistryError::NsExists(key));
        }
        let ns = Namespace::new(key);
        namespaces.insert(key, ns.clone());
        info!(%key, "namespace added");
        Ok(ns)
    }

    pub fn get_ns(&self, key: &TunnelKey) -> Option<Rc<Namespace>> {
        self.namespaces.borrow().get(key).cloned()
    }

    pub fn ns_keys(&self) -> Vec<TunnelKey> {
        self.namespaces.borrow().keys().copied().collect()
    }

    pub fn ns_count(&self) -> usize {
        self.namespaces.borrow().len()
    }

    /// Create namespace-scoped plugin instances by name.
    pub fn create_ns_plugins(
        self: &Rc<Self>,
        ns: &Rc<Namespace>,
        specs: &[(String, Value)],
    ) -> Result<(), RpcError> {
        for (name, init) in specs {
            let factory = self
                .registry
                .factory(name)
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;
            if ns.plugins.contains(factory.name()) {
                continue;
            }
            let plug = factory
                .create_ns(self, ns, init)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            ns.plugins.insert(factory.name(), plug);
        }
        Ok(())
    }

    /// Create client-scoped plugin instances by name.
    pub fn create_client_plugins(
        self: &Rc<Self>,
        client: &Rc<Client>,
        specs: &[(String, Value)],
    ) -> Result<(), RpcError> {
        for (name, init) in specs {
            let factory = self
                .registry
                .factory(name)
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;
            if client.plugins.contains(factory.name()) {
                continue;
            }
            let plug = factory
                .create_client(self, client, init)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            client.plugins.insert(factory.name(), plug);
        }
        Ok(())
    }

    /// Destroy a client: plugin teardown first, then index unlink, then
    /// the owned-timer audit. A timer still running after teardown is the
    /// framework's strongest invariant violation and aborts.
    pub fn remove_client(
        self: &Rc<Self>,
        ns: &Rc<Namespace>,
        mac: MacKey,
    ) -> Result<(), RegistryError> {
        let client = ns.client_by_mac(mac).ok_or(RegistryError::ClientNotFound(mac))?;
        for (_, plug) in client.plugins.drain() {
            plug.borrow_mut().on_destroy(self);
        }
        ns.unlink_client(mac)?;
        let mut tw = self.timerw.borrow_mut();
        for id in client.owned_timers.borrow_mut().drain(..) {
            if tw.is_running(id) {
                panic!("client {} destroyed with a timer still running", mac);
            }
            tw.unregister(id);
        }
        debug!(%mac, "client removed");
        Ok(())
    }

    /// Tear down a namespace: clients first, then namespace plugins, then
    /// the namespace's own timer audit.
    pub fn remove_ns(self: &Rc<Self>, key: &TunnelKey) -> Result<(), RegistryError> {
        let ns = self.get_ns(key).ok_or(RegistryError::NsNotFound)?;
        for mac in ns.client_macs() {
            self.remove_client(&ns, mac)?;
        }
        for (_, plug) in ns.plugins.drain() {
            plug.borrow_mut().on_destroy(self);
        }
        {
            let mut tw = self.timerw.borrow_mut();
            for id in ns.owned_timers.borrow_mut().drain(..) {
                if tw.is_running(id) {
                    panic!("namespace {} destroyed with a timer still running", key);
                }
                tw.unregister(id);
            }
        }
        self.namespaces.borrow_mut().remove(key);
        info!(%key, "namespace removed");
        Ok(())
    }

    // ---- timers ---------------------------------------------------------

    /// Register a timer owned by a client; teardown audits it.
    pub fn new_client_timer(&self, client: &Client, cb: EmuTimerCb) -> TimerId {
        let id = self.timerw.borrow_mut().register(cb);
        client.own_timer(id);
        id
    }

    /// Register a timer owned by a namespace; teardown audits it.
    pub fn new_ns_timer(&self, ns: &Namespace, cb: EmuTimerCb) -> TimerId {
        let id = self.timerw.borrow_mut().register(cb);
        ns.own_timer(id);
        id
    }

    pub fn start_timer(&self, id: TimerId, ticks: u32) {
        self.timerw.borrow_mut().start(id, ticks);
    }

    pub fn stop_timer(&self, id: TimerId) {
        self.timerw.borrow_mut().stop(id);
    }

    /// Advance the wheel one tick and run what expired. `expired` is a
    /// caller-provided scratch vector to keep the hot path allocation
    /// free.
    pub fn advance_tick(self: &Rc<Self>, expired: &mut Vec<EmuTimerCb>) {
        self.timerw.borrow_mut().on_tick(self.cfg.min_timer_events, expired);
        self.ticks.set(self.ticks.get() + 1);
        for cb in expired.drain(..) {
            cb.on_timer(self);
        }
    }

    // ---- data path ------------------------------------------------------

    /// Emit one owned frame. Chains are flattened, the wire takes only
    /// contiguous buffers.
    pub fn send(&self, m: Mbuf) {
        let m = if m.is_contiguous() {
            m
        } else {
            let mut pool = self.mpool.borrow_mut();
            let flat = m.contiguous(&mut pool);
            pool.free(m);
            flat
        };
        self.veth_stats.tx_pkts.inc();
        self.veth_stats.tx_bytes.add(u64::from(m.pkt_len()));
        if let Some(w) = self.monitor.borrow_mut().as_mut() {
            let _ = writeln!(w, "\n ->TX<- ");
            let _ = k12_dump(w, self.now_sec(), &m);
        }
        if let Some(rec) = self.recorder.borrow().as_ref() {
            rec.append_frame(self.now_sec(), "tx", &m);
        }
        let mut pool = self.mpool.borrow_mut();
        self.veth.borrow_mut().tx_push(&mut pool, m);
    }

    /// Allocate, stamp and send a prebuilt frame on a client's vport.
    /// With `unicast` the Ethernet addresses are rewritten from the
    /// client and its resolved gateway for the frame's address family; an
    /// unresolved gateway drops the frame.
    pub fn send_buffer(&self, unicast: bool, client: &Client, b: &[u8]) {
        let mut m = self.mpool.borrow_mut().alloc_from(client.vport(), b);
        if unicast {
            let gw_mac = if frame_is_ipv6(b) {
                let dgw = client.dgw_v6.borrow();
                dgw.resolved.then_some(dgw.mac)
            } else {
                let dgw = client.dgw_v4.borrow();
                dgw.resolved.then_some(dgw.mac)
            };
            let Some(gw_mac) = gw_mac else {
                self.veth_stats.tx_drop_not_resolve.inc();
                self.mpool.borrow_mut().free(m);
                return;
            };
            let data = m.data_mut();
            data[0..6].copy_from_slice(&gw_mac.0);
            data[6..12].copy_from_slice(&client.mac.0);
        }
        self.send(m);
    }

    /// Ingress: account, steer to a namespace, dispatch to exactly one
    /// plugin, free. Parse and lookup failures are data-plane events and
    /// only count.
    pub fn handle_rx_packet(self: &Rc<Self>, m: Mbuf) {
        self.veth_stats.rx_pkts.inc();
        self.veth_stats.rx_bytes.add(u64::from(m.pkt_len()));
        if let Some(w) = self.monitor.borrow_mut().as_mut() {
            let _ = writeln!(w, "\n ->RX<- ");
            let _ = k12_dump(w, self.now_sec(), &m);
        }
        if let Some(rec) = self.recorder.borrow().as_ref() {
            rec.append_frame(self.now_sec(), "rx", &m);
        }

        let m = if m.is_contiguous() {
            m
        } else {
            let mut pool = self.mpool.borrow_mut();
            let flat = m.contiguous(&mut pool);
            pool.free(m);
            flat
        };

        let pc = match parse_frame(m.vport(), m.data()) {
            Ok(pc) => pc,
            Err(e) => {
                debug!(error = %e, "rx parse failed");
                self.veth_stats.rx_parse_err.inc();
                self.mpool.borrow_mut().free(m);
                return;
            }
        };

        let Some(ns) = self.get_ns(&pc.tun) else {
            debug!(tun = %pc.tun, "rx for unknown tunnel");
            self.ctx_stats.rx_no_namespace.inc();
            self.mpool.borrow_mut().free(m);
            return;
        };

        let target = self.registry.hook_target(pc.layer, pc.selector).or_else(|| {
            (pc.layer == Layer::Icmpv6)
                .then(|| self.registry.hook_target(Layer::L3, u16::from(IP_PROTO_ICMPV6)))
                .flatten()
        });
        let Some(name) = target else {
            self.ctx_stats.rx_no_plugin.inc();
            self.mpool.borrow_mut().free(m);
            return;
        };

        // ownership narrows: the namespace instance if present, else the
        // destination client's
        let plug = ns
            .plugins
            .get(name)
            .or_else(|| ns.client_by_mac(pc.dst_mac).and_then(|c| c.plugins.get(name)));
        match plug {
            Some(plug) => {
                let verdict = plug.borrow_mut().on_rx(self, &m, &pc);
                if verdict == RxVerdict::Pass {
                    debug!(plugin = name, "frame passed through");
                }
            }
            None => {
                self.ctx_stats.rx_no_plugin.inc();
            }
        }
        self.mpool.borrow_mut().free(m);
    }

    // ---- control plane --------------------------------------------------

    /// Serve one RPC envelope frame and return the response frame.
    pub fn handle_rpc(self: &Rc<Self>, req: &[u8]) -> Vec<u8> {
        self.ctx_stats.rpc_reqs.inc();
        if let Some(rec) = self.recorder.borrow().as_ref() {
            rec.append_bytes(self.now_sec(), "rpc-req", req);
        }
        let resp = rpc::serve_bytes(req, |method, params| self.invoke_method(method, params));
        if let Some(rec) = self.recorder.borrow().as_ref() {
            rec.append_bytes(self.now_sec(), "rpc-res", &resp);
        }
        resp
    }

    fn invoke_method(self: &Rc<Self>, method: &str, params: &Value) -> Result<Value, RpcError> {
        let res = self.invoke_method_inner(method, params);
        if res.is_err() {
            self.ctx_stats.rpc_errs.inc();
        }
        res
    }

    fn invoke_method_inner(
        self: &Rc<Self>,
        method: &str,
        params: &Value,
    ) -> Result<Value, RpcError> {
        match method {
            "api_sync" => return Ok(json!({"api": rpc::API_VERSION})),
            "get_version" => {
                return Ok(json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }));
            }
            "ctx_cnt" => {
                let zero = params.get("zero").and_then(Value::as_bool).unwrap_or(false);
                let meta = params.get("meta").and_then(Value::as_bool).unwrap_or(false);
                let counters = self.counters.borrow();
                return Ok(if meta {
                    Value::Object(counters.marshal_meta())
                } else {
                    Value::Object(counters.marshal_values(zero))
                });
            }
            "ns_add" => {
                let key = rpc::tun_param(params)?;
                self.add_ns(key).map_err(|e| RpcError::invalid_params(e.to_string()))?;
                return Ok(Value::Null);
            }
            "ns_remove" => {
                let key = rpc::tun_param(params)?;
                self.remove_ns(&key).map_err(|e| RpcError::invalid_params(e.to_string()))?;
                return Ok(Value::Null);
            }
            "ns_iter" => {
                let keys: Vec<Value> = self
                    .ns_keys()
                    .iter()
                    .map(|k| {
                        json!({
                            "vport": k.vport,
                            "tci": [k.vlans[0] & 0xffff, k.vlans[1] & 0xffff],
                        })
                    })
                    .collect();
                return Ok(json!({"tunnels": keys}));
            }
            "client_add" => return self.rpc_client_add(params),
            "client_remove" => {
                let key = rpc::tun_param(params)?;
                let mac = rpc::mac_param(params)?;
                let ns = self.get_ns(&key).ok_or_else(|| RpcError::invalid_params("no namespace"))?;
                self.remove_client(&ns, mac)
                    .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                return Ok(Value::Null);
            }
            "client_iter" => {
                let key = rpc::tun_param(params)?;
                let ns = self.get_ns(&key).ok_or_else(|| RpcError::invalid_params("no namespace"))?;
                let macs: Vec<Value> =
                    ns.client_macs().iter().map(|m| json!(m.0.to_vec())).collect();
                return Ok(json!({"macs": macs}));
            }
            _ => {}
        }

        // plugin methods route through the registry's method table
        let Some((plugin, scope)) = self.registry.rpc_target(method) else {
            return Err(RpcError::method_not_found(method));
        };
        let key = rpc::tun_param(params)?;
        let ns = self.get_ns(&key).ok_or_else(|| RpcError::invalid_params("no namespace"))?;
        let instance = match scope {
            RpcScope::Ns => ns.plugins.get(plugin),
            RpcScope::Client => {
                let mac = rpc::mac_param(params)?;
                let client = ns
                    .client_by_mac(mac)
                    .ok_or_else(|| RpcError::invalid_params(format!("no client {}", mac)))?;
                client.plugins.get(plugin)
            }
        };
        let instance = instance.ok_or_else(|| {
            RpcError::invalid_params(format!("plugin {} not active at this scope", plugin))
        })?;
        let res = instance.borrow_mut().on_rpc(self, method, params);
        res
    }

    fn rpc_client_add(self: &Rc<Self>, params: &Value) -> Result<Value, RpcError> {
        #[derive(serde::Deserialize)]
        struct ClientParams {
            mac: [u8; 6],
            #[serde(default)]
            ipv4: Option<[u8; 4]>,
            #[serde(default)]
            ipv6: Option<[u8; 16]>,
            #[serde(default)]
            dgw4: Option<[u8; 4]>,
            #[serde(default)]
            dgw6: Option<[u8; 16]>,
            #[serde(default)]
            plugs: HashMap<String, Value>,
        }
        let key = rpc::tun_param(params)?;
        let ns = self.get_ns(&key).ok_or_else(|| RpcError::invalid_params("no namespace"))?;
        let p: ClientParams = serde_json::from_value(params.clone())
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;

        let client = Client::new(
            &ns,
            MacKey(p.mac),
            p.ipv4.map(Ipv4Key).unwrap_or_default(),
            p.ipv6.map(Ipv6Key).unwrap_or_default(),
            p.dgw4.map(Ipv4Key),
            p.dgw6.map(Ipv6Key),
        );
        ns.add_client(client.clone()).map_err(|e| RpcError::invalid_params(e.to_string()))?;

        let specs: Vec<(String, Value)> = p.plugs.into_iter().collect();
        self.create_client_plugins(&client, &specs)?;
        Ok(Value::Null)
    }

    // ---- teardown -------------------------------------------------------

    /// Orderly shutdown: namespaces, transport, then the pool leak check.
    pub fn teardown(self: &Rc<Self>) {
        for key in self.ns_keys() {
            if let Err(e) = self.remove_ns(&key) {
                warn!(error = %e, "namespace teardown failed");
            }
        }
        let mut pool = self.mpool.borrow_mut();
        self.veth.borrow_mut().shutdown(&mut pool);
        pool.release();
    }
}

/// Innermost EtherType check used to pick the gateway family.
fn frame_is_ipv6(b: &[u8]) -> bool {
    let mut off = 12;
    loop {
        if b.len() < off + 2 {
            return false;
        }
        let ethertype = u16::from_be_bytes([b[off], b[off + 1]]);
        match ethertype {
            ETH_TYPE_VLAN | ETH_TYPE_QINQ => off += 4,
            ETH_TYPE_IPV6 => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimTransport;

    fn ctx() -> Rc<ThreadCtx> {
        ThreadCtx::new(
            RuntimeConfig::default(),
            PluginRegistry::new(),
            Box::new(SimTransport::loopback()),
        )
    }

    fn tun() -> TunnelKey {
        TunnelKey::from_tci(1, [1, 2])
    }

    #[test]
    fn ns_lifecycle() {
        let ctx = ctx();
        ctx.add_ns(tun()).unwrap();
        assert!(matches!(ctx.add_ns(tun()), Err(RegistryError::NsExists(_))));
        assert_eq!(ctx.ns_count(), 1);
        ctx.remove_ns(&tun()).unwrap();
        assert_eq!(ctx.ns_count(), 0);
        assert!(matches!(ctx.remove_ns(&tun()), Err(RegistryError::NsNotFound)));
        ctx.teardown();
    }

    #[test]
    fn unknown_tunnel_counts_and_drops() {
        let ctx = ctx();
        let m = ctx.mpool.borrow_mut().alloc_from(9, &[0u8; 60]);
        ctx.handle_rx_packet(m);
        assert_eq!(ctx.ctx_stats.rx_no_namespace.get(), 1);
        assert_eq!(ctx.veth_stats.rx_pkts.get(), 1);
        ctx.teardown();
    }

    #[test]
    fn short_frame_counts_parse_error() {
        let ctx = ctx();
        let m = ctx.mpool.borrow_mut().alloc_from(1, &[0u8; 4]);
        ctx.handle_rx_packet(m);
        assert_eq!(ctx.veth_stats.rx_parse_err.get(), 1);
        ctx.teardown();
    }

    #[test]
    fn send_buffer_unicast_requires_resolved_gateway() {
        let ctx = ctx();
        let ns = ctx.add_ns(tun()).unwrap();
        let client = Client::new(
            &ns,
            MacKey([0, 0, 1, 0, 0, 1]),
            Ipv4Key([16, 0, 0, 1]),
            Ipv6Key::default(),
            Some(Ipv4Key([16, 0, 0, 254])),
            None,
        );
        ns.add_client(client.clone()).unwrap();

        let frame = [0u8; 60]; // ipv4-ish, family does not matter unresolved
        ctx.send_buffer(true, &client, &frame);
        assert_eq!(ctx.veth_stats.tx_drop_not_resolve.get(), 1);
        assert_eq!(ctx.veth_stats.tx_pkts.get(), 0);

        client.dgw_v4.borrow_mut().resolve(MacKey([0, 0, 0, 0, 1, 1]));
        ctx.send_buffer(true, &client, &frame);
        assert_eq!(ctx.veth_stats.tx_pkts.get(), 1);

        // flush the loopback and drain it back to the pool
        {
            let mut pool = ctx.mpool.borrow_mut();
            let mut veth = ctx.veth.borrow_mut();
            veth.tx_flush(&mut pool);
            let mut out = Vec::new();
            veth.rx_poll(&mut pool, 16, &mut out);
            assert_eq!(out.len(), 1);
            let data = out[0].to_vec();
            assert_eq!(&data[0..6], &[0, 0, 0, 0, 1, 1]);
            assert_eq!(&data[6..12], &[0, 0, 1, 0, 0, 1]);
            for m in out {
                pool.free(m);
            }
        }
        ctx.teardown();
    }

    #[test]
    fn dispatch_hits_exactly_one_plugin() {
        use std::any::Any;
        use std::cell::Cell;

        use crate::mbuf::Mbuf;
        use crate::parser::ParseCtx;
        use crate::plugin::{Layer, ParserHook, Plugin, PluginFactory, PluginRef};

        struct CountingPlugin {
            hits: Rc<Cell<u32>>,
        }

        impl Plugin for CountingPlugin {
            fn on_rx(&mut self, _ctx: &Rc<ThreadCtx>, _m: &Mbuf, _pc: &ParseCtx) -> RxVerdict {
                self.hits.set(self.hits.get() + 1);
                RxVerdict::Consumed
            }

            fn as_any(&mut self) -> &mut dyn Any {
                self
            }
        }

        struct CountingFactory {
            name: &'static str,
            hooks: Vec<ParserHook>,
            hits: Rc<Cell<u32>>,
        }

        impl PluginFactory for CountingFactory {
            fn name(&self) -> &'static str {
                self.name
            }

            fn hooks(&self) -> Vec<ParserHook> {
                self.hooks.clone()
            }

            fn create_ns(
                &self,
                _ctx: &Rc<ThreadCtx>,
                _ns: &Rc<Namespace>,
                _init: &Value,
            ) -> Result<PluginRef, crate::plugin::PluginError> {
                Ok(Rc::new(std::cell::RefCell::new(CountingPlugin { hits: self.hits.clone() })))
            }
        }

        let arp_hits = Rc::new(Cell::new(0));
        let ip_hits = Rc::new(Cell::new(0));
        let mut registry = PluginRegistry::new();
        registry
            .register(Rc::new(CountingFactory {
                name: "a",
                hooks: vec![ParserHook::new(Layer::L2, 0x0806)],
                hits: arp_hits.clone(),
            }))
            .unwrap();
        registry
            .register(Rc::new(CountingFactory {
                name: "b",
                hooks: vec![ParserHook::new(Layer::L3, 1)],
                hits: ip_hits.clone(),
            }))
            .unwrap();

        let ctx = ThreadCtx::new(
            RuntimeConfig::default(),
            registry,
            Box::new(SimTransport::loopback()),
        );
        let ns = ctx.add_ns(TunnelKey::new(1, [0, 0])).unwrap();
        ctx.create_ns_plugins(
            &ns,
            &[("a".to_string(), Value::Null), ("b".to_string(), Value::Null)],
        )
        .unwrap();

        // an arp frame lands in plugin "a" only
        let mut frame = vec![0xffu8; 6];
        frame.extend_from_slice(&[0, 0, 1, 0, 0, 1]);
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 28]);
        let m = ctx.mpool.borrow_mut().alloc_from(1, &frame);
        ctx.handle_rx_packet(m);
        assert_eq!((arp_hits.get(), ip_hits.get()), (1, 0));

        // an icmp frame lands in plugin "b" only
        let mut frame = vec![0xffu8; 6];
        frame.extend_from_slice(&[0, 0, 1, 0, 0, 1]);
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut ip4 = vec![0u8; 28];
        ip4[0] = 0x45;
        ip4[9] = 1;
        frame.extend_from_slice(&ip4);
        let m = ctx.mpool.borrow_mut().alloc_from(1, &frame);
        ctx.handle_rx_packet(m);
        assert_eq!((arp_hits.get(), ip_hits.get()), (1, 1));

        ctx.teardown();
    }

    #[test]
    fn rpc_global_methods() {
        let ctx = ctx();
        let resp = ctx.handle_rpc(
            br#"{"jsonrpc":"2.0","id":1,"method":"ns_add","params":{"api":"emu-v1","tun":{"vport":1,"tci":[1,2]}}}"#,
        );
        let v: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(v["result"], true);
        assert_eq!(ctx.ns_count(), 1);

        let resp = ctx.handle_rpc(
            br#"{"jsonrpc":"2.0","id":2,"method":"client_add","params":{"api":"emu-v1","tun":{"vport":1,"tci":[1,2]},"mac":[0,0,1,0,0,1],"ipv4":[16,0,0,1]}}"#,
        );
        let v: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(v["result"], true, "client_add failed: {}", v);
        let ns = ctx.get_ns(&tun()).unwrap();
        assert_eq!(ns.client_count(), 1);

        let resp = ctx.handle_rpc(
            br#"{"jsonrpc":"2.0","id":3,"method":"ctx_cnt","params":{"api":"emu-v1","zero":true}}"#,
        );
        let v: Value = serde_json::from_slice(&resp).unwrap();
        assert!(v["result"]["veth"].is_object());
        ctx.teardown();
    }
}
