#![allow(dead_code)]

//! Shared simulation environment for the end-to-end tests.

pub mod packets;

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{Value, json};

use netemu::config::RuntimeConfig;
use netemu::ctx::ThreadCtx;
use netemu::netns::{Client, Ipv4Key, Ipv6Key, MacKey, Namespace, TunnelKey};
use netemu::plugin::PluginRegistry;
use netemu::plugins::register_defaults;
use netemu::transport::{DutTransform, SimTransport, Transport};
use netemu::worker::Worker;

/// Tunnel used throughout: vport 1, double tagged 1/2.
pub fn tun() -> TunnelKey {
    TunnelKey::from_tci(1, [1, 2])
}

pub const CLIENT_MAC: MacKey = MacKey([0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);

pub const CLIENT_IPV6: Ipv6Key =
    Ipv6Key([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x02]);

/// Worker over a capturing DUT: every tx frame is recorded and dropped,
/// nothing loops back unless a test injects it.
pub fn sim_env() -> (Worker, Rc<RefCell<Vec<Vec<u8>>>>) {
    let captured: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = captured.clone();
    let transform: DutTransform = Box::new(move |pool, m| {
        sink.borrow_mut().push(m.to_vec());
        pool.free(m);
        None
    });

    let mut registry = PluginRegistry::new();
    register_defaults(&mut registry).unwrap();
    let ctx = ThreadCtx::new(
        RuntimeConfig::default(),
        registry,
        Box::new(SimTransport::with_transform(transform)),
    );
    (Worker::new(ctx), captured)
}

/// Namespace with the ipv6 plugin (designated to the test client) plus
/// one client running the ipv6 client plugin.
pub fn setup_ipv6_client(
    ctx: &Rc<ThreadCtx>,
    dgw6: Option<Ipv6Key>,
) -> (Rc<Namespace>, Rc<Client>) {
    let ns = ctx.add_ns(tun()).unwrap();
    ctx.create_ns_plugins(&ns, &[("ipv6".to_string(), json!({"dmac": CLIENT_MAC.0.to_vec()}))])
        .unwrap();

    let client = Client::new(&ns, CLIENT_MAC, Ipv4Key([16, 0, 0, 1]), CLIENT_IPV6, None, dgw6);
    ns.add_client(client.clone()).unwrap();
    ctx.create_client_plugins(&client, &[("ipv6".to_string(), Value::Null)]).unwrap();
    (ns, client)
}

/// Inject a frame as if received from the DUT.
pub fn inject(ctx: &Rc<ThreadCtx>, frame: &[u8]) {
    let m = ctx.mpool.borrow_mut().alloc_from(tun().vport, frame);
    let mut veth = ctx.veth.borrow_mut();
    veth.as_any().downcast_mut::<SimTransport>().unwrap().inject_rx(m);
}

/// Dispatch one RPC envelope directly and return the parsed response.
pub fn rpc(ctx: &Rc<ThreadCtx>, method: &str, mut params: Value) -> Value {
    params["api"] = json!("emu-v1");
    params["tun"] = json!({"vport": 1, "tci": [1, 2]});
    let req = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
    let resp = ctx.handle_rpc(&serde_json::to_vec(&req).unwrap());
    serde_json::from_slice(&resp).unwrap()
}
