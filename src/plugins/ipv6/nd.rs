//! Neighbor discovery cache.
//!
//! Learns target/link-layer pairs from received Neighbor Advertisements
//! and resolves client default gateways against them.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Value, json};
use tracing::debug;

use crate::netns::{Ipv6Key, MacKey, Namespace};

#[derive(Debug, Default)]
pub struct NdTable {
    cache: BTreeMap<Ipv6Key, MacKey>,
}

impl NdTable {
    /// Record a neighbor and resolve any client gateway waiting for it.
    pub fn learn(&mut self, ns: &Rc<Namespace>, target: Ipv6Key, mac: MacKey) {
        self.cache.insert(target, mac);
        for client in ns.clients() {
            let mut dgw = client.dgw_v6.borrow_mut();
            if dgw.ip == Some(target) && !dgw.resolved {
                debug!(client = %client.mac, gw = %target, %mac, "ipv6 gateway resolved");
                dgw.resolve(mac);
            }
        }
    }

    pub fn lookup(&self, target: &Ipv6Key) -> Option<MacKey> {
        self.cache.get(target).copied()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Cache contents for the iter RPC, address-ordered.
    pub fn marshal(&self) -> Value {
        let vec: Vec<Value> = self
            .cache
            .iter()
            .map(|(ip, mac)| json!({"ipv6": ip.0.to_vec(), "mac": mac.0.to_vec()}))
            .collect();
        json!({"vec": vec})
    }
}

/// Solicited-node multicast group of an address.
pub fn solicited_node(target: Ipv6Key) -> Ipv6Key {
    let t = target.0;
    Ipv6Key([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0xff, t[13], t[14], t[15]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netns::{Client, Ipv4Key, TunnelKey};

    #[test]
    fn learn_resolves_waiting_gateways() {
        let ns = Namespace::new(TunnelKey::new(1, [0, 0]));
        let gw = Ipv6Key([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 3]);
        let client = Client::new(
            &ns,
            MacKey([0, 0, 1, 0, 0, 1]),
            Ipv4Key::default(),
            Ipv6Key([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
            None,
            Some(gw),
        );
        ns.add_client(client.clone()).unwrap();

        let mut nd = NdTable::default();
        nd.learn(&ns, gw, MacKey([0, 0, 0, 0, 1, 1]));

        let dgw = client.dgw_v6.borrow();
        assert!(dgw.resolved);
        assert_eq!(dgw.mac, MacKey([0, 0, 0, 0, 1, 1]));
        assert_eq!(nd.lookup(&gw), Some(MacKey([0, 0, 0, 0, 1, 1])));
    }

    #[test]
    fn solicited_node_mapping() {
        let a = Ipv6Key([0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xaa, 0xbb, 0xcc]);
        assert_eq!(
            solicited_node(a),
            Ipv6Key([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0xff, 0xaa, 0xbb, 0xcc])
        );
    }
}
