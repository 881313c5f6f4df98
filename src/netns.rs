//! Namespaces, clients and their lookup indexes.
//!
//! A namespace is identified on ingress by its tunnel key (virtual port +
//! up to two 802.1Q tags) and owns a population of emulated clients. Three
//! client indexes are kept in sync: unicast MAC, IPv4 and IPv6 (the ARP/ND
//! answer paths), plus a multicast MAC-group membership map.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use smoltcp::wire::{EthernetAddress, Ipv4Address, Ipv6Address};
use thiserror::Error;

use crate::plugin::PluginMap;
use crate::timerw::TimerId;

/// 802.1Q TPID used when building vlan words from RPC `tci` values.
pub const VLAN_TPID: u16 = 0x8100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacKey(pub [u8; 6]);

impl MacKey {
    pub const BROADCAST: MacKey = MacKey([0xff; 6]);

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Ethernet multicast MAC for an IPv4 group (01:00:5e + low 23 bits).
    pub fn from_ipv4_mcast(ip: Ipv4Key) -> MacKey {
        let o = ip.0;
        MacKey([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
    }

    /// Ethernet multicast MAC for an IPv6 group (33:33 + low 32 bits).
    pub fn from_ipv6_mcast(ip: Ipv6Key) -> MacKey {
        let o = ip.0;
        MacKey([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }
}

impl fmt::Display for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", m[0], m[1], m[2], m[3], m[4], m[5])
    }
}

impl From<EthernetAddress> for MacKey {
    fn from(a: EthernetAddress) -> Self {
        MacKey(a.0)
    }
}

impl From<MacKey> for EthernetAddress {
    fn from(k: MacKey) -> Self {
        EthernetAddress(k.0)
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Ipv4Key(pub [u8; 4]);

impl Ipv4Key {
    pub fn is_unset(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl fmt::Display for Ipv4Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::net::Ipv4Addr::from(self.0))
    }
}

impl From<Ipv4Address> for Ipv4Key {
    fn from(a: Ipv4Address) -> Self {
        Ipv4Key(a.0)
    }
}

impl From<Ipv4Key> for Ipv4Address {
    fn from(k: Ipv4Key) -> Self {
        Ipv4Address(k.0)
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Ipv6Key(pub [u8; 16]);

impl Ipv6Key {
    pub fn is_unset(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }
}

impl fmt::Display for Ipv6Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::net::Ipv6Addr::from(self.0))
    }
}

impl From<Ipv6Address> for Ipv6Key {
    fn from(a: Ipv6Address) -> Self {
        Ipv6Key(a.0)
    }
}

impl From<Ipv6Key> for Ipv6Address {
    fn from(k: Ipv6Key) -> Self {
        Ipv6Address::from_bytes(&k.0)
    }
}

/// Ingress identity of a namespace: virtual port plus up to two vlan words,
/// each `(TPID << 16) | TCI`, zero when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelKey {
    pub vport: u16,
    pub vlans: [u32; 2],
}

impl TunnelKey {
    pub fn new(vport: u16, vlans: [u32; 2]) -> Self {
        TunnelKey { vport, vlans }
    }

    /// Build a key from RPC-style bare TCI values, stamping the 0x8100
    /// TPID on every non-zero tag.
    pub fn from_tci(vport: u16, tci: [u16; 2]) -> Self {
        let mut vlans = [0u32; 2];
        for (w, t) in vlans.iter_mut().zip(tci) {
            if t != 0 {
                *w = (u32::from(VLAN_TPID) << 16) | u32::from(t);
            }
        }
        TunnelKey { vport, vlans }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vport {} vlans {:#x},{:#x}", self.vport, self.vlans[0], self.vlans[1])
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client {0} already exists in namespace")]
    MacExists(MacKey),
    #[error("client {0} not found")]
    ClientNotFound(MacKey),
    #[error("namespace {0} already exists")]
    NsExists(TunnelKey),
    #[error("namespace not found")]
    NsNotFound,
}

/// Default-gateway state for one address family.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dgw<T: Copy> {
    pub ip: Option<T>,
    pub mac: MacKey,
    pub resolved: bool,
}

impl<T: Copy> Dgw<T> {
    pub fn resolve(&mut self, mac: MacKey) {
        self.mac = mac;
        self.resolved = true;
    }
}

impl Default for MacKey {
    fn default() -> Self {
        MacKey([0; 6])
    }
}

/// One emulated endpoint. Owned by exactly one namespace.
pub struct Client {
    ns: Weak<Namespace>,
    pub mac: MacKey,
    pub ipv4: Cell<Ipv4Key>,
    pub ipv6: Cell<Ipv6Key>,
    pub dgw_v4: RefCell<Dgw<Ipv4Key>>,
    pub dgw_v6: RefCell<Dgw<Ipv6Key>>,
    pub plugins: PluginMap,
    pub owned_timers: RefCell<Vec<TimerId>>,
}

impl Client {
    pub fn new(
        ns: &Rc<Namespace>,
        mac: MacKey,
        ipv4: Ipv4Key,
        ipv6: Ipv6Key,
        dgw_v4: Option<Ipv4Key>,
        dgw_v6: Option<Ipv6Key>,
    ) -> Rc<Client> {
        Rc::new(Client {
            ns: Rc::downgrade(ns),
            mac,
            ipv4: Cell::new(ipv4),
            ipv6: Cell::new(ipv6),
            dgw_v4: RefCell::new(Dgw { ip: dgw_v4, ..Dgw::default() }),
            dgw_v6: RefCell::new(Dgw { ip: dgw_v6, ..Dgw::default() }),
            plugins: PluginMap::default(),
            owned_timers: RefCell::new(Vec::new()),
        })
    }

    pub fn namespace(&self) -> Option<Rc<Namespace>> {
        self.ns.upgrade()
    }

    pub fn vport(&self) -> u16 {
        self.ns.upgrade().map(|ns| ns.key.vport).unwrap_or(0)
    }

    /// Track a timer slot owned by this client so teardown can verify it
    /// was stopped.
    pub fn own_timer(&self, id: TimerId) {
        self.owned_timers.borrow_mut().push(id);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client({})", self.mac)
    }
}

/// A VLAN/port scope holding clients and namespace-scoped plugin state.
pub struct Namespace {
    pub key: TunnelKey,
    clients: RefCell<HashMap<MacKey, Rc<Client>>>,
    ipv4_index: RefCell<HashMap<Ipv4Key, MacKey>>,
    ipv6_index: RefCell<HashMap<Ipv6Key, MacKey>>,
    mcast: RefCell<HashMap<MacKey, HashSet<MacKey>>>,
    pub plugins: PluginMap,
    pub owned_timers: RefCell<Vec<TimerId>>,
}

impl Namespace {
    pub fn new(key: TunnelKey) -> Rc<Namespace> {
        Rc::new(Namespace {
            key,
            clients: RefCell::new(HashMap::new()),
            ipv4_index: RefCell::new(HashMap::new()),
            ipv6_index: RefCell::new(HashMap::new()),
            mcast: RefCell::new(HashMap::new()),
            plugins: PluginMap::default(),
            owned_timers: RefCell::new(Vec::new()),
        })
    }

    pub fn vport(&self) -> u16 {
        self.key.vport
    }

    pub fn client_count(&self) -> usize {
        self.clients.borrow().len()
    }

    /// Register a client and index its addresses. The MAC must be unique
    /// within the namespace.
    pub fn add_client(&self, client: Rc<Client>) -> Result<(), RegistryError> {
        let mut clients = self.clients.borrow_mut();
        if clients.contains_key(&client.mac) {
            return Err(RegistryError::MacExists(client.mac));
        }
        if !client.ipv4.get().is_unset() {
            self.ipv4_index.borrow_mut().insert(client.ipv4.get(), client.mac);
        }
        if !client.ipv6.get().is_unset() {
            self.ipv6_index.borrow_mut().insert(client.ipv6.get(), client.mac);
        }
        clients.insert(client.mac, client);
        Ok(())
    }

    /// Drop a client from every index and return it. Plugin teardown is
    /// the caller's job (the context owns the wheel the plugins armed).
    pub fn unlink_client(&self, mac: MacKey) -> Result<Rc<Client>, RegistryError> {
        let client =
            self.clients.borrow_mut().remove(&mac).ok_or(RegistryError::ClientNotFound(mac))?;
        self.ipv4_index.borrow_mut().remove(&client.ipv4.get());
        self.ipv6_index.borrow_mut().remove(&client.ipv6.get());
        self.mcast.borrow_mut().retain(|_, members| {
            members.remove(&mac);
            !members.is_empty()
        });
        Ok(client)
    }

    pub fn client_by_mac(&self, mac: MacKey) -> Option<Rc<Client>> {
        self.clients.borrow().get(&mac).cloned()
    }

    pub fn client_by_ipv4(&self, ip: Ipv4Key) -> Option<Rc<Client>> {
        let mac = *self.ipv4_index.borrow().get(&ip)?;
        self.client_by_mac(mac)
    }

    pub fn client_by_ipv6(&self, ip: Ipv6Key) -> Option<Rc<Client>> {
        let mac = *self.ipv6_index.borrow().get(&ip)?;
        self.client_by_mac(mac)
    }

    pub fn clients(&self) -> Vec<Rc<Client>> {
        self.clients.borrow().values().cloned().collect()
    }

    pub fn client_macs(&self) -> Vec<MacKey> {
        let mut macs: Vec<_> = self.clients.borrow().keys().copied().collect();
        macs.sort();
        macs
    }

    /// Subscribe a client to an L2 multicast group.
    pub fn mcast_join(&self, group: MacKey, member: MacKey) {
        self.mcast.borrow_mut().entry(group).or_default().insert(member);
    }

    pub fn mcast_leave(&self, group: MacKey, member: MacKey) {
        let mut mcast = self.mcast.borrow_mut();
        if let Some(members) = mcast.get_mut(&group) {
            members.remove(&member);
            if members.is_empty() {
                mcast.remove(&group);
            }
        }
    }

    pub fn mcast_members(&self, group: MacKey) -> Vec<Rc<Client>> {
        let mcast = self.mcast.borrow();
        let Some(members) = mcast.get(&group) else {
            return Vec::new();
        };
        members.iter().filter_map(|m| self.client_by_mac(*m)).collect()
    }

    pub fn own_timer(&self, id: TimerId) {
        self.owned_timers.borrow_mut().push(id);
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Rc<Namespace> {
        Namespace::new(TunnelKey::from_tci(1, [1, 2]))
    }

    fn client(ns: &Rc<Namespace>, last: u8) -> Rc<Client> {
        Client::new(
            ns,
            MacKey([0, 0, 1, 0, 0, last]),
            Ipv4Key([16, 0, 0, last]),
            Ipv6Key([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, last]),
            Some(Ipv4Key([16, 0, 0, 1])),
            None,
        )
    }

    #[test]
    fn tunnel_key_tci_encoding() {
        let key = TunnelKey::from_tci(1, [1, 2]);
        assert_eq!(key.vlans, [0x8100_0001, 0x8100_0002]);
        let key = TunnelKey::from_tci(3, [7, 0]);
        assert_eq!(key.vlans, [0x8100_0007, 0]);
    }

    #[test]
    fn add_client_rejects_duplicate_mac() {
        let ns = ns();
        ns.add_client(client(&ns, 1)).unwrap();
        let dup = client(&ns, 1);
        assert_eq!(ns.add_client(dup).unwrap_err(), RegistryError::MacExists(MacKey([0, 0, 1, 0, 0, 1])));
        assert_eq!(ns.client_count(), 1);
    }

    #[test]
    fn indexes_stay_in_sync() {
        let ns = ns();
        ns.add_client(client(&ns, 1)).unwrap();
        ns.add_client(client(&ns, 2)).unwrap();

        let c = ns.client_by_ipv4(Ipv4Key([16, 0, 0, 2])).unwrap();
        assert_eq!(c.mac, MacKey([0, 0, 1, 0, 0, 2]));
        let c = ns
            .client_by_ipv6(Ipv6Key([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]))
            .unwrap();
        assert_eq!(c.mac, MacKey([0, 0, 1, 0, 0, 1]));

        let group = MacKey::from_ipv6_mcast(Ipv6Key([
            0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x16,
        ]));
        ns.mcast_join(group, MacKey([0, 0, 1, 0, 0, 1]));
        assert_eq!(ns.mcast_members(group).len(), 1);

        ns.unlink_client(MacKey([0, 0, 1, 0, 0, 1])).unwrap();
        assert!(ns.client_by_ipv4(Ipv4Key([16, 0, 0, 1])).is_none());
        assert!(
            ns.client_by_ipv6(Ipv6Key([
                0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1
            ]))
            .is_none()
        );
        assert!(ns.mcast_members(group).is_empty());
        assert!(ns.client_by_ipv4(Ipv4Key([16, 0, 0, 2])).is_some());
    }

    #[test]
    fn mcast_mac_mapping() {
        assert_eq!(
            MacKey::from_ipv4_mcast(Ipv4Key([224, 0, 0, 251])),
            MacKey([0x01, 0x00, 0x5e, 0, 0, 251])
        );
        let g = Ipv6Key([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x16]);
        assert_eq!(MacKey::from_ipv6_mcast(g), MacKey([0x33, 0x33, 0, 0, 0, 0x16]));
        assert!(MacKey([0x33, 0x33, 0, 0, 0, 0x16]).is_multicast());
        assert!(MacKey::BROADCAST.is_broadcast());
    }
}
