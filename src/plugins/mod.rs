//! Built-in protocol plugins.
//!
//! Each submodule exports a factory; `register_defaults` wires the full
//! set into a registry the way the binary does. Frame builders here are
//! shared by every plugin: egress frames always carry the owning
//! namespace's VLAN tags so the device under test can steer them back.

pub mod arp;
pub mod icmp;
pub mod igmp;
pub mod ipv6;

use crate::netns::{MacKey, TunnelKey};
use crate::plugin::{PluginError, PluginRegistry};

/// Register the stock plugin set.
pub fn register_defaults(reg: &mut PluginRegistry) -> Result<(), PluginError> {
    reg.register(std::rc::Rc::new(arp::ArpFactory))?;
    reg.register(std::rc::Rc::new(icmp::IcmpFactory))?;
    reg.register(std::rc::Rc::new(igmp::IgmpFactory))?;
    reg.register(std::rc::Rc::new(ipv6::Ipv6Factory))?;
    Ok(())
}

/// Ethernet header with the namespace's VLAN encapsulation.
pub(crate) fn eth_header(dst: MacKey, src: MacKey, tun: &TunnelKey, ethertype: u16) -> Vec<u8> {
    let mut f = Vec::with_capacity(22);
    f.extend_from_slice(&dst.0);
    f.extend_from_slice(&src.0);
    for vlan in tun.vlans.iter().filter(|v| **v != 0) {
        f.extend_from_slice(&((vlan >> 16) as u16).to_be_bytes());
        f.extend_from_slice(&(*vlan as u16).to_be_bytes());
    }
    f.extend_from_slice(&ethertype.to_be_bytes());
    f
}

/// EUI-64 link-local address of a MAC.
pub(crate) fn link_local(mac: MacKey) -> [u8; 16] {
    let m = mac.0;
    [
        0xfe,
        0x80,
        0,
        0,
        0,
        0,
        0,
        0,
        m[0] ^ 0x02,
        m[1],
        m[2],
        0xff,
        0xfe,
        m[3],
        m[4],
        m[5],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eth_header_carries_vlan_tags() {
        let tun = TunnelKey::from_tci(1, [1, 2]);
        let h = eth_header(MacKey([0xff; 6]), MacKey([0, 0, 1, 0, 0, 1]), &tun, 0x86dd);
        assert_eq!(h.len(), 22);
        assert_eq!(&h[12..16], &[0x81, 0x00, 0x00, 0x01]);
        assert_eq!(&h[16..20], &[0x81, 0x00, 0x00, 0x02]);
        assert_eq!(&h[20..22], &[0x86, 0xdd]);

        let untagged = TunnelKey::new(1, [0, 0]);
        let h = eth_header(MacKey([0xff; 6]), MacKey([0; 6]), &untagged, 0x0800);
        assert_eq!(h.len(), 14);
    }

    #[test]
    fn link_local_eui64() {
        let ll = link_local(MacKey([0x00, 0x00, 0x01, 0x00, 0x00, 0x02]));
        assert_eq!(&ll[0..2], &[0xfe, 0x80]);
        assert_eq!(&ll[8..16], &[0x02, 0x00, 0x01, 0xff, 0xfe, 0x00, 0x00, 0x02]);
    }
}
