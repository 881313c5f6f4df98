//! Ingress frame parsing.
//!
//! Pulls apart the Ethernet header and up to two 802.1Q tags to build the
//! tunnel key, then walks to the first selector the dispatch table can act
//! on: EtherType at L2, IP protocol at L3, the type byte for ICMPv6.
//! smoltcp has no 802.1Q representation, so the tag walk is manual;
//! plugins re-parse the payload with `smoltcp::wire` from the recorded
//! offsets.

use thiserror::Error;

use crate::netns::{MacKey, TunnelKey};
use crate::plugin::Layer;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_QINQ: u16 = 0x88a8;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_IGMP: u8 = 2;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_ICMPV6: u8 = 58;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame truncated at offset {0}")]
    Truncated(usize),
    #[error("more than two 802.1Q tags")]
    TooManyTags,
    #[error("bad IPv4 header length {0}")]
    BadIhl(u8),
}

/// Result of the ingress parse: tunnel identity plus the dispatch selector
/// and the layer offsets plugins parse from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseCtx {
    pub tun: TunnelKey,
    pub dst_mac: MacKey,
    pub src_mac: MacKey,
    /// Innermost EtherType (after vlan tags).
    pub ethertype: u16,
    /// Offset of the L3 header (or of the ARP payload).
    pub l3_off: usize,
    /// Offset of the L4 header; 0 when there is none.
    pub l4_off: usize,
    pub layer: Layer,
    pub selector: u16,
}

fn need(data: &[u8], upto: usize) -> Result<(), ParseError> {
    if data.len() < upto { Err(ParseError::Truncated(upto)) } else { Ok(()) }
}

fn be16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

/// Parse one raw L2 frame received on `vport`.
pub fn parse_frame(vport: u16, data: &[u8]) -> Result<ParseCtx, ParseError> {
    need(data, 14)?;
    let dst_mac = MacKey(data[0..6].try_into().unwrap());
    let src_mac = MacKey(data[6..12].try_into().unwrap());

    let mut vlans = [0u32; 2];
    let mut ntags = 0usize;
    let mut off = 12usize;
    let mut ethertype = be16(data, off);
    off += 2;
    while ethertype == ETH_TYPE_VLAN || ethertype == ETH_TYPE_QINQ {
        if ntags == 2 {
            return Err(ParseError::TooManyTags);
        }
        need(data, off + 4)?;
        let tci = be16(data, off);
        vlans[ntags] = (u32::from(ethertype) << 16) | u32::from(tci);
        ntags += 1;
        ethertype = be16(data, off + 2);
        off += 4;
    }

    let tun = TunnelKey::new(vport, vlans);
    let l3_off = off;

    let (layer, selector, l4_off) = match ethertype {
        ETH_TYPE_IPV4 => {
            need(data, l3_off + 20)?;
            let ihl = data[l3_off] & 0x0f;
            if ihl < 5 {
                return Err(ParseError::BadIhl(ihl));
            }
            let l4_off = l3_off + ihl as usize * 4;
            need(data, l4_off)?;
            let proto = data[l3_off + 9];
            (Layer::L3, u16::from(proto), l4_off)
        }
        ETH_TYPE_IPV6 => {
            need(data, l3_off + 40)?;
            let proto = data[l3_off + 6];
            let l4_off = l3_off + 40;
            if proto == IP_PROTO_ICMPV6 {
                need(data, l4_off + 4)?;
                (Layer::Icmpv6, u16::from(data[l4_off]), l4_off)
            } else {
                (Layer::L3, u16::from(proto), l4_off)
            }
        }
        // ARP, 802.1X and anything else dispatch on the EtherType itself
        other => (Layer::L2, other, 0),
    };

    Ok(ParseCtx { tun, dst_mac, src_mac, ethertype, l3_off, l4_off, layer, selector })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst);
        f.extend_from_slice(&src);
        f.extend_from_slice(&ethertype.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn tag(tci: u16, inner: u16) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&tci.to_be_bytes());
        v.extend_from_slice(&inner.to_be_bytes());
        v
    }

    #[test]
    fn arp_frame_dispatches_on_l2() {
        let frame = eth([0xff; 6], [0, 0, 1, 0, 0, 1], ETH_TYPE_ARP, &[0u8; 28]);
        let pc = parse_frame(1, &frame).unwrap();
        assert_eq!(pc.layer, Layer::L2);
        assert_eq!(pc.selector, ETH_TYPE_ARP);
        assert_eq!(pc.l3_off, 14);
        assert_eq!(pc.tun, TunnelKey::new(1, [0, 0]));
    }

    #[test]
    fn double_tagged_ipv6_icmpv6() {
        // dot1q(1) / dot1q(2) / ipv6 / icmpv6 echo request
        let mut ip6 = vec![0u8; 44];
        ip6[0] = 0x60;
        ip6[6] = IP_PROTO_ICMPV6;
        ip6[40] = 128; // echo request type
        let mut payload = tag(1, ETH_TYPE_VLAN);
        payload.extend_from_slice(&tag(2, ETH_TYPE_IPV6));
        payload.extend_from_slice(&ip6);
        let frame = eth([0, 0, 1, 0, 0, 0], [0, 0, 0, 2, 0, 0], ETH_TYPE_VLAN, &payload);

        let pc = parse_frame(1, &frame).unwrap();
        assert_eq!(pc.tun, TunnelKey::new(1, [0x8100_0001, 0x8100_0002]));
        assert_eq!(pc.ethertype, ETH_TYPE_IPV6);
        assert_eq!(pc.l3_off, 22);
        assert_eq!(pc.l4_off, 62);
        assert_eq!(pc.layer, Layer::Icmpv6);
        assert_eq!(pc.selector, 128);
    }

    #[test]
    fn ipv4_selects_on_protocol() {
        let mut ip4 = vec![0u8; 28];
        ip4[0] = 0x45;
        ip4[9] = IP_PROTO_IGMP;
        let frame = eth([0xff; 6], [0, 0, 1, 0, 0, 1], ETH_TYPE_IPV4, &ip4);
        let pc = parse_frame(3, &frame).unwrap();
        assert_eq!(pc.layer, Layer::L3);
        assert_eq!(pc.selector, u16::from(IP_PROTO_IGMP));
        assert_eq!(pc.l4_off, 34);
    }

    #[test]
    fn truncated_and_malformed_frames_error() {
        assert_eq!(parse_frame(1, &[0u8; 10]).unwrap_err(), ParseError::Truncated(14));

        let mut ip4 = vec![0u8; 20];
        ip4[0] = 0x42; // ihl 2
        let frame = eth([0xff; 6], [0; 6], ETH_TYPE_IPV4, &ip4);
        assert_eq!(parse_frame(1, &frame).unwrap_err(), ParseError::BadIhl(2));

        let mut payload = tag(1, ETH_TYPE_VLAN);
        payload.extend_from_slice(&tag(2, ETH_TYPE_VLAN));
        payload.extend_from_slice(&tag(3, ETH_TYPE_IPV4));
        payload.extend_from_slice(&[0u8; 20]);
        let frame = eth([0xff; 6], [0; 6], ETH_TYPE_VLAN, &payload);
        assert_eq!(parse_frame(1, &frame).unwrap_err(), ParseError::TooManyTags);
    }
}
