//! Frame builders for injected traffic.

use netemu::netns::{Ipv6Key, MacKey};
use netemu::smoltcp::phy::ChecksumCapabilities;
use netemu::smoltcp::wire::{
    IpAddress, Icmpv6Packet, Icmpv6Repr, IpProtocol, Ipv6Address, Ipv6Packet, Ipv6Repr,
    NdiscNeighborFlags, NdiscRepr, RawHardwareAddress,
};

/// Ethernet header with the harness double tag (1, 2).
pub fn eth_vlan_header(dst: MacKey, src: MacKey, ethertype: u16) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&dst.0);
    f.extend_from_slice(&src.0);
    for tci in [1u16, 2] {
        f.extend_from_slice(&0x8100u16.to_be_bytes());
        f.extend_from_slice(&tci.to_be_bytes());
    }
    f.extend_from_slice(&ethertype.to_be_bytes());
    f
}

fn ipv6_icmp_frame(
    dst_mac: MacKey,
    src_mac: MacKey,
    src_ip: Ipv6Key,
    dst_ip: Ipv6Key,
    hop_limit: u8,
    repr: &Icmpv6Repr<'_>,
) -> Vec<u8> {
    let src: Ipv6Address = src_ip.into();
    let dst: Ipv6Address = dst_ip.into();
    let ip = Ipv6Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmpv6,
        payload_len: repr.buffer_len(),
        hop_limit,
    };

    let mut frame = eth_vlan_header(dst_mac, src_mac, 0x86dd);
    let off = frame.len();
    frame.resize(off + ip.buffer_len() + repr.buffer_len(), 0);
    let mut ip_pkt = Ipv6Packet::new_unchecked(&mut frame[off..]);
    ip.emit(&mut ip_pkt);
    let mut icmp_pkt = Icmpv6Packet::new_unchecked(ip_pkt.payload_mut());
    repr.emit(
        &IpAddress::Ipv6(src),
        &IpAddress::Ipv6(dst),
        &mut icmp_pkt,
        &ChecksumCapabilities::default(),
    );
    frame
}

pub fn icmpv6_echo_request(
    dst_mac: MacKey,
    src_mac: MacKey,
    src_ip: Ipv6Key,
    dst_ip: Ipv6Key,
    ident: u16,
    seq: u16,
    data: &[u8],
) -> Vec<u8> {
    let repr = Icmpv6Repr::EchoRequest { ident, seq_no: seq, data };
    ipv6_icmp_frame(dst_mac, src_mac, src_ip, dst_ip, 64, &repr)
}

pub fn icmpv6_echo_reply(
    dst_mac: MacKey,
    src_mac: MacKey,
    src_ip: Ipv6Key,
    dst_ip: Ipv6Key,
    ident: u16,
    seq: u16,
    data: &[u8],
) -> Vec<u8> {
    let repr = Icmpv6Repr::EchoReply { ident, seq_no: seq, data };
    ipv6_icmp_frame(dst_mac, src_mac, src_ip, dst_ip, 64, &repr)
}

/// Unsolicited Neighbor Advertisement carrying a target link-layer
/// address option.
pub fn neighbor_advert(src_mac: MacKey, target: Ipv6Key, target_mac: MacKey) -> Vec<u8> {
    let all_nodes = Ipv6Key([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    let repr = Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
        flags: NdiscNeighborFlags::OVERRIDE,
        target_addr: target.into(),
        lladdr: Some(RawHardwareAddress::from_bytes(&target_mac.0)),
    });
    ipv6_icmp_frame(MacKey([0x33, 0x33, 0, 0, 0, 1]), src_mac, target, all_nodes, 255, &repr)
}

/// Minimal MLD general query (no hop-by-hop header; the dispatcher keys
/// on the ICMPv6 type byte alone).
pub fn mld_general_query(src_mac: MacKey) -> Vec<u8> {
    let all_nodes = Ipv6Key([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    let src_ip = Ipv6Key([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    let mut frame = eth_vlan_header(MacKey([0x33, 0x33, 0, 0, 0, 1]), src_mac, 0x86dd);
    let icmp = [130u8, 0, 0, 0, 0, 0, 0, 0]; // type/code/cksum/max-resp/reserved
    frame.push(0x60);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(icmp.len() as u16).to_be_bytes());
    frame.push(58);
    frame.push(1);
    frame.extend_from_slice(&src_ip.0);
    frame.extend_from_slice(&all_nodes.0);
    frame.extend_from_slice(&icmp);
    frame
}

/// Strip the harness vlan tags: returns the inner ethertype offset data
/// (the L3 payload) plus source and destination MACs.
pub fn split_frame(frame: &[u8]) -> (MacKey, MacKey, u16, &[u8]) {
    let dst = MacKey(frame[0..6].try_into().unwrap());
    let src = MacKey(frame[6..12].try_into().unwrap());
    let mut off = 12;
    let mut ethertype = u16::from_be_bytes([frame[off], frame[off + 1]]);
    while ethertype == 0x8100 || ethertype == 0x88a8 {
        off += 4;
        ethertype = u16::from_be_bytes([frame[off], frame[off + 1]]);
    }
    (dst, src, ethertype, &frame[off + 2..])
}
