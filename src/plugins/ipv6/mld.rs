//! MLDv2 membership and report generation.
//!
//! The namespace tracks its IPv6 multicast groups; joins and general
//! queries schedule an MLDv2 report to the all-MLDv2-routers group
//! (`ff02::16`), removals emit an immediate CHANGE_TO_INCLUDE record.
//! smoltcp has no MLDv2 serializer, so the message (with its mandatory
//! hop-by-hop router-alert header) is built as raw bytes.

use std::collections::BTreeSet;

use serde_json::{Value, json};

use crate::csum;
use crate::netns::{Ipv6Key, MacKey, TunnelKey};
use crate::parser::ETH_TYPE_IPV6;
use crate::plugins::{eth_header, link_local};

/// MLDv2 record types used here.
pub const MODE_IS_EXCLUDE: u8 = 2;
pub const CHANGE_TO_INCLUDE: u8 = 3;

/// All MLDv2-capable routers.
pub const ALL_MLDV2_ROUTERS: Ipv6Key =
    Ipv6Key([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x16]);

/// Ticks between a membership change and the report carrying it.
pub const REPORT_DELAY_TICKS: u32 = 100;

#[derive(Debug, Default)]
pub struct MldState {
    groups: BTreeSet<Ipv6Key>,
    report_pending: bool,
}

impl MldState {
    /// Add groups; returns the ones actually new.
    pub fn add(&mut self, vec: Vec<Ipv6Key>) -> Vec<Ipv6Key> {
        vec.into_iter().filter(|g| self.groups.insert(*g)).collect()
    }

    /// Remove groups; returns the ones actually removed.
    pub fn remove(&mut self, vec: Vec<Ipv6Key>) -> Vec<Ipv6Key> {
        vec.into_iter().filter(|g| self.groups.remove(g)).collect()
    }

    pub fn contains(&self, g: &Ipv6Key) -> bool {
        self.groups.contains(g)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Ipv6Key> {
        self.groups.iter()
    }

    /// Arm-once flag for the delayed report timer.
    pub fn mark_pending(&mut self) -> bool {
        let was = self.report_pending;
        self.report_pending = true;
        !was
    }

    pub fn clear_pending(&mut self) {
        self.report_pending = false;
    }

    pub fn marshal(&self) -> Value {
        let vec: Vec<Value> = self.groups.iter().map(|g| json!(g.0.to_vec())).collect();
        json!({"vec": vec})
    }
}

/// Build a complete MLDv2 report frame: Ethernet (+vlans), IPv6 with a
/// router-alert hop-by-hop header, ICMPv6 type 143 with one record per
/// group.
pub fn build_report(tun: &TunnelKey, src_mac: MacKey, records: &[(u8, Ipv6Key)]) -> Vec<u8> {
    const HBH_LEN: usize = 8;
    let icmp_len = 8 + records.len() * 20;
    let src_ip = link_local(src_mac);
    let dst_ip = ALL_MLDV2_ROUTERS;

    let mut frame =
        eth_header(MacKey::from_ipv6_mcast(dst_ip), src_mac, tun, ETH_TYPE_IPV6);

    // ipv6 header
    frame.push(0x60);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&((HBH_LEN + icmp_len) as u16).to_be_bytes());
    frame.push(0); // hop-by-hop
    frame.push(1); // hop limit
    frame.extend_from_slice(&src_ip);
    frame.extend_from_slice(&dst_ip.0);

    // hop-by-hop: next ICMPv6, router alert (MLD), PadN
    frame.extend_from_slice(&[58, 0, 0x05, 0x02, 0x00, 0x00, 0x01, 0x00]);

    // icmpv6 v2 report
    let icmp_off = frame.len();
    frame.push(143);
    frame.push(0);
    frame.extend_from_slice(&[0, 0]); // checksum
    frame.extend_from_slice(&[0, 0]); // reserved
    frame.extend_from_slice(&(records.len() as u16).to_be_bytes());
    for (rec_type, group) in records {
        frame.push(*rec_type);
        frame.push(0); // aux data len
        frame.extend_from_slice(&0u16.to_be_bytes()); // no sources
        frame.extend_from_slice(&group.0);
    }

    let ck = csum::ipv6_checksum(&src_ip, &dst_ip.0, 58, &frame[icmp_off..]);
    frame[icmp_off + 2..icmp_off + 4].copy_from_slice(&ck.to_be_bytes());
    frame
}
