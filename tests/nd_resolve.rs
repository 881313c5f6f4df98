//! A Neighbor Advertisement resolves a client's IPv6 default gateway,
//! after which unicast sends carry the advertised MAC.

mod harness;

use harness::packets::{neighbor_advert, split_frame};
use harness::{CLIENT_IPV6, CLIENT_MAC, inject, rpc, setup_ipv6_client, sim_env};

use serde_json::json;

use netemu::netns::{Ipv6Key, MacKey};

const GW_IPV6: Ipv6Key =
    Ipv6Key([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x03]);
const GW_MAC: MacKey = MacKey([0x00, 0x00, 0x00, 0x00, 0x01, 0x01]);

#[test]
fn advertisement_resolves_the_gateway() {
    let (mut worker, tx) = sim_env();
    let ctx = worker.ctx().clone();
    let (ns, client) = setup_ipv6_client(&ctx, Some(GW_IPV6));
    assert!(!client.dgw_v6.borrow().resolved);

    inject(&ctx, &neighbor_advert(GW_MAC, GW_IPV6, GW_MAC));
    worker.run_sim(10);

    {
        let dgw = client.dgw_v6.borrow();
        assert!(dgw.resolved);
        assert_eq!(dgw.mac, GW_MAC);
    }

    // the neighbor shows up in the nd iter method
    let resp = rpc(&ctx, "ipv6_nd_ns_iter", json!({}));
    assert_eq!(resp["result"]["vec"][0]["mac"], json!(GW_MAC.0.to_vec()));
    assert_eq!(resp["result"]["vec"][0]["ipv6"], json!(GW_IPV6.0.to_vec()));

    // a unicast send now fills in the gateway's destination MAC
    tx.borrow_mut().clear();
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0u8; 6]); // dst placeholder
    frame.extend_from_slice(&[0u8; 6]); // src placeholder
    frame.extend_from_slice(&[0x81, 0x00, 0x00, 0x01, 0x81, 0x00, 0x00, 0x02]);
    frame.extend_from_slice(&0x86ddu16.to_be_bytes());
    frame.extend_from_slice(&[0u8; 40]);
    ctx.send_buffer(true, &client, &frame);
    worker.run_sim(1);

    let frames = tx.borrow();
    assert_eq!(frames.len(), 1);
    let (dst, src, _, _) = split_frame(&frames[0]);
    assert_eq!(dst, GW_MAC);
    assert_eq!(src, CLIENT_MAC);

    drop(frames);
    let _ = ns;
    ctx.teardown();
}

#[test]
fn unresolved_gateway_drops_unicast_sends() {
    let (mut worker, tx) = sim_env();
    let ctx = worker.ctx().clone();
    let (_ns, client) = setup_ipv6_client(&ctx, Some(GW_IPV6));

    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&0x86ddu16.to_be_bytes());
    frame.extend_from_slice(&[0u8; 40]);
    ctx.send_buffer(true, &client, &frame);
    worker.run_sim(1);

    // the frame went nowhere but the solicitation timer is querying
    assert_eq!(ctx.veth_stats.tx_drop_not_resolve.get(), 1);
    let frames = tx.borrow();
    for f in frames.iter() {
        let (_, _, ethertype, l3) = split_frame(f);
        assert_eq!(ethertype, 0x86dd);
        assert_eq!(l3[40], 135, "only neighbor solicitations expected");
    }

    drop(frames);
    ctx.teardown();
}

#[test]
fn client_solicits_its_gateway_until_resolved() {
    let (mut worker, tx) = sim_env();
    let ctx = worker.ctx().clone();
    let (_ns, client) = setup_ipv6_client(&ctx, Some(GW_IPV6));

    worker.run_sim(2500);
    let solicits = tx
        .borrow()
        .iter()
        .filter(|f| {
            let (_, src, ethertype, l3) = split_frame(f);
            src == CLIENT_MAC && ethertype == 0x86dd && l3[40] == 135
        })
        .count();
    assert!(solicits >= 2, "expected periodic retries, saw {}", solicits);

    // target address of the solicitation is the gateway
    let frames = tx.borrow();
    let (_, _, _, l3) = split_frame(&frames[0]);
    assert_eq!(&l3[48..64], &GW_IPV6.0, "ns target must be the gateway");
    // source is the client's address
    assert_eq!(&l3[8..24], &CLIENT_IPV6.0);

    drop(frames);
    inject(&ctx, &neighbor_advert(GW_MAC, GW_IPV6, GW_MAC));
    worker.run_sim(10);
    assert!(client.dgw_v6.borrow().resolved);
    ctx.teardown();
}
