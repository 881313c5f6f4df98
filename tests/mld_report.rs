//! Joining an MLD group produces an MLDv2 report to ff02::16 with the
//! group in MODE_IS_EXCLUDE.

mod harness;

use harness::packets::{mld_general_query, split_frame};
use harness::{CLIENT_MAC, inject, rpc, setup_ipv6_client, sim_env};

use serde_json::json;

use netemu::netns::{Ipv6Key, MacKey};

const GROUP: Ipv6Key = Ipv6Key([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0, 0, 0]);

const MLDV2_ROUTERS_MAC: MacKey = MacKey([0x33, 0x33, 0, 0, 0, 0x16]);

/// Pull the MLDv2 records out of a report frame, skipping the IPv6 and
/// hop-by-hop headers.
fn report_records(l3: &[u8]) -> Option<Vec<(u8, Ipv6Key)>> {
    if l3[6] != 0 {
        return None; // no hop-by-hop: not an MLDv2 report
    }
    let hbh_len = (l3[40 + 1] as usize + 1) * 8;
    let icmp = &l3[40 + hbh_len..];
    if icmp[0] != 143 {
        return None;
    }
    let n = u16::from_be_bytes([icmp[6], icmp[7]]) as usize;
    let mut records = Vec::new();
    let mut off = 8;
    for _ in 0..n {
        let rec_type = icmp[off];
        let group = Ipv6Key(icmp[off + 4..off + 20].try_into().unwrap());
        records.push((rec_type, group));
        off += 20;
    }
    Some(records)
}

#[test]
fn group_join_reports_mode_is_exclude_within_a_second() {
    let (mut worker, tx) = sim_env();
    let ctx = worker.ctx().clone();
    setup_ipv6_client(&ctx, None);

    let resp = rpc(&ctx, "ipv6_mld_ns_add", json!({"vec": [GROUP.0.to_vec()]}));
    assert_eq!(resp["result"], true, "{}", resp);

    worker.run_sim(1000); // one second

    let frames = tx.borrow();
    let report = frames
        .iter()
        .find_map(|f| {
            let (dst, src, ethertype, l3) = split_frame(f);
            (dst == MLDV2_ROUTERS_MAC && ethertype == 0x86dd).then(|| {
                assert_eq!(src, CLIENT_MAC);
                report_records(l3).expect("frame to ff02::16 must be an mldv2 report")
            })
        })
        .expect("an mldv2 report must be sent within a second");

    assert!(
        report.contains(&(2, GROUP)), // MODE_IS_EXCLUDE
        "report must carry the joined group: {:?}",
        report
    );

    // the membership is visible through the iter method
    drop(frames);
    let resp = rpc(&ctx, "ipv6_mld_ns_iter", json!({}));
    assert_eq!(resp["result"]["vec"][0], json!(GROUP.0.to_vec()));
    ctx.teardown();
}

#[test]
fn general_query_triggers_a_full_report() {
    let (mut worker, tx) = sim_env();
    let ctx = worker.ctx().clone();
    setup_ipv6_client(&ctx, None);

    rpc(&ctx, "ipv6_mld_ns_add", json!({"vec": [GROUP.0.to_vec()]}));
    worker.run_sim(1000);
    tx.borrow_mut().clear();

    inject(&ctx, &mld_general_query(MacKey([0, 0, 0, 2, 0, 0])));
    worker.run_sim(1000);

    let frames = tx.borrow();
    let found = frames.iter().any(|f| {
        let (dst, _, _, l3) = split_frame(f);
        dst == MLDV2_ROUTERS_MAC
            && report_records(l3).is_some_and(|r| r.contains(&(2, GROUP)))
    });
    assert!(found, "query must be answered with the membership report");

    drop(frames);
    ctx.teardown();
}

#[test]
fn group_removal_sends_a_leave_record() {
    let (mut worker, tx) = sim_env();
    let ctx = worker.ctx().clone();
    setup_ipv6_client(&ctx, None);

    rpc(&ctx, "ipv6_mld_ns_add", json!({"vec": [GROUP.0.to_vec()]}));
    worker.run_sim(1000);
    tx.borrow_mut().clear();

    let resp = rpc(&ctx, "ipv6_mld_ns_remove", json!({"vec": [GROUP.0.to_vec()]}));
    assert_eq!(resp["result"], true);
    worker.run_sim(10);

    let frames = tx.borrow();
    let found = frames.iter().any(|f| {
        let (dst, _, _, l3) = split_frame(f);
        dst == MLDV2_ROUTERS_MAC
            && report_records(l3).is_some_and(|r| r.contains(&(3, GROUP))) // CHANGE_TO_INCLUDE
    });
    assert!(found, "removal must emit a leave record");

    drop(frames);
    let resp = rpc(&ctx, "ipv6_mld_ns_iter", json!({}));
    assert_eq!(resp["result"]["vec"], json!([]));
    ctx.teardown();
}
