#![allow(missing_docs)]

mod support;

use std::time::Duration;

use eskka_core::{NO_MASTER_BLOCK_ID, STATE_NOT_RECOVERED_BLOCK_ID};
use support::{LoopbackNet, eventually, next_state, node_addr, start_node, test_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cut_off_seed_is_downed_by_the_majority_and_clears_itself() {
    let net = LoopbackNet::new();
    let seeds = vec![node_addr(1), node_addr(2), node_addr(3)];

    let s1 = start_node(&net, seeds[0], test_config(&seeds)).await;
    let s2 = start_node(&net, seeds[1], test_config(&seeds)).await;
    let s3 = start_node(&net, seeds[2], test_config(&seeds)).await;

    eventually(Duration::from_secs(5), "full membership everywhere", || {
        [&s1, &s2, &s3]
            .iter()
            .all(|n| seeds.iter().all(|addr| n.sees_up(*addr)))
    })
    .await;

    // Drop every link between the third seed and the rest.
    net.isolate(s3.addr, &[s1.addr, s2.addr]);

    // The two-seed majority keeps quorum and evicts the unreachable seed
    // once a quorum of voters affirmatively times out probing it.
    eventually(Duration::from_secs(10), "majority downs the cut seed", || {
        s1.sees_downed(s3.addr) && s2.sees_downed(s3.addr)
    })
    .await;
    assert!(s1.sees_up(s2.addr) && s2.sees_up(s1.addr));

    // The minority side cannot muster a quorum of timeouts, so it downs
    // nobody; it loses its own quorum instead and clears its state.
    eventually(Duration::from_secs(10), "minority clears its state", || {
        let state = s3.store.current();
        state.has_block(NO_MASTER_BLOCK_ID)
            && state.has_block(STATE_NOT_RECOVERED_BLOCK_ID)
            && state.nodes.len() <= 1
            && state.routing_table.indices.is_empty()
    })
    .await;

    s1.discovery.close().await;
    s2.discovery.close().await;
    s3.discovery.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn symmetric_split_keeps_the_majority_and_fails_over_the_master() {
    let net = LoopbackNet::new();
    let seeds = vec![node_addr(1), node_addr(2), node_addr(3)];

    let s1 = start_node(&net, seeds[0], test_config(&seeds)).await;
    let s2 = start_node(&net, seeds[1], test_config(&seeds)).await;
    let s3 = start_node(&net, seeds[2], test_config(&seeds)).await;

    eventually(Duration::from_secs(5), "full membership everywhere", || {
        [&s1, &s2, &s3]
            .iter()
            .all(|n| seeds.iter().all(|addr| n.sees_up(*addr)))
    })
    .await;
    eventually(Duration::from_secs(5), "first seed runs the master", || {
        s1.discovery.is_master()
    })
    .await;

    // Split the old master away from the two-seed majority.
    net.isolate(s1.addr, &[s2.addr, s3.addr]);

    // The majority downs it and the next oldest member takes over.
    eventually(Duration::from_secs(10), "majority evicts the old master", || {
        s2.sees_downed(s1.addr) && s3.sees_downed(s1.addr)
    })
    .await;
    eventually(Duration::from_secs(10), "next oldest takes over", || {
        s2.discovery.is_master()
    })
    .await;

    // The majority still takes publishes.
    let before = s3.store.current().version;
    let acks = support::CollectingAcks::new();
    s2.discovery
        .publish(next_state(&s2), acks.clone())
        .expect("new master accepts publishes");
    eventually(Duration::from_secs(5), "majority follower applies", || {
        s3.store.current().version > before
    })
    .await;

    // The minority old master cleared itself instead of downing anyone.
    eventually(Duration::from_secs(10), "minority clears its state", || {
        s1.store.current().has_block(NO_MASTER_BLOCK_ID)
    })
    .await;

    s1.discovery.close().await;
    s2.discovery.close().await;
    s3.discovery.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_flap_cancels_the_evaluation_and_downs_nobody() {
    let net = LoopbackNet::new();
    let seeds = vec![node_addr(1), node_addr(2), node_addr(3)];

    // Stretch the evaluation delay so the flap heals before any evaluation
    // can fire.
    let config = |seeds: &[_]| {
        let mut config = test_config(seeds);
        config.partition.eval_delay = Duration::from_secs(2);
        config
    };
    let s1 = start_node(&net, seeds[0], config(&seeds)).await;
    let s2 = start_node(&net, seeds[1], config(&seeds)).await;
    let s3 = start_node(&net, seeds[2], config(&seeds)).await;

    eventually(Duration::from_secs(5), "full membership everywhere", || {
        [&s1, &s2, &s3]
            .iter()
            .all(|n| seeds.iter().all(|addr| n.sees_up(*addr)))
    })
    .await;

    // Cut long enough for failure detectors to notice, heal before the
    // evaluation delay expires.
    net.isolate(s3.addr, &[s1.addr, s2.addr]);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    net.rejoin(s3.addr, &[s1.addr, s2.addr]);

    // Give the cancelled evaluations time to have fired if they were going
    // to: well past eval_delay plus the ping window.
    tokio::time::sleep(Duration::from_secs(3)).await;
    for node in [&s1, &s2, &s3] {
        for addr in [s1.addr, s2.addr, s3.addr] {
            assert!(
                node.sees_up(addr),
                "flap must not down anyone ({} -> {})",
                node.addr,
                addr
            );
        }
    }

    s1.discovery.close().await;
    s2.discovery.close().await;
    s3.discovery.close().await;
}
