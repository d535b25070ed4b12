// Four VBFT validators reaching agreement from a governance-seeded genesis.

mod common;

use std::time::Duration;

use themis_consensus::vbft::governance::genesis_storage;
use themis_consensus::vbft::{verify_vrf, VbftBlockInfo};
use themis_consensus::{ConsensusConfig, VbftParams};
use themis_core::Ledger;

const ALL: [usize; 4] = [0, 1, 2, 3];

fn vbft_config() -> ConsensusConfig {
    ConsensusConfig {
        consensus_type: "vbft".into(),
        vbft: VbftParams {
            n: 4,
            c: 1,
            k: 4,
            l: 16,
            ..VbftParams::default()
        },
        ..ConsensusConfig::default()
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_governance_committee_commits_chained_blocks() {
    let config = vbft_config();
    let params = config.vbft.clone();
    let mut committee = common::committee(&config, 4, |keys| {
        let peers: Vec<_> = keys.iter().enumerate().map(|(i, pk)| (pk.clone(), 100 + i as u64)).collect();
        genesis_storage(&params, vec![7u8; 32], Vec::new(), &peers)
    });
    let payer = committee.nodes[0].key.clone();
    committee.submit(common::tx(1, &payer));
    committee.start();

    committee.wait_height(&ALL, 4, Duration::from_secs(300)).await;
    committee.halt().await;
    committee.assert_agree(&ALL, 4);

    // every block's VRF chains on its parent's
    let ledger = &committee.nodes[0].ledger;
    let mut prev_vrf = vec![7u8; 32];
    for h in 1..=3 {
        let block = ledger.get_block(h).unwrap();
        let info = VbftBlockInfo::of_block(&block).unwrap();
        let proposer = committee
            .nodes
            .iter()
            .map(|n| n.key.public().clone())
            .nth(info.proposer as usize - 1)
            .unwrap();
        assert!(verify_vrf(&proposer, h, &prev_vrf, &info.vrf_value, &info.vrf_proof));
        assert!(block.header.sig_data.len() >= 3);
        prev_vrf = info.vrf_value;
    }

    // after max_block_change_view blocks the committee is redrawn in-band
    let info_of = |h| VbftBlockInfo::of_block(&ledger.get_block(h).unwrap()).unwrap();
    assert!(info_of(2).new_chain_config.is_none());
    let carrier = info_of(3);
    assert_eq!(carrier.last_config_block_num, 3);
    let redrawn = carrier.new_chain_config.unwrap();
    assert_eq!(redrawn.version, 2);
    assert_eq!(redrawn.view, 1);
    let after = info_of(4);
    assert_eq!(after.last_config_block_num, 3);
    assert!(after.new_chain_config.is_none());

    let included: usize = (1..=4).map(|h| ledger.get_block(h).unwrap().transactions.len()).sum();
    assert_eq!(included, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_bookkeepers_stand_in_without_governance() {
    let mut committee = common::committee(&vbft_config(), 4, |_| Vec::new());
    committee.start();
    committee.wait_height(&ALL, 2, Duration::from_secs(300)).await;
    committee.halt().await;
    committee.assert_agree(&ALL, 2);
}
