// Concurrent waiters on the VBFT peer pool.

use std::sync::Arc;
use std::time::Duration;

use themis_consensus::vbft::{PeerConfig, PeerPool};
use themis_crypto::KeyPair;

fn pool() -> Arc<PeerPool> {
    let pool = Arc::new(PeerPool::new(None));
    for i in 1..=2u32 {
        let kp = KeyPair::from_seed(&[i as u8; 32]).unwrap();
        pool.add_peer(&PeerConfig {
            index: i,
            id: kp.public().clone(),
        })
        .unwrap();
    }
    pool
}

#[tokio::test(start_paused = true)]
async fn test_one_connect_releases_every_waiter() {
    let pool = pool();
    let a = tokio::spawn({
        let pool = pool.clone();
        async move { pool.wait_peer_connected(2).await }
    });
    let b = tokio::spawn({
        let pool = pool.clone();
        async move { pool.wait_peer_connected(2).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.peer_connected(2);

    assert!(a.await.unwrap());
    assert!(b.await.unwrap());

    let start = tokio::time::Instant::now();
    assert!(pool.wait_peer_connected(2).await);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_index_and_timeout() {
    let pool = pool();
    assert!(!pool.wait_peer_connected(9).await);
    assert!(!pool.wait_peer_connected(1).await);
}
