//! End-to-end scenarios S4-S6: blocklist precedence, synthetic-client stats
//! through a full register/shutdown cycle, and NAT status round-tripping
//! through a configured port file.

use std::path::Path;

use kotor_dcc::diagnostics::SyntheticShareStats;
use kotor_dcc::ids::ContentId;
use kotor_dcc::port::NatStatus;
use kotor_dcc::{CacheOptimizer, DccConfig, DccError};

fn config_in(dir: &tempfile::TempDir) -> DccConfig {
    DccConfig::default().with_cache_dir(dir.path().to_path_buf())
}

/// S4: a blocked id refuses a share without touching the network.
#[tokio::test]
async fn s4_block_precedes_share_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let optimizer = CacheOptimizer::new(config_in(&dir));

    let id = ContentId::parse("a".repeat(40)).unwrap();
    optimizer.block_content_id(id.clone(), "Test").await;
    assert!(optimizer.blocklist().is_blocked(id.as_str()));

    let result = optimizer
        .start_background_sharing("key", Path::new("/nonexistent/mod.zip"), id)
        .await;
    match result {
        Err(DccError::Blocked { reason }) => assert_eq!(reason, "Test"),
        other => panic!("expected Blocked error, got {other:?}"),
    }
}

/// S5: two synthetic shares report combined stats; shutdown clears them
/// with no field ever going negative (trivially true for unsigned counts,
/// checked explicitly for documentation value).
#[tokio::test]
async fn s5_synthetic_stats_then_shutdown_clears() {
    let dir = tempfile::tempdir().unwrap();
    let optimizer = CacheOptimizer::new(config_in(&dir));

    let guard = optimizer.attach_synthetic_client();
    guard.client.register_synthetic_share(SyntheticShareStats {
        uploaded_bytes: 100,
        connected_peers: 1,
        ..Default::default()
    });
    guard.client.register_synthetic_share(SyntheticShareStats {
        uploaded_bytes: 200,
        connected_peers: 2,
        ..Default::default()
    });

    let (active, uploaded, connected) = optimizer.get_network_cache_stats();
    assert_eq!((active, uploaded, connected), (2, 300, 3));

    optimizer.graceful_shutdown().await.unwrap();
    let (active, uploaded, connected) = optimizer.get_network_cache_stats();
    assert_eq!(active, 0);
    assert!(uploaded < u64::MAX);
    assert!(connected < u32::MAX);
}

/// S6: a preconfigured port file round-trips through `ensure_initialized`
/// and a simulated NAT success event.
#[tokio::test]
async fn s6_port_file_and_simulated_nat_success() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("port"), "35555").unwrap();
    let optimizer = CacheOptimizer::new(config_in(&dir));

    optimizer.ensure_initialized().unwrap();
    assert_eq!(optimizer.get_nat_status().unwrap().port, 35555);

    optimizer
        .set_nat_status_for_testing(NatStatus {
            successful: true,
            port: 35555,
            last_check_unix: 1,
        })
        .unwrap();
    let status = optimizer.get_nat_status().unwrap();
    assert!(status.successful);
    assert_eq!(status.port, 35555);
}

/// Invariant 8 (stats non-negativity) and invariant 10 (idempotent
/// lifecycle) together: repeated init/shutdown never panics and stats stay
/// within range before and after.
#[tokio::test]
async fn lifecycle_is_idempotent_and_stats_stay_sane() {
    let dir = tempfile::tempdir().unwrap();
    let optimizer = CacheOptimizer::new(config_in(&dir));

    let before = optimizer.get_network_cache_stats();
    assert_eq!(before, (0, 0, 0));

    optimizer.ensure_initialized().unwrap();
    optimizer.ensure_initialized().unwrap();
    optimizer.graceful_shutdown().await.unwrap();
    optimizer.graceful_shutdown().await.unwrap();

    let after = optimizer.get_network_cache_stats();
    assert_eq!(after, (0, 0, 0));
}
