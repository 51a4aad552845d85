mod fixtures;

use anyhow::Result;
use causal_raft::operation::AppliedResult;
use causal_raft::operation::ReplicatedContent;
use causal_raft::state_machines::kind;
use causal_raft::state_machines::token_registry::TokenRegistry;
use fixtures::RaftRouter;

/// Single-leader commit.
///
/// - bring a healthy 3 node cluster online
/// - replicate one operation through the leader
/// - assert the future resolves with the applier's result and that all
///   three logs end with the entry at identical index and term, with the
///   commit index advanced everywhere
///
/// RUST_LOG=causal_raft=debug cargo test -p causal-raft --test single_leader_commit
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_leader_commit() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(fixtures::test_config(), 3);
    for id in 0..3 {
        router.new_raft_node(id).await?;
    }

    tracing::info!("--- initializing cluster");
    router.initialize(0).await?;
    let leader = router.wait_for_leader().await?;

    // The new leader's blank entry lands at index 1.
    router.wait_for_log(&fixtures::all3(), 1, "leader blank entry").await?;

    tracing::info!("--- replicating one token-create through the leader");
    let result = router
        .replicate(
            leader.as_u128(),
            ReplicatedContent::TokenCreate {
                name: "label".into(),
                proposed_id: 7,
            },
        )
        .await
        .expect("replicate should succeed on the leader");
    assert_eq!(result, AppliedResult::TokenId(7));

    router.wait_for_log(&fixtures::all3(), 2, "token entry").await?;
    router.assert_stable_cluster().await;
    router.assert_logs_match(&fixtures::all3()).await;

    // Every applier observed the same registry state.
    for id in 0..3u128 {
        let node = router.node(id).await;
        let snapshot = node.applier.take_snapshot().await?;
        let mut blob = fixtures::snapshot_blob(&snapshot, kind::TOKEN_REGISTRY);
        let registry = TokenRegistry::unmarshal(&mut blob)?;
        assert_eq!(registry.get("label"), Some(7), "node {} registry", id);
    }

    // Commit index advanced on all three.
    for metrics in router.latest_metrics().await {
        assert!(metrics.commit_index >= 2, "node {} commit index", metrics.id);
    }

    Ok(())
}
