mod fixtures;

use anyhow::Result;
use causal_raft::error::ReplicationError;
use causal_raft::operation::ReplicatedContent;
use fixtures::RaftRouter;

/// Replication on a follower fails fast with the leader hint, so the
/// caller can retry against the right member.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_rejects_with_leader_hint() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(fixtures::test_config(), 3);
    for id in 0..3 {
        router.new_raft_node(id).await?;
    }
    router.initialize(0).await?;
    let leader = router.wait_for_leader().await?;
    router.wait_for_log(&fixtures::all3(), 1, "leader blank entry").await?;

    let follower = (0..3).find(|id| *id != leader.as_u128()).unwrap();

    let err = router
        .replicate(follower, ReplicatedContent::Dummy { size: 8 })
        .await
        .expect_err("a follower must not accept replication");
    match err {
        ReplicationError::NotLeader { hint } => {
            assert_eq!(hint, Some(leader), "the hint must name the current leader");
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }

    // Retrying against the hinted member succeeds.
    router
        .replicate(leader.as_u128(), ReplicatedContent::Dummy { size: 8 })
        .await
        .expect("the hinted leader accepts the retry");
    Ok(())
}
