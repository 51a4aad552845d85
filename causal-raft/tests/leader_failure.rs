mod fixtures;

use std::time::Duration;

use anyhow::Result;
use causal_raft::operation::ReplicatedContent;
use fixtures::RaftRouter;
use maplit::btreeset;

/// Leader failure mid-replication.
///
/// - commit one operation on a healthy 3 node cluster
/// - cut the leader off and submit a second operation to it, which can
///   reach no quorum
/// - assert the survivors elect a new leader and keep committing, the
///   committed operation survives, and the cut-off leader's uncommitted
///   tail is truncated away once it rejoins
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failure_mid_replication() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(fixtures::test_config(), 3);
    for id in 0..3 {
        router.new_raft_node(id).await?;
    }
    router.initialize(0).await?;
    let old_leader = router.wait_for_leader().await?;
    router.wait_for_log(&fixtures::all3(), 1, "leader blank entry").await?;

    tracing::info!("--- committing the first operation");
    router
        .replicate(old_leader.as_u128(), ReplicatedContent::Dummy { size: 8 })
        .await
        .expect("first operation must commit");
    router.wait_for_log(&fixtures::all3(), 2, "first operation").await?;

    tracing::info!("--- isolating the leader and writing into the void");
    router.isolate_node(old_leader.as_u128());

    // The isolated leader appends locally but can never commit; abandon
    // the call after a short wait.
    let doomed = {
        let node = router.node(old_leader.as_u128()).await;
        let replicator = node.replicator.clone();
        tokio::spawn(async move {
            let _ = replicator.replicate(ReplicatedContent::Dummy { size: 8 }, true).await;
        })
    };
    let _ = tokio::time::timeout(Duration::from_millis(300), doomed).await;

    let isolated_log = router.node(old_leader.as_u128()).await.stores.log.all_entries();
    let isolated_last = isolated_log.last().expect("isolated leader appended locally").log_id;
    assert!(
        isolated_last.index >= 3,
        "the uncommitted entry must exist on the old leader only"
    );

    tracing::info!("--- waiting for the survivors to elect a new leader");
    let survivors: std::collections::BTreeSet<u128> =
        (0..3).filter(|id| *id != old_leader.as_u128()).collect();
    let new_leader = router.wait_for_leader().await?;
    assert_ne!(new_leader, old_leader);
    assert!(survivors.contains(&new_leader.as_u128()));

    tracing::info!("--- committing on the new leader");
    router
        .replicate(new_leader.as_u128(), ReplicatedContent::Dummy { size: 8 })
        .await
        .expect("the majority partition must keep committing");

    // The uncommitted entry must not be committed on any survivor.
    for id in &survivors {
        let entries = router.node(*id).await.stores.log.all_entries();
        assert!(
            !entries.iter().any(|e| e.log_id == isolated_last),
            "node {} holds the uncommitted entry",
            id
        );
    }

    tracing::info!("--- healing the partition");
    router.restore_node(old_leader.as_u128());

    let want = router
        .node(new_leader.as_u128())
        .await
        .raft
        .metrics()
        .borrow()
        .last_log_index;
    router.wait_for_log(&fixtures::all3(), want, "converged").await?;
    router.assert_logs_match(&btreeset![0, 1, 2]).await;

    // The old leader's conflicting tail is gone.
    let healed = router.node(old_leader.as_u128()).await.stores.log.all_entries();
    assert!(
        !healed.iter().any(|e| e.log_id == isolated_last),
        "the conflicting entry must have been truncated"
    );
    Ok(())
}
