mod fixtures;

use anyhow::Result;
use causal_raft::operation::AppliedResult;
use causal_raft::operation::DistributedOperation;
use causal_raft::operation::GlobalSession;
use causal_raft::operation::LocalOperationId;
use causal_raft::operation::ReplicatedContent;
use causal_raft::state_machines::kind;
use causal_raft::state_machines::session_tracker::SessionTracker;
use causal_raft::state_machines::session_tracker::SessionValidation;
use causal_raft::state_machines::token_registry::TokenRegistry;
use fixtures::RaftRouter;

/// Duplicate client retry.
///
/// A client that timed out resends the same `(session, seq)` operation.
/// Both log entries commit, but the operation is applied exactly once
/// and the retry observes the original result.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_retry_applies_once() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(fixtures::test_config(), 3);
    for id in 0..3 {
        router.new_raft_node(id).await?;
    }
    router.initialize(0).await?;
    let leader = router.wait_for_leader().await?;
    router.wait_for_log(&fixtures::all3(), 1, "leader blank entry").await?;

    let session = GlobalSession::new(fixtures::member(99));
    let op_id = LocalOperationId {
        local_session_id: 0,
        sequence_number: 0,
    };

    tracing::info!("--- submitting the operation twice under one operation id");
    let node = router.node(leader.as_u128()).await;
    let first = DistributedOperation::new(
        session,
        op_id,
        ReplicatedContent::TokenCreate {
            name: "dup".into(),
            proposed_id: 7,
        },
    );
    // The retry even proposes a different id; the original outcome must
    // stand.
    let retry = DistributedOperation::new(
        session,
        op_id,
        ReplicatedContent::TokenCreate {
            name: "dup".into(),
            proposed_id: 9,
        },
    );

    node.raft.client_write(first).await.expect("first write commits");
    node.raft.client_write(retry).await.expect("retry commits as well");

    // Both entries (indexes 2 and 3) commit and apply everywhere.
    router.wait_for_log(&fixtures::all3(), 3, "both entries applied").await?;

    for id in 0..3u128 {
        let snapshot = router.node(id).await.applier.take_snapshot().await?;

        let mut registry_blob = fixtures::snapshot_blob(&snapshot, kind::TOKEN_REGISTRY);
        let registry = TokenRegistry::unmarshal(&mut registry_blob)?;
        assert_eq!(
            registry.get("dup"),
            Some(7),
            "node {}: the retry must not reapply",
            id
        );

        // The tracker answers the duplicate with the original result.
        let mut tracker_blob = fixtures::snapshot_blob(&snapshot, kind::SESSION_TRACKER);
        let tracker = SessionTracker::unmarshal(&mut tracker_blob)?;
        assert_eq!(
            tracker.validate(&session, op_id),
            SessionValidation::Duplicate {
                result: Some(AppliedResult::TokenId(7))
            },
            "node {}: cached result",
            id
        );
    }
    Ok(())
}

/// A stale duplicate retry.
///
/// The retry of an operation lands only after two further operations of
/// the same session have already applied. It must still be a no-op and
/// must still be answered with the original result, not with the
/// session's latest one.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_duplicate_keeps_its_original_result() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(fixtures::test_config(), 3);
    for id in 0..3 {
        router.new_raft_node(id).await?;
    }
    router.initialize(0).await?;
    let leader = router.wait_for_leader().await?;
    router.wait_for_log(&fixtures::all3(), 1, "leader blank entry").await?;

    let session = GlobalSession::new(fixtures::member(99));
    let op = |seq: u64, name: &str, id: u32| {
        DistributedOperation::new(
            session,
            LocalOperationId {
                local_session_id: 0,
                sequence_number: seq,
            },
            ReplicatedContent::TokenCreate {
                name: name.into(),
                proposed_id: id,
            },
        )
    };

    tracing::info!("--- three operations, then a retry of the first");
    let node = router.node(leader.as_u128()).await;
    node.raft.client_write(op(0, "first", 1)).await.expect("op 0 commits");
    node.raft.client_write(op(1, "second", 2)).await.expect("op 1 commits");
    node.raft.client_write(op(2, "third", 3)).await.expect("op 2 commits");
    // The client's delayed retry of op 0, now two sequence numbers
    // behind, even proposing a different id.
    node.raft.client_write(op(0, "first", 9)).await.expect("retry commits");

    router.wait_for_log(&fixtures::all3(), 5, "all entries applied").await?;

    for id in 0..3u128 {
        let snapshot = router.node(id).await.applier.take_snapshot().await?;

        let mut registry_blob = fixtures::snapshot_blob(&snapshot, kind::TOKEN_REGISTRY);
        let registry = TokenRegistry::unmarshal(&mut registry_blob)?;
        assert_eq!(registry.get("first"), Some(1), "node {}: no reapply", id);

        let mut tracker_blob = fixtures::snapshot_blob(&snapshot, kind::SESSION_TRACKER);
        let tracker = SessionTracker::unmarshal(&mut tracker_blob)?;
        assert_eq!(
            tracker.validate(
                &session,
                LocalOperationId {
                    local_session_id: 0,
                    sequence_number: 0,
                }
            ),
            SessionValidation::Duplicate {
                result: Some(AppliedResult::TokenId(1))
            },
            "node {}: the stale retry answers with the original result",
            id
        );
        // The latest operation's result is cached alongside it.
        assert_eq!(
            tracker.validate(
                &session,
                LocalOperationId {
                    local_session_id: 0,
                    sequence_number: 2,
                }
            ),
            SessionValidation::Duplicate {
                result: Some(AppliedResult::TokenId(3))
            },
            "node {}: the latest result is intact",
            id
        );
    }
    Ok(())
}
