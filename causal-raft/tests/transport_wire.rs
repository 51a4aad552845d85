mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use causal_raft::config::Config;
use causal_raft::message::Heartbeat;
use causal_raft::message::RaftMessage;
use causal_raft::monitor::NoopMonitor;
use causal_raft::node::RaftMember;
use causal_raft::state_machines::NullTransactionApplier;
use causal_raft::transport::inbound::RaftServer;
use causal_raft::transport::outbound::AddressBook;
use causal_raft::transport::outbound::OutboundChannels;
use causal_raft::ClusterId;
use causal_raft::MemberId;
use causal_raft::Outbound;
use maplit::btreeset;
use tokio::sync::watch;

fn config() -> Arc<Config> {
    Config::build("wire-test".into())
        // Long election timeout: the member under test should stay a
        // quiet follower while we poke at its transport.
        .election_timeout(30_000)
        .heartbeat_interval(100)
        .validate()
        .unwrap()
}

async fn follower_member(
    me: MemberId,
    peer: MemberId,
) -> Result<RaftMember<fixtures::MemLogStore>> {
    struct NullOutbound;
    #[async_trait::async_trait]
    impl Outbound for NullOutbound {
        async fn send(&self, _target: MemberId, _message: RaftMessage) -> Result<()> {
            Ok(())
        }
    }

    RaftMember::assemble(
        config(),
        fixtures::MemLogStore::new(),
        fixtures::MemStable::new(me, causal_raft::StoreId::from_u128(1)),
        fixtures::MemFlush::new(),
        Box::new(NullTransactionApplier::default()),
        Arc::new(NullOutbound),
        btreeset![me, peer],
    )
    .await
}

/// A message sent through the TCP transport is handshaken, framed,
/// decoded and delivered into the receiving member's core.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heartbeat_travels_across_the_wire() -> Result<()> {
    fixtures::init_tracing();

    let cluster = ClusterId::from_u128(0xc1);
    let sender = MemberId::from_u128(1);
    let receiver = MemberId::from_u128(2);

    let member = follower_member(receiver, sender).await?;
    let (_tx_binding, rx_binding) = watch::channel(Some(cluster));
    let server = RaftServer::spawn(
        "127.0.0.1:0".parse()?,
        rx_binding,
        member.raft.clone(),
        Arc::new(NoopMonitor),
    )
    .await?;

    let addresses = Arc::new(AddressBook::new());
    addresses.set(receiver, server.local_addr());
    let outbound = OutboundChannels::new(sender, cluster, config(), addresses);

    outbound
        .send(
            receiver,
            RaftMessage::Heartbeat(Heartbeat {
                term: 3,
                leader_commit: 0,
                commit_index_term: 0,
            }),
        )
        .await?;

    // The member adopts term 3 and the sender as leader once the
    // heartbeat lands.
    member
        .raft
        .wait(Some(Duration::from_secs(5)))
        .metrics(
            |m| m.current_term == 3 && m.current_leader == Some(sender),
            "heartbeat delivered",
        )
        .await?;
    Ok(())
}

/// Messages stamped with a different cluster id never reach the core.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_cluster_messages_are_dropped() -> Result<()> {
    fixtures::init_tracing();

    let local_cluster = ClusterId::from_u128(0xc1);
    let foreign_cluster = ClusterId::from_u128(0xc2);
    let sender = MemberId::from_u128(1);
    let receiver = MemberId::from_u128(2);

    let member = follower_member(receiver, sender).await?;
    let (_tx_binding, rx_binding) = watch::channel(Some(local_cluster));
    let server = RaftServer::spawn(
        "127.0.0.1:0".parse()?,
        rx_binding,
        member.raft.clone(),
        Arc::new(NoopMonitor),
    )
    .await?;

    let addresses = Arc::new(AddressBook::new());
    addresses.set(receiver, server.local_addr());
    let outbound = OutboundChannels::new(sender, foreign_cluster, config(), addresses);

    outbound
        .send(
            receiver,
            RaftMessage::Heartbeat(Heartbeat {
                term: 9,
                leader_commit: 0,
                commit_index_term: 0,
            }),
        )
        .await?;

    // The term must not move; the frame was dropped by the cluster-id
    // filter.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let metrics = member.raft.metrics().borrow().clone();
    assert_eq!(metrics.current_term, 0, "foreign-cluster message leaked through");
    assert_eq!(metrics.current_leader, None);
    Ok(())
}
