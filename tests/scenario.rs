//! The harder failure scenarios: 2-node quorum auto-adjustment in both
//! directions, the lagging-state-machine grace period, snapshot transfer
//! with injected read failures, and parallel log appending against a slow
//! leader disk.

mod common;

use bytes::Bytes;
use common::{add_server_when_ready, descriptor, endpoint_of, fast_options, wait_until, TestCluster};
use quorate::{LogStore, RaftOptions, ServerDescriptor, ServerId};
use tokio::time::{sleep, Duration};

fn two_node_options() -> RaftOptions {
    let mut options = fast_options();
    options.auto_adjust_quorum_for_small_cluster = true;
    options.limits.vote_limit = 2;
    // Leader notices a dead quorum after 4 heartbeat intervals.
    options.limits.response_limit = 4;
    options
}

async fn form_two_node_cluster(cluster: &mut TestCluster, options: RaftOptions) {
    cluster.start(1, vec![descriptor(1)], options.clone(), false);
    assert!(wait_until(Duration::from_secs(3), || cluster.member(1).is_leader()).await);

    cluster.start(2, vec![descriptor(2)], options, true);
    cluster.member(1).add_server(descriptor(2)).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            cluster.member(2).get_leader() == ServerId::new(1)
                && cluster.member(1).status().commit_index == cluster.member(1).status().last_log_index
        })
        .await
    );
}

#[tokio::test]
async fn auto_quorum_lets_surviving_leader_commit() {
    let mut cluster = TestCluster::new();
    form_two_node_cluster(&mut cluster, two_node_options()).await;

    cluster.member(1).replicate(Bytes::from_static(b"before")).await.unwrap();

    cluster.kill(2).await;

    // The leader loses its quorum, steps down, fails pre-votes for a
    // while, then adjusts both quorums to 1 and recovers alone.
    assert!(
        wait_until(Duration::from_secs(15), || {
            cluster.member(1).is_leader()
                && cluster
                    .members
                    .get(&1)
                    .map(|m| {
                        let status = m.member.status();
                        status.commit_index == status.last_log_index
                    })
                    .unwrap_or(false)
        })
        .await,
        "leader should recover via quorum auto-adjustment"
    );
    cluster
        .member(1)
        .replicate(Bytes::from_static(b"alone"))
        .await
        .expect("single-node commit after adjustment");

    // The partner returns and converges to the same committed state.
    cluster.restart(2);
    assert!(
        wait_until(Duration::from_secs(10), || {
            cluster.member(2).status().commit_index == cluster.member(1).status().commit_index
        })
        .await,
        "restarted follower should converge"
    );

    // One more entry lands on both.
    cluster.member(1).replicate(Bytes::from_static(b"together")).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            cluster.member(2).status().commit_index == cluster.member(1).status().commit_index
        })
        .await
    );
}

#[tokio::test]
async fn auto_quorum_lets_surviving_follower_take_over() {
    let mut cluster = TestCluster::new();
    form_two_node_cluster(&mut cluster, two_node_options()).await;

    cluster.kill(1).await;

    // The follower's pre-votes go unanswered until quorum adjustment lets
    // it elect itself.
    assert!(
        wait_until(Duration::from_secs(15), || cluster.member(2).is_leader()).await,
        "follower should become leader via quorum auto-adjustment"
    );
    cluster
        .member(2)
        .replicate(Bytes::from_static(b"solo"))
        .await
        .expect("new leader commits alone");

    cluster.restart(1);
    assert!(
        wait_until(Duration::from_secs(10), || {
            let m = cluster.member(1);
            !m.is_leader() && m.get_leader() == ServerId::new(2)
        })
        .await,
        "old leader should adopt the new one"
    );
}

#[tokio::test]
async fn grace_period_delays_lagging_server_election() {
    let mut cluster = TestCluster::new();

    let mut base = fast_options();
    base.allow_temporary_zero_priority_leader = false;

    cluster.start(1, vec![descriptor(1)], base.clone(), false);
    assert!(wait_until(Duration::from_secs(3), || cluster.member(1).is_leader()).await);

    // S2 can never lead (priority 0); S3 defers elections while its state
    // machine lags.
    let s2 = ServerDescriptor::new(ServerId::new(2), endpoint_of(2), 0);
    cluster.start(2, vec![s2.clone()], base.clone(), true);
    add_server_when_ready(&cluster, 1, s2).await;

    let mut s3_options = base.clone();
    s3_options.grace_period_of_lagging_state_machine = Duration::from_millis(1000);
    cluster.start(3, vec![descriptor(3)], s3_options, true);
    add_server_when_ready(&cluster, 1, descriptor(3)).await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            [2, 3].iter().all(|id| cluster.member(*id).get_leader() == ServerId::new(1))
        })
        .await
    );

    for i in 0..3u8 {
        cluster.member(1).replicate(Bytes::from(vec![i])).await.unwrap();
    }
    // S3 stops applying; five more entries commit everywhere but lag in
    // S3's state machine.
    cluster.member(3).pause_apply(None).await;
    for i in 3..8u8 {
        cluster.member(1).replicate(Bytes::from(vec![i])).await.unwrap();
    }
    assert!(
        wait_until(Duration::from_secs(3), || {
            cluster.member(3).status().commit_index == cluster.member(1).status().commit_index
        })
        .await
    );

    cluster.kill(1).await;

    // Within the grace period nobody takes over.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(cluster.current_leader(), None, "no leader during the grace period");

    // After it expires, S3 wins despite the lagging state machine.
    assert!(
        wait_until(Duration::from_secs(5), || cluster.member(3).is_leader()).await,
        "lagging server should lead after the grace period"
    );
    assert_eq!(cluster.current_leader(), Some(3));

    cluster.member(3).resume_apply().await;
    assert!(
        wait_until(Duration::from_secs(3), || {
            cluster.applied_len(3) >= 8
        })
        .await
    );
}

/// The other half of the grace-period story: once the term has been bumped
/// by leadership yields and fresh entries exist that the lagging server
/// never saw, waiting out the grace period no longer helps it. Voters
/// refuse it on log freshness, not priority.
#[tokio::test]
async fn grace_period_cannot_rescue_stale_log() {
    let mut cluster = TestCluster::new();

    let mut base = fast_options();
    base.allow_temporary_zero_priority_leader = false;

    cluster.start(1, vec![descriptor(1)], base.clone(), false);
    assert!(wait_until(Duration::from_secs(3), || cluster.member(1).is_leader()).await);

    let s2 = ServerDescriptor::new(ServerId::new(2), endpoint_of(2), 0);
    cluster.start(2, vec![s2.clone()], base.clone(), true);
    add_server_when_ready(&cluster, 1, s2).await;

    let mut s3_options = base.clone();
    s3_options.grace_period_of_lagging_state_machine = Duration::from_millis(1000);
    cluster.start(3, vec![descriptor(3)], s3_options, true);
    add_server_when_ready(&cluster, 1, descriptor(3)).await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            [2, 3].iter().all(|id| cluster.member(*id).get_leader() == ServerId::new(1))
        })
        .await
    );

    // Same lagging setup as before: S3's log is current but its state
    // machine stops five entries short.
    for i in 0..3u8 {
        cluster.member(1).replicate(Bytes::from(vec![i])).await.unwrap();
    }
    cluster.member(3).pause_apply(None).await;
    for i in 3..8u8 {
        cluster.member(1).replicate(Bytes::from(vec![i])).await.unwrap();
    }
    assert!(
        wait_until(Duration::from_secs(3), || {
            cluster.member(3).status().commit_index == cluster.member(1).status().commit_index
        })
        .await
    );

    // Cut S3 off, then bump the term with leadership yields while fresh
    // entries land on S1 and S2 only. Pre-vote keeps the isolated S3 from
    // inflating its own term meanwhile.
    cluster.network.set_down(&endpoint_of(3), true);

    cluster
        .member(1)
        .yield_leadership(true, Some(ServerId::new(2)))
        .await
        .expect("yield to S2");
    assert!(wait_until(Duration::from_secs(5), || cluster.member(2).is_leader()).await);
    for i in 8..10u8 {
        cluster.member(2).replicate(Bytes::from(vec![i])).await.unwrap();
    }

    cluster
        .member(2)
        .yield_leadership(true, Some(ServerId::new(1)))
        .await
        .expect("yield back to S1");
    assert!(wait_until(Duration::from_secs(5), || cluster.member(1).is_leader()).await);
    cluster.member(1).replicate(Bytes::from(vec![10])).await.unwrap();

    let fresh_last = cluster.member(1).status().last_log_index;
    assert!(
        cluster.member(3).status().last_log_index < fresh_last,
        "isolated server must have missed the fresh-term entries"
    );

    cluster.kill(1).await;
    cluster.network.set_down(&endpoint_of(3), false);

    // S3's grace period expires, it campaigns, and campaigns again at ever
    // higher terms, but S2's log is fresher and it denies every vote. The
    // cluster stays leaderless rather than electing a stale log.
    sleep(Duration::from_secs(4)).await;
    assert_eq!(cluster.current_leader(), None, "stale log must not win an election");
    assert!(!cluster.member(3).is_leader());
    assert!(cluster.member(3).status().last_log_index < cluster.member(2).status().last_log_index);
}

#[tokio::test]
async fn snapshot_join_survives_injected_read_failures() {
    let mut cluster = TestCluster::new();

    let mut leader_options = fast_options();
    leader_options.snapshot_distance = 20;
    leader_options.reserved_log_items = 5;
    leader_options.log_sync_stop_gap = 10;
    cluster.start(1, vec![descriptor(1)], leader_options, false);
    assert!(wait_until(Duration::from_secs(3), || cluster.member(1).is_leader()).await);

    cluster.start(2, vec![descriptor(2)], fast_options(), true);
    cluster.member(1).add_server(descriptor(2)).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            cluster.member(1).status().commit_index == cluster.member(1).status().last_log_index
        })
        .await
    );

    for i in 0..100u8 {
        cluster.member(1).replicate(Bytes::from(vec![i])).await.unwrap();
    }
    // Snapshotting compacted the leader's log prefix.
    assert!(
        wait_until(Duration::from_secs(5), || {
            cluster.members.get(&1).unwrap().log.start_index().as_u64() > 1
        })
        .await,
        "leader log should be compacted behind a snapshot"
    );

    // The next two snapshot chunk reads on the leader will fail.
    cluster
        .members
        .get(&1)
        .unwrap()
        .state_machine
        .lock()
        .unwrap()
        .inject_read_failures = 2;

    cluster.start(3, vec![descriptor(3)], fast_options(), true);
    add_server_when_ready(&cluster, 1, descriptor(3)).await;

    // S3 catches up via snapshot + appends despite the failures.
    assert!(
        wait_until(Duration::from_secs(15), || {
            cluster.member(3).status().commit_index == cluster.member(1).status().commit_index
        })
        .await,
        "joining server should reach the leader's commit index"
    );
    assert_eq!(
        cluster
            .members
            .get(&1)
            .unwrap()
            .state_machine
            .lock()
            .unwrap()
            .read_failure_count,
        2
    );

    // Every snapshot read context is closed again.
    assert!(
        wait_until(Duration::from_secs(5), || {
            cluster.member(1).status().open_snapshot_contexts == 0
        })
        .await,
        "open snapshot contexts should return to zero"
    );

    // And the replicated state machines agree.
    assert!(
        wait_until(Duration::from_secs(5), || {
            cluster.applied_len(3) == cluster.applied_len(1)
        })
        .await
    );
}

#[tokio::test]
async fn parallel_log_appending_commits_before_leader_durability() {
    let mut cluster = TestCluster::new();

    let mut options = fast_options();
    options.parallel_log_appending = true;

    cluster.start(1, vec![descriptor(1)], options.clone(), false);
    assert!(wait_until(Duration::from_secs(3), || cluster.member(1).is_leader()).await);
    for id in [2, 3] {
        cluster.start(id, vec![descriptor(id)], options.clone(), true);
        add_server_when_ready(&cluster, 1, descriptor(id)).await;
        assert!(
            wait_until(Duration::from_secs(5), || {
                cluster.member(1).status().commit_index == cluster.member(1).status().last_log_index
            })
            .await
        );
    }

    // Slow leader disk, fast follower disks.
    cluster.members.get(&1).unwrap().log.set_flush_delay(Duration::from_millis(500));
    for id in [2, 3] {
        cluster.members.get(&id).unwrap().log.set_flush_delay(Duration::from_millis(10));
    }

    for i in 0..10u8 {
        cluster.member(1).replicate(Bytes::from(vec![i])).await.unwrap();
    }

    // Followers' durability carried the commit; the leader's disk is still
    // catching up.
    let status = cluster.member(1).status();
    assert_eq!(status.commit_index, status.last_log_index);
    assert!(
        status.last_durable_index < status.last_log_index,
        "leader disk should still be behind (durable {}, log {})",
        status.last_durable_index,
        status.last_log_index
    );

    // Once the slow flushes land, the leader's durability catches up.
    assert!(
        wait_until(Duration::from_secs(3), || {
            let status = cluster.member(1).status();
            status.last_durable_index == status.last_log_index
        })
        .await
    );
}
