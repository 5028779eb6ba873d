//! Group construct/destruct across simulated clusters

#![allow(clippy::unwrap_used)]

use assert_matches::assert_matches;
use trellis_collective::{
    CollectiveConfig, CollectiveError, GroupDirective, GroupOp, GroupOutcome, GroupRequest,
};
use trellis_core::{DaemonId, EndpointInfo, InfoEntry, ProcId, Status, Tag, TrellisError};
use trellis_testkit::{init_tracing, Outcome, SimCluster};

fn d(rank: u32) -> DaemonId {
    DaemonId(rank)
}

fn app(rank: u32) -> ProcId {
    ProcId::new("app", rank)
}

/// Four daemons, each hosting the app rank of the same number
fn cluster() -> SimCluster {
    let cluster = SimCluster::new(4, 2);
    cluster.add_job("app", &[d(0), d(1), d(2), d(3)]);
    cluster
}

fn members() -> Vec<ProcId> {
    (0..4).map(app).collect()
}

/// Submit `request` (as adjusted per daemon) on every daemon
fn on_every_daemon<F>(cluster: &mut SimCluster, request: F) -> Vec<Outcome<GroupOutcome>>
where
    F: Fn(DaemonId) -> GroupRequest,
{
    cluster
        .daemons()
        .into_iter()
        .map(|daemon| cluster.group(daemon, request(daemon)).unwrap())
        .collect()
}

#[test]
fn construct_releases_membership_and_context_id() {
    init_tracing();
    let mut cluster = cluster();
    let outcomes = on_every_daemon(&mut cluster, |daemon| {
        let request = GroupRequest::construct("reef", members())
            .with(GroupDirective::AssignContextId(true))
            .with(GroupDirective::Endpoint(EndpointInfo {
                proc: app(daemon.0),
                entry: InfoEntry::new("addr", vec![daemon.0 as u8]),
            }));
        if daemon == d(1) {
            request.with(GroupDirective::GroupInfo(InfoEntry::new("color", b"blue".to_vec())))
        } else {
            request
        }
    });
    cluster.run_until_idle();

    for outcome in outcomes {
        let outcome = outcome.take().unwrap();
        assert_eq!(outcome.op, GroupOp::Construct);
        assert_eq!(outcome.membership, members());
        assert_eq!(outcome.context_id, Some(u64::MAX));
        assert_eq!(outcome.info, vec![InfoEntry::new("color", b"blue".to_vec())]);
        assert_eq!(outcome.endpoints.len(), 4);
    }
    for daemon in cluster.daemons() {
        let record = cluster.engine(daemon).lookup_group("reef").unwrap();
        assert_eq!(record.context_id, Some(u64::MAX));
        assert!(cluster.record(daemon).installed.contains_key("reef"));
        assert!(!cluster.engine(daemon).group_engine().is_tracking(GroupOp::Construct, "reef"));
    }
}

#[test]
fn context_ids_count_down_until_exhausted() {
    let config = CollectiveConfig {
        initial_context_id: 2,
        ..CollectiveConfig::default()
    };
    let mut cluster = SimCluster::with_config(2, 2, config).unwrap();
    cluster.add_job("app", &[d(0), d(1)]);
    let both = vec![app(0), app(1)];

    let mut released = Vec::new();
    for name in ["g1", "g2", "g3"] {
        let outcomes = on_every_daemon(&mut cluster, |_| {
            GroupRequest::construct(name, both.clone()).with(GroupDirective::AssignContextId(true))
        });
        cluster.run_until_idle();
        released.push(outcomes.into_iter().map(Outcome::take).collect::<Vec<_>>());
    }

    for result in &released[0] {
        assert_eq!(result.as_ref().unwrap().context_id, Some(2));
    }
    for result in &released[1] {
        assert_eq!(result.as_ref().unwrap().context_id, Some(1));
    }
    for result in &released[2] {
        assert_eq!(result, &Err(CollectiveError::Status(Status::OutOfResource)));
    }
    assert!(cluster.engine(d(1)).lookup_group("g3").is_none());
}

#[test]
fn group_without_context_request_gets_none() {
    let mut cluster = cluster();
    let outcomes = on_every_daemon(&mut cluster, |_| GroupRequest::construct("plain", members()));
    cluster.run_until_idle();

    for outcome in outcomes {
        assert_eq!(outcome.take().unwrap().context_id, None);
    }
    assert_eq!(cluster.engine(d(0)).stats().group.context_ids_assigned, 0);
}

#[test]
fn final_order_is_honoured() {
    let mut cluster = cluster();
    let order = vec![app(3), app(1), app(2), app(0)];
    let outcomes = on_every_daemon(&mut cluster, |daemon| {
        let request = GroupRequest::construct("ordered", members());
        if daemon == d(2) {
            request.with(GroupDirective::FinalOrder(order.clone()))
        } else {
            request
        }
    });
    cluster.run_until_idle();

    for outcome in outcomes {
        assert_eq!(outcome.take().unwrap().membership, order);
    }
}

#[test]
fn bad_final_order_fails_everyone_without_membership() {
    let mut cluster = cluster();
    let outcomes = on_every_daemon(&mut cluster, |_| {
        GroupRequest::construct("broken", members())
            .with(GroupDirective::AssignContextId(true))
            .with(GroupDirective::FinalOrder(vec![app(3), app(2), app(1)]))
    });
    cluster.run_until_idle();

    for outcome in outcomes {
        assert_eq!(outcome.take(), Err(CollectiveError::Status(Status::BadParam)));
    }
    for daemon in cluster.daemons() {
        assert!(cluster.engine(daemon).lookup_group("broken").is_none());
        assert!(!cluster.record(daemon).installed.contains_key("broken"));
    }
    let root = cluster.engine(d(0)).stats().group;
    assert_eq!(root.bad_orders, 1);
    assert_eq!(root.context_ids_assigned, 0);
}

#[test]
fn conflicting_final_orders_fail_the_construct() {
    let mut cluster = cluster();
    let outcomes = on_every_daemon(&mut cluster, |daemon| {
        let order = if daemon == d(1) {
            vec![app(0), app(1), app(2), app(3)]
        } else {
            vec![app(3), app(2), app(1), app(0)]
        };
        GroupRequest::construct("split", members()).with(GroupDirective::FinalOrder(order))
    });
    cluster.run_until_idle();

    for outcome in outcomes {
        assert_eq!(outcome.take(), Err(CollectiveError::Status(Status::BadParam)));
    }
    assert_eq!(cluster.engine(d(0)).stats().group.merge_conflicts, 1);
}

#[test]
fn add_members_join_the_released_membership() {
    let mut cluster = cluster();
    cluster.add_job("tools", &[d(2)]);
    let outcomes = on_every_daemon(&mut cluster, |daemon| {
        let request = GroupRequest::construct("mixed", members());
        if daemon == d(3) {
            request.with(GroupDirective::AddMembers(vec![ProcId::wildcard("tools"), app(1)]))
        } else {
            request
        }
    });
    cluster.run_until_idle();

    let mut expected = members();
    expected.push(ProcId::wildcard("tools"));
    for outcome in outcomes {
        assert_eq!(outcome.take().unwrap().membership, expected);
    }
}

#[test]
fn destruct_forgets_the_group_everywhere() {
    let mut cluster = cluster();
    let built = on_every_daemon(&mut cluster, |_| {
        GroupRequest::construct("tide", members())
            .with(GroupDirective::GroupInfo(InfoEntry::new("k", b"v".to_vec())))
    });
    cluster.run_until_idle();
    for outcome in built {
        outcome.take().unwrap();
    }

    let dissolved = on_every_daemon(&mut cluster, |_| GroupRequest::destruct("tide", members()));
    cluster.run_until_idle();
    for outcome in dissolved {
        assert_eq!(outcome.take().unwrap().op, GroupOp::Destruct);
    }
    for daemon in cluster.daemons() {
        assert!(cluster.engine(daemon).lookup_group("tide").is_none());
        assert!(cluster.record(daemon).installed.is_empty());
    }
}

#[test]
fn local_failure_status_fails_the_construct() {
    let mut cluster = cluster();
    let outcomes = on_every_daemon(&mut cluster, |daemon| {
        let request = GroupRequest::construct("sour", members());
        if daemon == d(3) {
            request.with(GroupDirective::LocalStatus(Status::NotFound))
        } else {
            request
        }
    });
    cluster.run_until_idle();

    for outcome in outcomes {
        assert_eq!(outcome.take(), Err(CollectiveError::Status(Status::NotFound)));
    }
}

#[test]
fn rollup_held_by_a_dead_parent_is_sent_again() {
    let mut cluster = cluster();
    let leaf = cluster
        .group(d(3), GroupRequest::construct("drift", members()))
        .unwrap();
    cluster.run_until_idle();
    assert!(cluster.engine(d(1)).group_engine().is_tracking(GroupOp::Construct, "drift"));

    let mut root = cluster.group(d(0), GroupRequest::construct("drift", members())).unwrap();
    let right = cluster.group(d(2), GroupRequest::construct("drift", members())).unwrap();
    cluster.run_until_idle();
    assert!(root.try_take().is_none());

    cluster.kill(d(1)).unwrap();
    cluster.run_until_idle();

    for outcome in [leaf, root, right] {
        assert_eq!(outcome.take().unwrap().membership, members());
    }
    for daemon in cluster.daemons() {
        assert!(cluster.engine(daemon).lookup_group("drift").is_some(), "{daemon}");
    }
}

#[test]
fn repeated_report_from_one_subtree_is_ignored() {
    let mut cluster = cluster();
    let outcomes = on_every_daemon(&mut cluster, |daemon| {
        let request = GroupRequest::construct("echo", members());
        if daemon == d(3) {
            request.with(GroupDirective::GroupInfo(InfoEntry::new("k", b"v".to_vec())))
        } else {
            request
        }
    });
    // Let d3 report to d1 before d1 contributes, then deliver d3's report twice.
    assert!(cluster.step_where(|e| e.from == d(3) && e.to == d(3)));
    let report = cluster
        .network()
        .take_where(|e| e.from == d(3) && e.to == d(1))
        .unwrap();
    cluster.deliver(report.clone());
    cluster.deliver(report);
    cluster.run_until_idle();

    for outcome in outcomes {
        assert_eq!(
            outcome.take().unwrap().info,
            vec![InfoEntry::new("k", b"v".to_vec())]
        );
    }
    assert_eq!(cluster.engine(d(1)).stats().group.duplicate_reports, 1);
}

#[test]
fn malformed_requests_are_rejected_locally() {
    let mut cluster = cluster();
    assert_matches!(
        cluster.group(d(1), GroupRequest::construct("", members())),
        Err(CollectiveError::Core(TrellisError::Invalid { .. }))
    );
    assert_matches!(
        cluster.group(d(1), GroupRequest::destruct("reef", Vec::new())),
        Err(CollectiveError::Core(TrellisError::Invalid { .. }))
    );
    assert_eq!(cluster.network().pending_message_count(), 0);
}

// ============================================================================
// Bootstrap mode
// ============================================================================

fn leader(rank: u32) -> GroupRequest {
    GroupRequest::construct("boot", vec![app(rank)])
        .with(GroupDirective::Bootstrap(2))
        .with(GroupDirective::AddMembers(vec![app(3)]))
}

fn follower() -> GroupRequest {
    GroupRequest::construct("boot", Vec::new()).with(GroupDirective::AddMembers(vec![app(3)]))
}

fn deliver_report(cluster: &mut SimCluster, from: DaemonId) {
    assert!(cluster.step_where(|e| e.from == from && e.tag == Tag::GROUP));
}

#[test]
fn bootstrap_completes_only_when_leaders_and_followers_are_in() {
    let orders = [
        [d(1), d(2), d(3)],
        [d(1), d(3), d(2)],
        [d(2), d(1), d(3)],
        [d(2), d(3), d(1)],
        [d(3), d(1), d(2)],
        [d(3), d(2), d(1)],
    ];
    for order in orders {
        let mut cluster = cluster();
        let mut outcomes = vec![
            cluster.group(d(1), leader(1)).unwrap(),
            cluster.group(d(2), leader(2)).unwrap(),
            cluster.group(d(3), follower()).unwrap(),
        ];

        deliver_report(&mut cluster, order[0]);
        deliver_report(&mut cluster, order[1]);
        assert_eq!(cluster.network().pending_message_count(), 1);
        for outcome in &mut outcomes {
            assert!(outcome.try_take().is_none(), "released early for {order:?}");
        }
        assert!(cluster
            .engine(d(0))
            .group_engine()
            .is_tracking(GroupOp::Construct, "boot"));

        deliver_report(&mut cluster, order[2]);
        cluster.run_until_idle();
        for outcome in outcomes {
            let released = outcome.take().unwrap();
            assert_eq!(released.membership, vec![app(1), app(2), app(3)], "{order:?}");
        }
        assert_eq!(
            cluster.engine(d(3)).lookup_group("boot").map(|g| g.membership.len()),
            Some(3)
        );
    }
}

#[test]
fn bootstrap_progress_tracks_both_counts() {
    let mut cluster = cluster();
    cluster.group(d(1), leader(1)).unwrap();
    cluster.group(d(2), leader(2)).unwrap();
    let joined = cluster.group(d(3), follower()).unwrap();

    deliver_report(&mut cluster, d(1));
    deliver_report(&mut cluster, d(2));
    assert_eq!(
        cluster.engine(d(0)).group_engine().bootstrap_progress("boot"),
        Some((2, 2, 0, 1))
    );

    cluster.run_until_idle();
    assert_eq!(joined.take().unwrap().membership.len(), 3);
    assert_eq!(cluster.engine(d(0)).group_engine().bootstrap_progress("boot"), None);
}

#[test]
fn leader_count_mismatch_fails_the_bootstrap() {
    let mut cluster = cluster();
    let first = cluster
        .group(d(1), GroupRequest::construct("boot", vec![app(1)]).with(GroupDirective::Bootstrap(2)))
        .unwrap();
    let second = cluster
        .group(d(2), GroupRequest::construct("boot", vec![app(2)]).with(GroupDirective::Bootstrap(3)))
        .unwrap();
    cluster.run_until_idle();

    assert_eq!(first.take(), Err(CollectiveError::Status(Status::BadParam)));
    assert_eq!(second.take(), Err(CollectiveError::Status(Status::BadParam)));
    assert_eq!(cluster.engine(d(0)).stats().group.merge_conflicts, 1);
}
