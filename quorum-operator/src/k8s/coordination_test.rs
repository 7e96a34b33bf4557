use std::time::Duration as StdDuration;

use chrono::Duration;

use super::coordination::{next_state, LeaderElectionConfig, LeaderState};

const ME: &str = "quorum-operator-0";
const OTHER: &str = "quorum-operator-1";

#[test]
fn next_state_acquires_when_holding_the_lease() {
    for current in [LeaderState::Standby, LeaderState::Following(OTHER.into())] {
        let next = next_state(&current, ME, ME);
        assert!(next == Some(LeaderState::Leading), "expected {:?} to move to Leading, got {:?}", current, next);
    }
}

#[test]
fn next_state_follows_another_holder() {
    for current in [LeaderState::Standby, LeaderState::Leading, LeaderState::Following("old".into())] {
        let next = next_state(&current, OTHER, ME);
        assert!(
            next == Some(LeaderState::Following(OTHER.into())),
            "expected {:?} to follow {}, got {:?}",
            current,
            OTHER,
            next
        );
    }
}

#[test]
fn next_state_is_unchanged_for_same_holder() {
    let next = next_state(&LeaderState::Leading, ME, ME);
    assert!(next.is_none(), "expected no change while leading, got {:?}", next);
    let next = next_state(&LeaderState::Following(OTHER.into()), OTHER, ME);
    assert!(next.is_none(), "expected no change while following the same leader, got {:?}", next);
}

#[test]
fn election_config_validates_durations() {
    let timeout = StdDuration::from_secs(10);
    let res = LeaderElectionConfig::new("default", "quorum-operator", ME, Duration::seconds(60), Duration::seconds(10), Duration::seconds(2), timeout);
    assert!(res.is_ok(), "expected valid config, got {:?}", res.err());

    let res = LeaderElectionConfig::new("default", "quorum-operator", ME, Duration::seconds(10), Duration::seconds(10), Duration::seconds(2), timeout);
    assert!(res.is_err(), "expected lease duration equal to renew deadline to be rejected");

    let res = LeaderElectionConfig::new("default", "quorum-operator", ME, Duration::seconds(60), Duration::seconds(2), Duration::seconds(2), timeout);
    assert!(res.is_err(), "expected renew deadline without jitter room to be rejected");
}

#[test]
fn initial_lease_is_held_by_this_instance() {
    let config = LeaderElectionConfig::new(
        "default",
        "quorum-operator",
        ME,
        Duration::seconds(60),
        Duration::seconds(10),
        Duration::seconds(2),
        StdDuration::from_secs(10),
    )
    .map_err(|err| err.to_string());
    let lease = match config {
        Ok(config) => config.initial_lease(),
        Err(err) => panic!("unexpected config error: {}", err),
    };

    let spec = lease.spec.unwrap_or_default();
    assert!(spec.holder_identity.as_deref() == Some(ME), "unexpected holder {:?}", spec.holder_identity);
    assert!(spec.lease_duration_seconds == Some(60), "unexpected lease duration {:?}", spec.lease_duration_seconds);
    assert!(spec.lease_transitions == Some(0), "unexpected transitions {:?}", spec.lease_transitions);
    assert!(lease.metadata.namespace.as_deref() == Some("default"), "unexpected namespace {:?}", lease.metadata.namespace);
}
