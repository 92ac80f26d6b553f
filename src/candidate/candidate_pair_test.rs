use std::sync::Arc;

use super::*;

fn host_pair(local: &str, remote: &str, controlling: bool) -> CandidatePair {
    CandidatePair::new(
        Arc::new(Candidate::host(local.parse().unwrap())),
        Arc::new(Candidate::host(remote.parse().unwrap())),
        controlling,
    )
}

#[test]
fn test_pair_priority_formula() {
    let p = host_pair("192.0.2.1:2000", "198.51.100.2:3000", true);

    let g = u64::from(p.local.priority());
    let d = u64::from(p.remote.priority());
    let want = (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d);
    assert_eq!(p.priority(), want);
}

#[test]
fn test_pair_priority_symmetric_across_roles() {
    // Both sides must order their check lists identically, so the pair
    // priority may not depend on which side computes it.
    let controlling = host_pair("192.0.2.1:2000", "[2001:db8::2]:3000", true);
    let controlled = host_pair("[2001:db8::2]:3000", "192.0.2.1:2000", false);
    assert_eq!(controlling.priority(), controlled.priority());
}

#[test]
fn test_pair_initial_state_is_frozen() {
    let p = host_pair("192.0.2.1:2000", "198.51.100.2:3000", true);
    assert_eq!(p.state(), CandidatePairState::Frozen);
    assert!(!p.nominated());
}

#[test]
fn test_pair_state_round_trip() {
    for state in [
        CandidatePairState::Frozen,
        CandidatePairState::Waiting,
        CandidatePairState::InProgress,
        CandidatePairState::Succeeded,
        CandidatePairState::Failed,
    ] {
        assert_eq!(CandidatePairState::from(state as u8), state);
    }
}

#[test]
fn test_pair_key_uses_local_base() {
    let srflx = Arc::new(Candidate::server_reflexive(
        "203.0.113.5:40000".parse().unwrap(),
        "192.0.2.1:2000".parse().unwrap(),
    ));
    let remote = Arc::new(Candidate::host("198.51.100.2:3000".parse().unwrap()));
    let via_srflx = CandidatePair::new(srflx, Arc::clone(&remote), true);

    let host = Arc::new(Candidate::host("192.0.2.1:2000".parse().unwrap()));
    let via_host = CandidatePair::new(host, remote, true);

    // checks for both pairs leave from the same base, so they collapse
    assert_eq!(via_srflx.key(), via_host.key());
}

#[test]
fn test_pair_foundation_groups_by_both_sides() {
    let a = host_pair("192.0.2.1:2000", "198.51.100.2:3000", true);
    let b = host_pair("192.0.2.1:2001", "198.51.100.2:3001", true);
    let c = host_pair("192.0.2.9:2000", "198.51.100.2:3000", true);

    assert_eq!(a.foundation(), b.foundation());
    assert_ne!(a.foundation(), c.foundation());
}
