use super::*;

#[test]
fn test_agent_state_u8_round_trip() {
    let states = [
        AgentState::Disconnected,
        AgentState::Gathering,
        AgentState::Connecting,
        AgentState::Connected,
        AgentState::Completed,
        AgentState::Failed,
    ];

    for state in states {
        assert_eq!(AgentState::from(state as u8), state);
    }
}

#[test]
fn test_agent_state_ordering_matches_progression() {
    assert!(AgentState::Disconnected < AgentState::Gathering);
    assert!(AgentState::Gathering < AgentState::Connecting);
    assert!(AgentState::Connecting < AgentState::Connected);
    assert!(AgentState::Connected < AgentState::Completed);
    // Failed ranks above every live state so the monotonic guard also
    // covers the terminal transition.
    assert!(AgentState::Completed < AgentState::Failed);
}

#[test]
fn test_agent_state_string() {
    assert_eq!(AgentState::Disconnected.to_string(), "disconnected");
    assert_eq!(AgentState::Connecting.to_string(), "connecting");
    assert_eq!(AgentState::Failed.to_string(), "failed");
}

#[test]
fn test_gathering_state_round_trip_and_string() {
    for state in [
        GatheringState::New,
        GatheringState::Gathering,
        GatheringState::Complete,
    ] {
        assert_eq!(GatheringState::from(state as u8), state);
    }

    assert_eq!(GatheringState::Complete.to_string(), "complete");
}
