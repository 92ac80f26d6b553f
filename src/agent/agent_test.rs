use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use stun::message::{Message, BINDING_SUCCESS};
use stun::xoraddr::XorMappedAddress;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use super::agent_config::*;
use super::*;
use crate::candidate::{CandidatePairState, CandidateType};
use crate::error::Error;

fn loopback_config(role: Role) -> AgentConfig {
    AgentConfig {
        bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        role,
        ..AgentConfig::default()
    }
}

async fn new_loopback_agent(role: Role) -> Agent {
    Agent::new(loopback_config(role)).await.unwrap()
}

fn watch_states(agent: &Agent) -> mpsc::Receiver<AgentState> {
    let (tx, rx) = mpsc::channel(16);
    agent.on_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(state).await;
        })
    }));
    rx
}

async fn gather_and_wait(agent: &Agent) {
    let (tx, mut rx) = mpsc::channel(1);
    agent.on_gathering_done(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(()).await;
        })
    }));
    agent.gather_candidates().await.unwrap();
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("gathering timed out");
}

async fn exchange_descriptions(a: &Agent, b: &Agent) {
    let desc_a = a.local_description().await;
    let desc_b = b.local_description().await;
    a.set_remote_description(&desc_b).await.unwrap();
    b.set_remote_description(&desc_a).await.unwrap();
}

async fn wait_for_state(rx: &mut mpsc::Receiver<AgentState>, want: AgentState, secs: u64) {
    let reached = async {
        while let Some(state) = rx.recv().await {
            if state == want {
                return;
            }
        }
        panic!("state channel closed before {want}");
    };
    if timeout(Duration::from_secs(secs), reached).await.is_err() {
        panic!("timed out waiting for {want}");
    }
}

#[tokio::test]
async fn test_gathering_emits_host_candidate_and_done() {
    let _ = env_logger::builder().is_test(true).try_init();

    let agent = new_loopback_agent(Role::Controlling).await;

    let (tx, mut rx) = mpsc::channel(8);
    agent.on_candidate(Box::new(move |c| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(c).await;
        })
    }));

    gather_and_wait(&agent).await;

    let candidate = rx.recv().await.expect("no candidate emitted");
    assert_eq!(candidate.candidate_type(), CandidateType::Host);
    assert_eq!(candidate.addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(agent.gathering_state(), GatheringState::Complete);

    let (ufrag, pwd) = agent.local_credentials().await;
    assert_eq!(ufrag.len(), 4);
    assert_eq!(pwd.len(), 22);

    let desc = agent.local_description().await;
    assert!(desc.contains(&format!("a=ice-ufrag:{ufrag}")));
    assert!(desc.contains("a=candidate:"));
    assert!(desc.ends_with("a=end-of-candidates\r\n"));

    agent.close().await.unwrap();
}

// Two agents on loopback with exchanged descriptions must complete and
// relay payloads byte-identically.
#[tokio::test]
async fn test_connectivity_loopback_host_only() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a = new_loopback_agent(Role::Controlling).await;
    let b = new_loopback_agent(Role::Controlled).await;

    let mut a_states = watch_states(&a);
    let mut b_states = watch_states(&b);

    let (recv_tx, mut recv_rx) = mpsc::channel::<Vec<u8>>(4);
    b.on_recv(Box::new(move |data| {
        let tx = recv_tx.clone();
        Box::pin(async move {
            let _ = tx.send(data).await;
        })
    }));

    gather_and_wait(&a).await;
    gather_and_wait(&b).await;
    exchange_descriptions(&a, &b).await;

    wait_for_state(&mut a_states, AgentState::Completed, 2).await;
    wait_for_state(&mut b_states, AgentState::Completed, 2).await;

    // the nominated pair is live and verified on both sides
    for agent in [&a, &b] {
        let selected = agent
            .selected_candidate_pair()
            .expect("completed agent must expose a selected pair");
        assert_eq!(selected.state(), CandidatePairState::Succeeded);
        assert!(selected.nominated());
    }

    a.send(b"ping").await.unwrap();
    let payload = timeout(Duration::from_secs(1), recv_rx.recv())
        .await
        .expect("payload timed out")
        .unwrap();
    assert_eq!(payload, b"ping");

    // ordered index invariant: priorities are non-increasing
    {
        let checklist = a.internal.checklist.lock().await;
        for w in checklist.windows(2) {
            assert!(w[0].priority() >= w[1].priority());
        }
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_state_progression_is_monotonic() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a = new_loopback_agent(Role::Controlling).await;
    let b = new_loopback_agent(Role::Controlled).await;

    let (tx, mut rx) = mpsc::channel(16);
    a.on_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(state).await;
        })
    }));

    gather_and_wait(&a).await;
    gather_and_wait(&b).await;
    exchange_descriptions(&a, &b).await;

    let mut seen = vec![];
    let collect = async {
        while let Some(state) = rx.recv().await {
            seen.push(state);
            if state == AgentState::Completed {
                break;
            }
        }
    };
    timeout(Duration::from_secs(5), collect)
        .await
        .expect("never completed");

    assert_eq!(seen.first(), Some(&AgentState::Gathering));
    assert_eq!(seen.last(), Some(&AgentState::Completed));
    for w in seen.windows(2) {
        assert!(w[0] < w[1], "backward transition {} -> {}", w[0], w[1]);
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
}

// Both agents start controlling; 487 handling must leave exactly one of
// them controlling and still complete the session.
#[tokio::test]
async fn test_role_conflict_resolution() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a = new_loopback_agent(Role::Controlling).await;
    let b = new_loopback_agent(Role::Controlling).await;

    let mut a_states = watch_states(&a);
    let mut b_states = watch_states(&b);

    gather_and_wait(&a).await;
    gather_and_wait(&b).await;
    exchange_descriptions(&a, &b).await;

    wait_for_state(&mut a_states, AgentState::Completed, 5).await;
    wait_for_state(&mut b_states, AgentState::Completed, 5).await;

    let roles = (a.role(), b.role());
    assert!(
        roles == (Role::Controlling, Role::Controlled)
            || roles == (Role::Controlled, Role::Controlling),
        "exactly one agent must have switched, got {roles:?}"
    );

    a.close().await.unwrap();
    b.close().await.unwrap();
}

// B's source port is unknown to A (as if a NAT rewrote it): A must
// synthesize a peer-reflexive remote candidate and complete on it.
#[tokio::test]
async fn test_peer_reflexive_candidate() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a = new_loopback_agent(Role::Controlling).await;
    let b = new_loopback_agent(Role::Controlled).await;

    let mut a_states = watch_states(&a);
    let mut b_states = watch_states(&b);

    gather_and_wait(&a).await;
    gather_and_wait(&b).await;

    // B learns A's real description; A only gets B's credentials plus a
    // candidate whose port nobody answers on.
    let desc_a = a.local_description().await;
    b.set_remote_description(&desc_a).await.unwrap();

    let (b_ufrag, b_pwd) = b.local_credentials().await;
    let bogus = format!(
        "a=ice-ufrag:{b_ufrag}\r\na=ice-pwd:{b_pwd}\r\n\
         a=candidate:1 1 udp 1 127.0.0.1 1 typ host\r\n"
    );
    a.set_remote_description(&bogus).await.unwrap();

    wait_for_state(&mut a_states, AgentState::Completed, 5).await;
    wait_for_state(&mut b_states, AgentState::Completed, 5).await;

    let selected = a.selected_candidate_pair().unwrap();
    assert_eq!(
        selected.remote.candidate_type(),
        CandidateType::PeerReflexive,
        "the observed source must have been synthesized as prflx"
    );
    assert_eq!(selected.remote.addr(), b.internal.local_addr);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

// A mock STUN server hands out a fixed mapping; the agent must surface it
// as a srflx candidate in its description.
#[tokio::test]
async fn test_server_reflexive_gathering() {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0_u8; 1500];
        while let Ok((n, src)) = server.recv_from(&mut buf).await {
            let mut request = Message::new();
            request.raw = buf[..n].to_vec();
            if request.decode().is_err() {
                continue;
            }

            let mut response = Message::new();
            response
                .build(&[
                    Box::new(request.clone()),
                    Box::new(BINDING_SUCCESS),
                    Box::new(XorMappedAddress {
                        ip: "203.0.113.5".parse().unwrap(),
                        port: 40000,
                    }),
                ])
                .unwrap();
            let _ = server.send_to(&response.raw, src).await;
        }
    });

    let mut config = loopback_config(Role::Controlling);
    config.urls = vec![Url::parse_url(&format!("stun:127.0.0.1:{}", server_addr.port())).unwrap()];
    let agent = Agent::new(config).await.unwrap();

    gather_and_wait(&agent).await;

    let candidates = agent.local_candidates().await;
    let srflx = candidates
        .iter()
        .find(|c| c.candidate_type() == CandidateType::ServerReflexive)
        .expect("no srflx candidate gathered");
    assert_eq!(srflx.addr(), "203.0.113.5:40000".parse().unwrap());

    let desc = agent.local_description().await;
    assert!(desc.contains("203.0.113.5 40000 typ srflx"));
    assert!(desc.contains("a=end-of-candidates"));

    agent.close().await.unwrap();
}

// A silent peer must fail the agent once the fail timeout elapses, and
// only surface Failed a single time.
#[tokio::test]
async fn test_fail_timeout_fires_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = loopback_config(Role::Controlling);
    config.fail_timeout = Some(Duration::from_millis(500));
    let agent = Agent::new(config).await.unwrap();

    let mut states = watch_states(&agent);

    gather_and_wait(&agent).await;

    // nobody is listening on the remote candidate
    let remote = "a=ice-ufrag:Mute\r\na=ice-pwd:NeverAnswersAnythingAA\r\n\
                  a=candidate:1 1 udp 1 127.0.0.1 9 typ host\r\n";
    agent.set_remote_description(remote).await.unwrap();

    wait_for_state(&mut states, AgentState::Failed, 5).await;

    // terminal: no further state changes, sends are refused
    assert!(
        timeout(Duration::from_millis(300), states.recv()).await.is_err(),
        "no state change may follow Failed"
    );
    assert_eq!(agent.state(), AgentState::Failed);
    assert_eq!(agent.send(b"late").await, Err(Error::ErrAgentFailed));

    // the shipping default
    assert_eq!(ICE_FAIL_TIMEOUT, Duration::from_secs(30));

    agent.close().await.unwrap();
}

// After nomination the selected pair is kept alive by periodic checks and
// never silently replaced.
#[tokio::test]
async fn test_keepalive_on_selected_pair() {
    let _ = env_logger::builder().is_test(true).try_init();

    let keepalive = Duration::from_millis(100);
    let mut config_a = loopback_config(Role::Controlling);
    config_a.keepalive_period = Some(keepalive);
    let mut config_b = loopback_config(Role::Controlled);
    config_b.keepalive_period = Some(keepalive);

    let a = Agent::new(config_a).await.unwrap();
    let b = Agent::new(config_b).await.unwrap();

    let mut a_states = watch_states(&a);

    gather_and_wait(&a).await;
    gather_and_wait(&b).await;
    exchange_descriptions(&a, &b).await;

    wait_for_state(&mut a_states, AgentState::Completed, 5).await;

    let selected = a.selected_candidate_pair().unwrap();
    let sent_before = selected.local.last_sent();
    sleep(keepalive * 4).await;
    let sent_after = selected.local.last_sent();

    assert!(
        sent_after > sent_before,
        "keepalives must refresh the selected pair"
    );
    assert!(
        Arc::ptr_eq(&selected, &a.selected_candidate_pair().unwrap()),
        "the selected pair must not change"
    );
    assert_eq!(STUN_KEEPALIVE_PERIOD, Duration::from_secs(15));

    a.close().await.unwrap();
    b.close().await.unwrap();
}
