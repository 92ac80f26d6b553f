use std::net::{IpAddr, Ipv4Addr};

use stun::agent::TransactionId;
use stun::message::{Message, BINDING_REQUEST};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use super::*;
use crate::candidate::RECEIVE_MTU;
use crate::error::Error;

async fn loopback_agent(role: Role) -> Agent {
    Agent::new(AgentConfig {
        bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        role,
        ..AgentConfig::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_send_without_pair_fails() {
    let agent = loopback_agent(Role::Controlling).await;

    assert_eq!(agent.send(b"hello").await, Err(Error::ErrNoCandidatePairs));

    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_send_rejects_oversized_payload() {
    let agent = loopback_agent(Role::Controlling).await;

    let oversized = vec![0_u8; RECEIVE_MTU + 1];
    assert_eq!(agent.send(&oversized).await, Err(Error::ErrPacketTooLarge));

    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_send_rejects_stun_shaped_payload() {
    let agent = loopback_agent(Role::Controlling).await;

    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(TransactionId::new())])
        .unwrap();
    assert_eq!(agent.send(&m.raw).await, Err(Error::ErrWriteStunMessage));

    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let agent = loopback_agent(Role::Controlling).await;

    agent.close().await.unwrap();
    assert_eq!(agent.send(b"late").await, Err(Error::ErrClosed));
    assert_eq!(agent.close().await, Err(Error::ErrClosed));
}

// Payloads flow both directions over the selected pair and the byte
// counters account for them.
#[tokio::test]
async fn test_bidirectional_payloads() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a = loopback_agent(Role::Controlling).await;
    let b = loopback_agent(Role::Controlled).await;

    let (a_recv_tx, mut a_recv_rx) = mpsc::channel::<Vec<u8>>(4);
    a.on_recv(Box::new(move |data| {
        let tx = a_recv_tx.clone();
        Box::pin(async move {
            let _ = tx.send(data).await;
        })
    }));
    let (b_recv_tx, mut b_recv_rx) = mpsc::channel::<Vec<u8>>(4);
    b.on_recv(Box::new(move |data| {
        let tx = b_recv_tx.clone();
        Box::pin(async move {
            let _ = tx.send(data).await;
        })
    }));

    let (done_tx, mut done_rx) = mpsc::channel(2);
    for agent in [&a, &b] {
        let tx = done_tx.clone();
        agent.on_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                if state == AgentState::Completed {
                    let _ = tx.send(()).await;
                }
            })
        }));
    }

    for agent in [&a, &b] {
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

    let desc_a = a.local_description().await;
    let desc_b = b.local_description().await;
    a.set_remote_description(&desc_b).await.unwrap();
    b.set_remote_description(&desc_a).await.unwrap();

    for _ in 0..2 {
        timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("agents never completed");
    }

    a.send(b"from a").await.unwrap();
    b.send(b"from b").await.unwrap();

    let at_b = timeout(Duration::from_secs(1), b_recv_rx.recv())
        .await
        .expect("b got no payload")
        .unwrap();
    let at_a = timeout(Duration::from_secs(1), a_recv_rx.recv())
        .await
        .expect("a got no payload")
        .unwrap();
    assert_eq!(at_b, b"from a");
    assert_eq!(at_a, b"from b");

    assert_eq!(a.bytes_sent(), b"from a".len());
    assert_eq!(b.bytes_received(), b"from a".len());

    a.close().await.unwrap();
    b.close().await.unwrap();
}
