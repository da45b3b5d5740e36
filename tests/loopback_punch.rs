use keyhole::nat_traversal::{
    bind_udp, Endpoint, PeerTarget, PunchConfig, PunchSession, PunchState, SessionEvent,
};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::timeout;

fn config() -> PunchConfig {
    PunchConfig {
        probe_count: 8,
        probe_interval: Duration::from_millis(30),
        poll_interval: Duration::from_millis(50),
    }
}

fn loopback(session: &PunchSession) -> Endpoint {
    Endpoint::new(Ipv4Addr::LOCALHOST, session.local_endpoint().port())
}

async fn wait_established(session: &PunchSession) {
    timeout(Duration::from_secs(3), async {
        while !session.is_established() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never established");
}

#[tokio::test]
async fn two_sessions_punch_and_chat() {
    let alice = PunchSession::new(bind_udp(Ipv4Addr::LOCALHOST, 0).unwrap(), None, config()).unwrap();
    let bob = PunchSession::new(bind_udp(Ipv4Addr::LOCALHOST, 0).unwrap(), None, config()).unwrap();
    let alice_ep = loopback(&alice);
    let bob_ep = loopback(&bob);

    let mut bob_inbox = bob.take_inbox().unwrap();
    alice.start_punching(PeerTarget::Confirmed(bob_ep)).unwrap();
    bob.start_punching(PeerTarget::Assumed(alice_ep)).unwrap();

    wait_established(&alice).await;
    wait_established(&bob).await;
    assert_eq!(alice.peer(), Some(bob_ep));
    assert_eq!(bob.peer(), Some(alice_ep));

    alice.send("hello through the hole").await.unwrap();
    let (from, text) = bob_inbox
        .next_message(Duration::from_secs(2))
        .await
        .expect("no message delivered");
    assert_eq!(from, alice_ep);
    assert_eq!(text, "hello through the hole");

    alice.close().await;
    bob.close().await;
    assert_eq!(alice.state(), PunchState::Closed);
    assert!(bob.send("too late").await.is_err());
}

#[tokio::test]
async fn listener_adopts_first_sender() {
    let listener = PunchSession::new(bind_udp(Ipv4Addr::LOCALHOST, 0).unwrap(), None, config()).unwrap();
    let caller = PunchSession::new(bind_udp(Ipv4Addr::LOCALHOST, 0).unwrap(), None, config()).unwrap();
    let listener_ep = loopback(&listener);
    let caller_ep = loopback(&caller);

    let mut events = listener.take_inbox().unwrap();
    let mut caller_inbox = caller.take_inbox().unwrap();
    listener.start_punching(PeerTarget::Unknown).unwrap();
    caller.start_punching(PeerTarget::Confirmed(listener_ep)).unwrap();

    let first = timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("listener saw nothing")
        .unwrap();
    assert!(matches!(first, SessionEvent::Established { peer } if peer == caller_ep));

    // The listener sends nothing until it has a peer, so its reply opens the caller's side
    listener.send("Received: ping").await.unwrap();
    wait_established(&caller).await;
    assert_eq!(caller.peer(), Some(listener_ep));
    assert_eq!(listener.stats().messages_sent, 1);

    let (from, text) = caller_inbox
        .next_message(Duration::from_secs(2))
        .await
        .expect("reply not delivered");
    assert_eq!(from, listener_ep);
    assert_eq!(text, "Received: ping");

    listener.close().await;
    caller.close().await;
}
