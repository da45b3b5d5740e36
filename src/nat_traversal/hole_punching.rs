/**
 * nat_traversal/hole_punching.rs
 *
 * UDP hole punching: probe burst, receive loop and the established channel
 */

use super::channel::{probe_payload, Datagram, Inbox, SessionEvent};
use super::codec::is_stun_message;
use super::error::{SessionError, SocketError};
use super::socket::local_endpoint;
use super::stun::RECV_BUFFER;
use super::types::{to_endpoint, Endpoint, PeerTarget, PunchConfig, PunchState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Traffic counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PunchStats {
    pub probes_sent: u32,
    pub probes_received: u32,
    pub messages_sent: u32,
    pub messages_received: u32,
    pub strangers: u32,
}

/// Session state shared by the foreground, the burst and the receive loop
#[derive(Debug)]
struct Inner {
    state: PunchState,
    peer: Option<Endpoint>,
    peer_confirmed: bool,
    stats: PunchStats,
}

impl Inner {
    /// Account for one inbound datagram and produce the events it causes
    fn on_datagram(&mut self, from: Endpoint, datagram: Datagram) -> Vec<SessionEvent> {
        if matches!(self.state, PunchState::Idle | PunchState::Closed) {
            return Vec::new();
        }

        let from_peer = match self.peer {
            Some(peer) if self.peer_confirmed => peer == from,
            _ => {
                // Trust on first use
                info!("Adopting {} as peer", from);
                self.peer = Some(from);
                self.peer_confirmed = true;
                true
            }
        };

        if !from_peer {
            self.stats.strangers += 1;
            return vec![SessionEvent::Stranger { from, datagram }];
        }

        let mut events = Vec::with_capacity(2);
        if self.state == PunchState::Punching {
            info!("Hole punched: first datagram from {}", from);
            self.state = PunchState::Established;
            events.push(SessionEvent::Established { peer: from });
        }

        match datagram {
            Datagram::Probe(seq) => {
                self.stats.probes_received += 1;
                events.push(SessionEvent::Probe { from, seq });
            }
            Datagram::Text(text) => {
                self.stats.messages_received += 1;
                events.push(SessionEvent::Message { from, text });
            }
        }
        events
    }
}

struct Shared {
    running: AtomicBool,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Tasks {
    receiver: Option<JoinHandle<()>>,
    bursts: Vec<JoinHandle<()>>,
}

/// A hole-punch session
///
/// Owns the UDP socket for its whole life. The socket is shared with the
/// receive loop and any running probe burst; `close` stops both and waits
/// for the receive loop to exit.
pub struct PunchSession {
    socket: Arc<UdpSocket>,
    local_endpoint: Endpoint,
    public_endpoint: Option<Endpoint>,
    config: PunchConfig,
    shared: Arc<Shared>,
    events_tx: Mutex<Option<UnboundedSender<SessionEvent>>>,
    inbox: Mutex<Option<Inbox>>,
    tasks: Mutex<Tasks>,
}

impl PunchSession {
    /// Wrap a bound socket. `public_endpoint` is what STUN reported for it, if anything.
    pub fn new(
        socket: UdpSocket,
        public_endpoint: Option<Endpoint>,
        config: PunchConfig,
    ) -> Result<Self, SocketError> {
        let local_endpoint = local_endpoint(&socket)?;
        let (tx, rx) = unbounded_channel();

        Ok(Self {
            socket: Arc::new(socket),
            local_endpoint,
            public_endpoint,
            config,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    state: PunchState::Idle,
                    peer: None,
                    peer_confirmed: false,
                    stats: PunchStats::default(),
                }),
            }),
            events_tx: Mutex::new(Some(tx)),
            inbox: Mutex::new(Some(Inbox::new(rx))),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// The event stream; can be taken once
    pub fn take_inbox(&self) -> Option<Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Idle -> Punching: start the receive loop and, when the target has an
    /// endpoint, a probe burst towards it. Must run inside a Tokio runtime.
    pub fn start_punching(&self, target: PeerTarget) -> Result<(), SessionError> {
        {
            let mut inner = self.shared.lock();
            match inner.state {
                PunchState::Idle => {}
                PunchState::Closed => return Err(SessionError::Closed),
                PunchState::Punching | PunchState::Established => return Err(SessionError::AlreadyStarted),
            }
            inner.state = PunchState::Punching;
            inner.peer = target.endpoint();
            inner.peer_confirmed = matches!(target, PeerTarget::Confirmed(_));
        }

        let events = self
            .events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::AlreadyStarted)?;

        self.shared.running.store(true, Ordering::SeqCst);
        info!(
            "Punching from {} (public {:?}) towards {:?}",
            self.local_endpoint, self.public_endpoint, target
        );

        let receiver = tokio::spawn(receive_loop(
            self.socket.clone(),
            self.shared.clone(),
            events,
            self.config.poll_interval,
        ));
        self.lock_tasks().receiver = Some(receiver);

        if let Some(endpoint) = target.endpoint() {
            self.spawn_burst(endpoint);
        }
        Ok(())
    }

    /// Send another full burst towards the current peer
    pub fn punch_again(&self) -> Result<(), SessionError> {
        let (state, peer) = {
            let inner = self.shared.lock();
            (inner.state, inner.peer)
        };
        match (state, peer) {
            (PunchState::Closed, _) => Err(SessionError::Closed),
            (PunchState::Idle, _) | (_, None) => Err(SessionError::NotEstablished),
            (_, Some(peer)) => {
                self.spawn_burst(peer);
                Ok(())
            }
        }
    }

    fn spawn_burst(&self, target: Endpoint) {
        let burst = tokio::spawn(punch_burst(
            self.socket.clone(),
            self.shared.clone(),
            target,
            self.config.probe_count,
            self.config.probe_interval,
        ));
        let mut tasks = self.lock_tasks();
        tasks.bursts.retain(|handle| !handle.is_finished());
        tasks.bursts.push(burst);
    }

    /// Send chat text to the peer. Fire and forget: no acknowledgement, no retry.
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        let peer = {
            let inner = self.shared.lock();
            match (inner.state, inner.peer) {
                (PunchState::Closed, _) => return Err(SessionError::Closed),
                (PunchState::Established, Some(peer)) => peer,
                _ => return Err(SessionError::NotEstablished),
            }
        };

        self.socket
            .send_to(text.as_bytes(), peer)
            .await
            .map_err(|source| SocketError::Send {
                target: peer.to_string(),
                source,
            })?;

        self.shared.lock().stats.messages_sent += 1;
        debug!("Sent {} bytes to {}", text.len(), peer);
        Ok(())
    }

    /// Stop the burst and the receive loop and wait for the loop to exit.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let mut inner = self.shared.lock();
            if inner.state != PunchState::Closed {
                info!("Closing punch session on {}", self.local_endpoint);
            }
            inner.state = PunchState::Closed;
        }
        // Never started: drop the unused sender so the inbox ends
        self.events_tx.lock().unwrap_or_else(PoisonError::into_inner).take();

        let (receiver, bursts) = {
            let mut tasks = self.lock_tasks();
            (tasks.receiver.take(), std::mem::take(&mut tasks.bursts))
        };

        for burst in bursts {
            burst.abort();
        }
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.await {
                warn!("Receive loop ended abnormally: {}", e);
            }
        }
    }

    pub fn state(&self) -> PunchState {
        self.shared.lock().state
    }

    pub fn is_established(&self) -> bool {
        self.state() == PunchState::Established
    }

    /// Current peer; confirmed once the session is established
    pub fn peer(&self) -> Option<Endpoint> {
        self.shared.lock().peer
    }

    pub fn stats(&self) -> PunchStats {
        self.shared.lock().stats
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local_endpoint
    }

    pub fn public_endpoint(&self) -> Option<Endpoint> {
        self.public_endpoint
    }

    pub fn config(&self) -> &PunchConfig {
        &self.config
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PunchSession {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for burst in tasks.bursts.drain(..) {
            burst.abort();
        }
        if let Some(receiver) = tasks.receiver.take() {
            receiver.abort();
        }
    }
}

/// `probe_count` probes, `interval` apart, to the peer (or `target` until one is known)
async fn punch_burst(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    target: Endpoint,
    probe_count: u32,
    interval: Duration,
) {
    for seq in 1..=probe_count {
        if !shared.is_running() {
            break;
        }

        let to = shared.lock().peer.unwrap_or(target);
        match socket.send_to(probe_payload(seq).as_bytes(), to).await {
            Ok(_) => {
                shared.lock().stats.probes_sent += 1;
                debug!("Probe {}/{} sent to {}", seq, probe_count, to);
            }
            Err(e) => warn!("Probe {} to {} failed: {}", seq, to, e),
        }

        if seq < probe_count {
            tokio::time::sleep(interval).await;
        }
    }
    debug!("Probe burst towards {} finished", target);
}

/// Bounded waits on the shared socket until the running flag drops
async fn receive_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    events: UnboundedSender<SessionEvent>,
    poll_interval: Duration,
) {
    let mut buffer = vec![0u8; RECV_BUFFER];

    while shared.is_running() {
        let (len, from) = match timeout(poll_interval, socket.recv_from(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                // ICMP unreachable from an unopened peer port shows up here on some platforms
                debug!("Receive error: {}", e);
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        let Some(from) = to_endpoint(from) else {
            debug!("Ignoring datagram from non-IPv4 source {}", from);
            continue;
        };

        // Late STUN answers land on this socket too; they never come from the peer
        if is_stun_message(&buffer[..len]) {
            debug!("Dropping stray STUN message from {}", from);
            continue;
        }

        let datagram = Datagram::parse(&buffer[..len]);
        let produced = shared.lock().on_datagram(from, datagram);
        for event in produced {
            if let SessionEvent::Stranger { from, .. } = &event {
                warn!("Datagram from unexpected source {}", from);
            }
            // The inbox may have been dropped by a caller that only wants the state
            let _ = events.send(event);
        }
    }
    debug!("Receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_config(probe_count: u32) -> PunchConfig {
        PunchConfig {
            probe_count,
            probe_interval: Duration::from_millis(40),
            poll_interval: Duration::from_millis(50),
        }
    }

    async fn loopback() -> (UdpSocket, Endpoint) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ep = to_endpoint(socket.local_addr().unwrap()).unwrap();
        (socket, ep)
    }

    async fn session(probe_count: u32) -> (PunchSession, Endpoint) {
        let (socket, ep) = loopback().await;
        (PunchSession::new(socket, None, fast_config(probe_count)).unwrap(), ep)
    }

    fn inner(peer: Option<Endpoint>, confirmed: bool) -> Inner {
        Inner {
            state: PunchState::Punching,
            peer,
            peer_confirmed: confirmed,
            stats: PunchStats::default(),
        }
    }

    #[test]
    fn confirmed_peer_filters_other_sources() {
        let peer: Endpoint = "198.51.100.1:5000".parse().unwrap();
        let other: Endpoint = "198.51.100.2:5000".parse().unwrap();
        let mut state = inner(Some(peer), true);

        let events = state.on_datagram(other, Datagram::Text("hi".into()));
        assert!(matches!(events.as_slice(), [SessionEvent::Stranger { .. }]));
        assert_eq!(state.state, PunchState::Punching);

        let events = state.on_datagram(peer, Datagram::Probe(Some(1)));
        assert_eq!(
            events,
            vec![
                SessionEvent::Established { peer },
                SessionEvent::Probe { from: peer, seq: Some(1) }
            ]
        );
        assert_eq!(state.state, PunchState::Established);
        assert_eq!(state.stats.strangers, 1);
        assert_eq!(state.stats.probes_received, 1);
    }

    #[test]
    fn assumed_peer_is_replaced_by_first_sender() {
        let assumed: Endpoint = "198.51.100.1:5000".parse().unwrap();
        let actual: Endpoint = "198.51.100.1:5007".parse().unwrap();
        let mut state = inner(Some(assumed), false);

        state.on_datagram(actual, Datagram::Probe(Some(3)));
        assert_eq!(state.peer, Some(actual));
        assert_eq!(state.state, PunchState::Established);
    }

    #[test]
    fn closed_session_ignores_traffic() {
        let mut state = inner(None, false);
        state.state = PunchState::Closed;
        let events = state.on_datagram("198.51.100.1:1".parse().unwrap(), Datagram::Text("x".into()));
        assert!(events.is_empty());
        assert_eq!(state.peer, None);
    }

    #[tokio::test]
    async fn establishes_mid_burst_and_sends_exactly_once() {
        let (stub, stub_ep) = loopback().await;
        let (session, local) = session(10).await;
        let mut inbox = session.take_inbox().unwrap();

        session.start_punching(PeerTarget::Confirmed(stub_ep)).unwrap();
        assert_eq!(session.state(), PunchState::Punching);

        let mut buf = [0u8; 256];
        for _ in 0..3 {
            let (len, from) = stub.recv_from(&mut buf).await.unwrap();
            assert!(Datagram::parse(&buf[..len]).is_probe());
            assert_eq!(to_endpoint(from), Some(local));
        }
        stub.send_to(b"PUNCH_1", local).await.unwrap();

        let event = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        assert_eq!(event, Some(SessionEvent::Established { peer: stub_ep }));
        assert!(session.is_established());

        session.send("hello peer").await.unwrap();

        let mut chat = Vec::new();
        while let Ok(Ok((len, _))) = timeout(Duration::from_millis(300), stub.recv_from(&mut buf)).await {
            if let Datagram::Text(text) = Datagram::parse(&buf[..len]) {
                chat.push(text);
            }
        }
        assert_eq!(chat, vec!["hello peer".to_string()]);
        assert_eq!(session.state(), PunchState::Established);
        assert_eq!(session.stats().probes_sent, 10);
        assert_eq!(session.stats().messages_sent, 1);

        session.close().await;
    }

    #[tokio::test]
    async fn first_sender_becomes_peer() {
        let (session, local) = session(1).await;
        let mut inbox = session.take_inbox().unwrap();
        session.start_punching(PeerTarget::Unknown).unwrap();

        let (first, first_ep) = loopback().await;
        let (second, second_ep) = loopback().await;

        first.send_to(b"hello", local).await.unwrap();
        assert_eq!(
            inbox.recv().await,
            Some(SessionEvent::Established { peer: first_ep })
        );
        assert_eq!(
            inbox.recv().await,
            Some(SessionEvent::Message { from: first_ep, text: "hello".into() })
        );

        second.send_to(b"intruder", local).await.unwrap();
        assert_eq!(
            inbox.recv().await,
            Some(SessionEvent::Stranger {
                from: second_ep,
                datagram: Datagram::Text("intruder".into())
            })
        );

        assert_eq!(session.peer(), Some(first_ep));
        assert_eq!(session.stats().strangers, 1);
        assert_eq!(session.stats().probes_sent, 0);
        session.close().await;
    }

    #[tokio::test]
    async fn late_stun_response_does_not_become_peer() {
        use crate::nat_traversal::codec::{encode_binding_response, AddressEncoding};
        use crate::nat_traversal::types::TransactionId;

        let (stun, _) = loopback().await;
        let (peer, peer_ep) = loopback().await;
        let (session, local) = session(1).await;
        let mut inbox = session.take_inbox().unwrap();

        // Queued before the receive loop starts, as after a timed-out query
        let late = encode_binding_response(
            &TransactionId([7; 12]),
            &"203.0.113.5:40000".parse().unwrap(),
            AddressEncoding::XorMapped,
        );
        stun.send_to(&late, local).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.start_punching(PeerTarget::Assumed(peer_ep)).unwrap();
        peer.send_to(b"PUNCH_1", local).await.unwrap();

        let event = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        assert_eq!(event, Some(SessionEvent::Established { peer: peer_ep }));
        assert_eq!(session.peer(), Some(peer_ep));
        assert_eq!(session.stats().strangers, 0);
        session.close().await;
    }

    #[tokio::test]
    async fn send_requires_established_peer() {
        let (session, _) = session(1).await;
        assert!(matches!(session.send("early").await, Err(SessionError::NotEstablished)));

        session.start_punching(PeerTarget::Unknown).unwrap();
        assert!(matches!(session.send("still early").await, Err(SessionError::NotEstablished)));
        assert!(matches!(
            session.start_punching(PeerTarget::Unknown),
            Err(SessionError::AlreadyStarted)
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_prompt() {
        let (stub, stub_ep) = loopback().await;
        let (session, _) = session(100).await;
        let mut inbox = session.take_inbox().unwrap();
        session.start_punching(PeerTarget::Confirmed(stub_ep)).unwrap();

        let started = Instant::now();
        session.close().await;
        assert!(started.elapsed() < session.config().poll_interval * 4);

        let started = Instant::now();
        session.close().await;
        assert!(started.elapsed() < Duration::from_millis(50));

        assert_eq!(session.state(), PunchState::Closed);
        assert!(matches!(session.send("late").await, Err(SessionError::Closed)));
        assert!(matches!(session.punch_again(), Err(SessionError::Closed)));
        assert!(matches!(
            session.start_punching(PeerTarget::Unknown),
            Err(SessionError::Closed)
        ));

        // The loop is gone, so the inbox drains and ends
        assert_eq!(timeout(Duration::from_secs(1), inbox.recv()).await.unwrap(), None);
        drop(stub);
    }

    #[tokio::test]
    async fn close_before_start() {
        let (session, _) = session(1).await;
        let mut inbox = session.take_inbox().unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), PunchState::Closed);
        assert_eq!(inbox.recv().await, None);
    }

    #[tokio::test]
    async fn punch_again_sends_another_burst() {
        let (stub, stub_ep) = loopback().await;
        let (session, _) = session(2).await;
        session.start_punching(PeerTarget::Assumed(stub_ep)).unwrap();

        let mut buf = [0u8; 64];
        for _ in 0..2 {
            stub.recv_from(&mut buf).await.unwrap();
        }
        session.punch_again().unwrap();
        for _ in 0..2 {
            let (len, _) = timeout(Duration::from_secs(1), stub.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(Datagram::parse(&buf[..len]).is_probe());
        }
        session.close().await;
        assert_eq!(session.stats().probes_sent, 4);
    }
}
