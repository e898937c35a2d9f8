//! In-memory transport engine and signaling service used by the unit tests.

use crate::error::Error;
use crate::signaling::{IceCandidateRecord, SignalingConnector, SignalingLink, SignalingMessage};
use crate::transport::{
    DataChannelHandle, DataLink, PeerConnectionState, PeerTransport, SdpKind,
    SessionDescription, TransportEngine, TransportEventAdapter,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;

pub(crate) const TIMEOUT: Duration = Duration::from_secs(5);

/// Polls the condition until it holds, panicking after [TIMEOUT].
pub(crate) async fn eventually<F>(f: F)
where
    F: Fn() -> bool,
{
    let poll = async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, poll)
        .await
        .expect("condition not met in time");
}

#[derive(Debug, Default)]
pub(crate) struct RecordingLink {
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl RecordingLink {
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataLink for RecordingLink {
    async fn send(&self, data: &Bytes) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelNotOpen);
        }
        self.sent.lock().unwrap().push(data.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted engine. Descriptions are plain strings, and a connection reports itself as
/// connected as soon as both its local and remote descriptions are set (when `auto_connect` is
/// on). Locally created data channels open together with the connection.
#[derive(Debug)]
pub(crate) struct MockEngine {
    name: String,
    auto_connect: bool,
    fail_answer: AtomicBool,
    /// Fails the next connection request without creating a peer.
    fail_connection: AtomicBool,
    /// When set, offer creation waits for a permit.
    offer_gate: Option<Arc<Semaphore>>,
    counter: AtomicU64,
    peers: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockEngine {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true, None))
    }

    pub fn manual(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false, None))
    }

    pub fn gated(name: &str, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self::build(name, true, Some(gate)))
    }

    fn build(name: &str, auto_connect: bool, offer_gate: Option<Arc<Semaphore>>) -> Self {
        MockEngine {
            name: name.to_owned(),
            auto_connect,
            fail_answer: AtomicBool::new(false),
            fail_connection: AtomicBool::new(false),
            offer_gate,
            counter: AtomicU64::new(0),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_answers(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_connection(&self) {
        self.fail_connection.store(true, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn peer(&self, i: usize) -> Arc<MockPeer> {
        self.peers.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn new_connection(
        &self,
        adapter: TransportEventAdapter,
    ) -> Result<Arc<dyn PeerTransport>, Error> {
        if self.fail_connection.swap(false, Ordering::SeqCst) {
            return Err(Error::NegotiationFailed(format!(
                "{} refused connection {}",
                self.name,
                adapter.incarnation()
            )));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(MockPeer {
            name: format!("{}-{}", self.name, n),
            adapter,
            auto_connect: self.auto_connect,
            fail_answer: self.fail_answer.load(Ordering::SeqCst),
            offer_gate: self.offer_gate.clone(),
            state: Mutex::new(MockPeerState::default()),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockPeerState {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub candidates: Vec<IceCandidateRecord>,
    pub channels: Vec<(DataChannelHandle, Arc<RecordingLink>)>,
    pub connected: bool,
    pub closed: bool,
}

#[derive(Debug)]
pub(crate) struct MockPeer {
    name: String,
    adapter: TransportEventAdapter,
    auto_connect: bool,
    fail_answer: bool,
    offer_gate: Option<Arc<Semaphore>>,
    state: Mutex<MockPeerState>,
}

impl MockPeer {
    pub fn adapter(&self) -> &TransportEventAdapter {
        &self.adapter
    }

    pub fn candidates(&self) -> Vec<IceCandidateRecord> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn channel_link(&self) -> Option<Arc<RecordingLink>> {
        let state = self.state.lock().unwrap();
        state.channels.first().map(|(_, link)| link.clone())
    }

    pub fn channel_handle(&self) -> Option<DataChannelHandle> {
        let state = self.state.lock().unwrap();
        state.channels.first().map(|(handle, _)| handle.clone())
    }

    /// Reports the connection as established, opening its data channels.
    pub fn connect(&self) {
        let channels = {
            let mut state = self.state.lock().unwrap();
            if state.connected || state.closed {
                return;
            }
            state.connected = true;
            // channels announced in the remote offer are opened by the remote side
            let announced: Vec<String> = match &state.remote {
                Some(desc) if desc.kind == SdpKind::Offer => desc
                    .sdp
                    .split(';')
                    .filter_map(|part| part.strip_prefix("dc="))
                    .map(str::to_owned)
                    .collect(),
                _ => Vec::new(),
            };
            for label in announced {
                let link = Arc::new(RecordingLink::default());
                let id = state.channels.len() as u16;
                let handle =
                    DataChannelHandle::new(self.adapter.incarnation(), id, &label, link.clone());
                state.channels.push((handle, link));
            }
            state.channels.clone()
        };
        self.adapter.connection_state(PeerConnectionState::Connecting);
        self.adapter.connection_state(PeerConnectionState::Connected);
        for (handle, _) in channels {
            self.adapter.data_channel_opened(handle);
        }
    }

    /// Simulates the remote side opening a data channel.
    pub fn open_remote_channel(&self, label: &str) -> (DataChannelHandle, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        let handle = DataChannelHandle::new(self.adapter.incarnation(), 9, label, link.clone());
        self.adapter.data_channel_opened(handle.clone());
        (handle, link)
    }

    fn maybe_connect(&self) {
        let ready = {
            let state = self.state.lock().unwrap();
            state.local.is_some() && state.remote.is_some()
        };
        if ready && self.auto_connect {
            self.connect();
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        if let Some(gate) = &self.offer_gate {
            let permit = gate.acquire().await.map_err(|_| Error::SessionClosed)?;
            permit.forget();
        }
        let state = self.state.lock().unwrap();
        let mut sdp = format!("offer:{}", self.name);
        for (handle, _) in state.channels.iter() {
            sdp.push_str(";dc=");
            sdp.push_str(handle.label());
        }
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        if self.fail_answer {
            return Err(Error::NegotiationFailed("answer rejected".into()));
        }
        let remote = self.state.lock().unwrap().remote.clone();
        match remote {
            Some(desc) if desc.kind == SdpKind::Offer => Ok(SessionDescription::answer(
                format!("answer:{}", self.name),
            )),
            _ => Err(Error::NegotiationFailed("no remote offer".into())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.state.lock().unwrap().local = Some(desc);
        self.adapter.local_candidate(Some(IceCandidateRecord {
            candidate: format!("candidate:{}", self.name),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        if desc.sdp.is_empty() {
            return Err(Error::NegotiationFailed("empty remote description".into()));
        }
        self.state.lock().unwrap().remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(Error::NegotiationFailed(
                "candidate applied before remote description".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), Error> {
        let link = Arc::new(RecordingLink::default());
        let mut state = self.state.lock().unwrap();
        let id = state.channels.len() as u16;
        let handle = DataChannelHandle::new(self.adapter.incarnation(), id, label, link.clone());
        state.channels.push((handle, link));
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Signaling connector handing out links created by the paired [RemoteEnd].
pub(crate) struct TestConnector {
    links: tokio::sync::Mutex<UnboundedReceiver<SignalingLink>>,
}

#[async_trait]
impl SignalingConnector for TestConnector {
    async fn open(&self) -> Result<SignalingLink, Error> {
        let mut links = self.links.lock().await;
        links.recv().await.ok_or(Error::ChannelUnavailable)
    }
}

/// Test-side control of the signaling service.
pub(crate) struct RemoteEnd {
    links: UnboundedSender<SignalingLink>,
}

impl RemoteEnd {
    /// Prepares the link which will be handed over to the next `open` call of the connector.
    pub fn accept(&self) -> FarEnd {
        let (to_session, inbound) = unbounded_channel();
        let (outbound, from_session) = unbounded_channel();
        let _ = self.links.send(SignalingLink { outbound, inbound });
        FarEnd {
            to_session: Some(to_session),
            from_session,
        }
    }
}

pub(crate) fn signaling_pair() -> (TestConnector, RemoteEnd) {
    let (tx, rx) = unbounded_channel();
    (
        TestConnector {
            links: tokio::sync::Mutex::new(rx),
        },
        RemoteEnd { links: tx },
    )
}

/// Remote side of a single signaling link.
pub(crate) struct FarEnd {
    to_session: Option<UnboundedSender<String>>,
    from_session: UnboundedReceiver<String>,
}

impl FarEnd {
    pub fn push(&self, msg: &SignalingMessage) {
        self.push_raw(&msg.encode().unwrap());
    }

    pub fn push_raw(&self, frame: &str) {
        if let Some(tx) = &self.to_session {
            let _ = tx.send(frame.to_owned());
        }
    }

    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        let frame = tokio::time::timeout(TIMEOUT, self.from_session.recv())
            .await
            .ok()??;
        Some(SignalingMessage::decode(&frame).unwrap())
    }

    /// Receives messages until one matches the predicate.
    pub async fn recv_until<F>(&mut self, f: F) -> SignalingMessage
    where
        F: Fn(&SignalingMessage) -> bool,
    {
        loop {
            let msg = self.recv().await.expect("signaling link closed");
            if f(&msg) {
                return msg;
            }
        }
    }

    /// Closes the link from the service side.
    pub fn hang_up(&mut self) {
        self.to_session = None;
    }
}

/// Relays frames between two far ends, as a policy-free signaling service would.
pub(crate) fn relay(a: FarEnd, b: FarEnd) {
    fn pump(mut from: UnboundedReceiver<String>, to: UnboundedSender<String>) {
        tokio::spawn(async move {
            while let Some(frame) = from.recv().await {
                if to.send(frame).is_err() {
                    break;
                }
            }
        });
    }
    let (a_tx, a_rx) = (a.to_session, a.from_session);
    let (b_tx, b_rx) = (b.to_session, b.from_session);
    if let (Some(a_tx), Some(b_tx)) = (a_tx, b_tx) {
        pump(a_rx, b_tx);
        pump(b_rx, a_tx);
    }
}
