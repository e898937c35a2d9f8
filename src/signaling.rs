use crate::error::Error;
use crate::state::SessionState;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;

/// ICE candidate descriptor, either discovered locally or received from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Session-control message exchanged with the remote peer through the signaling service.
///
/// `attempt` identifies the sender's connection attempt the description or candidate belongs
/// to. It lets the receiver drop candidates of connections the sender has already discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer {
        sdp: String,
        /// Identifier of the offering peer, used to break ties when both peers offer at once.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempt: Option<u64>,
    },
    Answer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempt: Option<u64>,
    },
    IceCandidate {
        #[serde(flatten)]
        candidate: IceCandidateRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempt: Option<u64>,
    },
    #[serde(rename = "state")]
    SessionStateUpdate(SessionState),
}

impl SignalingMessage {
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Events produced by a single signaling connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Message(SignalingMessage),
    Disconnected,
}

/// Raw, bidirectional text-frame pipe to the signaling service. The link is considered closed
/// once `inbound` returns `None`.
#[derive(Debug)]
pub struct SignalingLink {
    pub outbound: UnboundedSender<String>,
    pub inbound: UnboundedReceiver<String>,
}

/// Opens links to a signaling service.
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    async fn open(&self) -> Result<SignalingLink, Error>;
}

/// Signaling service transport. It carries messages, but no session policy: what a message
/// means for the session is decided by the session state machine.
pub struct SignalingChannel {
    connector: Arc<dyn SignalingConnector>,
    outbound: Arc<ArcSwapOption<UnboundedSender<String>>>,
}

impl SignalingChannel {
    pub fn new<C: SignalingConnector>(connector: C) -> Self {
        SignalingChannel {
            connector: Arc::new(connector),
            outbound: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Opens a new signaling link and returns the sequence of its events. Can be called again
    /// after the previous sequence ended in order to reconnect.
    pub async fn connect(&self) -> Result<SignalingEvents, Error> {
        let link = self.connector.open().await.map_err(|e| {
            log::warn!("failed to open signaling link: {}", e);
            Error::ChannelUnavailable
        })?;
        let outbound = Arc::new(link.outbound);
        self.outbound.store(Some(outbound.clone()));
        Ok(SignalingEvents {
            inbound: link.inbound,
            outbound,
            slot: self.outbound.clone(),
            phase: Phase::Opening,
        })
    }

    pub fn is_connected(&self) -> bool {
        match &*self.outbound.load() {
            Some(tx) => !tx.is_closed(),
            None => false,
        }
    }

    /// Fire-and-forget send of a message to the remote peer.
    pub fn send(&self, msg: &SignalingMessage) -> Result<(), Error> {
        let guard = self.outbound.load();
        let tx = (*guard).as_ref().ok_or(Error::ChannelUnavailable)?;
        let frame = msg.encode()?;
        tx.send(frame).map_err(|_| Error::ChannelUnavailable)
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Opening,
    Open,
    Done,
}

/// Lazy sequence of events of a single signaling connection: `Connected`, followed by any
/// number of `Message`s, terminated by `Disconnected`.
#[derive(Debug)]
pub struct SignalingEvents {
    inbound: UnboundedReceiver<String>,
    outbound: Arc<UnboundedSender<String>>,
    slot: Arc<ArcSwapOption<UnboundedSender<String>>>,
    phase: Phase,
}

impl SignalingEvents {
    pub async fn next(&mut self) -> Option<SignalingEvent> {
        loop {
            match self.phase {
                Phase::Opening => {
                    self.phase = Phase::Open;
                    return Some(SignalingEvent::Connected);
                }
                Phase::Done => return None,
                Phase::Open => match self.inbound.recv().await {
                    Some(frame) => match SignalingMessage::decode(&frame) {
                        Ok(msg) => return Some(SignalingEvent::Message(msg)),
                        Err(e) => {
                            log::warn!("dropping signaling frame: {}", e);
                        }
                    },
                    None => {
                        self.phase = Phase::Done;
                        self.release();
                        return Some(SignalingEvent::Disconnected);
                    }
                },
            }
        }
    }

    fn release(&self) {
        // a newer connection may already have replaced this one
        let current = self.slot.load();
        if let Some(tx) = &*current {
            if Arc::ptr_eq(tx, &self.outbound) {
                self.slot.store(None);
            }
        }
    }
}

impl Drop for SignalingEvents {
    fn drop(&mut self) {
        if self.phase != Phase::Done {
            self.release();
        }
    }
}

/// [SignalingConnector] talking JSON text frames over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new<S: Into<String>>(url: S) -> Self {
        WebSocketConnector { url: url.into() }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn open(&self) -> Result<SignalingLink, Error> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| {
                log::warn!("websocket connection to {} failed: {}", self.url, e);
                Error::ChannelUnavailable
            })?;
        log::info!("connected to signaling service at {}", self.url);
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = unbounded_channel::<String>();
        let (inbound_tx, inbound) = unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    log::warn!("failed to write signaling frame: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("signaling websocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(SignalingLink { outbound, inbound })
    }
}

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::signaling::{
        IceCandidateRecord, SignalingChannel, SignalingEvent, SignalingMessage,
    };
    use crate::state::SessionState;
    use crate::testing::signaling_pair;
    use serde_json::json;

    #[test]
    fn wire_format() {
        let offer = SignalingMessage::Offer {
            sdp: "v=0".into(),
            from: Some("alice".into()),
            attempt: Some(3),
        };
        assert_eq!(
            serde_json::to_value(&offer).unwrap(),
            json!({"type": "offer", "payload": {"sdp": "v=0", "from": "alice", "attempt": 3}})
        );

        let candidate = SignalingMessage::IceCandidate {
            candidate: IceCandidateRecord {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
            attempt: Some(3),
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(
            value,
            json!({"type": "ice_candidate", "payload": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "attempt": 3
            }})
        );
        let decoded: SignalingMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, candidate);

        let state = SignalingMessage::SessionStateUpdate(SessionState::Ready);
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"type": "state", "payload": "Ready"})
        );
    }

    #[test]
    fn untagged_payloads_are_accepted() {
        let msg = SignalingMessage::decode(r#"{"type":"offer","payload":{"sdp":"v=0"}}"#).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Offer {
                sdp: "v=0".into(),
                from: None,
                attempt: None,
            }
        );
        let msg = SignalingMessage::decode(r#"{"type":"answer","payload":{"sdp":"v=1"}}"#).unwrap();
        assert_eq!(msg, answer("v=1"));
        let msg = SignalingMessage::decode(
            r#"{"type":"ice_candidate","payload":{"candidate":"candidate:1","sdpMid":null}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalingMessage::IceCandidate {
                candidate: IceCandidateRecord {
                    candidate: "candidate:1".into(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
                attempt: None,
            }
        );
    }

    fn answer(sdp: &str) -> SignalingMessage {
        SignalingMessage::Answer {
            sdp: sdp.into(),
            attempt: None,
        }
    }

    #[test]
    fn unknown_discriminant_is_malformed() {
        let err = SignalingMessage::decode(r#"{"type":"bye","payload":null}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn send_fails_when_not_connected() {
        let (connector, _remote) = signaling_pair();
        let channel = SignalingChannel::new(connector);
        let err = channel
            .send(&SignalingMessage::SessionStateUpdate(SessionState::Ready))
            .unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn events_sequence() {
        let (connector, remote) = signaling_pair();
        let channel = SignalingChannel::new(connector);
        let mut far = remote.accept();
        let mut events = channel.connect().await.unwrap();

        assert_eq!(events.next().await, Some(SignalingEvent::Connected));
        assert!(channel.is_connected());

        far.push_raw("not json");
        far.push(&SignalingMessage::SessionStateUpdate(SessionState::Ready));
        assert_eq!(
            events.next().await,
            Some(SignalingEvent::Message(SignalingMessage::SessionStateUpdate(
                SessionState::Ready
            )))
        );

        channel.send(&answer("v=0")).unwrap();
        assert_eq!(far.recv().await, Some(answer("v=0")));

        far.hang_up();
        assert_eq!(events.next().await, Some(SignalingEvent::Disconnected));
        assert_eq!(events.next().await, None);
        assert!(channel.send(&answer("v=0")).is_err());
    }

    #[tokio::test]
    async fn reconnect_opens_a_fresh_link() {
        let (connector, remote) = signaling_pair();
        let channel = SignalingChannel::new(connector);

        let far = remote.accept();
        let mut events = channel.connect().await.unwrap();
        assert_eq!(events.next().await, Some(SignalingEvent::Connected));
        drop(far);
        assert_eq!(events.next().await, Some(SignalingEvent::Disconnected));

        let mut far = remote.accept();
        let mut events = channel.connect().await.unwrap();
        assert_eq!(events.next().await, Some(SignalingEvent::Connected));
        channel
            .send(&SignalingMessage::SessionStateUpdate(SessionState::Offline))
            .unwrap();
        assert_eq!(
            far.recv().await,
            Some(SignalingMessage::SessionStateUpdate(SessionState::Offline))
        );
    }
}
