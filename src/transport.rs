//! Transport engine capability surface consumed by the session, and the adapter which turns the
//! engine's callbacks into [TransportEvent]s posted onto the session's serialized event queue.

use crate::error::Error;
use crate::signaling::IceCandidateRecord;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Formatter;
use std::sync::Arc;

/// Identifier of a single attempt at establishing a session. Every new connection handle gets a
/// fresh incarnation, which lets the session recognize events and completions that belong to a
/// connection which has already been torn down.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Incarnation(pub(crate) u64);

impl std::fmt::Display for Incarnation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer<S: Into<String>>(sdp: S) -> Self {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer<S: Into<String>>(sdp: S) -> Self {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Aggregate state of the underlying peer connection as reported by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Remote media track announced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: String,
    pub stream_id: String,
}

/// Engine side of a single data channel.
#[async_trait]
pub trait DataLink: Send + Sync + 'static {
    async fn send(&self, data: &Bytes) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Non-owning view of a data channel which belongs to a given connection incarnation. It stays
/// valid only for as long as its parent connection does.
#[derive(Clone)]
pub struct DataChannelHandle {
    incarnation: Incarnation,
    id: u16,
    label: Arc<str>,
    link: Arc<dyn DataLink>,
}

impl DataChannelHandle {
    pub fn new(incarnation: Incarnation, id: u16, label: &str, link: Arc<dyn DataLink>) -> Self {
        DataChannelHandle {
            incarnation,
            id,
            label: Arc::from(label),
            link,
        }
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Checks if both handles point to the same channel of the same connection incarnation.
    pub fn same_channel(&self, other: &DataChannelHandle) -> bool {
        self.incarnation == other.incarnation && self.id == other.id && self.label == other.label
    }

    pub(crate) async fn send(&self, data: &Bytes) -> Result<(), Error> {
        self.link.send(data).await
    }

    pub(crate) async fn close(&self) -> Result<(), Error> {
        self.link.close().await
    }
}

impl std::fmt::Debug for DataChannelHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelHandle")
            .field("incarnation", &self.incarnation)
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

/// A single connection object of the transport engine.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription, Error>;
    async fn create_answer(&self) -> Result<SessionDescription, Error>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error>;
    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> Result<(), Error>;
    /// Creates a new data channel. Its handle is delivered later on through
    /// [TransportEvent::DataChannelOpened].
    async fn create_data_channel(&self, label: &str) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Factory of engine connections. Every connection reports its callbacks through the adapter
/// it was created with.
#[async_trait]
pub trait TransportEngine: Send + Sync + 'static {
    async fn new_connection(
        &self,
        adapter: TransportEventAdapter,
    ) -> Result<Arc<dyn PeerTransport>, Error>;
}

/// Uniform internal representation of the engine's callbacks.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalIceCandidateDiscovered(IceCandidateRecord),
    RemoteTrackAdded(RemoteTrack),
    DataChannelOpened(DataChannelHandle),
    DataChannelMessage(DataChannelHandle, Bytes),
    DataChannelStateChanged(DataChannelHandle, DataChannelState),
    ConnectionStateChanged(PeerConnectionState),
}

type EventSink = Arc<dyn Fn(Incarnation, TransportEvent) + Send + Sync>;

/// Bridges engine callbacks, which may be called from any thread or engine-internal task, into
/// the session's event queue. It performs no business logic: payloads are translated, tagged
/// with the connection's incarnation and re-emitted. Malformed payloads are dropped and logged.
#[derive(Clone)]
pub struct TransportEventAdapter {
    incarnation: Incarnation,
    sink: EventSink,
}

impl TransportEventAdapter {
    pub(crate) fn new<F>(incarnation: Incarnation, sink: F) -> Self
    where
        F: Fn(Incarnation, TransportEvent) + Send + Sync + 'static,
    {
        TransportEventAdapter {
            incarnation,
            sink: Arc::new(sink),
        }
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    /// Locally discovered ICE candidate. `None` marks the end of candidate gathering.
    pub fn local_candidate(&self, candidate: Option<IceCandidateRecord>) {
        match candidate {
            None => log::debug!("{} ICE candidate gathering complete", self.incarnation),
            Some(c) if c.candidate.trim().is_empty() => {
                self.malformed(Error::MalformedEvent("empty ICE candidate".into()))
            }
            Some(c) => self.emit(TransportEvent::LocalIceCandidateDiscovered(c)),
        }
    }

    pub fn remote_track(&self, track: Option<RemoteTrack>) {
        match track {
            Some(track) => self.emit(TransportEvent::RemoteTrackAdded(track)),
            None => self.malformed(Error::MalformedEvent("null remote track".into())),
        }
    }

    pub fn data_channel_opened(&self, channel: DataChannelHandle) {
        if channel.incarnation() != self.incarnation {
            self.malformed(Error::MalformedEvent(format!(
                "data channel '{}' belongs to connection {}",
                channel.label(),
                channel.incarnation()
            )));
        } else {
            self.emit(TransportEvent::DataChannelOpened(channel))
        }
    }

    pub fn data_channel_message(&self, channel: &DataChannelHandle, data: Option<Bytes>) {
        match data {
            Some(data) => self.emit(TransportEvent::DataChannelMessage(channel.clone(), data)),
            None => self.malformed(Error::MalformedEvent(format!(
                "null message on data channel '{}'",
                channel.label()
            ))),
        }
    }

    pub fn data_channel_state(&self, channel: &DataChannelHandle, state: DataChannelState) {
        self.emit(TransportEvent::DataChannelStateChanged(channel.clone(), state))
    }

    pub fn connection_state(&self, state: PeerConnectionState) {
        self.emit(TransportEvent::ConnectionStateChanged(state))
    }

    /// Reports a callback payload which could not be translated. It's never propagated further.
    pub fn malformed(&self, cause: Error) {
        log::warn!("{} dropping transport event: {}", self.incarnation, cause);
    }

    fn emit(&self, event: TransportEvent) {
        log::trace!("{} transport event: {:?}", self.incarnation, event);
        (self.sink)(self.incarnation, event)
    }
}

impl std::fmt::Debug for TransportEventAdapter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEventAdapter")
            .field("incarnation", &self.incarnation)
            .finish()
    }
}
