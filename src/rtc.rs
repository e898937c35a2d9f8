//! [TransportEngine] implementation backed by [webrtc](https://webrtc.rs).

use crate::error::Error;
use crate::signaling::IceCandidateRecord;
use crate::transport::{
    DataChannelHandle, DataChannelState, DataLink, PeerConnectionState, PeerTransport,
    RemoteTrack, SdpKind, SessionDescription, TransportEngine, TransportEventAdapter,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Clone)]
pub struct EngineOptions {
    pub rtc_config: RTCConfiguration,
}

impl EngineOptions {
    pub fn with_ice_servers(urls: &[&str]) -> Self {
        let mut ice_servers = Vec::new();
        if !urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: urls.iter().map(|&url| url.to_owned()).collect(),
                ..Default::default()
            });
        }
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        EngineOptions { rtc_config }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions::with_ice_servers(&["stun:stun.l.google.com:19302"])
    }
}

/// Transport engine creating a fresh [RTCPeerConnection] for every session incarnation.
pub struct RtcEngine {
    api: API,
    options: EngineOptions,
}

impl RtcEngine {
    pub fn new(options: EngineOptions) -> Result<Self, Error> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();

        // Register default codecs
        media_engine.register_default_codecs()?;

        // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
        // This provides NACKs, RTCP Reports and other features.
        let mut registry = Registry::new();

        // Use the default set of Interceptors
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(RtcEngine { api, options })
    }
}

#[async_trait]
impl TransportEngine for RtcEngine {
    async fn new_connection(
        &self,
        adapter: TransportEventAdapter,
    ) -> Result<Arc<dyn PeerTransport>, Error> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.options.rtc_config.clone())
                .await?,
        );
        {
            let adapter = adapter.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                if let Some(state) = map_connection_state(s) {
                    adapter.connection_state(state);
                }
                Box::pin(async move {})
            }));
        }
        {
            let adapter = adapter.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                match candidate.map(|c| c.to_json()) {
                    None => adapter.local_candidate(None),
                    Some(Ok(init)) => adapter.local_candidate(Some(init.into())),
                    Some(Err(e)) => adapter.malformed(e.into()),
                }
                Box::pin(async move {})
            }));
        }
        {
            let adapter = adapter.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                adapter.remote_track(Some(RemoteTrack {
                    id: track.id(),
                    kind: track.kind().to_string(),
                    stream_id: track.stream_id(),
                }));
                Box::pin(async move {})
            }));
        }
        {
            let adapter = adapter.clone();
            pc.on_data_channel(Box::new(move |dc| {
                watch_data_channel(&adapter, &dc);
                Box::pin(async move {})
            }));
        }
        log::debug!("{} created peer connection", adapter.incarnation());

        Ok(Arc::new(RtcPeer { pc, adapter }))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    adapter: TransportEventAdapter,
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> Result<(), Error> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), Error> {
        let dc = self.pc.create_data_channel(label, None).await?;
        watch_data_channel(&self.adapter, &dc);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, Error> {
    let desc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(desc)
}

fn map_connection_state(s: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match s {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Registers data channel callbacks, which report to the adapter of the owning connection.
fn watch_data_channel(adapter: &TransportEventAdapter, dc: &Arc<RTCDataChannel>) {
    let handle = DataChannelHandle::new(
        adapter.incarnation(),
        dc.id(),
        dc.label(),
        Arc::new(RtcDataLink(Arc::downgrade(dc))),
    );
    {
        let adapter = adapter.clone();
        let handle = handle.clone();
        dc.on_open(Box::new(move || {
            adapter.data_channel_opened(handle);
            Box::pin(async move {})
        }));
    }
    {
        let adapter = adapter.clone();
        let handle = handle.clone();
        dc.on_message(Box::new(move |msg| {
            adapter.data_channel_message(&handle, Some(msg.data));
            Box::pin(async move {})
        }));
    }
    {
        let adapter = adapter.clone();
        let handle = handle.clone();
        dc.on_close(Box::new(move || {
            adapter.data_channel_state(&handle, DataChannelState::Closed);
            Box::pin(async move {})
        }));
    }
    {
        let label = handle.label().to_owned();
        dc.on_error(Box::new(move |e| {
            log::warn!("data channel '{}' error: {}", label, e);
            Box::pin(async move {})
        }));
    }
    if dc.ready_state() == RTCDataChannelState::Open {
        // channel opened before the callback could be registered
        adapter.data_channel_opened(handle);
    }
}

/// Data channel link which doesn't keep the channel alive: the channel is owned by its peer
/// connection.
struct RtcDataLink(Weak<RTCDataChannel>);

#[async_trait]
impl DataLink for RtcDataLink {
    async fn send(&self, data: &Bytes) -> Result<(), Error> {
        let dc = self.0.upgrade().ok_or(Error::ChannelNotOpen)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(Error::ChannelNotOpen);
        }
        dc.send(data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if let Some(dc) = self.0.upgrade() {
            dc.close().await?;
        }
        Ok(())
    }
}

impl From<RTCIceCandidateInit> for IceCandidateRecord {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidateRecord {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
        }
    }
}

impl From<IceCandidateRecord> for RTCIceCandidateInit {
    fn from(record: IceCandidateRecord) -> Self {
        RTCIceCandidateInit {
            candidate: record.candidate,
            sdp_mid: record.sdp_mid,
            sdp_mline_index: record.sdp_m_line_index,
            username_fragment: None,
        }
    }
}
