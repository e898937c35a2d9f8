//! `wrtc-session` drives a single peer-to-peer [webrtc](https://webrtc.rs) connection through its
//! whole lifecycle, using an external signaling service to find and negotiate with the remote
//! peer:
//! - Session state (`Offline`, `Impossible`, `Ready`, `Creating`, `Active`) is observable as an
//!   ordered stream of transitions.
//! - Offer/answer exchange, ICE candidate trickling and simultaneous offers (glare) are handled
//!   automatically.
//! - All transitions are serialized through one event queue: signaling messages, engine
//!   callbacks and results of asynchronous engine calls never race with each other.
//! - Application data is exchanged over a data channel bridge, which also implements `Sink`.
//!
//! Signaling messages are JSON text frames:
//! `{"type": "offer"|"answer"|"ice_candidate"|"state", "payload": ...}`.
//!
//! # Examples
//!
//! ```no_run
//! use wrtc_session::{
//!     EngineOptions, Error, RtcEngine, Session, SessionConfig, SessionState, SignalingChannel,
//!     WebSocketConnector,
//! };
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let engine = Arc::new(RtcEngine::new(EngineOptions::default())?);
//!     let signaling = SignalingChannel::new(WebSocketConnector::new("ws://localhost:8080/room"));
//!     let session = Session::new(SessionConfig::default(), engine, signaling);
//!
//!     // wait for the remote peer to show up
//!     let mut state = session.watch_state();
//!     state.wait_for(SessionState::Ready).await;
//!
//!     session.start_session().await?;
//!     state.wait_for(SessionState::Active).await;
//!
//!     let dc = session.data_channel();
//!     dc.ready().await;
//!     dc.send(Bytes::from_static(b"hello")).await?;
//!     if let Some(reply) = dc.messages().next().await {
//!         println!("received {} bytes", reply.len());
//!     }
//!
//!     session.close().await
//! }
//! ```

pub mod config;
pub mod data_channel;
pub mod error;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use data_channel::{DataChannelBridge, DataChannelEvent};
pub use error::Error;
pub use rtc::{EngineOptions, RtcEngine};
pub use session::Session;
pub use signaling::{
    IceCandidateRecord, SignalingChannel, SignalingConnector, SignalingMessage,
    WebSocketConnector,
};
pub use state::{SessionState, StateWatcher};
pub use transport::{PeerTransport, TransportEngine, TransportEvent, TransportEventAdapter};
