use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Configuration of a single [crate::Session]. Constructed once at startup and handed over to
/// [crate::Session::new].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Local peer identifier. When both peers start a session at the same time, the one with
    /// the lower identifier keeps its offer.
    pub peer_id: String,
    /// Label of the application data channel opened by the offering side. When set, the session
    /// becomes `Active` only after this channel has been opened.
    pub data_channel: Option<String>,
    /// Answer incoming offers right away. When disabled, an incoming offer is held in
    /// `Creating` state until [crate::Session::start_session] is called.
    pub auto_answer: bool,
    /// Announce local readiness to the remote peer over signaling.
    pub announce_state: bool,
    /// Max number of remote ICE candidates buffered before a connection is able to apply them.
    pub max_pending_candidates: usize,
    /// Delay before reconnecting to the signaling service. `None` disables reconnection.
    pub reconnect_interval_ms: Option<u64>,
}

impl SessionConfig {
    pub fn new<S: Into<String>>(peer_id: S) -> Self {
        SessionConfig {
            peer_id: peer_id.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        self.reconnect_interval_ms.map(Duration::from_millis)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            peer_id: generate_peer_id(),
            data_channel: Some("data".to_owned()),
            auto_answer: true,
            announce_state: true,
            max_pending_candidates: 64,
            reconnect_interval_ms: Some(2000),
        }
    }
}

fn generate_peer_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!("peer-{:016x}", nanos ^ ((std::process::id() as u64) << 32))
}
