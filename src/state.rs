use arc_swap::ArcSwap;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Canonical state of the peer-to-peer session. Exactly one value is current at any time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No signaling connectivity.
    Offline,
    /// Signaling is reachable, but the session cannot proceed (ie. capacity rejection).
    Impossible,
    /// Signaling connected and no negotiation in flight: local party may initiate.
    Ready,
    /// Offer/answer exchange is in flight.
    Creating,
    /// Negotiation complete and transport established.
    Active,
}

impl SessionState {
    /// Returns true if a peer connection may exist in this state.
    pub fn is_negotiating_or_active(&self) -> bool {
        matches!(self, SessionState::Creating | SessionState::Active)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Offline
    }
}

#[derive(Debug, Copy, Clone)]
struct Stamped {
    seq: u64,
    state: SessionState,
}

const HISTORY_CAPACITY: usize = 64;

/// Write side of the observable session state. Only the session loop holds it, so all writes
/// happen from a single sequence point.
#[derive(Debug)]
pub(crate) struct StatePublisher {
    current: Arc<ArcSwap<Stamped>>,
    history: broadcast::Sender<Stamped>,
}

impl StatePublisher {
    pub fn new(initial: SessionState) -> Self {
        let (history, _) = broadcast::channel(HISTORY_CAPACITY);
        StatePublisher {
            current: Arc::new(ArcSwap::from_pointee(Stamped {
                seq: 0,
                state: initial,
            })),
            history,
        }
    }

    pub fn get(&self) -> SessionState {
        self.current.load().state
    }

    /// Publishes a new state. Setting the same state twice is a no-op, so observers never see
    /// the same value repeated back to back. Returns the previous state.
    pub fn set(&self, state: SessionState) -> SessionState {
        let prev = **self.current.load();
        if prev.state != state {
            let next = Stamped {
                seq: prev.seq + 1,
                state,
            };
            self.current.store(Arc::new(next));
            let _ = self.history.send(next);
        }
        prev.state
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            current: self.current.clone(),
            history: self.history.clone(),
        }
    }
}

/// Cheap, cloneable read side of the session state.
#[derive(Debug, Clone)]
pub(crate) struct StateReader {
    current: Arc<ArcSwap<Stamped>>,
    history: broadcast::Sender<Stamped>,
}

impl StateReader {
    pub fn get(&self) -> SessionState {
        self.current.load().state
    }

    pub fn watch(&self) -> StateWatcher {
        // subscribe before the current value is read, transitions racing with it are
        // recognized by their sequence number and skipped
        let history = self.history.subscribe();
        let initial = **self.current.load();
        StateWatcher {
            current: self.current.clone(),
            history,
            initial: Some(initial),
            seen: initial.seq,
        }
    }
}

/// Observer of [SessionState] changes.
///
/// The first call to [StateWatcher::next] replays the state which was current when the watcher
/// was created, every following call yields the next transition in the exact order it happened.
/// A watcher which falls too far behind skips directly to the latest state.
#[derive(Debug)]
pub struct StateWatcher {
    current: Arc<ArcSwap<Stamped>>,
    history: broadcast::Receiver<Stamped>,
    initial: Option<Stamped>,
    seen: u64,
}

impl StateWatcher {
    /// Current session state, without consuming anything from the watcher.
    pub fn current(&self) -> SessionState {
        self.current.load().state
    }

    /// Returns the next observed state, or `None` once the session has been dropped.
    pub async fn next(&mut self) -> Option<SessionState> {
        if let Some(initial) = self.initial.take() {
            return Some(initial.state);
        }
        loop {
            match self.history.recv().await {
                Ok(stamped) if stamped.seq > self.seen => {
                    self.seen = stamped.seq;
                    return Some(stamped.state);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("state watcher lagged behind by {} transitions", skipped);
                    let current = **self.current.load();
                    if current.seq > self.seen {
                        self.seen = current.seq;
                        return Some(current.state);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Waits until the session reaches `target`. Returns `false` if the session was dropped
    /// before that happened.
    pub async fn wait_for(&mut self, target: SessionState) -> bool {
        while let Some(state) = self.next().await {
            if state == target {
                return true;
            }
        }
        false
    }

    /// Converts this watcher into a [Stream] of states.
    pub fn into_stream(self) -> impl Stream<Item = SessionState> + Send + Unpin + 'static {
        Box::pin(futures_util::stream::unfold(self, |mut watcher| async move {
            let state = watcher.next().await?;
            Some((state, watcher))
        }))
    }
}
