use crate::config::SessionConfig;
use crate::data_channel::DataChannelBridge;
use crate::error::Error;
use crate::signaling::{IceCandidateRecord, SignalingChannel, SignalingEvent, SignalingMessage};
use crate::state::{SessionState, StatePublisher, StateReader, StateWatcher};
use crate::transport::{
    Incarnation, PeerConnectionState, PeerTransport, RemoteTrack, SessionDescription,
    TransportEngine, TransportEvent, TransportEventAdapter,
};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TRACK_CAPACITY: usize = 16;

/// Handle to a single peer-to-peer session.
///
/// All state transitions are executed by one background task, which consumes signaling events,
/// transport events, engine completions and local requests from a single queue. The handle only
/// posts requests into that queue and observes the results.
pub struct Session {
    config: Arc<SessionConfig>,
    state: StateReader,
    queue: UnboundedSender<Inbound>,
    data_channel: Arc<DataChannelBridge>,
    tracks: broadcast::Sender<RemoteTrack>,
    machine: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl Session {
    /// Starts a new session: connects to the signaling service and begins processing events.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: SessionConfig,
        engine: Arc<dyn TransportEngine>,
        signaling: SignalingChannel,
    ) -> Self {
        let config = Arc::new(config);
        let signaling = Arc::new(signaling);
        let (queue, inbound) = unbounded_channel();
        let publisher = StatePublisher::new(SessionState::Offline);
        let state = publisher.reader();
        let data_channel = Arc::new(DataChannelBridge::new(config.data_channel.as_deref()));
        let (tracks, _) = broadcast::channel(TRACK_CAPACITY);

        let machine = Machine {
            config: config.clone(),
            engine,
            signaling: signaling.clone(),
            state: publisher,
            queue: queue.clone(),
            bridge: data_channel.clone(),
            tracks: tracks.clone(),
            attempt: None,
            pending: VecDeque::new(),
            held_offer: None,
            rejected: HashSet::new(),
            remote_state: SessionState::Offline,
            signaling_up: false,
            impossible: false,
            next_incarnation: 0,
        };
        let machine = tokio::spawn(machine.run(inbound));
        let pump = tokio::spawn(pump_signaling(
            signaling,
            queue.clone(),
            config.reconnect_interval(),
        ));

        Session {
            config,
            state,
            queue,
            data_channel,
            tracks,
            machine,
            pump,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Observes session state: the current state is replayed first, followed by every
    /// transition in order.
    pub fn watch_state(&self) -> StateWatcher {
        self.state.watch()
    }

    /// Starts a session with the remote peer (sends an offer), or joins the remote peer's session
    /// when its offer has been held because `auto_answer` is disabled.
    pub async fn start_session(&self) -> Result<(), Error> {
        self.request(Command::Start).await
    }

    /// Tears down the current session and returns to `Ready`.
    pub async fn end_session(&self) -> Result<(), Error> {
        self.request(Command::End).await
    }

    pub fn data_channel(&self) -> &Arc<DataChannelBridge> {
        &self.data_channel
    }

    /// Subscribes to remote media tracks added to the active connection.
    pub fn remote_tracks(&self) -> broadcast::Receiver<RemoteTrack> {
        self.tracks.subscribe()
    }

    /// Gracefully stops the session, tearing down any connection in progress.
    pub async fn close(self) -> Result<(), Error> {
        self.pump.abort();
        self.request(Command::Shutdown).await
    }

    async fn request<F>(&self, command: F) -> Result<(), Error>
    where
        F: FnOnce(oneshot::Sender<Result<(), Error>>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Inbound::Command(command(tx)))
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
        self.machine.abort();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.config.peer_id)
            .field("state", &self.state.get())
            .finish()
    }
}

type Reply = oneshot::Sender<Result<(), Error>>;

enum Command {
    Start(Reply),
    End(Reply),
    Shutdown(Reply),
}

/// Result of an asynchronous engine operation, posted back into the session queue.
enum Completion {
    ConnectionCreated(Arc<dyn PeerTransport>),
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    RemoteAnswerApplied,
    Failed(Error),
}

enum Inbound {
    Signaling(SignalingEvent),
    Transport(Incarnation, TransportEvent),
    Completed(Incarnation, Completion),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer { offer: String },
}

/// Remote ICE candidate, tagged with the remote connection attempt it was gathered for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteCandidate {
    attempt: Option<u64>,
    record: IceCandidateRecord,
}

/// Remote offer waiting for the local user to join.
#[derive(Debug, Clone)]
struct HeldOffer {
    sdp: String,
    attempt: Option<u64>,
}

/// A single attempt at establishing a connection, owning its connection handle.
struct Attempt {
    incarnation: Incarnation,
    role: Role,
    transport: Option<Arc<dyn PeerTransport>>,
    cancel: CancellationToken,
    offer_sent: bool,
    answer_received: bool,
    /// Remote attempt this connection negotiates with, once known from its offer or answer.
    remote_attempt: Option<u64>,
    /// Remote side has taken part in this attempt: it offered, answered or reported
    /// `Creating`/`Active`. Only then a remote `Ready` means the remote has left.
    remote_engaged: bool,
    /// Candidate applier, present once the remote description has been set.
    candidates: Option<UnboundedSender<IceCandidateRecord>>,
    applied: HashSet<IceCandidateRecord>,
    /// Remote candidates handed to this attempt, in receipt order.
    received: Vec<RemoteCandidate>,
    connected: bool,
    channel_open: bool,
}

impl Attempt {
    fn new(incarnation: Incarnation, role: Role, remote_attempt: Option<u64>) -> Self {
        let remote_engaged = matches!(role, Role::Answerer { .. });
        Attempt {
            incarnation,
            role,
            transport: None,
            cancel: CancellationToken::new(),
            offer_sent: false,
            answer_received: false,
            remote_attempt,
            remote_engaged,
            candidates: None,
            applied: HashSet::new(),
            received: Vec::new(),
            connected: false,
            channel_open: false,
        }
    }

    fn is_offerer(&self) -> bool {
        self.role == Role::Offerer
    }

    /// Candidates of other remote attempts belong to connections the remote has discarded.
    fn accepts(&self, candidate: &RemoteCandidate) -> bool {
        match (self.remote_attempt, candidate.attempt) {
            (Some(expected), Some(tag)) => expected == tag,
            _ => true,
        }
    }
}

struct Machine {
    config: Arc<SessionConfig>,
    engine: Arc<dyn TransportEngine>,
    signaling: Arc<SignalingChannel>,
    state: StatePublisher,
    queue: UnboundedSender<Inbound>,
    bridge: Arc<DataChannelBridge>,
    tracks: broadcast::Sender<RemoteTrack>,
    attempt: Option<Attempt>,
    /// Remote candidates waiting for a connection able to apply them.
    pending: VecDeque<RemoteCandidate>,
    held_offer: Option<HeldOffer>,
    /// Remote attempts whose offers lost the glare tie-break.
    rejected: HashSet<u64>,
    /// Last state the remote side is known to be in.
    remote_state: SessionState,
    signaling_up: bool,
    /// Remote side reported `Impossible`: ignore state updates until signaling reconnects.
    impossible: bool,
    next_incarnation: u64,
}

impl Machine {
    async fn run(mut self, mut inbound: UnboundedReceiver<Inbound>) {
        while let Some(event) = inbound.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        log::debug!("session loop of '{}' stopped", self.config.peer_id);
    }

    /// Executes a single transition. Returns false when the loop should stop.
    fn handle(&mut self, event: Inbound) -> bool {
        match event {
            Inbound::Signaling(e) => self.on_signaling(e),
            Inbound::Transport(incarnation, e) => {
                if self.is_current(incarnation) {
                    self.on_transport(incarnation, e)
                } else {
                    log::debug!("dropping event of stale connection {}: {:?}", incarnation, e);
                }
            }
            Inbound::Completed(incarnation, completion) => {
                if self.is_current(incarnation) {
                    self.on_completion(incarnation, completion)
                } else {
                    self.on_stale_completion(incarnation, completion)
                }
            }
            Inbound::Command(Command::Start(reply)) => {
                let _ = reply.send(self.start());
            }
            Inbound::Command(Command::End(reply)) => {
                let _ = reply.send(self.end());
            }
            Inbound::Command(Command::Shutdown(reply)) => {
                self.teardown();
                self.transition(SessionState::Offline);
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    fn is_current(&self, incarnation: Incarnation) -> bool {
        matches!(&self.attempt, Some(a) if a.incarnation == incarnation)
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state.set(to);
        if from != to {
            log::info!("'{}' session: {:?} -> {:?}", self.config.peer_id, from, to);
        }
    }

    fn send(&self, msg: SignalingMessage) {
        if let Err(e) = self.signaling.send(&msg) {
            log::warn!("failed to send {:?}: {}", msg, e);
        }
    }

    fn announce(&self, state: SessionState) {
        if self.config.announce_state && self.signaling_up {
            self.send(SignalingMessage::SessionStateUpdate(state));
        }
    }

    fn start(&mut self) -> Result<(), Error> {
        match self.state.get() {
            SessionState::Ready => {
                self.begin(Role::Offerer, None);
                self.transition(SessionState::Creating);
                Ok(())
            }
            SessionState::Creating if self.attempt.is_none() => match self.held_offer.take() {
                Some(held) => {
                    self.begin(Role::Answerer { offer: held.sdp }, held.attempt);
                    Ok(())
                }
                None => Err(Error::InvalidState(SessionState::Creating)),
            },
            other => Err(Error::InvalidState(other)),
        }
    }

    fn end(&mut self) -> Result<(), Error> {
        let state = self.state.get();
        if !state.is_negotiating_or_active() {
            return Err(Error::InvalidState(state));
        }
        self.teardown();
        self.transition(SessionState::Ready);
        // lets the remote side know that the session is over
        self.announce(SessionState::Ready);
        Ok(())
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                log::info!("'{}' signaling connected", self.config.peer_id);
                self.reset_remote();
                self.signaling_up = true;
                self.announce(SessionState::Ready);
            }
            SignalingEvent::Disconnected => {
                log::info!("'{}' signaling disconnected", self.config.peer_id);
                self.reset_remote();
                self.signaling_up = false;
                self.teardown();
                self.transition(SessionState::Offline);
            }
            SignalingEvent::Message(msg) => self.on_message(msg),
        }
    }

    /// Forgets everything known about the remote side.
    fn reset_remote(&mut self) {
        self.impossible = false;
        self.rejected.clear();
        self.remote_state = SessionState::Offline;
    }

    fn on_message(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Offer { sdp, from, attempt } => {
                self.remote_state = SessionState::Creating;
                self.on_remote_offer(sdp, from, attempt)
            }
            SignalingMessage::Answer { sdp, attempt } => {
                self.remote_state = SessionState::Creating;
                self.on_remote_answer(sdp, attempt)
            }
            SignalingMessage::IceCandidate { candidate, attempt } => match self.state.get() {
                SessionState::Offline | SessionState::Impossible => {
                    log::debug!("discarding remote ICE candidate: no session")
                }
                _ => self.add_remote_candidate(RemoteCandidate {
                    attempt,
                    record: candidate,
                }),
            },
            SignalingMessage::SessionStateUpdate(state) => self.on_remote_state(state),
        }
    }

    fn on_remote_state(&mut self, remote: SessionState) {
        if self.impossible {
            log::debug!("ignoring remote {:?}: session impossible", remote);
            return;
        }
        self.remote_state = remote;
        match remote {
            SessionState::Ready => match self.state.get() {
                SessionState::Ready => {}
                SessionState::Creating | SessionState::Active => {
                    // without a held offer or engaged remote, this is the remote's reply to our
                    // own announcement, sent before it saw our offer
                    let engaged = self.attempt.as_ref().map_or(true, |a| a.remote_engaged);
                    if engaged {
                        log::info!("remote peer reset the session");
                        self.teardown();
                        self.transition(SessionState::Ready);
                        self.announce(SessionState::Ready);
                    } else {
                        log::debug!("remote is ready, waiting for it to join");
                    }
                }
                SessionState::Offline | SessionState::Impossible => {
                    self.transition(SessionState::Ready);
                    self.announce(SessionState::Ready);
                }
            },
            SessionState::Impossible => {
                self.teardown();
                self.impossible = true;
                self.transition(SessionState::Impossible);
            }
            SessionState::Offline => {
                self.teardown();
                self.transition(SessionState::Offline);
            }
            SessionState::Creating | SessionState::Active => {
                log::debug!("remote session is {:?}", remote);
                if let Some(attempt) = &mut self.attempt {
                    attempt.remote_engaged = true;
                }
            }
        }
    }

    fn on_remote_offer(&mut self, sdp: String, from: Option<String>, attempt: Option<u64>) {
        match self.state.get() {
            SessionState::Ready => {
                self.transition(SessionState::Creating);
                if self.config.auto_answer {
                    self.begin(Role::Answerer { offer: sdp }, attempt);
                } else {
                    log::info!("holding remote offer until the session is joined");
                    self.held_offer = Some(HeldOffer { sdp, attempt });
                }
            }
            SessionState::Creating => {
                let offering = self.attempt.as_ref().map(Attempt::is_offerer);
                match offering {
                    Some(true) => {
                        if self.remote_wins(from.as_deref()) {
                            log::info!("offer glare: yielding to remote offer from {:?}", from);
                            self.yield_to_remote(sdp, attempt);
                        } else {
                            log::info!("offer glare: keeping local offer, ignoring {:?}", from);
                            self.reject_remote_attempt(attempt);
                        }
                    }
                    Some(false) => log::warn!("ignoring duplicate remote offer"),
                    None => {
                        let held = HeldOffer { sdp, attempt };
                        if self.held_offer.replace(held).is_some() {
                            log::warn!("replaced held remote offer with a newer one");
                        }
                    }
                }
            }
            SessionState::Active => log::warn!("ignoring remote offer: renegotiation unsupported"),
            state => log::warn!("ignoring remote offer in {:?} state", state),
        }
    }

    /// Glare tie-break: lower peer identifier keeps its offer. An offer without identifier wins.
    fn remote_wins(&self, remote_id: Option<&str>) -> bool {
        match remote_id {
            None => true,
            Some(id) => {
                if id == self.config.peer_id {
                    log::warn!("remote peer uses the same identifier '{}'", id);
                }
                id < self.config.peer_id.as_str()
            }
        }
    }

    /// The remote discards the connection of an offer that lost the tie-break, so do its
    /// candidates, buffered or still in flight.
    fn reject_remote_attempt(&mut self, attempt: Option<u64>) {
        if let Some(tag) = attempt {
            self.rejected.insert(tag);
            let before = self.pending.len();
            self.pending.retain(|c| c.attempt != Some(tag));
            let dropped = before - self.pending.len();
            if dropped > 0 {
                log::debug!("dropped {} candidates of rejected remote attempt {}", dropped, tag);
            }
        }
    }

    /// Discards the local offering attempt and answers the remote offer on a fresh connection.
    fn yield_to_remote(&mut self, offer: String, remote_attempt: Option<u64>) {
        if let Some(attempt) = self.discard_attempt() {
            // remote candidates already received are still valid for the remote's connection
            for candidate in attempt.received.into_iter().rev() {
                self.pending.push_front(candidate);
            }
            self.trim_pending();
        }
        self.begin(Role::Answerer { offer }, remote_attempt);
    }

    fn on_remote_answer(&mut self, sdp: String, remote_attempt: Option<u64>) {
        let attempt = match &mut self.attempt {
            Some(a) if a.is_offerer() && a.offer_sent && !a.answer_received => a,
            _ => {
                log::warn!("ignoring unexpected remote answer");
                return;
            }
        };
        attempt.answer_received = true;
        attempt.remote_engaged = true;
        attempt.remote_attempt = remote_attempt;
        let transport = match &attempt.transport {
            Some(t) => t.clone(),
            None => return,
        };
        self.spawn_step(async move {
            match transport
                .set_remote_description(SessionDescription::answer(sdp))
                .await
            {
                Ok(()) => Completion::RemoteAnswerApplied,
                Err(e) => Completion::Failed(e),
            }
        });
    }

    fn add_remote_candidate(&mut self, candidate: RemoteCandidate) {
        if let Some(tag) = candidate.attempt {
            if self.rejected.contains(&tag) {
                log::debug!("discarding ICE candidate of rejected remote attempt {}", tag);
                return;
            }
        }
        if let Some(attempt) = &mut self.attempt {
            if let Some(applier) = &attempt.candidates {
                if !attempt.accepts(&candidate) {
                    log::debug!(
                        "{} discarding ICE candidate of remote attempt {:?}",
                        attempt.incarnation,
                        candidate.attempt
                    );
                } else if attempt.applied.insert(candidate.record.clone()) {
                    let _ = applier.send(candidate.record.clone());
                    attempt.received.push(candidate);
                } else {
                    log::trace!("{} duplicate ICE candidate", attempt.incarnation);
                }
                return;
            }
        }
        if self.pending.iter().any(|c| c.record == candidate.record) {
            return;
        }
        self.pending.push_back(candidate);
        self.trim_pending();
    }

    /// Drops the oldest buffered candidates above the configured bound.
    fn trim_pending(&mut self) {
        while self.pending.len() > self.config.max_pending_candidates {
            if let Some(dropped) = self.pending.pop_front() {
                log::warn!("candidate buffer full, dropping {}", dropped.record.candidate);
            }
        }
    }

    /// Called once the current attempt has both descriptions set: starts applying candidates.
    fn open_candidate_applier(&mut self) {
        let attempt = match &mut self.attempt {
            Some(a) => a,
            None => return,
        };
        let transport = match &attempt.transport {
            Some(t) => t.clone(),
            None => return,
        };
        let (tx, mut rx) = unbounded_channel::<IceCandidateRecord>();
        let cancel = attempt.cancel.clone();
        let incarnation = attempt.incarnation;
        tokio::spawn(async move {
            loop {
                let candidate = tokio::select! {
                    _ = cancel.cancelled() => break,
                    c = rx.recv() => match c {
                        Some(c) => c,
                        None => break,
                    },
                };
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    log::warn!("{} failed to apply ICE candidate: {}", incarnation, e);
                }
            }
        });
        attempt.candidates = Some(tx);
        let pending: Vec<_> = self.pending.drain(..).collect();
        for candidate in pending {
            self.add_remote_candidate(candidate);
        }
    }

    /// Starts a new connection attempt. `remote_attempt` is the remote's attempt being
    /// answered, if any.
    fn begin(&mut self, role: Role, remote_attempt: Option<u64>) {
        self.next_incarnation += 1;
        let incarnation = Incarnation(self.next_incarnation);
        log::debug!("{} starting connection as {:?}", incarnation, role);
        self.attempt = Some(Attempt::new(incarnation, role, remote_attempt));
        self.announce(SessionState::Creating);

        let queue = self.queue.clone();
        let adapter = TransportEventAdapter::new(incarnation, move |inc, event| {
            let _ = queue.send(Inbound::Transport(inc, event));
        });
        let engine = self.engine.clone();
        let queue = self.queue.clone();
        // not cancellable: a connection created for a stale attempt must still be closed
        tokio::spawn(async move {
            let completion = match engine.new_connection(adapter).await {
                Ok(transport) => Completion::ConnectionCreated(transport),
                Err(e) => Completion::Failed(e),
            };
            let _ = queue.send(Inbound::Completed(incarnation, completion));
        });
    }

    /// Runs an engine operation on behalf of the current attempt. The operation is cancelled
    /// when the attempt is torn down.
    fn spawn_step<F>(&self, step: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let attempt = match &self.attempt {
            Some(a) => a,
            None => return,
        };
        let incarnation = attempt.incarnation;
        let cancel = attempt.cancel.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => log::debug!("{} operation cancelled", incarnation),
                completion = step => {
                    let _ = queue.send(Inbound::Completed(incarnation, completion));
                }
            }
        });
    }

    fn on_completion(&mut self, incarnation: Incarnation, completion: Completion) {
        let tag = Some(incarnation.0);
        match completion {
            Completion::ConnectionCreated(transport) => self.on_connection_created(transport),
            Completion::OfferCreated(offer) => {
                if let Some(attempt) = &mut self.attempt {
                    attempt.offer_sent = true;
                }
                self.send(SignalingMessage::Offer {
                    sdp: offer.sdp,
                    from: Some(self.config.peer_id.clone()),
                    attempt: tag,
                });
            }
            Completion::AnswerCreated(answer) => {
                self.open_candidate_applier();
                self.send(SignalingMessage::Answer {
                    sdp: answer.sdp,
                    attempt: tag,
                });
            }
            Completion::RemoteAnswerApplied => self.open_candidate_applier(),
            Completion::Failed(e) => self.fail(e.into_negotiation_failure()),
        }
    }

    fn on_stale_completion(&self, incarnation: Incarnation, completion: Completion) {
        log::debug!("dropping stale completion of {}", incarnation);
        if let Completion::ConnectionCreated(transport) = completion {
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
        }
    }

    fn on_connection_created(&mut self, transport: Arc<dyn PeerTransport>) {
        let attempt = match &mut self.attempt {
            Some(a) => a,
            None => return,
        };
        attempt.transport = Some(transport.clone());
        match attempt.role.clone() {
            Role::Offerer => {
                let label = self.config.data_channel.clone();
                self.spawn_step(async move {
                    let offer = async {
                        if let Some(label) = label {
                            transport.create_data_channel(&label).await?;
                        }
                        let offer = transport.create_offer().await?;
                        transport.set_local_description(offer.clone()).await?;
                        Ok::<_, Error>(offer)
                    };
                    match offer.await {
                        Ok(offer) => Completion::OfferCreated(offer),
                        Err(e) => Completion::Failed(e),
                    }
                });
            }
            Role::Answerer { offer } => {
                self.spawn_step(async move {
                    let answer = async {
                        transport
                            .set_remote_description(SessionDescription::offer(offer))
                            .await?;
                        let answer = transport.create_answer().await?;
                        transport.set_local_description(answer.clone()).await?;
                        Ok::<_, Error>(answer)
                    };
                    match answer.await {
                        Ok(answer) => Completion::AnswerCreated(answer),
                        Err(e) => Completion::Failed(e),
                    }
                });
            }
        }
    }

    fn on_transport(&mut self, incarnation: Incarnation, event: TransportEvent) {
        match event {
            TransportEvent::LocalIceCandidateDiscovered(candidate) => {
                self.send(SignalingMessage::IceCandidate {
                    candidate,
                    attempt: Some(incarnation.0),
                })
            }
            TransportEvent::RemoteTrackAdded(track) => {
                log::info!("remote {} track '{}' added", track.kind, track.id);
                let _ = self.tracks.send(track);
            }
            TransportEvent::DataChannelOpened(channel) => {
                if self.bridge.attach(channel) {
                    if let Some(attempt) = &mut self.attempt {
                        attempt.channel_open = true;
                    }
                    self.check_active();
                }
            }
            TransportEvent::DataChannelMessage(channel, data) => self.bridge.deliver(&channel, data),
            TransportEvent::DataChannelStateChanged(channel, state) => {
                self.bridge.state_changed(&channel, state)
            }
            TransportEvent::ConnectionStateChanged(state) => match state {
                PeerConnectionState::Connected => {
                    if let Some(attempt) = &mut self.attempt {
                        attempt.connected = true;
                    }
                    self.check_active();
                }
                PeerConnectionState::Failed | PeerConnectionState::Closed => {
                    self.fail(Error::NegotiationFailed(format!(
                        "peer connection {:?}",
                        state
                    )));
                }
                other => log::debug!("peer connection {:?}", other),
            },
        }
    }

    /// Moves to `Active` once the transport is connected and required channels are open.
    fn check_active(&mut self) {
        let complete = match &self.attempt {
            Some(a) => a.connected && (self.config.data_channel.is_none() || a.channel_open),
            None => false,
        };
        if complete && self.state.get() == SessionState::Creating {
            self.transition(SessionState::Active);
            self.announce(SessionState::Active);
        }
    }

    /// Tears the attempt down after a failure and tells the remote we can start over. When the
    /// remote is known to be idle already it won't answer that, so the session is ready again
    /// right away.
    fn fail(&mut self, cause: Error) {
        log::warn!("'{}' session failed: {}", self.config.peer_id, cause);
        self.teardown();
        self.transition(SessionState::Offline);
        self.announce(SessionState::Ready);
        if self.signaling_up && self.remote_state == SessionState::Ready {
            self.transition(SessionState::Ready);
        }
    }

    /// Releases the current attempt: cancels its in-flight operations and closes its connection.
    fn discard_attempt(&mut self) -> Option<Attempt> {
        let attempt = self.attempt.take()?;
        attempt.cancel.cancel();
        if let Some(transport) = attempt.transport.clone() {
            let incarnation = attempt.incarnation;
            tokio::spawn(async move {
                if let Err(e) = transport.close().await {
                    log::debug!("{} failed to close connection: {}", incarnation, e);
                }
            });
        }
        self.bridge.detach_incarnation(attempt.incarnation);
        log::debug!("{} torn down", attempt.incarnation);
        Some(attempt)
    }

    fn teardown(&mut self) {
        self.discard_attempt();
        self.pending.clear();
        self.held_offer = None;
    }
}

/// Forwards events of the signaling channel into the session queue, reconnecting after the
/// connection is lost.
async fn pump_signaling(
    signaling: Arc<SignalingChannel>,
    queue: UnboundedSender<Inbound>,
    reconnect: Option<Duration>,
) {
    loop {
        match signaling.connect().await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    if queue.send(Inbound::Signaling(event)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => log::warn!("signaling connection failed: {}", e),
        }
        match reconnect {
            Some(delay) => tokio::time::sleep(delay).await,
            None => return,
        }
    }
}
