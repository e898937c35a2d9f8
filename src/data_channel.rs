use crate::error::Error;
use crate::transport::{DataChannelHandle, DataChannelState, Incarnation};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures_util::{ready, Sink, Stream};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::ReusableBoxFuture;

const EVENT_CAPACITY: usize = 256;

/// Discrete data channel lifecycle and delivery events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    Opened { label: String },
    Message(Bytes),
    Closed { label: String },
}

/// Application data channel layered over the session transport.
///
/// The bridge outlives individual connections: a channel is attached when it opens during an
/// active connection, and detached when it closes or its connection is torn down. While no
/// channel is attached, sends fail with [Error::ChannelNotOpen].
pub struct DataChannelBridge {
    label: Option<Arc<str>>,
    channel: ArcSwapOption<DataChannelHandle>,
    opened: Notify,
    events: broadcast::Sender<DataChannelEvent>,
}

impl DataChannelBridge {
    /// Creates a bridge for a channel with a given label. With no label, the first channel opened
    /// by the remote side is accepted.
    pub fn new(label: Option<&str>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        DataChannelBridge {
            label: label.map(Arc::from),
            channel: ArcSwapOption::empty(),
            opened: Notify::new(),
            events,
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.channel.load().is_some()
    }

    /// Sends a binary message over the open channel.
    pub async fn send(&self, data: Bytes) -> Result<(), Error> {
        let handle = self.channel.load_full().ok_or(Error::ChannelNotOpen)?;
        handle.send(&data).await
    }

    /// Waits until the channel becomes open.
    pub async fn ready(&self) {
        loop {
            let notified = self.opened.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }

    /// Subscribes to the channel's open/close transitions and incoming messages. Only events
    /// emitted after this call are observed.
    pub fn events(&self) -> DataChannelEvents {
        DataChannelEvents(self.events.subscribe())
    }

    /// Subscribes to incoming messages of this channel.
    pub fn messages(&self) -> MessageStream {
        MessageStream(self.events())
    }

    /// Returns a [Sink] sending messages through this channel.
    pub fn sink(self: &Arc<Self>) -> DataChannelSink {
        DataChannelSink {
            bridge: self.clone(),
            state: SinkState::Idle,
            pending: ReusableBoxFuture::new(async { Ok(()) }),
        }
    }

    pub(crate) fn attach(&self, handle: DataChannelHandle) -> bool {
        if let Some(label) = &self.label {
            if &**label != handle.label() {
                log::debug!("ignoring data channel '{}'", handle.label());
                return false;
            }
        }
        if let Some(current) = &*self.channel.load() {
            if !current.same_channel(&handle) {
                log::warn!(
                    "data channel '{}' already attached, ignoring {:?}",
                    current.label(),
                    handle
                );
            }
            return false;
        }
        log::info!("data channel '{}' open", handle.label());
        let label = handle.label().to_owned();
        self.channel.store(Some(Arc::new(handle)));
        self.opened.notify_waiters();
        let _ = self.events.send(DataChannelEvent::Opened { label });
        true
    }

    pub(crate) fn deliver(&self, handle: &DataChannelHandle, data: Bytes) {
        match &*self.channel.load() {
            Some(current) if current.same_channel(handle) => {
                let _ = self.events.send(DataChannelEvent::Message(data));
            }
            _ => log::debug!(
                "dropping {} bytes received on detached channel {:?}",
                data.len(),
                handle
            ),
        }
    }

    pub(crate) fn state_changed(&self, handle: &DataChannelHandle, state: DataChannelState) {
        match state {
            DataChannelState::Closing | DataChannelState::Closed => {
                let current = self.channel.load_full();
                if let Some(current) = current {
                    if current.same_channel(handle) {
                        self.detach(&current);
                    }
                }
            }
            DataChannelState::Connecting | DataChannelState::Open => {}
        }
    }

    /// Detaches the channel if it belongs to the given connection incarnation.
    pub(crate) fn detach_incarnation(&self, incarnation: Incarnation) {
        let current = self.channel.load_full();
        if let Some(current) = current {
            if current.incarnation() == incarnation {
                self.detach(&current);
                tokio::spawn(async move {
                    if let Err(e) = current.close().await {
                        log::debug!("failed to close data channel: {}", e);
                    }
                });
            }
        }
    }

    fn detach(&self, handle: &Arc<DataChannelHandle>) {
        let prev = self.channel.compare_and_swap(handle, None);
        if let Some(prev) = &*prev {
            if Arc::ptr_eq(prev, handle) {
                log::info!("data channel '{}' closed", handle.label());
                let _ = self.events.send(DataChannelEvent::Closed {
                    label: handle.label().to_owned(),
                });
            }
        }
    }
}

impl std::fmt::Debug for DataChannelBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelBridge")
            .field("label", &self.label)
            .field("channel", &self.channel.load())
            .finish()
    }
}

/// Subscription to [DataChannelEvent]s.
#[derive(Debug)]
pub struct DataChannelEvents(broadcast::Receiver<DataChannelEvent>);

impl DataChannelEvents {
    /// Returns the next event, or `None` once the bridge has been dropped.
    pub async fn next(&mut self) -> Option<DataChannelEvent> {
        loop {
            match self.0.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("data channel subscriber skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Incoming messages of the bridged data channel.
#[derive(Debug)]
pub struct MessageStream(DataChannelEvents);

impl MessageStream {
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            match self.0.next().await? {
                DataChannelEvent::Message(data) => return Some(data),
                _ => continue,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + Unpin + 'static {
        Box::pin(futures_util::stream::unfold(self, |mut messages| async move {
            let data = messages.next().await?;
            Some((data, messages))
        }))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SinkState {
    Idle,
    Awaiting,
}

/// [Sink] of binary messages sent through a [DataChannelBridge]. Sending fails with
/// [Error::ChannelNotOpen] while no channel is open.
pub struct DataChannelSink {
    bridge: Arc<DataChannelBridge>,
    state: SinkState,
    /// Send operation in flight, polled when the sink state is `Awaiting`.
    pending: ReusableBoxFuture<'static, Result<(), Error>>,
}

impl Sink<Bytes> for DataChannelSink {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.state {
            SinkState::Idle => {
                if self.bridge.is_open() {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(Error::ChannelNotOpen))
                }
            }
            SinkState::Awaiting => {
                let res = ready!(self.pending.poll(cx));
                self.state = SinkState::Idle;
                Poll::Ready(res)
            }
        }
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let handle = self.bridge.channel.load_full().ok_or(Error::ChannelNotOpen)?;
        self.pending.set(async move { handle.send(&item).await });
        self.state = SinkState::Awaiting;
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.state {
            SinkState::Idle => Poll::Ready(Ok(())),
            SinkState::Awaiting => {
                let res = ready!(self.pending.poll(cx));
                self.state = SinkState::Idle;
                Poll::Ready(res)
            }
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.poll_flush(cx)
    }
}

impl std::fmt::Debug for DataChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelSink")
            .field("state", &self.state)
            .finish()
    }
}
