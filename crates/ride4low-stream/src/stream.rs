use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ride4low_types::ride::{Coordinate, PaymentMethod, TripId, UserId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::error::StreamError;
use crate::frames::{ClientFrame, FrameError, ServerEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where the coordination backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// WebSocket base, e.g. `ws://localhost:8082/ws`.
    pub base_url: Url,
}

impl StreamConfig {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    /// `<base>/riders?userID=<id>`
    pub fn riders_url(&self, user_id: &UserId) -> Result<Url, StreamError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push("riders");
        url.query_pairs_mut()
            .clear()
            .append_pair("userID", user_id.as_str());
        Ok(url)
    }
}

/// One item delivered by [`TripEventStream::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Server(ServerEvent),
    /// A well-formed frame that is not a known `{type, data}` event.
    UnknownMessage { raw: String, reason: String },
    /// The channel or a frame failed below the message level.
    TransportError { reason: String },
    /// The backend closed the channel.
    Closed { reason: Option<String> },
}

impl StreamEvent {
    fn from_frame(text: &str) -> Self {
        match ServerEvent::decode(text) {
            Ok(event) => StreamEvent::Server(event),
            Err(err @ FrameError::Malformed(_)) => StreamEvent::TransportError {
                reason: err.to_string(),
            },
            Err(err) => StreamEvent::UnknownMessage {
                raw: text.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

struct Channel {
    user_id: UserId,
    outbound: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Channel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn shutdown(self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(Message::Close(None));
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Rider-side WebSocket channel to the trip-coordination backend.
///
/// At most one channel is open per stream. Events are delivered in arrival
/// order without batching; transport failures are reported as events and
/// never retried.
pub struct TripEventStream {
    config: StreamConfig,
    channel: Option<Channel>,
}

impl TripEventStream {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            channel: None,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.channel.as_ref().is_some_and(Channel::is_open)
    }

    /// Opens the channel for `user_id` and, when given, announces the rider's
    /// position as the very first outbound frame.
    ///
    /// An empty `user_id` opens nothing.
    #[tracing::instrument(skip(self, initial_location), err)]
    pub async fn open(
        &mut self,
        user_id: &str,
        initial_location: Option<Coordinate>,
    ) -> Result<(), StreamError> {
        let Ok(user_id) = UserId::new(user_id) else {
            tracing::debug!("No signed-in rider, not opening the event stream");
            return Ok(());
        };
        if let Some(channel) = &self.channel {
            if channel.is_open() {
                return Err(StreamError::AlreadyOpen(channel.user_id.to_string()));
            }
        }
        // Remote side closed the previous channel; reap it before reopening.
        if let Some(stale) = self.channel.take() {
            stale.shutdown().await;
        }

        let url = self.config.riders_url(&user_id)?;
        let (socket, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|source| StreamError::Connect {
                    url: url.to_string(),
                    source,
                })?;
        tracing::info!(%url, "Event stream connected");

        let (sink, source) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(write_frames(sink, outbound_rx, cancel.clone()));
        tasks.spawn(read_frames(
            source,
            events_tx,
            Arc::clone(&open),
            cancel.clone(),
        ));

        self.channel = Some(Channel {
            user_id,
            outbound: outbound_tx,
            events: events_rx,
            open,
            cancel,
            tasks,
        });
        if let Some(location) = initial_location {
            self.send_location(location)?;
        }
        Ok(())
    }

    /// Next inbound event, or `None` once the channel is gone.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        match &mut self.channel {
            Some(channel) => channel.events.recv().await,
            None => None,
        }
    }

    pub fn send_location(&self, location: Coordinate) -> Result<(), StreamError> {
        self.send(ClientFrame::DriverLocation { location })
    }

    pub fn send_payment_method_selection(
        &self,
        method: PaymentMethod,
        trip_id: &TripId,
    ) -> Result<(), StreamError> {
        let Some(channel) = self.channel.as_ref() else {
            tracing::debug!(%method, "Event stream not open, dropping payment selection");
            return Ok(());
        };
        let frame = ClientFrame::payment_selection(method, trip_id.clone(), channel.user_id.clone());
        self.send(frame)
    }

    fn send(&self, frame: ClientFrame) -> Result<(), StreamError> {
        let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) else {
            tracing::debug!(?frame, "Event stream not open, dropping outbound frame");
            return Ok(());
        };
        let text = frame.encode()?;
        if channel.outbound.send(Message::Text(text.into())).is_err() {
            tracing::debug!("Event stream writer is gone, dropping outbound frame");
        }
        Ok(())
    }

    /// Closes the channel if one is open. Calling it again does nothing.
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            tracing::info!(user_id = %channel.user_id, "Closing event stream");
            channel.shutdown().await;
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let closing = message.is_close();
                if let Err(err) = sink.send(message).await {
                    tracing::warn!(error = %err, "Failed to write to event stream");
                    break;
                }
                if closing {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(error = %err, "Event stream sink already closed");
    }
}

async fn read_frames(
    mut source: SplitStream<Socket>,
    events: mpsc::UnboundedSender<StreamEvent>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = source.next() => message,
        };
        let event = match message {
            Some(Ok(Message::Text(text))) => StreamEvent::from_frame(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => StreamEvent::from_frame(text),
                Err(err) => StreamEvent::TransportError {
                    reason: format!("Binary frame is not UTF-8: {err}"),
                },
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty());
                tracing::info!(?reason, "Event stream closed by backend");
                open.store(false, Ordering::Release);
                let _ = events.send(StreamEvent::Closed { reason });
                cancel.cancel();
                break;
            }
            // Ping/pong are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "Event stream transport error");
                open.store(false, Ordering::Release);
                let _ = events.send(StreamEvent::TransportError {
                    reason: err.to_string(),
                });
                cancel.cancel();
                break;
            }
            None => {
                open.store(false, Ordering::Release);
                let _ = events.send(StreamEvent::Closed { reason: None });
                cancel.cancel();
                break;
            }
        };
        if let StreamEvent::UnknownMessage { reason, .. } = &event {
            tracing::warn!(%reason, "Unrecognized event-stream message");
        }
        if events.send(event).is_err() {
            break;
        }
    }
}
