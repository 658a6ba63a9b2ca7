//! Session channels to the routing daemon.
//!
//! One channel type serves both the primary links endpoint and the
//! secondary control endpoint. A channel lazily owns at most one
//! socket; sends issued while the connect handshake is in flight are
//! buffered in order and flushed exactly once on open. A send with no
//! live socket is recovered locally (the channel demotes itself to
//! Closed) and never surfaces as a hard error to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::protocol::{parse_message, Outgoing, WireMessage, WIRE_SUBPROTOCOL};
use transport_queue::{Fifo, Queue};

/// Externally observable channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Error,
}

/// Which of the two daemon endpoints a channel talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLabel {
    Links,
    Control,
}

impl ChannelLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelLabel::Links => "links",
            ChannelLabel::Control => "control",
        }
    }
}

/// Signals surfaced to the session loop.
#[derive(Debug)]
pub enum ChannelSignal {
    State(ChannelLabel, ChannelState),
    Message(ChannelLabel, WireMessage),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
}

/// Raw socket events delivered by a connector.
#[derive(Debug)]
pub enum SocketEvent {
    Text(String),
    Binary(Vec<u8>),
    Closed { clean: bool },
}

/// A live socket: an ordered outbound sink plus an inbound event
/// stream.
pub struct SocketHandle {
    pub outbound: mpsc::UnboundedSender<Outgoing>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Seam over the actual WebSocket dial, so tests can swap in a mock
/// transport.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<SocketHandle, ConnectError>;
}

enum LinkState {
    Closed,
    Connecting { pending: Fifo<Outgoing> },
    Open { tx: mpsc::UnboundedSender<Outgoing> },
    Faulted,
}

impl LinkState {
    fn as_channel_state(&self) -> ChannelState {
        match self {
            LinkState::Closed => ChannelState::Closed,
            LinkState::Connecting { .. } => ChannelState::Connecting,
            LinkState::Open { .. } => ChannelState::Open,
            LinkState::Faulted => ChannelState::Error,
        }
    }
}

struct ChannelShared {
    label: ChannelLabel,
    url: Url,
    connector: Arc<dyn SocketConnector>,
    state: Mutex<LinkState>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
}

/// One logical connection to a daemon endpoint.
#[derive(Clone)]
pub struct SessionChannel {
    shared: Arc<ChannelShared>,
}

impl SessionChannel {
    pub fn new(
        label: ChannelLabel,
        url: Url,
        connector: Arc<dyn SocketConnector>,
        signals: mpsc::UnboundedSender<ChannelSignal>,
    ) -> Self {
        SessionChannel {
            shared: Arc::new(ChannelShared {
                label,
                url,
                connector,
                state: Mutex::new(LinkState::Closed),
                signals,
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.lock().as_channel_state()
    }

    /// Start a connection attempt unless one is already underway.
    pub fn connect(&self) {
        {
            let mut state = self.shared.state.lock();
            match *state {
                LinkState::Connecting { .. } | LinkState::Open { .. } => return,
                LinkState::Closed | LinkState::Faulted => {
                    *state = LinkState::Connecting {
                        pending: Fifo::new(),
                    };
                }
            }
        }
        self.signal_state(ChannelState::Connecting);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run_connection(shared).await;
        });
    }

    /// Send a structured message; requires a connection attempt to
    /// exist (links-channel semantics).
    pub fn send(&self, msg: &WireMessage) {
        match Outgoing::message(msg) {
            Ok(payload) => self.post(payload, false),
            Err(err) => {
                tracing::warn!(channel = self.shared.label.as_str(), %err, "dropping unencodable message");
            }
        }
    }

    /// Send with opportunistic-connect semantics: when no connection
    /// attempt has been made, `force = true` makes this send establish
    /// one, `force = false` drops the payload.
    pub fn send_opportunistic(&self, msg: &WireMessage, force: bool) {
        match Outgoing::message(msg) {
            Ok(payload) => self.post(payload, force),
            Err(err) => {
                tracing::warn!(channel = self.shared.label.as_str(), %err, "dropping unencodable message");
            }
        }
    }

    /// Send a binary tile payload.
    pub fn send_binary(&self, payload: Bytes) {
        self.post(Outgoing::Binary(payload), false);
    }

    pub fn send_binary_opportunistic(&self, payload: Bytes, force: bool) {
        self.post(Outgoing::Binary(payload), force);
    }

    fn post(&self, payload: Outgoing, force_connect: bool) {
        let deliver_failed = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                LinkState::Open { tx } => tx.send(payload).is_err(),
                LinkState::Connecting { pending } => {
                    pending.push(payload);
                    false
                }
                LinkState::Closed | LinkState::Faulted => {
                    if force_connect {
                        let mut pending = Fifo::new();
                        pending.push(payload);
                        *state = LinkState::Connecting { pending };
                        drop(state);
                        self.signal_state(ChannelState::Connecting);
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            run_connection(shared).await;
                        });
                    } else {
                        tracing::debug!(
                            channel = self.shared.label.as_str(),
                            "no live connection, dropping payload"
                        );
                    }
                    return;
                }
            }
        };

        if deliver_failed {
            // The socket task is gone; recover locally by demoting to
            // Closed so the next user action can reconnect.
            tracing::warn!(
                channel = self.shared.label.as_str(),
                "send failed, demoting channel to closed"
            );
            *self.shared.state.lock() = LinkState::Closed;
            self.signal_state(ChannelState::Closed);
        }
    }

    fn signal_state(&self, state: ChannelState) {
        let _ = self
            .shared
            .signals
            .send(ChannelSignal::State(self.shared.label, state));
    }
}

async fn run_connection(shared: Arc<ChannelShared>) {
    let label = shared.label;
    let handle = match shared.connector.connect(&shared.url).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(channel = label.as_str(), %err, "connect failed");
            *shared.state.lock() = LinkState::Faulted;
            let _ = shared
                .signals
                .send(ChannelSignal::State(label, ChannelState::Error));
            return;
        }
    };

    let SocketHandle {
        outbound,
        mut events,
    } = handle;

    // Flush everything queued while connecting, in push order, before
    // announcing the open state.
    {
        let mut state = shared.state.lock();
        let mut pending = match std::mem::replace(
            &mut *state,
            LinkState::Open {
                tx: outbound.clone(),
            },
        ) {
            LinkState::Connecting { pending } => pending,
            other => {
                // Connection was torn down while we were dialing.
                *state = other;
                return;
            }
        };
        while let Some(item) = pending.pop() {
            let _ = outbound.send(item);
        }
    }
    let _ = shared
        .signals
        .send(ChannelSignal::State(label, ChannelState::Open));

    let mut saw_close = false;
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Text(raw) => match parse_message(&raw) {
                Ok(msg) => {
                    let _ = shared.signals.send(ChannelSignal::Message(label, msg));
                }
                Err(err) => {
                    // One malformed payload must not take down the
                    // dispatch loop.
                    tracing::warn!(channel = label.as_str(), %err, "skipping malformed message");
                }
            },
            SocketEvent::Binary(bytes) => {
                tracing::trace!(
                    channel = label.as_str(),
                    len = bytes.len(),
                    "ignoring inbound binary frame"
                );
            }
            SocketEvent::Closed { clean } => {
                let next = if clean {
                    LinkState::Closed
                } else {
                    LinkState::Faulted
                };
                let observable = next.as_channel_state();
                *shared.state.lock() = next;
                let _ = shared.signals.send(ChannelSignal::State(label, observable));
                saw_close = true;
                break;
            }
        }
    }

    if !saw_close {
        // Event stream ended without a close frame: treat as unclean.
        *shared.state.lock() = LinkState::Faulted;
        let _ = shared
            .signals
            .send(ChannelSignal::State(label, ChannelState::Error));
    }
}

/// Production connector speaking `VLP` over tokio-tungstenite.
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<SocketHandle, ConnectError> {
        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|err| ConnectError::InvalidEndpoint {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(WIRE_SUBPROTOCOL),
        );

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|err| ConnectError::Handshake(err.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                let frame = match item {
                    Outgoing::Text(text) => Message::Text(text),
                    Outgoing::Binary(bytes) => Message::Binary(bytes.to_vec()),
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(SocketEvent::Text(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if event_tx.send(SocketEvent::Binary(bytes)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        let _ = event_tx.send(SocketEvent::Closed { clean: true });
                        return;
                    }
                    Err(_) => {
                        let _ = event_tx.send(SocketEvent::Closed { clean: false });
                        return;
                    }
                    Ok(_) => {}
                }
            }
            let _ = event_tx.send(SocketEvent::Closed { clean: false });
        });

        Ok(SocketHandle {
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    /// Connector whose handshake completes only when released,
    /// exposing the socket ends to the test.
    struct MockConnector {
        release: Arc<Notify>,
        taps: Mutex<Vec<MockSocket>>,
        fail: bool,
    }

    struct MockSocket {
        sent: mpsc::UnboundedReceiver<Outgoing>,
        inject: mpsc::UnboundedSender<SocketEvent>,
    }

    impl MockConnector {
        fn new(fail: bool) -> Self {
            MockConnector {
                release: Arc::new(Notify::new()),
                taps: Mutex::new(Vec::new()),
                fail,
            }
        }

        fn take_socket(&self) -> MockSocket {
            self.taps.lock().pop().expect("no socket established")
        }
    }

    #[async_trait]
    impl SocketConnector for MockConnector {
        async fn connect(&self, _url: &Url) -> Result<SocketHandle, ConnectError> {
            self.release.notified().await;
            if self.fail {
                return Err(ConnectError::Handshake("refused".into()));
            }
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            self.taps.lock().push(MockSocket {
                sent: outbound_rx,
                inject: event_tx,
            });
            Ok(SocketHandle {
                outbound: outbound_tx,
                events: event_rx,
            })
        }
    }

    fn channel_with(
        connector: Arc<MockConnector>,
    ) -> (SessionChannel, mpsc::UnboundedReceiver<ChannelSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = Url::parse("ws://localhost:4487").unwrap();
        (
            SessionChannel::new(ChannelLabel::Links, url, connector, tx),
            rx,
        )
    }

    fn text_of(item: Outgoing) -> String {
        match item {
            Outgoing::Text(text) => text,
            Outgoing::Binary(_) => panic!("expected text frame"),
        }
    }

    async fn next_state(rx: &mut mpsc::UnboundedReceiver<ChannelSignal>) -> ChannelState {
        loop {
            match rx.recv().await.expect("signal stream ended") {
                ChannelSignal::State(_, state) => return state,
                ChannelSignal::Message(..) => continue,
            }
        }
    }

    fn abort(id: &str, stamp: i64) -> WireMessage {
        WireMessage::Abort {
            id: id.into(),
            stamp,
        }
    }

    #[tokio::test]
    async fn sends_while_connecting_flush_in_order_on_open() {
        let connector = Arc::new(MockConnector::new(false));
        let (channel, mut signals) = channel_with(connector.clone());

        channel.connect();
        assert_eq!(next_state(&mut signals).await, ChannelState::Connecting);
        channel.send(&abort("a", 1));
        channel.send(&abort("b", 2));
        channel.send(&abort("c", 3));

        connector.release.notify_one();
        assert_eq!(next_state(&mut signals).await, ChannelState::Open);

        let mut socket = connector.take_socket();
        for expected in ["a", "b", "c"] {
            let text = text_of(socket.sent.recv().await.unwrap());
            assert!(text.contains(&format!("\"id\":\"{expected}\"")));
        }

        // Messages sent after open still follow everything queued.
        channel.send(&abort("d", 4));
        let text = text_of(socket.sent.recv().await.unwrap());
        assert!(text.contains("\"id\":\"d\""));
    }

    #[tokio::test]
    async fn opportunistic_send_without_force_drops() {
        let connector = Arc::new(MockConnector::new(false));
        let (channel, _signals) = channel_with(connector.clone());

        channel.send_opportunistic(&abort("dropped", 1), false);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(connector.taps.lock().is_empty());
    }

    #[tokio::test]
    async fn opportunistic_send_with_force_connects_and_delivers() {
        let connector = Arc::new(MockConnector::new(false));
        let (channel, mut signals) = channel_with(connector.clone());

        channel.send_opportunistic(&abort("first", 1), true);
        assert_eq!(next_state(&mut signals).await, ChannelState::Connecting);
        // A follow-up without force rides the in-flight attempt.
        channel.send_opportunistic(&abort("second", 2), false);

        connector.release.notify_one();
        assert_eq!(next_state(&mut signals).await, ChannelState::Open);

        let mut socket = connector.take_socket();
        let first = text_of(socket.sent.recv().await.unwrap());
        assert!(first.contains("\"id\":\"first\""));
        let second = text_of(socket.sent.recv().await.unwrap());
        assert!(second.contains("\"id\":\"second\""));
    }

    #[tokio::test]
    async fn connect_failure_reports_error_and_abandons() {
        let connector = Arc::new(MockConnector::new(true));
        let (channel, mut signals) = channel_with(connector.clone());

        channel.connect();
        assert_eq!(next_state(&mut signals).await, ChannelState::Connecting);
        connector.release.notify_one();
        assert_eq!(next_state(&mut signals).await, ChannelState::Error);
        assert_eq!(channel.state(), ChannelState::Error);
    }

    #[tokio::test]
    async fn malformed_inbound_message_does_not_stop_dispatch() {
        let connector = Arc::new(MockConnector::new(false));
        let (channel, mut signals) = channel_with(connector.clone());

        channel.connect();
        connector.release.notify_one();
        assert_eq!(next_state(&mut signals).await, ChannelState::Connecting);
        assert_eq!(next_state(&mut signals).await, ChannelState::Open);

        let socket = connector.take_socket();
        socket
            .inject
            .send(SocketEvent::Text("{broken".into()))
            .unwrap();
        socket
            .inject
            .send(SocketEvent::Text(
                r#"{"task":"REQUEST","id":"x","stamp":9}"#.into(),
            ))
            .unwrap();

        match signals.recv().await.unwrap() {
            ChannelSignal::Message(_, WireMessage::Request { id, stamp }) => {
                assert_eq!(id, "x");
                assert_eq!(stamp, 9);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unclean_close_faults_the_channel() {
        let connector = Arc::new(MockConnector::new(false));
        let (channel, mut signals) = channel_with(connector.clone());

        channel.connect();
        connector.release.notify_one();
        assert_eq!(next_state(&mut signals).await, ChannelState::Connecting);
        assert_eq!(next_state(&mut signals).await, ChannelState::Open);

        let socket = connector.take_socket();
        socket
            .inject
            .send(SocketEvent::Closed { clean: false })
            .unwrap();
        assert_eq!(next_state(&mut signals).await, ChannelState::Error);
        assert_eq!(channel.state(), ChannelState::Error);
    }

    #[tokio::test]
    async fn clean_close_returns_to_closed() {
        let connector = Arc::new(MockConnector::new(false));
        let (channel, mut signals) = channel_with(connector.clone());

        channel.connect();
        connector.release.notify_one();
        assert_eq!(next_state(&mut signals).await, ChannelState::Connecting);
        assert_eq!(next_state(&mut signals).await, ChannelState::Open);

        let socket = connector.take_socket();
        socket
            .inject
            .send(SocketEvent::Closed { clean: true })
            .unwrap();
        assert_eq!(next_state(&mut signals).await, ChannelState::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
