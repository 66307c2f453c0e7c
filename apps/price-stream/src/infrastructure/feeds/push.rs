//! Push Connector
//!
//! WebSocket [`SourceConnector`] for upstream feeds that stream prices.
//!
//! # Session
//!
//! 1. Open the socket (bounded by the source's request timeout)
//! 2. Authenticate when credentials are configured (within [`AUTH_TIMEOUT`])
//! 3. Subscribe to the current symbol set, then send only deltas as it changes
//! 4. Forward prices until the socket closes, the heartbeat watchdog fires,
//!    or protocol errors cross their threshold

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::auth::{AUTH_TIMEOUT, AuthError, AuthHandler, Credentials};
use super::codec::JsonCodec;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{ClientRequest, ErrorMessage, FeedMessage};
use crate::application::ports::{FeedError, FeedEventSink, SourceConnector};
use crate::domain::connection::{ConnectionState, SourceDescriptor};
use crate::domain::tick::{SymbolSet, normalize_symbol};

/// Requests remembered while waiting for `subscribed` acks.
const MAX_UNACKED: usize = 32;

impl From<tungstenite::Error> for FeedError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::ConnectionClosed
            }
            tungstenite::Error::Http(ref response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                Self::Authentication(format!("handshake rejected: {}", response.status()))
            }
            other => Self::TransientNetwork(other.to_string()),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a push connector.
#[derive(Debug, Clone)]
pub struct PushConnectorConfig {
    /// Source description (endpoint, timeouts).
    pub descriptor: SourceDescriptor,
    /// Optional API credentials.
    pub credentials: Option<Credentials>,
    /// Heartbeat watchdog settings.
    pub heartbeat: HeartbeatConfig,
}

impl PushConnectorConfig {
    /// Create a configuration whose heartbeat follows the descriptor's timeout.
    #[must_use]
    pub fn new(descriptor: SourceDescriptor) -> Self {
        let heartbeat = HeartbeatConfig::from_timeout(descriptor.heartbeat_timeout);
        Self {
            descriptor,
            credentials: None,
            heartbeat,
        }
    }

    /// Authenticate with these credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

// =============================================================================
// Push Connector
// =============================================================================

/// WebSocket connector for streaming feeds.
#[derive(Debug)]
pub struct PushConnector {
    config: PushConnectorConfig,
    codec: JsonCodec,
}

impl PushConnector {
    /// Create a new push connector.
    #[must_use]
    pub const fn new(config: PushConnectorConfig) -> Self {
        Self {
            config,
            codec: JsonCodec::new(),
        }
    }
}

/// Per-session bookkeeping.
struct Session {
    sink: FeedEventSink,
    auth: AuthHandler,
    /// What has been requested upstream.
    upstream: SymbolSet,
    /// Expected server-side set after each request not yet acknowledged.
    in_flight: VecDeque<SymbolSet>,
}

#[async_trait]
impl SourceConnector for PushConnector {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.config.descriptor
    }

    async fn connect(
        &self,
        mut symbols: watch::Receiver<SymbolSet>,
        sink: FeedEventSink,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let descriptor = &self.config.descriptor;
        tracing::info!(source = %descriptor.id, url = %descriptor.endpoint, "Connecting to push feed");

        let handshake = tokio::time::timeout(
            descriptor.request_timeout,
            tokio_tungstenite::connect_async(descriptor.endpoint.as_str()),
        );
        let (ws_stream, _response) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = handshake => result.map_err(|_| FeedError::Timeout(descriptor.request_timeout))??,
        };
        let (mut write, mut read) = ws_stream.split();

        // Polled alongside the socket so it ends with the session
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(8);
        let watchdog = HeartbeatManager::new(
            self.config.heartbeat,
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            cancel.child_token(),
        )
        .run();
        tokio::pin!(watchdog);
        let mut watchdog_done = false;

        let mut session = Session::new(sink, AuthHandler::new(self.config.credentials.clone()));
        let auth_deadline = Instant::now() + AUTH_TIMEOUT;

        if let Some(request) = session.auth.begin() {
            tracing::debug!(source = %descriptor.id, "Sending authentication");
            send(&mut write, &request).await?;
        } else {
            session.on_ready(&mut write, &mut symbols).await?;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                () = tokio::time::sleep_until(auth_deadline), if !session.auth.is_authenticated() => {
                    tracing::warn!(source = %descriptor.id, "Authentication not acknowledged in time");
                    return Err(FeedError::Timeout(AUTH_TIMEOUT));
                }
                changed = symbols.changed(), if session.auth.is_authenticated() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let wanted = symbols.borrow_and_update().clone();
                    session.sync(&mut write, wanted).await?;
                }
                () = &mut watchdog, if !watchdog_done => watchdog_done = true,
                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendPing => write.send(Message::Ping(Vec::new().into())).await?,
                    HeartbeatEvent::Timeout => {
                        return Err(FeedError::HeartbeatTimeout(self.config.heartbeat.timeout));
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat_state.record_activity();
                        match self.codec.decode(text.as_str()) {
                            Ok(messages) => {
                                for message in messages {
                                    session.handle(message, &mut write, &mut symbols).await?;
                                }
                            }
                            Err(e) => session.sink.protocol_error(e.to_string()).await?,
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        heartbeat_state.record_activity();
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => heartbeat_state.record_activity(),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(source = %descriptor.id, ?frame, "Server sent close frame");
                        return Err(FeedError::ConnectionClosed);
                    }
                    Some(Ok(_)) => heartbeat_state.record_activity(),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(FeedError::ConnectionClosed),
                },
            }
        }
    }
}

impl Session {
    fn new(sink: FeedEventSink, auth: AuthHandler) -> Self {
        Self {
            sink,
            auth,
            upstream: SymbolSet::new(),
            in_flight: VecDeque::new(),
        }
    }

    /// Authenticated (or no auth needed): report connected and subscribe.
    async fn on_ready<W>(
        &mut self,
        write: &mut W,
        symbols: &mut watch::Receiver<SymbolSet>,
    ) -> Result<(), FeedError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        self.sink.set_state(ConnectionState::Connected).await;
        let wanted = symbols.borrow_and_update().clone();
        self.sync(write, wanted).await
    }

    /// Send only the difference between what is requested upstream and `wanted`.
    async fn sync<W>(&mut self, write: &mut W, wanted: SymbolSet) -> Result<(), FeedError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let added: Vec<String> = wanted.difference(&self.upstream).cloned().collect();
        let removed: Vec<String> = self.upstream.difference(&wanted).cloned().collect();

        if !removed.is_empty() {
            tracing::debug!(source = %self.sink.source(), symbols = ?removed, "Unsubscribing");
            let kept = self.upstream.intersection(&wanted).cloned().collect();
            self.remember(kept);
            send(write, &ClientRequest::Unsubscribe { symbols: removed }).await?;
        }
        if !added.is_empty() {
            tracing::debug!(source = %self.sink.source(), symbols = ?added, "Subscribing");
            self.remember(wanted.clone());
            send(write, &ClientRequest::Subscribe { symbols: added }).await?;
        }

        self.upstream = wanted;
        self.sink.tracking(self.upstream.clone()).await;
        Ok(())
    }

    async fn handle<W>(
        &mut self,
        message: FeedMessage,
        write: &mut W,
        symbols: &mut watch::Receiver<SymbolSet>,
    ) -> Result<(), FeedError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match message {
            FeedMessage::Price(price) => self.sink.raw_tick(&price.into_raw()).await?,
            FeedMessage::Heartbeat => {}
            FeedMessage::Authenticated => {
                if !self.auth.is_authenticated() {
                    tracing::info!(source = %self.sink.source(), "Push feed authenticated");
                    self.auth.on_authenticated();
                    self.on_ready(write, symbols).await?;
                }
            }
            FeedMessage::Subscribed(ack) => self.on_subscribed(&ack.symbols).await,
            FeedMessage::Error(error) => self.on_server_error(&error).await?,
        }
        Ok(())
    }

    fn remember(&mut self, after: SymbolSet) {
        if self.in_flight.len() == MAX_UNACKED {
            self.in_flight.pop_front();
        }
        self.in_flight.push_back(after);
    }

    /// An ack carries the server's whole set as of the request it answers.
    /// Only symbols that request expected and the ack leaves out are dropped.
    async fn on_subscribed(&mut self, acked: &[String]) {
        let acked: SymbolSet = acked
            .iter()
            .filter_map(|s| normalize_symbol(s).ok())
            .collect();
        let expected = self
            .in_flight
            .pop_front()
            .unwrap_or_else(|| self.upstream.clone());
        let rejected: Vec<String> = expected
            .difference(&acked)
            .filter(|s| self.upstream.contains(*s))
            .cloned()
            .collect();
        if rejected.is_empty() {
            return;
        }

        tracing::warn!(source = %self.sink.source(), symbols = ?rejected, "Upstream did not confirm symbols");
        for symbol in &rejected {
            self.upstream.remove(symbol);
        }
        self.sink.tracking(self.upstream.clone()).await;
    }

    async fn on_server_error(&mut self, error: &ErrorMessage) -> Result<(), FeedError> {
        if AuthError::is_auth_code(error.code) || !self.auth.is_authenticated() {
            let err = self.auth.on_error(error);
            tracing::error!(source = %self.sink.source(), code = error.code, error = %err, "Authentication rejected");
            return Err(err.into());
        }

        tracing::warn!(
            source = %self.sink.source(),
            code = error.code,
            message = %error.message,
            "Server reported error"
        );
        self.sink.error(AuthError::from(error).into()).await;
        Ok(())
    }
}

async fn send<W>(write: &mut W, request: &ClientRequest) -> Result<(), FeedError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = request
        .to_json()
        .map_err(|e| FeedError::Protocol(format!("failed to serialize request: {e}")))?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use std::convert::Infallible;

    use super::*;
    use crate::application::ports::{ConnectorEvent, SourceEvent};
    use crate::infrastructure::feeds::messages::SubscribedMessage;
    use crate::domain::connection::ProtocolErrorWindow;
    use crate::domain::tick::SourceId;

    type ServerSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_text(ws: &mut ServerSocket) -> serde_json::Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    fn harness(
        url: &str,
        credentials: Option<Credentials>,
    ) -> (PushConnector, FeedEventSink, mpsc::Receiver<SourceEvent>) {
        let descriptor = SourceDescriptor::push(SourceId::Primary, 0, url);
        let mut config = PushConnectorConfig::new(descriptor);
        config.credentials = credentials;
        let (tx, rx) = mpsc::channel(64);
        let sink = FeedEventSink::new(
            SourceId::Primary,
            tx,
            ProtocolErrorWindow::new(2, Duration::from_secs(10)),
        );
        (PushConnector::new(config), sink, rx)
    }

    async fn next_matching(
        rx: &mut mpsc::Receiver<SourceEvent>,
        pred: impl Fn(&ConnectorEvent) -> bool,
    ) -> ConnectorEvent {
        loop {
            let event = rx.recv().await.unwrap().event;
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn subscribes_and_forwards_prices() {
        let (listener, url) = listener().await;
        let (connector, sink, mut rx) = harness(&url, None);
        let (symbols_tx, symbols_rx) = watch::channel(SymbolSet::from(["BTCUSDT".to_string()]));
        let cancel = CancellationToken::new();

        let session = tokio::spawn({
            let cancel = cancel.clone();
            async move { connector.connect(symbols_rx, sink, cancel).await }
        });

        let mut ws = accept(&listener).await;
        let subscribe = next_text(&mut ws).await;
        assert_eq!(subscribe["action"], "subscribe");
        assert_eq!(subscribe["symbols"][0], "BTCUSDT");

        ws.send(Message::Text(
            r#"{"type":"price","symbol":"BTC-USDT","price":"101.5"}"#.into(),
        ))
        .await
        .unwrap();

        let ConnectorEvent::Tick(tick) =
            next_matching(&mut rx, |e| matches!(e, ConnectorEvent::Tick(_))).await
        else {
            unreachable!()
        };
        assert_eq!(tick.symbol(), "BTCUSDT");

        symbols_tx.send_replace(SymbolSet::from(["ETHUSDT".to_string()]));
        let first = next_text(&mut ws).await;
        let second = next_text(&mut ws).await;
        assert_eq!(first["action"], "unsubscribe");
        assert_eq!(first["symbols"][0], "BTCUSDT");
        assert_eq!(second["action"], "subscribe");
        assert_eq!(second["symbols"][0], "ETHUSDT");

        cancel.cancel();
        assert_eq!(session.await.unwrap(), Ok(()));
    }

    fn symbol_set(symbols: &[&str]) -> SymbolSet {
        symbols.iter().map(|s| (*s).to_string()).collect()
    }

    fn last_tracking(rx: &mut mpsc::Receiver<SourceEvent>) -> Option<SymbolSet> {
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let ConnectorEvent::Tracking(symbols) = event.event {
                last = Some(symbols);
            }
        }
        last
    }

    #[tokio::test]
    async fn late_ack_does_not_drop_newer_symbols() {
        let (tx, mut rx) = mpsc::channel(64);
        let sink = FeedEventSink::new(
            SourceId::Primary,
            tx,
            ProtocolErrorWindow::new(2, Duration::from_secs(10)),
        );
        let mut session = Session::new(sink, AuthHandler::new(None));
        let mut write = futures_util::sink::drain()
            .sink_map_err(|never: Infallible| -> tungstenite::Error { match never {} });
        let (_symbols_tx, mut symbols_rx) = watch::channel(SymbolSet::new());
        let ack = |symbols: &[&str]| {
            FeedMessage::Subscribed(SubscribedMessage {
                symbols: symbols.iter().map(|s| (*s).to_string()).collect(),
            })
        };

        session.sync(&mut write, symbol_set(&["BTCUSDT"])).await.unwrap();
        session
            .sync(&mut write, symbol_set(&["BTCUSDT", "ETHUSDT"]))
            .await
            .unwrap();
        assert_eq!(last_tracking(&mut rx), Some(symbol_set(&["BTCUSDT", "ETHUSDT"])));

        // Answers the first request only
        session
            .handle(ack(&["BTCUSDT"]), &mut write, &mut symbols_rx)
            .await
            .unwrap();
        assert_eq!(last_tracking(&mut rx), None);
        assert_eq!(session.upstream, symbol_set(&["BTCUSDT", "ETHUSDT"]));

        // Answers the second request but leaves BTCUSDT out
        session
            .handle(ack(&["ETHUSDT"]), &mut write, &mut symbols_rx)
            .await
            .unwrap();
        assert_eq!(last_tracking(&mut rx), Some(symbol_set(&["ETHUSDT"])));
        assert!(session.in_flight.is_empty());
    }

    #[tokio::test]
    async fn authenticates_before_subscribing() {
        let (listener, url) = listener().await;
        let creds = Credentials::new("key", "secret").unwrap();
        let (connector, sink, mut rx) = harness(&url, Some(creds));
        let (_symbols_tx, symbols_rx) = watch::channel(SymbolSet::from(["BTCUSDT".to_string()]));
        let cancel = CancellationToken::new();

        let session = tokio::spawn({
            let cancel = cancel.clone();
            async move { connector.connect(symbols_rx, sink, cancel).await }
        });

        let mut ws = accept(&listener).await;
        let auth = next_text(&mut ws).await;
        assert_eq!(auth["action"], "auth");
        assert_eq!(auth["key"], "key");

        ws.send(Message::Text(r#"{"type":"authenticated"}"#.into())).await.unwrap();
        let subscribe = next_text(&mut ws).await;
        assert_eq!(subscribe["action"], "subscribe");

        let event = next_matching(&mut rx, |e| matches!(e, ConnectorEvent::StateChanged(_))).await;
        assert_eq!(event, ConnectorEvent::StateChanged(ConnectionState::Connected));

        cancel.cancel();
        assert_eq!(session.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn rejected_credentials_end_session() {
        let (listener, url) = listener().await;
        let creds = Credentials::new("key", "wrong").unwrap();
        let (connector, sink, _rx) = harness(&url, Some(creds));
        let (_symbols_tx, symbols_rx) = watch::channel(SymbolSet::new());

        let session = tokio::spawn(async move {
            connector
                .connect(symbols_rx, sink, CancellationToken::new())
                .await
        });

        let mut ws = accept(&listener).await;
        let _auth = next_text(&mut ws).await;
        ws.send(Message::Text(
            r#"{"type":"error","code":402,"message":"auth failed"}"#.into(),
        ))
        .await
        .unwrap();

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, FeedError::Authentication(_)));
    }

    #[tokio::test]
    async fn malformed_frames_cross_protocol_threshold() {
        let (listener, url) = listener().await;
        let (connector, sink, _rx) = harness(&url, None);
        let (_symbols_tx, symbols_rx) = watch::channel(SymbolSet::new());

        let session = tokio::spawn(async move {
            connector
                .connect(symbols_rx, sink, CancellationToken::new())
                .await
        });

        let mut ws = accept(&listener).await;
        for _ in 0..3 {
            ws.send(Message::Text("garbage".into())).await.unwrap();
        }

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, FeedError::ProtocolThreshold { count: 3, .. }));
    }

    #[tokio::test]
    async fn server_close_is_connection_closed() {
        let (listener, url) = listener().await;
        let (connector, sink, _rx) = harness(&url, None);
        let (_symbols_tx, symbols_rx) = watch::channel(SymbolSet::new());

        let session = tokio::spawn(async move {
            connector
                .connect(symbols_rx, sink, CancellationToken::new())
                .await
        });

        let mut ws = accept(&listener).await;
        ws.close(None).await.unwrap();

        let err = session.await.unwrap().unwrap_err();
        assert_eq!(err, FeedError::ConnectionClosed);
    }

    #[tokio::test]
    async fn silent_server_ends_session_on_heartbeat_timeout() {
        let (listener, url) = listener().await;
        let descriptor = SourceDescriptor::push(SourceId::Primary, 0, url.as_str())
            .with_heartbeat_timeout(Duration::from_millis(200));
        let connector = PushConnector::new(PushConnectorConfig::new(descriptor));
        let (tx, _rx) = mpsc::channel(64);
        let sink = FeedEventSink::new(
            SourceId::Primary,
            tx,
            ProtocolErrorWindow::new(2, Duration::from_secs(10)),
        );
        let (_symbols_tx, symbols_rx) = watch::channel(SymbolSet::new());

        let session = tokio::spawn(async move {
            connector
                .connect(symbols_rx, sink, CancellationToken::new())
                .await
        });
        // Accept, then never read or write
        let _ws = accept(&listener).await;

        let err = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err, FeedError::HeartbeatTimeout(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let (listener, url) = listener().await;
        drop(listener);
        let (connector, sink, _rx) = harness(&url, None);
        let (_symbols_tx, symbols_rx) = watch::channel(SymbolSet::new());

        let err = connector
            .connect(symbols_rx, sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::TransientNetwork(_)));
    }
}
