//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use price_stream::{
    ConnectionState, FeedError, FeedEventSink, PriceFetcher, RawTick, SourceConnector,
    SourceDescriptor, StreamConfig, Symbol, SymbolSet,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted Connector
// =============================================================================

/// Connector driven by the test: stays connected, tracks whatever it is asked
/// for and forwards the raw ticks pushed through [`ScriptedConnector::push`].
pub struct ScriptedConnector {
    descriptor: SourceDescriptor,
    feed: broadcast::Sender<RawTick>,
    requested: watch::Sender<SymbolSet>,
}

impl ScriptedConnector {
    pub fn new(descriptor: SourceDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            feed: broadcast::channel(1024).0,
            requested: watch::channel(SymbolSet::new()).0,
        })
    }

    /// Emit a raw tick on every open session.
    pub fn push(&self, symbol: &str, price: &str) {
        let _ = self.feed.send(RawTick::new(symbol, price, None));
    }

    /// Symbols the supervisor last asked for.
    pub fn requested(&self) -> SymbolSet {
        self.requested.borrow().clone()
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn connect(
        &self,
        mut symbols: watch::Receiver<SymbolSet>,
        sink: FeedEventSink,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let mut feed = self.feed.subscribe();
        sink.set_state(ConnectionState::Connected).await;

        loop {
            let tracked = symbols.borrow_and_update().clone();
            self.requested.send_replace(tracked.clone());
            sink.tracking(tracked).await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    changed = symbols.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        break;
                    }
                    raw = feed.recv() => match raw {
                        Ok(raw) => sink.raw_tick(&raw).await?,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(FeedError::ConnectionClosed);
                        }
                    },
                }
            }
        }
    }
}

// =============================================================================
// Fake Polling Endpoint
// =============================================================================

/// Answers every poll with a fixed price for each requested symbol.
pub struct FixedPriceFetcher {
    price: String,
    calls: Arc<AtomicUsize>,
}

impl FixedPriceFetcher {
    pub fn new(price: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                price: price.to_string(),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl PriceFetcher for FixedPriceFetcher {
    async fn fetch(&self, symbols: &[Symbol]) -> Result<Vec<RawTick>, FeedError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(symbols
            .iter()
            .map(|symbol| RawTick::new(symbol.as_str(), self.price.as_str(), None))
            .collect())
    }
}

// =============================================================================
// WebSocket Feed Server
// =============================================================================

/// Local push feed. Streams `price` for every subscribed symbol every 20 ms
/// until [`FeedServer::silence`] is called; after that open sockets stay up
/// without sending or reading anything and new connections are refused.
pub struct FeedServer {
    pub url: String,
    silence: CancellationToken,
}

impl FeedServer {
    pub async fn start(price: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let silence = CancellationToken::new();

        tokio::spawn({
            let silence = silence.clone();
            async move {
                loop {
                    tokio::select! {
                        () = silence.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, _)) = accepted else { break };
                            tokio::spawn(serve_session(stream, price, silence.clone()));
                        }
                    }
                }
            }
        });

        Self { url, silence }
    }

    /// Stop talking without closing anything.
    pub fn silence(&self) {
        self.silence.cancel();
    }
}

async fn serve_session(stream: tokio::net::TcpStream, price: &'static str, silence: CancellationToken) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let mut subscribed: Vec<String> = Vec::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(20));

    loop {
        tokio::select! {
            () = silence.cancelled() => {
                // Hold the socket open but unresponsive
                std::future::pending::<()>().await;
            }
            _ = ticker.tick() => {
                for symbol in &subscribed {
                    let body = format!(r#"{{"type":"price","symbol":"{symbol}","price":"{price}"}}"#);
                    if write.send(Message::Text(body.into())).await.is_err() {
                        return;
                    }
                }
            }
            msg = read.next() => {
                let Some(Ok(msg)) = msg else { return };
                let Message::Text(text) = msg else { continue };
                let request: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                let symbols: Vec<String> = request["symbols"]
                    .as_array()
                    .map(|list| list.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                match request["action"].as_str() {
                    Some("subscribe") => subscribed.extend(symbols),
                    Some("unsubscribe") => subscribed.retain(|s| !symbols.contains(s)),
                    _ => continue,
                }
                let ack = serde_json::json!({"type": "subscribed", "symbols": subscribed});
                if write.send(Message::Text(ack.to_string().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Configuration with a short batch window so tests stay quick.
pub fn test_config() -> StreamConfig {
    StreamConfig {
        resubscribe_batch: Duration::from_millis(10),
        ..StreamConfig::default()
    }
}

pub fn symbols(list: &[&str]) -> SymbolSet {
    list.iter().map(|s| (*s).to_string()).collect()
}

/// Poll `condition` every 10 ms until it holds or `limit` passes.
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future` for at most two seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}
