//! Bidirectional push connection carrying chat frames and roster snapshots.

use std::future::Future;

use convo_core::{Message, PushEvent, SyncError, SyncErrorCategory};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

const INBOUND_BUFFER: usize = 256;

/// What the connection hands to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Frame(PushEvent),
    /// The connection ended. No further events follow.
    Closed { reason: String },
}

/// Handle to an identified push connection.
///
/// Dropping the handle closes the connection.
#[derive(Debug)]
pub struct LiveConnection {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::Receiver<LiveEvent>,
    shutdown: CancellationToken,
}

impl LiveConnection {
    /// Wrap channel ends served by a transport task.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<Message>,
        inbound: mpsc::Receiver<LiveEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            shutdown,
        }
    }

    /// Queue one chat frame. Delivery is best-effort.
    pub fn send(&self, message: &Message) -> Result<(), SyncError> {
        self.outbound.send(message.clone()).map_err(|_| {
            SyncError::network("connection_closed", "push connection is no longer writable")
        })
    }

    /// Next inbound event; `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.inbound.recv().await
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Opens push connections for a user.
pub trait PushConnector: Send + Sync + 'static {
    /// Connect and identify as `username`.
    fn connect(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<LiveConnection, SyncError>> + Send;
}

/// WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl PushConnector for WsConnector {
    async fn connect(&self, username: &str) -> Result<LiveConnection, SyncError> {
        let (stream, _) = connect_async(self.url.as_str()).await.map_err(|err| {
            SyncError::network("ws_connect_failed", format!("connect {}: {err}", self.url))
        })?;
        let (mut sink, mut source) = stream.split();

        // The server only routes to users it has seen an identify frame from.
        let identify = encode_frame(&Message::identify(username))?;
        sink.send(WsMessage::Text(identify.into()))
            .await
            .map_err(|err| SyncError::network("ws_identify_failed", err.to_string()))?;
        info!(url = %self.url, %username, "push connection identified");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    next = outbound_rx.recv() => {
                        let Some(message) = next else {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        };
                        let frame = match encode_frame(&message) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(error = %err, "dropping unencodable chat frame");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(WsMessage::Text(frame.into())).await {
                            warn!(error = %err, "push write failed");
                            writer_shutdown.cancel();
                            break;
                        }
                    }
                }
            }
            debug!("push writer stopped");
        });

        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = reader_shutdown.cancelled() => break None,
                    next = source.next() => match next {
                        Some(Ok(WsMessage::Text(text))) => {
                            trace!(bytes = text.len(), "push frame received");
                            match PushEvent::decode(text.as_str()) {
                                Ok(event) => {
                                    if inbound_tx.send(LiveEvent::Frame(event)).await.is_err() {
                                        break None;
                                    }
                                }
                                Err(err) => warn!(error = %err, "ignoring push frame"),
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            break Some(
                                frame
                                    .map(|frame| frame.reason.as_str().to_owned())
                                    .filter(|reason| !reason.is_empty())
                                    .unwrap_or_else(|| "closed by server".to_owned()),
                            );
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break Some(err.to_string()),
                        None => break Some("connection ended".to_owned()),
                    }
                }
            };

            reader_shutdown.cancel();
            if let Some(reason) = reason {
                info!(%reason, "push connection closed");
                let _ = inbound_tx.send(LiveEvent::Closed { reason }).await;
            }
        });

        Ok(LiveConnection::from_channels(outbound_tx, inbound_rx, shutdown))
    }
}

/// Push endpoint derived from the HTTP base: `http` becomes `ws`, `https`
/// becomes `wss`, and `/ws` is appended to the base path.
pub fn ws_url_from_base(base: &Url) -> Result<Url, SyncError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "unsupported_scheme",
                format!("cannot derive push endpoint from '{other}' url"),
            ));
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme).map_err(|()| {
        SyncError::new(
            SyncErrorCategory::Config,
            "unsupported_scheme",
            format!("cannot switch {base} to {scheme}"),
        )
    })?;
    let path = format!("{}/ws", base.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn encode_frame(message: &Message) -> Result<String, SyncError> {
    serde_json::to_string(message)
        .map_err(|err| SyncError::protocol("frame_encode_error", err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[test]
    fn derives_ws_endpoint_from_http_base() {
        let url = ws_url_from_base(&Url::parse("http://localhost:8080").expect("url"))
            .expect("derive");
        assert_eq!(url.as_str(), "ws://localhost:8080/ws");

        let url = ws_url_from_base(&Url::parse("https://chat.example.org/api/").expect("url"))
            .expect("derive");
        assert_eq!(url.as_str(), "wss://chat.example.org/api/ws");
    }

    #[test]
    fn rejects_non_http_base() {
        let err = ws_url_from_base(&Url::parse("ftp://example.org").expect("url"))
            .expect_err("ftp has no push endpoint");
        assert_eq!(err.code, "unsupported_scheme");
    }

    #[test]
    fn identify_frame_has_empty_recipient_and_content() {
        let frame = encode_frame(&Message::identify("alice")).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["to"], "");
        assert_eq!(value["content"], "");
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn connection_handle_forwards_both_directions() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let mut connection =
            LiveConnection::from_channels(outbound_tx, inbound_rx, shutdown.clone());

        let message = Message::new("alice", "bob", "hi", "2024-01-01T00:00:00.000Z");
        connection.send(&message).expect("send");
        assert_eq!(outbound_rx.recv().await, Some(message));

        inbound_tx
            .send(LiveEvent::Closed {
                reason: "bye".into(),
            })
            .await
            .expect("inbound");
        let event = timeout(Duration::from_secs(1), connection.recv())
            .await
            .expect("recv timeout");
        assert_eq!(
            event,
            Some(LiveEvent::Closed {
                reason: "bye".into()
            })
        );

        drop(connection);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn send_fails_once_transport_is_gone() {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (_inbound_tx, inbound_rx) = mpsc::channel(1);
        let connection =
            LiveConnection::from_channels(outbound_tx, inbound_rx, CancellationToken::new());
        drop(outbound_rx);

        let err = connection
            .send(&Message::new("alice", "bob", "hi", "t"))
            .expect_err("closed transport");
        assert_eq!(err.category, SyncErrorCategory::Network);
    }
}
