//! WebSocket signaling connector
//!
//! Connects to `{base}/video/rooms/{room_id}/ws?token=..&user_id=..&user_role=..`
//! and runs two background tasks per channel: a writer draining the outbound
//! queue into the socket and a reader decoding frames into [`ChannelEvent`]s.

use super::{ChannelEvent, CloseReason, JoinParams, SignalingChannel, SignalingConnector, SignalingMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close codes the relay uses to refuse a participant
const REJECT_CLOSE_CODES: [u16; 2] = [1008, 4003];

/// Opens signaling channels over WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: Url,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for `base_url` (ws:// or wss://)
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid signaling URL {}: {}", base_url, e)))?;

        if !matches!(base_url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidConfig(format!(
                "signaling URL must use ws or wss, got {}",
                base_url.scheme()
            )));
        }

        Ok(Self {
            base_url,
            connect_timeout,
        })
    }

    /// Connect URL for `params`
    pub fn room_url(&self, params: &JoinParams) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(["video", "rooms", params.room_id.as_str(), "ws"]);
        url.query_pairs_mut()
            .append_pair("token", &params.token)
            .append_pair("user_id", &params.user_id)
            .append_pair("user_role", params.user_role.as_str());
        Ok(url)
    }

    async fn writer_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {} message: {}", message.kind(), e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                warn!("Failed to send signaling message: {}", e);
                break;
            }
        }

        // Outbound queue dropped: the session closed the channel
        let _ = write.send(Message::Close(None)).await;
        debug!("Signaling writer task terminated");
    }

    async fn reader_task(mut read: SplitStream<WsStream>, tx: mpsc::UnboundedSender<ChannelEvent>) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                    Ok(message) => {
                        if tx.send(ChannelEvent::Message(message)).is_err() {
                            debug!("Signaling consumer gone, stopping reader");
                            return;
                        }
                    }
                    Err(e) => warn!("Skipping undecodable signaling frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!("Signaling server closed the connection: {:?}", frame);
                    break close_reason(frame.map(|f| (f.code, f.reason.into_owned())));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Signaling socket error: {}", e);
                    break CloseReason::Dropped(e.to_string());
                }
                None => break CloseReason::Dropped("socket closed".to_string()),
            }
        };

        let _ = tx.send(ChannelEvent::Closed(reason));
        debug!("Signaling reader task terminated");
    }
}

fn close_reason(frame: Option<(CloseCode, String)>) -> CloseReason {
    match frame {
        Some((code, reason)) if REJECT_CLOSE_CODES.contains(&u16::from(code)) => {
            CloseReason::Rejected(reason)
        }
        Some((code, reason)) => CloseReason::Dropped(format!("closed with {}: {}", u16::from(code), reason)),
        None => CloseReason::Dropped("closed without a close frame".to_string()),
    }
}

fn map_connect_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Error::AuthRejected(format!("signaling handshake refused ({})", response.status()))
        }
        other => Error::ConnectFailed(other.to_string()),
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    #[instrument(skip(self, params), fields(room_id = %params.room_id, user_id = %params.user_id))]
    async fn connect(&self, params: &JoinParams) -> Result<SignalingChannel> {
        let url = self.room_url(params)?;
        info!("Connecting to signaling relay for room {}", params.room_id);

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                Error::ConnectFailed(format!(
                    "signaling connect timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(map_connect_error)?;

        info!("Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(write, out_rx));
        tokio::spawn(Self::reader_task(read, in_tx));

        Ok(SignalingChannel::from_parts(out_tx, in_rx))
    }
}
