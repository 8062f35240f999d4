use std::pin::Pin;

use async_trait::async_trait;
use futures::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use crate::error::SignalingError;

pub type SocketSink = Pin<Box<dyn Sink<String, Error = SignalingError> + Send>>;
pub type SocketStream = Pin<Box<dyn Stream<Item = Result<String, SignalingError>> + Send>>;

/// Opens the duplex text socket to the signaling server.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<(SocketSink, SocketStream), SignalingError>;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<(SocketSink, SocketStream), SignalingError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(target = "signaling", url = %url, "signaling websocket connected");
        let (ws_write, ws_read) = ws_stream.split();

        let sink = ws_write
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text))))
            .sink_map_err(|err| SignalingError::Send(err.to_string()));

        let stream = ws_read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => {
                    tracing::trace!(
                        target = "signaling",
                        event = "ws_in",
                        kind = "text",
                        len = text.len()
                    );
                    Some(Ok(text))
                }
                Ok(Message::Binary(data)) => {
                    tracing::trace!(
                        target = "signaling",
                        event = "ws_in",
                        kind = "binary",
                        len = data.len()
                    );
                    String::from_utf8(data).ok().map(Ok)
                }
                Ok(Message::Close(_)) => Some(Err(SignalingError::Closed)),
                Ok(_) => None,
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(
                                target = "signaling",
                                "signaling websocket closed: {err}"
                            );
                        }
                        _ => {
                            tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                        }
                    }
                    Some(Err(SignalingError::Connect(err.to_string())))
                }
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
