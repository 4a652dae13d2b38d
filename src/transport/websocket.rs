//! WebSocket connector backed by tokio-tungstenite

use crate::transport::channel::{Connector, Link};
use crate::transport::protocol::Frame;
use crate::{Result, SessionError};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Opens WebSocket connections, optionally authenticated with the
/// session identity token as a bearer credential
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    auth_token: Option<String>,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, address: &str) -> BoxFuture<'static, Result<Link>> {
        let address = address.to_string();
        let token = self.auth_token.clone();

        async move {
            let mut request = address
                .as_str()
                .into_client_request()
                .map_err(|e| SessionError::ConfigError(format!("Invalid server address: {}", e)))?;

            if let Some(token) = token {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| SessionError::ConfigError(format!("Invalid token: {}", e)))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }

            let (stream, _) = connect_async(request)
                .await
                .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;
            let (mut ws_tx, mut ws_rx) = stream.split();

            let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Frame>();

            // Writer: runs until the channel drops its sender
            tokio::spawn(async move {
                while let Some(frame) = outgoing_rx.recv().await {
                    let message = match frame {
                        Frame::Text(text) => Message::Text(text.into()),
                        Frame::Binary(bytes) => Message::Binary(bytes.into()),
                    };
                    if let Err(e) = ws_tx.send(message).await {
                        warn!("WebSocket send failed: {}", e);
                        break;
                    }
                }
                let _ = ws_tx.close().await;
                debug!("WebSocket writer finished");
            });

            // Reader: dropping incoming_tx tells the channel the link is gone
            tokio::spawn(async move {
                while let Some(message) = ws_rx.next().await {
                    let frame = match message {
                        Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                        Ok(Message::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
                        Ok(Message::Close(close)) => {
                            debug!("WebSocket closed by server: {:?}", close);
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("WebSocket read failed: {}", e);
                            break;
                        }
                    };
                    if incoming_tx.send(frame).is_err() {
                        break;
                    }
                }
                debug!("WebSocket reader finished");
            });

            Ok(Link {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
            })
        }
        .boxed()
    }
}
