use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use super::{ClientFrame, StreamConnection, StreamConnector, TransportError, endpoint_url};
use crate::config::SyncConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws(s)://<server>/sessions/{id}/stream` and authenticates.
pub struct WebSocketConnector {
    stream_base: Url,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &SyncConfig) -> Result<Self, TransportError> {
        let stream_base = config
            .stream_base_url()
            .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))?;
        Ok(Self {
            stream_base,
            connect_timeout: config.connect_timeout,
        })
    }

    fn stream_url(&self, session: &str) -> Result<Url, TransportError> {
        endpoint_url(&self.stream_base, &["sessions", session, "stream"])
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(
        &self,
        session: &str,
        credential: Option<&str>,
    ) -> Result<Box<dyn StreamConnection>, TransportError> {
        let url = self.stream_url(session)?;
        let auth = serde_json::to_string(&ClientFrame::Auth {
            session: session.to_string(),
            token: credential.map(str::to_string),
        })?;

        let handshake = async {
            let (ws_stream, _) = connect_async(url.as_str()).await?;
            let (mut sink, stream) = ws_stream.split();
            sink.send(Message::Text(auth)).await?;
            Ok::<_, TransportError>((sink, stream))
        };
        let (sink, stream) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;

        debug!(
            target = "beach_tide::transport",
            session = %session,
            url = %url,
            "stream handshake sent"
        );
        Ok(Box::new(WebSocketConnection {
            sink,
            stream,
            session: session.to_string(),
        }))
    }
}

struct WebSocketConnection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    session: String,
}

#[async_trait]
impl StreamConnection for WebSocketConnection {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(err) => {
                        warn!(
                            target = "beach_tide::transport",
                            session = %self.session,
                            error = %err,
                            "dropping non-utf8 binary frame"
                        );
                    }
                },
                Ok(Message::Close(_)) => return None,
                // ping/pong are answered by tungstenite
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.sink.send(Message::Close(None)).await {
            debug!(
                target = "beach_tide::transport",
                session = %self.session,
                error = %err,
                "close frame not delivered"
            );
        }
        let _ = self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_uses_ws_scheme_and_session_path() {
        let config = SyncConfig::new("localhost:4132").unwrap();
        let connector = WebSocketConnector::new(&config).unwrap();
        assert_eq!(
            connector.stream_url("abc").unwrap().as_str(),
            "ws://localhost:4132/sessions/abc/stream"
        );
        assert_eq!(
            connector.stream_url("a/b#c").unwrap().as_str(),
            "ws://localhost:4132/sessions/a%2Fb%23c/stream"
        );
    }
}
