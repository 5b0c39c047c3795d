use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt, future},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::debug,
};

use {
    super::{Connection, Connector, WireMessage},
    crate::{Error, Result},
};

/// WebSocket connector for `ws://` and `wss://` gateway URLs.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: url::Url,
}

impl WsConnector {
    pub fn new(url: &str) -> Result<Self> {
        let url = url::Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(Error::transport(format!(
                "unsupported gateway scheme {other}, expected ws or wss"
            ))),
        }
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection> {
        let (ws, response) = connect_async(self.url.as_str()).await?;
        debug!(url = %self.url, status = %response.status(), "websocket upgraded");

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(Error::from)
            .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text.into()))));
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text.as_str().to_owned()))),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "gateway sent close frame");
                    None
                },
                Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                    Some(Ok(WireMessage::Keepalive))
                },
                Err(e) => Some(Err(Error::from(e))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_websocket_schemes() {
        assert!(WsConnector::new("ws://127.0.0.1:18789").is_ok());
        let wss = WsConnector::new("wss://gateway.example/ws").unwrap();
        assert_eq!(wss.endpoint(), "wss://gateway.example/ws");
    }

    #[test]
    fn rejects_http_scheme() {
        let err = WsConnector::new("http://127.0.0.1:18789").unwrap_err();
        assert!(err.to_string().contains("unsupported gateway scheme"));
    }

    #[test]
    fn rejects_garbage_url() {
        assert!(matches!(WsConnector::new("not a url"), Err(Error::Url(_))));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connector = WsConnector::new(&format!("ws://127.0.0.1:{port}")).unwrap();
        assert!(connector.connect().await.is_err());
    }
}
