//! Websocket transport for the Substrate connector.
//!
//! The connector never touches a socket directly: it talks to a [`Socket`],
//! a pair of text-frame channels. [`WsSocketConnector`] backs that pair with
//! a real websocket; tests substitute an in-process node.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::ConnectorError;

/// An open text-frame duplex. Dropping `tx` closes the connection; `rx`
/// yields `None` once the remote side is gone.
#[derive(Debug)]
pub struct Socket {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

/// Opens sockets to endpoint URLs.
#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Socket, ConnectorError>;
}

/// [`SocketConnector`] over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsSocketConnector;

#[async_trait]
impl SocketConnector for WsSocketConnector {
    async fn open(&self, url: &str) -> Result<Socket, ConnectorError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| ConnectorError::Transport(format!("Connect to {url} failed: {e}")))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let endpoint = url.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(endpoint = %endpoint, "Write failed: {e}");
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let endpoint = url.to_string();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(endpoint = %endpoint, "Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => {
                        debug!(endpoint = %endpoint, "Remote closed the socket");
                        break;
                    }
                    Ok(_) => continue, // ping/pong are answered by tungstenite
                    Err(e) => {
                        debug!(endpoint = %endpoint, "Read error: {e}");
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
        });

        Ok(Socket {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn echoes_through_a_real_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                } else if msg.is_close() {
                    break;
                }
            }
        });

        let mut socket = WsSocketConnector.open(&format!("ws://{addr}")).await.unwrap();
        socket.tx.send(r#"{"id":1}"#.to_string()).unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), socket.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, r#"{"id":1}"#);
    }

    #[tokio::test]
    async fn remote_close_ends_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
        });

        let mut socket = WsSocketConnector.open(&format!("ws://{addr}")).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), socket.rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WsSocketConnector.open(&format!("ws://{addr}")).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Transport(_)));
    }
}
