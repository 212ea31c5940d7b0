// In-process push server for channel tests.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use reelup_core::ChannelConfig;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

pub const TOKEN: &str = "test-token";
const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("reelup_channel=debug")
        .with_test_writer()
        .try_init();
}

pub fn config_for(url: &str) -> ChannelConfig {
    ChannelConfig {
        url: url.to_string(),
        reconnect_delays_ms: vec![20, 40, 80],
        connect_timeout_ms: 1_000,
    }
}

/// Accepts websocket clients and hands each connection to the test.
pub struct PushServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl PushServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut auth = None;
                    let callback = |request: &Request,
                                    response: Response|
                     -> Result<Response, ErrorResponse> {
                        auth = request
                            .headers()
                            .get("authorization")
                            .and_then(|value| value.to_str().ok())
                            .map(String::from);
                        Ok(response)
                    };
                    let accepted = accept_hdr_async(stream, callback).await;
                    if let Ok(ws) = accepted {
                        let _ = tx.send(ServerConnection { auth, ws });
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}/ws"),
            connections,
        }
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> ServerConnection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }
}

pub struct ServerConnection {
    pub auth: Option<String>,
    ws: WebSocketStream<TcpStream>,
}

impl ServerConnection {
    /// Next text frame from the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> serde_json::Value {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("client closed the socket")
                .expect("read failed");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Assert the client sends no text frame for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(Some(Ok(Message::Text(text)))) = timeout(quiet, self.ws.next()).await {
            panic!("unexpected frame: {text}");
        }
    }

    /// Wait until the client closes the socket.
    pub async fn expect_closed(&mut self) {
        loop {
            match timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for close")
            {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn send_json(&mut self, value: serde_json::Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }
}

/// A websocket URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/ws")
}
