//! Mock WebSocket server for integration tests.
//!
//! Provides a simple WebSocket server that can:
//! - Accept connections and answer correlated JSON-RPC requests
//! - Go silent (never reply) for timeout scenarios
//! - Push frames to connected clients
//! - Drop all live connections to exercise reconnection

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

enum ServerPush {
    Frame(Message),
    Drop,
}

/// A mock WebSocket server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    messages: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
    silent: Arc<AtomicBool>,
    pushers: Arc<Mutex<Vec<mpsc::Sender<ServerPush>>>>,
}

impl MockWsServer {
    /// Start a new mock WebSocket server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let silent = Arc::new(AtomicBool::new(false));
        let pushers: Arc<Mutex<Vec<mpsc::Sender<ServerPush>>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let silent_clone = silent.clone();
        let pushers_clone = pushers.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        let (push_tx, push_rx) = mpsc::channel(32);
                        pushers_clone.lock().await.push(push_tx);
                        tokio::spawn(handle_connection(
                            stream,
                            messages_clone.clone(),
                            connections_clone.clone(),
                            silent_clone.clone(),
                            push_rx,
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            messages,
            connections,
            silent,
            pushers,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Get the number of connections received.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    /// Get all received text messages.
    pub async fn received_messages(&self) -> Vec<String> {
        self.messages.lock().await.iter().cloned().collect()
    }

    /// Forget everything received so far.
    pub async fn clear_messages(&self) {
        self.messages.lock().await.clear();
    }

    /// When silent, the server records requests but never replies.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Push a text frame to every live connection.
    pub async fn broadcast(&self, text: impl Into<String>) {
        let text = text.into();
        let pushers = self.pushers.lock().await;
        for tx in pushers.iter() {
            let _ = tx.send(ServerPush::Frame(Message::Text(text.clone()))).await;
        }
    }

    /// Abruptly drop every live connection (no close frame).
    pub async fn drop_connections(&self) {
        let mut pushers = self.pushers.lock().await;
        for tx in pushers.drain(..) {
            let _ = tx.send(ServerPush::Drop).await;
        }
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    messages: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
    silent: Arc<AtomicBool>,
    mut push_rx: mpsc::Receiver<ServerPush>,
) {
    {
        let mut count = connections.lock().await;
        *count += 1;
    }

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    {
                        let mut msgs = messages.lock().await;
                        msgs.push_back(text.clone());
                    }
                    if silent.load(Ordering::SeqCst) {
                        continue;
                    }

                    // Answer any correlated request with a success reply.
                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                        if let Some(id) = parsed.get("id") {
                            let response = serde_json::json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "result": "ok"
                            });
                            let _ = write.send(Message::Text(response.to_string())).await;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            push = push_rx.recv() => match push {
                Some(ServerPush::Frame(frame)) => {
                    let _ = write.send(frame).await;
                }
                // Drop the socket without a close frame
                Some(ServerPush::Drop) | None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockWsServer::start().await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        server.shutdown().await;
    }
}
