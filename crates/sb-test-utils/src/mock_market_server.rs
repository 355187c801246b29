// mock_market_server: A mock market-data WebSocket server for testing the
// bridge client.
//
// Accepts connections on ws://127.0.0.1:<port>, records every client text
// message (the bridge's SUBSCRIBE control frame arrives first), and lets the
// test body push frames to connected clients or drop them to exercise the
// reconnect path.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Debug, Clone)]
enum ServerCommand {
    Frame(String),
    Close,
}

/// A mock market-data WebSocket server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound address.  Each test
/// can spin up its own isolated server instance; dropping the server aborts
/// the accept loop and releases the port, so later dials are refused.
pub struct MockMarketServer {
    addr: SocketAddr,
    commands: broadcast::Sender<ServerCommand>,
    client_messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl MockMarketServer {
    /// Bind to an OS-assigned port and begin accepting connections.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (commands, _) = broadcast::channel(64);
        let client_messages = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));

        let task = {
            let commands = commands.clone();
            let client_messages = Arc::clone(&client_messages);
            let connections = Arc::clone(&connections);
            let pings = Arc::clone(&pings);
            tokio::spawn(async move {
                Self::accept_loop(listener, commands, client_messages, connections, pings).await;
            })
        };

        Ok(Self {
            addr,
            commands,
            client_messages,
            connections,
            pings,
            task,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL for the bridge config.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a text frame to every connected client.
    pub fn push_frame(&self, json: &str) {
        let _ = self.commands.send(ServerCommand::Frame(json.to_owned()));
    }

    /// Close every current connection from the server side.
    pub fn drop_clients(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }

    /// Shut the server down entirely; subsequent dials are refused.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    /// Every text message received from clients, in arrival order.
    pub fn client_messages(&self) -> Vec<String> {
        self.client_messages.lock().unwrap().clone()
    }

    /// Total connections accepted since start (reconnects included).
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Protocol pings received from clients.
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` connections were accepted.
    pub async fn wait_for_connections(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<(), Box<dyn std::error::Error>> {
        wait_until(timeout, || self.connection_count() >= count)
            .await
            .map_err(|()| format!("timed out waiting for {count} connections").into())
    }

    /// Poll until at least `count` client messages were recorded.
    pub async fn wait_for_client_messages(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<(), Box<dyn std::error::Error>> {
        wait_until(timeout, || self.client_messages.lock().unwrap().len() >= count)
            .await
            .map_err(|()| format!("timed out waiting for {count} client messages").into())
    }

    // -- internal --

    async fn accept_loop(
        listener: TcpListener,
        commands: broadcast::Sender<ServerCommand>,
        client_messages: Arc<Mutex<Vec<String>>>,
        connections: Arc<AtomicUsize>,
        pings: Arc<AtomicUsize>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let commands = commands.subscribe();
                    let client_messages = Arc::clone(&client_messages);
                    let pings = Arc::clone(&pings);
                    tokio::spawn(async move {
                        // Connection errors are expected in tests (clients
                        // drop mid-conversation); swallow them.
                        let _ =
                            Self::handle_connection(stream, commands, client_messages, pings).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        mut commands: broadcast::Receiver<ServerCommand>,
        client_messages: Arc<Mutex<Vec<String>>>,
        pings: Arc<AtomicUsize>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Ok(ServerCommand::Frame(text)) => {
                        write.send(Message::Text(text.into())).await?;
                    }
                    Ok(ServerCommand::Close) => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                msg = read.next() => match msg {
                    None => break,
                    Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => {
                        client_messages.lock().unwrap().push(text.to_string());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        pings.fetch_add(1, Ordering::SeqCst);
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        Ok(())
    }
}

impl Drop for MockMarketServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> Result<(), ()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(())
}
