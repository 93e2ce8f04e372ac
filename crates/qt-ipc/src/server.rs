//! The Trader-side socket server: per-connection tasks, a string→handler
//! registry, heartbeat-driven eviction, and push broadcast to every live
//! client.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{read_frame, write_frame, Message, MessageType, ProtocolError, MAX_FRAME_LEN};

/// Seconds between client heartbeats; eviction fires at 4× this.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Idle ceiling before a connection is evicted.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
/// Cadence of the health sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Maps request op names to handler closures. Built once at Trader startup
/// by explicit `register` calls, then frozen behind an `Arc`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for one request op.
    pub fn register<F, Fut>(&mut self, op: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |data| Box::pin(handler(data)) as HandlerFuture);
        if self.handlers.insert(op.to_string(), wrapped).is_some() {
            warn!(op, "request handler replaced");
        }
    }

    pub fn get(&self, op: &str) -> Option<Handler> {
        self.handlers.get(op).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct Connection {
    conn_id: Uuid,
    outbound: mpsc::UnboundedSender<Message>,
    last_inbound: Mutex<Instant>,
    closed: Notify,
}

impl Connection {
    fn touch(&self) {
        *self.last_inbound.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_inbound.lock().elapsed()
    }
}

struct ServerState {
    account_id: String,
    registry: Arc<HandlerRegistry>,
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    max_frame: usize,
    heartbeat_timeout: Duration,
}

/// The socket server. One instance per Trader process; multiple Manager
/// clients may be connected at once.
pub struct SocketServer {
    state: Arc<ServerState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    socket_path: Mutex<Option<PathBuf>>,
}

impl SocketServer {
    pub fn new(account_id: &str, registry: Arc<HandlerRegistry>) -> Self {
        Self::with_heartbeat_timeout(account_id, registry, HEARTBEAT_TIMEOUT)
    }

    /// Override the eviction window. Tests shrink it to keep runtimes sane.
    pub fn with_heartbeat_timeout(
        account_id: &str,
        registry: Arc<HandlerRegistry>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                account_id: account_id.to_string(),
                registry,
                connections: RwLock::new(HashMap::new()),
                max_frame: MAX_FRAME_LEN,
                heartbeat_timeout,
            }),
            tasks: Mutex::new(Vec::new()),
            socket_path: Mutex::new(None),
        }
    }

    /// Bind a Unix domain socket and start serving. A stale socket file from
    /// a previous run is removed first.
    pub async fn serve_unix(&self, path: &std::path::Path) -> Result<(), ProtocolError> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "socket server listening");
        *self.socket_path.lock() = Some(path.to_path_buf());

        let state = self.state.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(state.clone(), stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        self.spawn_sweeper();
        self.tasks.lock().push(accept);
        Ok(())
    }

    /// Bind a TCP listener. Used by tests; the protocol is transport
    /// agnostic.
    pub async fn serve_tcp(&self, addr: &str) -> Result<std::net::SocketAddr, ProtocolError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(%local, "socket server listening (tcp)");

        let state = self.state.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(state.clone(), stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        self.spawn_sweeper();
        self.tasks.lock().push(accept);
        Ok(local)
    }

    fn spawn_sweeper(&self) {
        let state = self.state.clone();
        let sweeper = tokio::spawn(async move {
            let sweep = SWEEP_INTERVAL.min(state.heartbeat_timeout / 4).max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(sweep);
            loop {
                ticker.tick().await;
                let dead: Vec<Uuid> = state
                    .connections
                    .read()
                    .values()
                    .filter(|c| c.idle_for() > state.heartbeat_timeout)
                    .map(|c| c.conn_id)
                    .collect();
                for conn_id in dead {
                    if let Some(conn) = state.connections.write().remove(&conn_id) {
                        warn!(
                            %conn_id,
                            idle_secs = conn.idle_for().as_secs(),
                            "evicting connection after heartbeat timeout"
                        );
                        conn.closed.notify_waiters();
                    }
                }
            }
        });
        self.tasks.lock().push(sweeper);
    }

    /// Broadcast a push to every live connection. Returns how many
    /// connections accepted the frame for write.
    pub fn push(&self, kind: &str, payload: Value) -> usize {
        let message = Message::push(kind, payload);
        let connections = self.state.connections.read();
        let mut sent = 0;
        for conn in connections.values() {
            if conn.outbound.send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.read().len()
    }

    /// Stop serving: cancel tasks, drop connections, unlink the socket file.
    pub async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.connections.write().clear();
        if let Some(path) = self.socket_path.lock().take() {
            let _ = std::fs::remove_file(path);
        }
        info!("socket server stopped");
    }
}

async fn handle_connection<S>(state: Arc<ServerState>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = Uuid::new_v4();
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Single writer task per connection keeps frame writes serialized.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if write_frame(&mut write_half, &message).await.is_err() {
                break;
            }
        }
    });

    let conn = Arc::new(Connection {
        conn_id,
        outbound: outbound_tx,
        last_inbound: Mutex::new(Instant::now()),
        closed: Notify::new(),
    });
    state.connections.write().insert(conn_id, conn.clone());
    info!(%conn_id, "connection accepted");

    // First frame out is always the register push.
    let register = Message::push(
        "register",
        json!({"account_id": state.account_id, "conn_id": conn_id}),
    );
    let _ = conn.outbound.send(register);

    loop {
        tokio::select! {
            result = read_frame(&mut read_half, state.max_frame) => match result {
                Ok(message) => {
                    conn.touch();
                    process_message(&state, &conn, message).await;
                }
                Err(ProtocolError::Closed) => {
                    debug!(%conn_id, "peer closed connection");
                    break;
                }
                Err(ProtocolError::FrameTooLarge { len, max }) => {
                    warn!(%conn_id, len, max, "oversized frame, dropping connection");
                    break;
                }
                Err(e) => {
                    warn!(%conn_id, error = %e, "read failed");
                    break;
                }
            },
            // Eviction closes the connection by removing it from the set.
            _ = conn.closed.notified() => {
                debug!(%conn_id, "connection evicted");
                break;
            }
        }
    }

    state.connections.write().remove(&conn_id);
    writer.abort();
    info!(%conn_id, "connection closed");
}

async fn process_message(state: &Arc<ServerState>, conn: &Arc<Connection>, message: Message) {
    match message.msg_type {
        MessageType::Heartbeat => {
            let _ = conn.outbound.send(Message::heartbeat());
        }
        MessageType::Request => {
            let Some(request_id) = message.request_id else {
                warn!(conn_id = %conn.conn_id, "request without request_id dropped");
                return;
            };
            let Some(envelope) = message.envelope() else {
                let _ = conn
                    .outbound
                    .send(Message::response_err(request_id, "malformed request envelope"));
                return;
            };

            let reply = match state.registry.get(&envelope.kind) {
                Some(handler) => match handler(envelope.data).await {
                    Ok(data) => Message::response_ok(request_id, data),
                    Err(error) => Message::response_err(request_id, &error),
                },
                None => Message::response_err(
                    request_id,
                    &format!("unknown request type: {}", envelope.kind),
                ),
            };
            let _ = conn.outbound.send(reply);
        }
        MessageType::Push => {
            debug!(conn_id = %conn.conn_id, "inbound push ignored");
        }
        MessageType::Response => {
            debug!(conn_id = %conn.conn_id, "unexpected response frame ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    fn registry_with_echo() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", |data| async move { Ok(data) });
        registry.register("fail", |_data| async move {
            Err("handler exploded".to_string())
        });
        Arc::new(registry)
    }

    async fn connect(addr: std::net::SocketAddr) -> TcpStream {
        TcpStream::connect(addr).await.unwrap()
    }

    #[tokio::test]
    async fn register_push_arrives_first() {
        let server = SocketServer::new("ACC1", registry_with_echo());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();

        let mut stream = connect(addr).await;
        let first = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(first.msg_type, MessageType::Push);
        let envelope = first.envelope().unwrap();
        assert_eq!(envelope.kind, "register");
        assert_eq!(envelope.data["account_id"], "ACC1");

        server.stop().await;
    }

    #[tokio::test]
    async fn request_response_and_unknown_op() {
        let server = SocketServer::new("ACC1", registry_with_echo());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();

        let mut stream = connect(addr).await;
        let _register = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();

        let (req, id) = Message::request("echo", json!({"x": 1}));
        write_frame(&mut stream, &req).await.unwrap();
        let reply = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(reply.request_id, Some(id));
        assert_eq!(reply.status, Some(crate::ResponseStatus::Success));
        assert_eq!(reply.data.unwrap()["x"], 1);

        // Unknown op answers an error but keeps the connection alive.
        let (req, id) = Message::request("nope", Value::Null);
        write_frame(&mut stream, &req).await.unwrap();
        let reply = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(reply.request_id, Some(id));
        assert_eq!(reply.status, Some(crate::ResponseStatus::Error));

        // Still usable afterwards.
        let (req, _) = Message::request("echo", json!({"y": 2}));
        write_frame(&mut stream, &req).await.unwrap();
        let reply = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(reply.status, Some(crate::ResponseStatus::Success));

        server.stop().await;
    }

    #[tokio::test]
    async fn handler_error_becomes_error_response() {
        let server = SocketServer::new("ACC1", registry_with_echo());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();

        let mut stream = connect(addr).await;
        let _register = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();

        let (req, _) = Message::request("fail", Value::Null);
        write_frame(&mut stream, &req).await.unwrap();
        let reply = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(reply.status, Some(crate::ResponseStatus::Error));
        assert_eq!(reply.error.as_deref(), Some("handler exploded"));

        server.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_echoed() {
        let server = SocketServer::new("ACC1", registry_with_echo());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();

        let mut stream = connect(addr).await;
        let _register = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();

        write_frame(&mut stream, &Message::heartbeat()).await.unwrap();
        let reply = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Heartbeat);

        server.stop().await;
    }

    #[tokio::test]
    async fn silent_connection_evicted() {
        let server = SocketServer::with_heartbeat_timeout(
            "ACC1",
            registry_with_echo(),
            Duration::from_millis(100),
        );
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();

        let mut silent = connect(addr).await;
        let _ = read_frame(&mut silent, MAX_FRAME_LEN).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.connection_count(), 1);

        // No heartbeats: the sweep removes the connection and later pushes
        // reach nobody, without crashing the server.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.push("order", json!({})), 0);

        // The evicted peer sees EOF.
        let result = read_frame(&mut silent, MAX_FRAME_LEN).await;
        assert!(result.is_err());

        server.stop().await;
    }

    #[tokio::test]
    async fn heartbeats_keep_connection_alive() {
        let server = SocketServer::with_heartbeat_timeout(
            "ACC1",
            registry_with_echo(),
            Duration::from_millis(120),
        );
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();

        let mut stream = connect(addr).await;
        let _ = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            write_frame(&mut stream, &Message::heartbeat()).await.unwrap();
            let _ = read_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        }
        assert_eq!(server.connection_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn push_broadcasts_to_all_connections() {
        let server = SocketServer::new("ACC1", registry_with_echo());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        let _ = read_frame(&mut a, MAX_FRAME_LEN).await.unwrap();
        let _ = read_frame(&mut b, MAX_FRAME_LEN).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = server.push("order", json!({"order_id": "O1"}));
        assert_eq!(sent, 2);

        for stream in [&mut a, &mut b] {
            let push = read_frame(stream, MAX_FRAME_LEN).await.unwrap();
            assert_eq!(push.envelope().unwrap().kind, "order");
        }

        server.stop().await;
    }
}
