//! The Manager-side socket client: request/response with a pending-future
//! map, push dispatch, heartbeats, and an exponential-backoff reconnect
//! loop.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{
    read_frame, write_frame, Message, MessageType, ProtocolError, ResponseStatus, MAX_FRAME_LEN,
};
use crate::server::HEARTBEAT_INTERVAL;

/// Reconnect backoff: initial 3 s, ×1.5 per failure, capped at 60 s,
/// infinite attempts; a successful connect resets it.
const BACKOFF_INITIAL: Duration = Duration::from_secs(3);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Default ceiling on one request round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced by [`SocketClient::request`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not connected")]
    Disconnected,

    #[error("request timed out")]
    Timeout,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("registered account mismatch: expected {expected}, got {actual}")]
    RegisterMismatch { expected: String, actual: String },
}

/// Where the client dials.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

type PushFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// Invoked for every push: `(kind, payload)`.
pub type PushHandler = Arc<dyn Fn(String, Value) -> PushFuture + Send + Sync>;
/// Invoked after each successful (re)connect.
pub type ConnectHandler = Arc<dyn Fn() -> PushFuture + Send + Sync>;

struct ClientShared {
    account_id: String,
    endpoint: Endpoint,
    connected: AtomicBool,
    /// Permanent failure latch: set when the server registers a different
    /// account than expected.
    aborted: AtomicBool,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Result<Value, ClientError>>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    push_handler: RwLock<Option<PushHandler>>,
    on_connect: RwLock<Option<ConnectHandler>>,
    backoff: Mutex<Duration>,
}

impl ClientShared {
    fn fail_pending(&self, error: &str) {
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ClientError::Remote(error.to_string())));
        }
    }
}

/// IPC client fronting one Trader. Clone-cheap.
#[derive(Clone)]
pub struct SocketClient {
    shared: Arc<ClientShared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SocketClient {
    pub fn new(account_id: &str, endpoint: Endpoint) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                account_id: account_id.to_string(),
                endpoint,
                connected: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                push_handler: RwLock::new(None),
                on_connect: RwLock::new(None),
                backoff: Mutex::new(BACKOFF_INITIAL),
            }),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Install the push callback. Must be set before [`start`](Self::start).
    pub fn on_push<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.shared.push_handler.write() =
            Some(Arc::new(move |kind, data| Box::pin(handler(kind, data)) as PushFuture));
    }

    /// Install the on-connect callback, used to re-establish session state
    /// after a reconnect.
    pub fn on_connect<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.shared.on_connect.write() =
            Some(Arc::new(move || Box::pin(handler()) as PushFuture));
    }

    /// Start the connection manager. Runs until [`stop`](Self::stop).
    pub fn start(&self) {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                if shared.aborted.load(Ordering::SeqCst) {
                    break;
                }
                match Self::connect_once(&shared).await {
                    Ok(()) => {
                        // Session ended after a successful connect; reset
                        // the backoff before retrying.
                        *shared.backoff.lock() = BACKOFF_INITIAL;
                    }
                    Err(ClientError::RegisterMismatch { expected, actual }) => {
                        error!(%expected, %actual, "register mismatch, aborting client");
                        shared.aborted.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(_) => {}
                }
                shared.connected.store(false, Ordering::SeqCst);
                shared.fail_pending("connection lost");

                let delay = {
                    let mut backoff = shared.backoff.lock();
                    let current = *backoff;
                    *backoff = Duration::from_secs_f64(
                        (current.as_secs_f64() * BACKOFF_MULTIPLIER)
                            .min(BACKOFF_MAX.as_secs_f64()),
                    );
                    current
                };
                debug!(account_id = %shared.account_id, ?delay, "reconnecting after backoff");
                tokio::time::sleep(delay).await;
            }
        });
        self.tasks.lock().push(task);
    }

    async fn connect_once(shared: &Arc<ClientShared>) -> Result<(), ClientError> {
        match &shared.endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|_| ClientError::Disconnected)?;
                Self::run_session(shared, stream).await
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|_| ClientError::Disconnected)?;
                Self::run_session(shared, stream).await
            }
        }
    }

    /// Drive one connected session to completion. Returns `Ok(())` when the
    /// session ends after a successful register, `Err` when it never got
    /// established.
    async fn run_session<S>(shared: &Arc<ClientShared>, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // The register push must arrive first and match our account.
        let register = read_frame(&mut read_half, MAX_FRAME_LEN)
            .await
            .map_err(|_| ClientError::Disconnected)?;
        let envelope = register.envelope().filter(|e| e.kind == "register");
        let Some(envelope) = envelope else {
            warn!("first frame was not a register push");
            return Err(ClientError::Disconnected);
        };
        let actual = envelope.data["account_id"].as_str().unwrap_or("").to_string();
        if actual != shared.account_id {
            return Err(ClientError::RegisterMismatch {
                expected: shared.account_id.clone(),
                actual,
            });
        }

        info!(account_id = %shared.account_id, "connected to trader");
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        *shared.outbound.lock() = Some(outbound_tx.clone());
        *shared.backoff.lock() = BACKOFF_INITIAL;

        // Session state is re-established before the client reports
        // connected.
        let on_connect = shared.on_connect.read().clone();
        if let Some(on_connect) = on_connect {
            on_connect().await;
        }
        shared.connected.store(true, Ordering::SeqCst);

        // Writer: single consumer of the outbound queue.
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if write_frame(&mut write_half, &message).await.is_err() {
                    break;
                }
            }
        });

        // Heartbeats every 15 s keep us inside the server's 60 s window.
        let heartbeat_tx = outbound_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Message::heartbeat()).is_err() {
                    break;
                }
            }
        });

        // Read loop until EOF / error.
        loop {
            match read_frame(&mut read_half, MAX_FRAME_LEN).await {
                Ok(message) => Self::handle_inbound(shared, message).await,
                Err(ProtocolError::Closed) => {
                    info!(account_id = %shared.account_id, "trader closed connection");
                    break;
                }
                Err(e) => {
                    warn!(account_id = %shared.account_id, error = %e, "read failed");
                    break;
                }
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
        *shared.outbound.lock() = None;
        heartbeat.abort();
        writer.abort();
        Ok(())
    }

    async fn handle_inbound(shared: &Arc<ClientShared>, message: Message) {
        match message.msg_type {
            MessageType::Response => {
                let Some(request_id) = message.request_id else {
                    warn!("response without request_id dropped");
                    return;
                };
                let waiter = shared.pending.lock().remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let result = match message.status {
                            Some(ResponseStatus::Error) => Err(ClientError::Remote(
                                message.error.unwrap_or_else(|| "request failed".to_string()),
                            )),
                            _ => Ok(message.data.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(result);
                    }
                    // Late response after a local timeout: drop silently.
                    None => debug!(%request_id, "late response dropped"),
                }
            }
            MessageType::Push => {
                let Some(envelope) = message.envelope() else {
                    warn!("malformed push dropped");
                    return;
                };
                if envelope.kind == "register" {
                    return;
                }
                let handler = shared.push_handler.read().clone();
                if let Some(handler) = handler {
                    handler(envelope.kind, envelope.data).await;
                }
            }
            MessageType::Heartbeat => {}
            MessageType::Request => debug!("unexpected request frame ignored"),
        }
    }

    /// Send a request and await the correlated response.
    ///
    /// Fails fast with [`ClientError::Disconnected`] while the reconnect
    /// loop is between sessions. On timeout the pending entry is dropped so
    /// a late response cannot complete anything.
    pub async fn request(
        &self,
        op: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let outbound = {
            let guard = self.shared.outbound.lock();
            guard.clone()
        };
        let Some(outbound) = outbound else {
            return Err(ClientError::Disconnected);
        };

        let (message, request_id) = Message::request(op, payload);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id, tx);

        if outbound.send(message).is_err() {
            self.shared.pending.lock().remove(&request_id);
            return Err(ClientError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                warn!(op, %request_id, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Convenience wrapper matching the "null on failure" contract used by
    /// the proxy layer.
    pub async fn request_or_none(&self, op: &str, payload: Value) -> Option<Value> {
        self.request(op, payload, REQUEST_TIMEOUT).await.ok()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// True when the client latched a register mismatch and gave up.
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Stop reconnecting and drop the connection.
    pub async fn stop(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        *self.shared.outbound.lock() = None;
        self.shared.fail_pending("client stopped");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{HandlerRegistry, SocketServer};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn echo_registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", |data| async move { Ok(data) });
        registry.register("slow", |data| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(data)
        });
        registry.register("fail", |_| async move { Err("nope".to_string()) });
        Arc::new(registry)
    }

    async fn started_client(addr: std::net::SocketAddr, account_id: &str) -> SocketClient {
        let client = SocketClient::new(account_id, Endpoint::Tcp(addr.to_string()));
        client.start();
        for _ in 0..100 {
            if client.is_connected() || client.is_aborted() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client
    }

    #[tokio::test]
    async fn request_round_trip() {
        let server = SocketServer::new("ACC1", echo_registry());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();
        let client = started_client(addr, "ACC1").await;
        assert!(client.is_connected());

        let result = client
            .request("echo", json!({"k": "v"}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result["k"], "v");

        let err = client
            .request("fail", Value::Null, REQUEST_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref m) if m == "nope"));

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn timeout_drops_pending_and_ignores_late_response() {
        let server = SocketServer::new("ACC1", echo_registry());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();
        let client = started_client(addr, "ACC1").await;

        let err = client
            .request("slow", json!({"n": 1}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert!(client.shared.pending.lock().is_empty());

        // The late response arrives ~250 ms later and must be dropped
        // without disturbing a fresh request.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let result = client
            .request("echo", json!({"n": 2}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result["n"], 2);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn register_mismatch_aborts() {
        let server = SocketServer::new("OTHER", echo_registry());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();
        let client = started_client(addr, "ACC1").await;

        assert!(client.is_aborted());
        assert!(!client.is_connected());

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn disconnected_request_fails_fast() {
        let client = SocketClient::new("ACC1", Endpoint::Tcp("127.0.0.1:1".to_string()));
        let err = client
            .request("echo", Value::Null, REQUEST_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Disconnected));
        assert!(client.request_or_none("echo", Value::Null).await.is_none());
    }

    #[tokio::test]
    async fn reconnects_after_server_restart() {
        let registry = echo_registry();
        let server = SocketServer::new("ACC1", registry.clone());
        let addr = server.serve_tcp("127.0.0.1:0").await.unwrap();

        let reconnects = Arc::new(AtomicUsize::new(0));
        let client = SocketClient::new("ACC1", Endpoint::Tcp(addr.to_string()));
        let counter = reconnects.clone();
        client.on_connect(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.start();
        for _ in 0..100 {
            if client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);

        // Kill the server; client should notice and fail fast.
        server.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!client.is_connected());
        assert!(matches!(
            client.request("echo", Value::Null, REQUEST_TIMEOUT).await,
            Err(ClientError::Disconnected)
        ));

        // Restart on the same port; backoff (3 s initial) brings it back.
        let server2 = SocketServer::new("ACC1", registry);
        let _ = server2.serve_tcp(&addr.to_string()).await.unwrap();
        for _ in 0..500 {
            if client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(client.is_connected());
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);

        let result = client
            .request("echo", json!({"back": true}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result["back"], true);

        client.stop().await;
        server2.stop().await;
    }
}
