//! Typed async pub/sub used inside each qtrader process.
//!
//! Gateway callbacks, the executor, the persistence writer, and the IPC push
//! path all meet here: producers [`EventEngine::emit`] events, a dispatcher
//! task drains the queue and invokes every registered handler. Within one
//! event type, handlers run in registration order; a failing handler is
//! logged and never kills the engine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use qt_types::{Account, AlarmData, Bar, Order, Position, Tick, Trade};

/// The fixed event set a trader process publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AccountUpdate,
    OrderUpdate,
    TradeUpdate,
    PositionUpdate,
    TickUpdate,
    BarUpdate,
    AccountStatus,
    AlarmUpdate,
}

/// Payload of an event. Variants mirror [`EventType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Account(Account),
    Order(Order),
    Trade(Trade),
    Position(Position),
    Tick(Tick),
    Bar(Bar),
    Alarm(AlarmData),
    /// Connection/pause status and other loosely shaped payloads.
    Raw(serde_json::Value),
}

/// A single event flowing through the engine.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub data: Arc<EventData>,
}

impl Event {
    pub fn new(event_type: EventType, data: EventData) -> Self {
        Self {
            event_type,
            data: Arc::new(data),
        }
    }
}

/// A subscriber. Errors are logged by the dispatcher; they never propagate.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in dispatch error logs.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<(), String>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> BoxedHandlerFuture + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), String> {
        (self.func)(event.clone()).await
    }
}

/// The engine itself. Cheap to clone; all clones share one queue and one
/// handler table.
#[derive(Clone)]
pub struct EventEngine {
    tx: mpsc::UnboundedSender<Event>,
    handlers: Arc<RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>>,
    dispatcher: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl EventEngine {
    /// Create the engine and start its dispatcher task.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers: Arc<RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let engine = Self {
            tx,
            handlers: handlers.clone(),
            dispatcher: Arc::new(RwLock::new(None)),
        };
        let task = tokio::spawn(Self::dispatch_loop(rx, handlers));
        *engine.dispatcher.write() = Some(task);
        engine
    }

    async fn dispatch_loop(
        mut rx: mpsc::UnboundedReceiver<Event>,
        handlers: Arc<RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>>,
    ) {
        while let Some(event) = rx.recv().await {
            let subscribers: Vec<Arc<dyn EventHandler>> = handlers
                .read()
                .get(&event.event_type)
                .map(|v| v.to_vec())
                .unwrap_or_default();

            for handler in subscribers {
                if let Err(message) = handler.handle(&event).await {
                    error!(
                        handler = handler.name(),
                        event_type = ?event.event_type,
                        %message,
                        "event handler failed"
                    );
                }
            }
        }
        debug!("event dispatcher drained and stopped");
    }

    /// Subscribe a handler. Handlers for one event type are invoked in the
    /// order they were registered.
    pub fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Subscribe an async closure.
    pub fn register_fn<F, Fut>(&self, event_type: EventType, name: &str, func: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler = FnHandler {
            name: name.to_string(),
            func: move |event| Box::pin(func(event)) as BoxedHandlerFuture,
        };
        self.register(event_type, Arc::new(handler));
    }

    /// Enqueue an event. Never blocks; the dispatcher drains in order.
    pub fn emit(&self, event_type: EventType, data: EventData) {
        if self.tx.send(Event::new(event_type, data)).is_err() {
            warn!(?event_type, "event engine stopped, event dropped");
        }
    }

    /// Stop the dispatcher. Events already queued get a short grace period
    /// to drain before the task is aborted.
    pub async fn stop(&self) {
        let task = self.dispatcher.write().take();
        if let Some(task) = task {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            task.abort();
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn handlers_fire_in_registration_order() {
        let engine = EventEngine::start();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            engine.register_fn(EventType::TickUpdate, tag, move |_event| {
                let seen = seen.clone();
                async move {
                    seen.lock().await.push(tag);
                    Ok(())
                }
            });
        }

        engine.emit(
            EventType::TickUpdate,
            EventData::Raw(serde_json::json!({"n": 1})),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().await, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_dispatch() {
        let engine = EventEngine::start();
        let count = Arc::new(AtomicUsize::new(0));

        engine.register_fn(EventType::OrderUpdate, "bad", |_event| async {
            Err("boom".to_string())
        });
        let count2 = count.clone();
        engine.register_fn(EventType::OrderUpdate, "good", move |_event| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for _ in 0..3 {
            engine.emit(
                EventType::OrderUpdate,
                EventData::Raw(serde_json::Value::Null),
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_cross_type_delivery() {
        let engine = EventEngine::start();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        engine.register_fn(EventType::TradeUpdate, "trades-only", move |_event| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        engine.emit(
            EventType::TickUpdate,
            EventData::Raw(serde_json::Value::Null),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
