//! The OrderCmd executor: drives one high-level directive ("move N lots of
//! S") to completion through split child orders, per-slice timeouts,
//! cancels, retries, and partial-fill accounting against the gateway.
//!
//! Each submitted cmd runs as its own state machine on its own task; the
//! executor routes order-update events to the owning cmd by child order id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use qt_gateway::{Gateway, GatewayError};
use qt_types::{
    CancelRequest, CmdStatus, Direction, FinishReason, Order, OrderCmdRequest, OrderCmdStatus,
    OrderRequest, OrderStatus,
};

use crate::risk::RiskControl;

/// Consecutive insert failures tolerated before a cmd dies with `ERROR`.
const MAX_INSERT_ERRORS: u32 = 3;
/// Grace period to observe the terminal order update after a cancel.
const CANCEL_QUIESCE: Duration = Duration::from_secs(2);

/// Invoked on every status transition of a cmd, terminal included.
pub type CmdCallback = Arc<dyn Fn(OrderCmdStatus) + Send + Sync>;

struct CmdHandle {
    status: Mutex<OrderCmdStatus>,
    updates: mpsc::UnboundedSender<Order>,
    cancel_requested: AtomicBool,
    cancel: Notify,
    on_change: Option<CmdCallback>,
}

impl CmdHandle {
    fn snapshot(&self) -> OrderCmdStatus {
        self.status.lock().clone()
    }

    fn notify_change(&self) {
        if let Some(on_change) = &self.on_change {
            on_change(self.snapshot());
        }
    }
}

struct ExecutorInner {
    gateway: Arc<dyn Gateway>,
    risk: Arc<RiskControl>,
    cmds: RwLock<HashMap<Uuid, Arc<CmdHandle>>>,
    /// child order id → owning cmd.
    order_index: RwLock<HashMap<String, Uuid>>,
}

/// The executor. Clone-cheap; shared between the Trader shell, the rotation
/// engine, and strategies.
#[derive(Clone)]
pub struct OrderCmdExecutor {
    inner: Arc<ExecutorInner>,
}

impl OrderCmdExecutor {
    pub fn new(gateway: Arc<dyn Gateway>, risk: Arc<RiskControl>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                gateway,
                risk,
                cmds: RwLock::new(HashMap::new()),
                order_index: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Submit a cmd and return its id. The driver task starts immediately.
    pub fn submit(&self, request: OrderCmdRequest, on_change: Option<CmdCallback>) -> Uuid {
        let cmd_id = Uuid::new_v4();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let status = OrderCmdStatus {
            cmd_id,
            symbol: request.symbol.clone(),
            direction: request.direction,
            offset: request.offset,
            volume: request.volume,
            filled_volume: 0,
            price: request.price,
            status: CmdStatus::Pending,
            finish_reason: None,
            source: request.source.clone(),
            started_at: None,
            finished_at: None,
            order_ids: Vec::new(),
        };
        let handle = Arc::new(CmdHandle {
            status: Mutex::new(status),
            updates: updates_tx,
            cancel_requested: AtomicBool::new(false),
            cancel: Notify::new(),
            on_change,
        });
        self.inner.cmds.write().insert(cmd_id, handle.clone());
        info!(
            %cmd_id,
            symbol = %request.symbol,
            volume = request.volume,
            source = %request.source,
            "order cmd submitted"
        );

        let inner = self.inner.clone();
        tokio::spawn(drive_cmd(inner, cmd_id, request, handle, updates_rx));
        cmd_id
    }

    /// Request cancellation. The cmd terminates once its live child
    /// quiesces. Returns false for unknown or already-finished cmds.
    pub fn cancel(&self, cmd_id: Uuid) -> bool {
        let handle = self.inner.cmds.read().get(&cmd_id).cloned();
        match handle {
            Some(handle) if handle.snapshot().is_active() => {
                handle.cancel_requested.store(true, Ordering::SeqCst);
                handle.cancel.notify_one();
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, cmd_id: Uuid) -> Option<OrderCmdStatus> {
        self.inner.cmds.read().get(&cmd_id).map(|h| h.snapshot())
    }

    /// All cmds ever submitted this session, newest last.
    pub fn all_statuses(&self) -> Vec<OrderCmdStatus> {
        let mut statuses: Vec<OrderCmdStatus> = self
            .inner
            .cmds
            .read()
            .values()
            .map(|h| h.snapshot())
            .collect();
        statuses.sort_by_key(|s| s.started_at);
        statuses
    }

    /// Route a gateway order update to the owning cmd, if any.
    pub fn on_order_update(&self, order: &Order) {
        let cmd_id = self.inner.order_index.read().get(&order.order_id).copied();
        if let Some(cmd_id) = cmd_id {
            if let Some(handle) = self.inner.cmds.read().get(&cmd_id) {
                let _ = handle.updates.send(order.clone());
            }
        }
    }
}

/// Outcome of waiting on one child order.
enum ChildOutcome {
    /// Child reached a terminal state; `executed` lots traded.
    Done { executed: i64, rejected: bool },
    /// External cancel arrived; child has quiesced with `executed` lots.
    CancelRequested { executed: i64 },
    /// Total timeout hit; child has quiesced with `executed` lots.
    TotalTimeout { executed: i64 },
}

async fn drive_cmd(
    inner: Arc<ExecutorInner>,
    cmd_id: Uuid,
    request: OrderCmdRequest,
    handle: Arc<CmdHandle>,
    mut updates_rx: mpsc::UnboundedReceiver<Order>,
) {
    let started = Instant::now();
    let deadline = started + Duration::from_secs_f64(request.total_timeout.max(0.1));
    {
        let mut status = handle.status.lock();
        status.status = CmdStatus::Running;
        status.started_at = Some(Utc::now());
    }
    handle.notify_change();

    let mut filled: i64 = 0;
    let mut insert_errors: u32 = 0;
    let finish_reason;

    'outer: loop {
        let remaining = request.volume - filled;
        if remaining <= 0 {
            finish_reason = FinishReason::AllCompleted;
            break;
        }
        if Instant::now() >= deadline {
            finish_reason = FinishReason::PartialTimeout;
            break;
        }

        // A cancel between slices needs no quiescing.
        if cancel_pending(&handle) {
            finish_reason = FinishReason::Cancelled;
            break;
        }

        let slice = remaining.min(request.max_volume_per_order.max(1));
        if let Err(reason) = inner.risk.check_order(slice).into_result() {
            warn!(%cmd_id, %reason, "slice blocked by risk control");
            finish_reason = FinishReason::Error;
            break;
        }
        let limit_price = resolve_price(&inner, &request, request.direction);

        let order = match inner
            .gateway
            .send_order(OrderRequest {
                symbol: request.symbol.clone(),
                direction: request.direction,
                offset: request.offset,
                volume: slice,
                price: limit_price,
            })
            .await
        {
            Ok(order) => {
                inner.risk.on_order_inserted();
                insert_errors = 0;
                order
            }
            Err(e) => {
                insert_errors += 1;
                warn!(%cmd_id, error = %e, attempt = insert_errors, "slice insert failed");
                if insert_errors >= MAX_INSERT_ERRORS {
                    finish_reason = FinishReason::Error;
                    break 'outer;
                }
                tokio::time::sleep(Duration::from_secs_f64(request.order_interval.max(0.05)))
                    .await;
                continue;
            }
        };

        inner
            .order_index
            .write()
            .insert(order.order_id.clone(), cmd_id);
        {
            let mut status = handle.status.lock();
            status.order_ids.push(order.order_id.clone());
        }
        debug!(%cmd_id, order_id = %order.order_id, slice, "slice inserted");

        let outcome = wait_child(
            &inner,
            &handle,
            &mut updates_rx,
            &order,
            Duration::from_secs_f64(request.order_timeout.max(0.05)),
            deadline,
        )
        .await;

        match outcome {
            ChildOutcome::Done { executed, rejected } => {
                filled += executed;
                sync_filled(&handle, filled);
                if rejected && filled == 0 {
                    finish_reason = FinishReason::Error;
                    break;
                }
            }
            ChildOutcome::CancelRequested { executed } => {
                filled += executed;
                sync_filled(&handle, filled);
                finish_reason = FinishReason::Cancelled;
                break;
            }
            ChildOutcome::TotalTimeout { executed } => {
                filled += executed;
                sync_filled(&handle, filled);
                finish_reason = FinishReason::PartialTimeout;
                break;
            }
        }
    }

    let final_reason = if finish_reason == FinishReason::PartialTimeout && filled >= request.volume
    {
        FinishReason::AllCompleted
    } else {
        finish_reason
    };
    {
        let mut status = handle.status.lock();
        status.filled_volume = filled;
        status.status = CmdStatus::Finished;
        status.finish_reason = Some(final_reason);
        status.finished_at = Some(Utc::now());
    }
    info!(%cmd_id, ?final_reason, filled, volume = request.volume, "order cmd finished");
    handle.notify_change();
}

fn sync_filled(handle: &CmdHandle, filled: i64) {
    handle.status.lock().filled_volume = filled;
}

fn cancel_pending(handle: &CmdHandle) -> bool {
    handle.cancel_requested.load(Ordering::SeqCst)
}

fn resolve_price(inner: &ExecutorInner, request: &OrderCmdRequest, direction: Direction) -> f64 {
    match request.price {
        Some(price) if price > 0.0 => price,
        // No caller price: take the opposite-side best quote; 0 falls back
        // to a market order at the gateway.
        _ => inner
            .gateway
            .get_quotes()
            .get(&request.symbol)
            .map(|tick| tick.opposite_price(direction))
            .unwrap_or(0.0),
    }
}

/// Wait for one child to quiesce: terminal update, per-slice timeout
/// (cancel, then re-check), external cancel, or total timeout.
async fn wait_child(
    inner: &Arc<ExecutorInner>,
    handle: &Arc<CmdHandle>,
    updates_rx: &mut mpsc::UnboundedReceiver<Order>,
    child: &Order,
    order_timeout: Duration,
    deadline: Instant,
) -> ChildOutcome {
    let slice_deadline = Instant::now() + order_timeout;
    let mut latest: Order = child.clone();

    loop {
        tokio::select! {
            update = updates_rx.recv() => {
                let Some(update) = update else {
                    // Executor dropped; treat as quiesced.
                    return ChildOutcome::Done { executed: executed_of(&latest), rejected: false };
                };
                if update.order_id != child.order_id {
                    continue;
                }
                latest = update;
                if latest.status.is_terminal() {
                    let rejected = latest.status == OrderStatus::Rejected
                        || (latest.status == OrderStatus::Finished
                            && latest.volume_left == latest.volume
                            && !latest.status_msg.is_empty());
                    return ChildOutcome::Done { executed: executed_of(&latest), rejected };
                }
            }
            _ = handle.cancel.notified() => {
                let executed = cancel_and_quiesce(inner, updates_rx, &mut latest).await;
                return ChildOutcome::CancelRequested { executed };
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(slice_deadline)) => {
                // Slice stalled: cancel it, then count whatever the gateway
                // reports — the cancel may race a fill.
                debug!(order_id = %child.order_id, "slice timeout, cancelling");
                let executed = cancel_and_quiesce(inner, updates_rx, &mut latest).await;
                return ChildOutcome::Done { executed, rejected: false };
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                let executed = cancel_and_quiesce(inner, updates_rx, &mut latest).await;
                return ChildOutcome::TotalTimeout { executed };
            }
        }
    }
}

fn executed_of(order: &Order) -> i64 {
    order.volume - order.volume_left
}

/// Issue a cancel for `latest` and wait for its terminal update (bounded).
/// A cancel that fails because the order already completed is not an error;
/// the latest gateway snapshot decides the executed volume either way.
async fn cancel_and_quiesce(
    inner: &Arc<ExecutorInner>,
    updates_rx: &mut mpsc::UnboundedReceiver<Order>,
    latest: &mut Order,
) -> i64 {
    if !latest.status.is_terminal() {
        match inner
            .gateway
            .cancel_order(CancelRequest {
                order_id: latest.order_id.clone(),
            })
            .await
        {
            Ok(()) => inner.risk.on_order_cancelled(),
            Err(GatewayError::OrderNotFound { .. }) => {}
            Err(e) => debug!(order_id = %latest.order_id, error = %e, "cancel failed"),
        }
    }

    let quiesce_deadline = Instant::now() + CANCEL_QUIESCE;
    while !latest.status.is_terminal() {
        let remaining = quiesce_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, updates_rx.recv()).await {
            Ok(Some(update)) if update.order_id == latest.order_id => *latest = update,
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => break,
        }
    }

    // Re-check the gateway's latest word in case the terminal update raced
    // past the channel.
    if !latest.status.is_terminal() {
        if let Some(snapshot) = inner.gateway.get_orders().get(&latest.order_id) {
            *latest = snapshot.clone();
        }
    }
    executed_of(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qt_gateway::{SimBehavior, SimGateway};
    use qt_types::{Offset, RiskControlConfig, Symbol};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rb() -> Symbol {
        "SHFE.rb2505".parse().unwrap()
    }

    fn request(volume: i64, max_per_order: i64, order_timeout: f64, total: f64) -> OrderCmdRequest {
        OrderCmdRequest {
            symbol: rb(),
            direction: Direction::Buy,
            offset: Offset::Open,
            volume,
            price: Some(3500.0),
            max_volume_per_order: max_per_order,
            order_interval: 0.05,
            total_timeout: total,
            order_timeout,
            source: "test".to_string(),
        }
    }

    async fn executor_with(gateway: &SimGateway) -> OrderCmdExecutor {
        let risk = Arc::new(RiskControl::new(RiskControlConfig::default()));
        let executor = OrderCmdExecutor::new(Arc::new(gateway.clone()), risk);

        // Wire gateway order callbacks straight into the executor, the way
        // the trader shell does through the event engine.
        struct Router(OrderCmdExecutor);
        #[async_trait::async_trait]
        impl qt_gateway::GatewayCallback for Router {
            async fn on_order(&self, order: Order) {
                self.0.on_order_update(&order);
            }
        }
        gateway.register_callback(Arc::new(Router(executor.clone())));
        gateway.connect().await.unwrap();
        executor
    }

    async fn wait_finished(executor: &OrderCmdExecutor, cmd_id: Uuid, secs: f64) -> OrderCmdStatus {
        let deadline = Instant::now() + Duration::from_secs_f64(secs);
        loop {
            let status = executor.status(cmd_id).unwrap();
            if status.status == CmdStatus::Finished {
                return status;
            }
            assert!(Instant::now() < deadline, "cmd did not finish in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn single_slice_success() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;

        let cmd_id = executor.submit(request(3, 10, 5.0, 30.0), None);
        let status = wait_finished(&executor, cmd_id, 5.0).await;

        assert_eq!(status.finish_reason, Some(FinishReason::AllCompleted));
        assert_eq!(status.filled_volume, 3);
        assert_eq!(status.order_ids.len(), 1);
    }

    #[tokio::test]
    async fn split_partial_then_timeout_then_completion() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;

        // Slice 1 (5) fills; slice 2 fills 3 of 5 then stalls until the
        // executor cancels it; slice 3 (4) fills.
        gateway.script(
            &rb(),
            vec![
                SimBehavior::FillAfter {
                    delay: Duration::from_millis(20),
                },
                SimBehavior::PartialThenStall {
                    fill: 3,
                    delay: Duration::from_millis(20),
                },
                SimBehavior::FillAfter {
                    delay: Duration::from_millis(20),
                },
            ],
        );

        let cmd_id = executor.submit(request(12, 5, 0.3, 30.0), None);
        let status = wait_finished(&executor, cmd_id, 10.0).await;

        assert_eq!(status.finish_reason, Some(FinishReason::AllCompleted));
        assert_eq!(status.filled_volume, 12);
        assert_eq!(status.order_ids.len(), 3);
    }

    #[tokio::test]
    async fn volume_equal_to_slice_is_single_child() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;

        let cmd_id = executor.submit(request(10, 10, 5.0, 30.0), None);
        let status = wait_finished(&executor, cmd_id, 5.0).await;
        assert_eq!(status.order_ids.len(), 1);
        assert_eq!(status.filled_volume, 10);
    }

    #[tokio::test]
    async fn insert_errors_exhaust_to_error() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;
        gateway.script(
            &rb(),
            vec![
                SimBehavior::RejectInsert { reason: "limit".into() },
                SimBehavior::RejectInsert { reason: "limit".into() },
                SimBehavior::RejectInsert { reason: "limit".into() },
            ],
        );

        let cmd_id = executor.submit(request(3, 10, 1.0, 10.0), None);
        let status = wait_finished(&executor, cmd_id, 5.0).await;
        assert_eq!(status.finish_reason, Some(FinishReason::Error));
        assert_eq!(status.filled_volume, 0);
        assert!(status.order_ids.is_empty());
    }

    #[tokio::test]
    async fn exchange_reject_without_fills_is_error() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;
        gateway.script(
            &rb(),
            vec![SimBehavior::RejectExchange {
                message: "no position to close".into(),
                delay: Duration::from_millis(20),
            }],
        );

        let cmd_id = executor.submit(request(3, 10, 1.0, 10.0), None);
        let status = wait_finished(&executor, cmd_id, 5.0).await;
        assert_eq!(status.finish_reason, Some(FinishReason::Error));
    }

    #[tokio::test]
    async fn total_timeout_yields_partial() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;
        gateway.script(
            &rb(),
            vec![
                SimBehavior::FillAfter {
                    delay: Duration::from_millis(20),
                },
                SimBehavior::Stall,
            ],
        );

        // Second slice stalls forever: order_timeout longer than
        // total_timeout, so the total guard fires first.
        let cmd_id = executor.submit(request(10, 5, 10.0, 0.5), None);
        let status = wait_finished(&executor, cmd_id, 10.0).await;

        assert_eq!(status.finish_reason, Some(FinishReason::PartialTimeout));
        assert_eq!(status.filled_volume, 5);
    }

    #[tokio::test]
    async fn external_cancel_quiesces_child() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;
        gateway.script(&rb(), vec![SimBehavior::Stall]);

        let cmd_id = executor.submit(request(4, 10, 30.0, 60.0), None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(executor.cancel(cmd_id));

        let status = wait_finished(&executor, cmd_id, 5.0).await;
        assert_eq!(status.finish_reason, Some(FinishReason::Cancelled));
        assert_eq!(status.filled_volume, 0);

        // Cancelling a finished cmd reports false.
        assert!(!executor.cancel(cmd_id));
    }

    #[tokio::test]
    async fn cancel_racing_full_fill_credits_the_fill() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;
        gateway.script(&rb(), vec![SimBehavior::Stall]);
        // Cancels take 300 ms to reach the exchange; the fill lands inside
        // that window, so the cancel finds a completed order.
        gateway.set_cancel_delay(Duration::from_millis(300));

        let cmd_id = executor.submit(request(3, 10, 0.1, 30.0), None);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let order_id = executor.status(cmd_id).unwrap().order_ids[0].clone();
        gateway.force_fill(&order_id, 3, 3500.0).await;

        let status = wait_finished(&executor, cmd_id, 5.0).await;
        assert_eq!(status.finish_reason, Some(FinishReason::AllCompleted));
        assert_eq!(status.filled_volume, 3);
    }

    #[tokio::test]
    async fn on_change_fires_per_transition() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;

        let transitions = Arc::new(AtomicUsize::new(0));
        let seen = transitions.clone();
        let callback: CmdCallback = Arc::new(move |status: OrderCmdStatus| {
            seen.fetch_add(1, Ordering::SeqCst);
            if status.status == CmdStatus::Finished {
                assert_eq!(status.finish_reason, Some(FinishReason::AllCompleted));
            }
        });

        let cmd_id = executor.submit(request(2, 10, 5.0, 30.0), Some(callback));
        wait_finished(&executor, cmd_id, 5.0).await;
        // Running + Finished.
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn filled_never_exceeds_volume() {
        let gateway = SimGateway::new("ACC");
        let executor = executor_with(&gateway).await;

        let cmd_id = executor.submit(request(7, 3, 5.0, 30.0), None);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = executor.status(cmd_id).unwrap();
            assert!(status.filled_volume <= status.volume);
            if status.status == CmdStatus::Finished {
                assert_eq!(status.filled_volume, 7);
                assert_eq!(status.order_ids.len(), 3); // 3 + 3 + 1
                break;
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
