//! Event-driven persistence writer: subscribes to account, position, and
//! trade events and upserts them into the per-account store. Orders are not
//! persisted eagerly; trades are the source of truth for fills.

use std::sync::Arc;

use tracing::warn;

use qt_event::{EventData, EventEngine, EventType};
use qt_store::Store;

/// Subscribe the writer's handlers. Each upsert runs on the blocking pool so
/// DB latency never holds the event loop.
pub fn register(engine: &EventEngine, store: Arc<Store>) {
    let account_store = store.clone();
    engine.register_fn(EventType::AccountUpdate, "persist-account", move |event| {
        let store = account_store.clone();
        async move {
            if let EventData::Account(account) = event.data.as_ref() {
                let account = account.clone();
                run_blocking(move || store.upsert_account(&account)).await
            } else {
                Ok(())
            }
        }
    });

    let position_store = store.clone();
    engine.register_fn(EventType::PositionUpdate, "persist-position", move |event| {
        let store = position_store.clone();
        async move {
            if let EventData::Position(position) = event.data.as_ref() {
                let position = position.clone();
                run_blocking(move || store.upsert_position(&position)).await
            } else {
                Ok(())
            }
        }
    });

    engine.register_fn(EventType::TradeUpdate, "persist-trade", move |event| {
        let store = store.clone();
        async move {
            if let EventData::Trade(trade) = event.data.as_ref() {
                let trade = trade.clone();
                run_blocking(move || store.insert_trade(&trade).map(|_| ())).await
            } else {
                Ok(())
            }
        }
    });
}

async fn run_blocking<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), qt_store::StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(error = %e, "persist upsert failed");
            Err(e.to_string())
        }
        Err(e) => Err(format!("persist task failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use qt_types::{Account, Direction, Offset, RiskControlConfig, Trade};

    #[tokio::test]
    async fn events_reach_the_store() {
        let store = Arc::new(
            Store::open_in_memory("ACC", &RiskControlConfig::default()).unwrap(),
        );
        let engine = EventEngine::start();
        register(&engine, store.clone());

        engine.emit(
            EventType::AccountUpdate,
            EventData::Account(Account::empty("ACC")),
        );
        let trade = Trade {
            trade_id: "T1".into(),
            order_id: "O1".into(),
            symbol: "SHFE.rb2505".parse().unwrap(),
            direction: Direction::Buy,
            offset: Offset::Open,
            price: 3500.0,
            volume: 3,
            trade_time: Utc::now(),
        };
        engine.emit(EventType::TradeUpdate, EventData::Trade(trade.clone()));
        // Re-delivery of the same trade is absorbed by the unique index.
        engine.emit(EventType::TradeUpdate, EventData::Trade(trade));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(store.count_trades().unwrap(), 1);
    }
}
