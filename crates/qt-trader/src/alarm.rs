//! Alarm plumbing: components report alarm-worthy failures here; the sink
//! stores them and pushes `push(alarm, …)` to the Manager.

use std::sync::Arc;

use tracing::error;

use qt_event::{EventData, EventEngine, EventType};
use qt_store::Store;
use qt_types::AlarmData;

/// Builds, stores, and publishes alarms for one account.
#[derive(Clone)]
pub struct AlarmSink {
    account_id: String,
    store: Arc<Store>,
    engine: EventEngine,
}

impl AlarmSink {
    pub fn new(account_id: &str, store: Arc<Store>, engine: EventEngine) -> Self {
        Self {
            account_id: account_id.to_string(),
            store,
            engine,
        }
    }

    /// Raise an alarm: log at ERROR, persist, and emit `ALARM_UPDATE` so the
    /// IPC push path carries it to the Manager.
    pub async fn raise(&self, source: &str, title: &str, detail: &str) {
        error!(source, title, detail, "alarm raised");
        let alarm = AlarmData::new(&self.account_id, source, title, detail);

        let store = self.store.clone();
        let record = alarm.clone();
        let persisted = tokio::task::spawn_blocking(move || store.insert_alarm(&record)).await;
        match persisted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to persist alarm"),
            Err(e) => error!(error = %e, "alarm persist task failed"),
        }

        self.engine.emit(EventType::AlarmUpdate, EventData::Alarm(alarm));
    }
}
