//! Rotation engine: CSV ingest into persisted instructions, the inbox scan
//! job, and the batch execution loop that turns today's instructions into
//! order cmds and monitors them to completion.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use qt_store::Store;
use qt_types::{
    trading_date_from_filename, Direction, ImportMode, InstructionStatus, Offset, OrderCmdRequest,
    RiskControlConfig, RotationInstruction, Symbol,
};

use crate::executor::OrderCmdExecutor;

/// Outcome of one CSV import.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// The engine. One per Trader; `working` is a single-writer latch making
/// `execute` non-reentrant.
pub struct RotationEngine {
    account_id: String,
    store: Arc<Store>,
    executor: OrderCmdExecutor,
    risk: RiskControlConfig,
    csv_inbox: PathBuf,
    working: AtomicBool,
    check_interval: Duration,
    monitor_guard: Duration,
}

impl RotationEngine {
    pub fn new(
        account_id: &str,
        store: Arc<Store>,
        executor: OrderCmdExecutor,
        risk: RiskControlConfig,
        csv_inbox: PathBuf,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            store,
            executor,
            risk,
            csv_inbox,
            working: AtomicBool::new(false),
            check_interval: Duration::from_secs(2),
            monitor_guard: Duration::from_secs(600),
        }
    }

    /// Shrink the monitor cadence and guard. Test hook.
    pub fn with_monitor_timing(mut self, check_interval: Duration, guard: Duration) -> Self {
        self.check_interval = check_interval;
        self.monitor_guard = guard;
        self
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Decode a rotation CSV body: strict UTF-8 first, GBK otherwise.
    pub fn decode_csv_bytes(bytes: &[u8]) -> String {
        match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => {
                let (text, _, _) = encoding_rs::GBK.decode(bytes);
                text.into_owned()
            }
        }
    }

    /// Parse and persist a rotation CSV. `replace` soft-deletes all live
    /// rows of the file's trading date before inserting.
    pub fn import_csv(
        &self,
        csv_text: &str,
        filename: &str,
        mode: ImportMode,
    ) -> Result<ImportReport, String> {
        let trading_date = trading_date_from_filename(filename).map_err(|e| e.to_string())?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(csv_text.as_bytes());

        let mut rows: Vec<RotationInstruction> = Vec::new();
        let mut report = ImportReport::default();

        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("line {}: {e}", line + 2));
                    continue;
                }
            };
            if record.iter().all(|f| f.is_empty()) {
                continue;
            }
            match self.parse_row(&record, &trading_date, filename) {
                Ok(instruction) => rows.push(instruction),
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("line {}: {e}", line + 2));
                }
            }
        }

        if mode == ImportMode::Replace {
            self.store
                .soft_delete_by_date(&trading_date)
                .map_err(|e| e.to_string())?;
        }
        for instruction in &rows {
            self.store
                .insert_instruction(instruction)
                .map_err(|e| e.to_string())?;
            report.imported += 1;
        }

        info!(
            account_id = %self.account_id,
            filename,
            trading_date,
            imported = report.imported,
            failed = report.failed,
            "rotation csv imported"
        );
        report.errors.truncate(10);
        Ok(report)
    }

    fn parse_row(
        &self,
        record: &csv::StringRecord,
        trading_date: &str,
        filename: &str,
    ) -> Result<RotationInstruction, String> {
        if record.len() < 6 {
            return Err(format!("expected 6+ columns, got {}", record.len()));
        }
        let account_id = record.get(0).unwrap_or_default();
        let strategy_id = record.get(1).unwrap_or_default();
        let symbol_text = record.get(2).unwrap_or_default();
        let offset_text = record.get(3).unwrap_or_default();
        let direction_text = record.get(4).unwrap_or_default();
        let volume_text = record.get(5).unwrap_or_default();
        let order_time = record.get(6).map(str::to_string).filter(|s| !s.is_empty());

        if account_id.is_empty() || strategy_id.is_empty() {
            return Err("missing account_id or strategy_id".to_string());
        }
        if account_id != self.account_id {
            return Err(format!(
                "account mismatch: row {account_id}, trader {}",
                self.account_id
            ));
        }
        let symbol: Symbol = symbol_text
            .parse()
            .map_err(|e: qt_types::TypeError| e.to_string())?;
        let offset = Offset::parse_loose(offset_text).map_err(|e| e.to_string())?;
        let direction = Direction::parse_loose(direction_text).map_err(|e| e.to_string())?;
        let volume: i64 = volume_text
            .parse()
            .map_err(|_| format!("bad volume: {volume_text}"))?;
        if volume <= 0 {
            return Err(format!("volume must be positive, got {volume}"));
        }
        if let Some(time) = &order_time {
            NaiveTime::parse_from_str(time, "%H:%M:%S")
                .map_err(|_| format!("bad order_time: {time}"))?;
        }

        Ok(RotationInstruction::from_csv_row(
            account_id,
            strategy_id,
            symbol,
            offset,
            direction,
            volume,
            order_time,
            trading_date,
            filename,
        ))
    }

    /// Scan `<inbox>/<YYYYMMDD>/` for files of today naming this account,
    /// import new ones in replace mode, and record them so a rescan skips
    /// them.
    pub fn scan_inbox(&self) -> usize {
        let today = Local::now().format("%Y%m%d").to_string();
        let today_dir = self.csv_inbox.join(&today);
        let Ok(entries) = std::fs::read_dir(&today_dir) else {
            return 0;
        };

        let mut imported_files = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("csv")
                || !name.contains(&today)
                || !name.contains(&self.account_id)
            {
                continue;
            }
            match self.store.import_recorded(name) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "import-record lookup failed");
                    continue;
                }
            }
            let Ok(bytes) = std::fs::read(&path) else {
                warn!(path = %path.display(), "cannot read rotation file");
                continue;
            };
            let text = Self::decode_csv_bytes(&bytes);
            match self.import_csv(&text, name, ImportMode::Replace) {
                Ok(report) if report.imported > 0 => {
                    let _ = self
                        .store
                        .record_import(name, &today_dir.display().to_string());
                    imported_files += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(file = name, error = %e, "rotation import failed"),
            }
        }
        imported_files
    }

    /// Run today's rotation. Refuses to run re-entrantly; returns false in
    /// that case without side effects.
    pub async fn execute(&self, is_manual: bool) -> bool {
        if self
            .working
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("rotation already running, skipping");
            return false;
        }
        info!(is_manual, "rotation started");

        let result = self.execute_inner(is_manual).await;
        self.working.store(false, Ordering::SeqCst);
        info!("rotation finished");
        result
    }

    async fn execute_inner(&self, is_manual: bool) -> bool {
        let today = Local::now().format("%Y%m%d").to_string();
        let store = self.store.clone();
        let date = today.clone();
        let loaded = tokio::task::spawn_blocking(move || store.instructions_by_date(&date)).await;
        let mut todo: Vec<RotationInstruction> = match loaded {
            Ok(Ok(instructions)) => instructions
                .into_iter()
                .filter(|i| i.status != InstructionStatus::Completed && i.enabled)
                .collect(),
            Ok(Err(e)) => {
                warn!(error = %e, "cannot load instructions");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "instruction load task failed");
                return false;
            }
        };
        if todo.is_empty() {
            info!("no rotation instructions for today");
            return true;
        }

        // Reset transient state, completing anything already filled.
        for instruction in todo.iter_mut() {
            instruction.reconcile();
            if instruction.status != InstructionStatus::Completed {
                instruction.status = InstructionStatus::Pending;
                instruction.error_message = None;
                instruction.current_cmd_id = None;
            }
        }

        // Launch a cmd per runnable instruction.
        for instruction in todo.iter_mut() {
            if instruction.status != InstructionStatus::Pending {
                continue;
            }
            if !is_manual && !order_time_reached(instruction.order_time.as_deref()) {
                continue;
            }

            let request = OrderCmdRequest {
                symbol: instruction.symbol.clone(),
                direction: instruction.direction,
                offset: instruction.offset,
                volume: instruction.remaining_volume,
                price: (instruction.price > 0.0).then_some(instruction.price),
                max_volume_per_order: self.risk.max_split_volume,
                order_interval: 0.5,
                order_timeout: self.risk.order_timeout,
                total_timeout: self.risk.order_timeout * 10.0,
                source: format!("rotation:{}", instruction.symbol),
            };
            let cmd_id = self.executor.submit(request, None);
            instruction.current_cmd_id = Some(cmd_id.to_string());
            instruction.status = InstructionStatus::Running;
            instruction.attempt_count += 1;
            instruction.last_attempt_time = Some(Utc::now());
            info!(
                symbol = %instruction.symbol,
                volume = instruction.remaining_volume,
                %cmd_id,
                "rotation cmd created"
            );
        }
        self.persist_all(&todo).await;

        self.monitor(&mut todo).await;
        self.persist_all(&todo).await;
        true
    }

    /// Poll cmd state every `check_interval` until every instruction has
    /// settled or the guard trips.
    async fn monitor(&self, instructions: &mut [RotationInstruction]) {
        let started = Instant::now();
        loop {
            if started.elapsed() > self.monitor_guard {
                warn!("rotation monitor guard tripped, giving up");
                break;
            }

            let mut all_finished = true;
            for instruction in instructions.iter_mut() {
                if instruction.status != InstructionStatus::Running {
                    continue;
                }
                let Some(cmd_id) = instruction
                    .current_cmd_id
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                else {
                    continue;
                };
                let Some(cmd) = self.executor.status(cmd_id) else {
                    warn!(%cmd_id, "order cmd vanished");
                    continue;
                };
                if cmd.is_active() {
                    all_finished = false;
                    continue;
                }

                instruction.filled_volume += cmd.filled_volume;
                instruction.remaining_volume -= cmd.filled_volume;
                instruction.current_cmd_id = None;
                match cmd.finish_reason {
                    Some(qt_types::FinishReason::AllCompleted) => {
                        instruction.status = InstructionStatus::Completed;
                    }
                    reason => {
                        instruction.status = InstructionStatus::Failed;
                        instruction.error_message =
                            Some(reason.map(|r| r.to_string()).unwrap_or_default());
                    }
                }
            }
            self.persist_all(instructions).await;

            if all_finished {
                break;
            }
            tokio::time::sleep(self.check_interval).await;
        }
    }

    async fn persist_all(&self, instructions: &[RotationInstruction]) {
        let store = self.store.clone();
        let snapshot: Vec<RotationInstruction> = instructions.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            for instruction in &snapshot {
                if let Err(e) = store.update_instruction(instruction) {
                    warn!(id = instruction.id, error = %e, "instruction persist failed");
                }
            }
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "instruction persist task failed");
        }
    }
}

/// True when `order_time` (HH:MM:SS, local) has passed, or no gate is set.
fn order_time_reached(order_time: Option<&str>) -> bool {
    match order_time.and_then(|t| NaiveTime::parse_from_str(t, "%H:%M:%S").ok()) {
        Some(gate) => Local::now().time() >= gate,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskControl;
    use qt_gateway::{Gateway, GatewayCallback, SimBehavior, SimGateway};
    use qt_types::Order;

    const CSV: &str = "account_id,strategy_id,instrument,offset,direction,volume,order_time\n\
                       ACC,S1,DCE.i2505,Open,Buy,2,00:00:01\n";

    async fn engine_with(gateway: &SimGateway, inbox: PathBuf) -> RotationEngine {
        let store = Arc::new(
            Store::open_in_memory("ACC", &RiskControlConfig::default()).unwrap(),
        );
        let risk = Arc::new(RiskControl::new(RiskControlConfig::default()));
        let executor = OrderCmdExecutor::new(Arc::new(gateway.clone()), risk);

        struct Router(OrderCmdExecutor);
        #[async_trait::async_trait]
        impl GatewayCallback for Router {
            async fn on_order(&self, order: Order) {
                self.0.on_order_update(&order);
            }
        }
        gateway.register_callback(Arc::new(Router(executor.clone())));
        gateway.connect().await.unwrap();

        RotationEngine::new(
            "ACC",
            store,
            executor,
            RiskControlConfig {
                order_timeout: 0.5,
                ..RiskControlConfig::default()
            },
            inbox,
        )
        .with_monitor_timing(Duration::from_millis(50), Duration::from_secs(10))
    }

    fn todays_filename() -> String {
        format!("{}_ACC_r.csv", Local::now().format("%Y%m%d"))
    }

    #[tokio::test]
    async fn import_validates_rows() {
        let gateway = SimGateway::new("ACC");
        let engine = engine_with(&gateway, PathBuf::from("/nonexistent")).await;

        let bad_csv = "account_id,strategy_id,instrument,offset,direction,volume,order_time\n\
                       ACC,S1,DCE.i2505,Open,Buy,2,\n\
                       OTHER,S1,DCE.i2505,Open,Buy,2,\n\
                       ACC,S1,badsymbol,Open,Buy,2,\n\
                       ACC,S1,DCE.i2505,Open,Buy,0,\n\
                       ACC,S1,DCE.i2505,Hold,Buy,2,\n";
        let report = engine
            .import_csv(bad_csv, "20250115_r.csv", ImportMode::Append)
            .unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.failed, 4);

        let rows = engine.store.instructions_by_date("20250115").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].volume, 2);
        assert!(rows[0].order_time.is_none());
    }

    #[tokio::test]
    async fn replace_import_is_idempotent() {
        let gateway = SimGateway::new("ACC");
        let engine = engine_with(&gateway, PathBuf::from("/nonexistent")).await;

        engine
            .import_csv(CSV, "20250115_r.csv", ImportMode::Replace)
            .unwrap();
        engine
            .import_csv(CSV, "20250115_r.csv", ImportMode::Replace)
            .unwrap();

        let rows = engine.store.instructions_by_date("20250115").unwrap();
        assert_eq!(rows.len(), 1);

        // Append on top adds.
        engine
            .import_csv(CSV, "20250115_r.csv", ImportMode::Append)
            .unwrap();
        assert_eq!(engine.store.instructions_by_date("20250115").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gbk_bytes_decode() {
        let text = "账户,方向\nACC,买入\n";
        let (gbk, _, _) = encoding_rs::GBK.encode(text);
        assert_eq!(RotationEngine::decode_csv_bytes(&gbk), text);
        assert_eq!(RotationEngine::decode_csv_bytes(text.as_bytes()), text);
    }

    #[tokio::test]
    async fn execute_completes_instruction() {
        let gateway = SimGateway::new("ACC");
        let engine = engine_with(&gateway, PathBuf::from("/nonexistent")).await;
        let filename = todays_filename();
        let csv = "account_id,strategy_id,instrument,offset,direction,volume,order_time\n\
                   ACC,S1,DCE.i2505,Open,Buy,2,00:00:01\n";
        engine
            .import_csv(csv, &filename, ImportMode::Replace)
            .unwrap();

        assert!(engine.execute(false).await);

        let today = Local::now().format("%Y%m%d").to_string();
        let rows = engine.store.instructions_by_date(&today).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, InstructionStatus::Completed);
        assert_eq!(rows[0].filled_volume, 2);
        assert_eq!(rows[0].remaining_volume, 0);
        assert!(rows[0].current_cmd_id.is_none());
    }

    #[tokio::test]
    async fn failed_cmd_marks_instruction_failed() {
        let gateway = SimGateway::new("ACC");
        let engine = engine_with(&gateway, PathBuf::from("/nonexistent")).await;
        gateway.script(
            &"DCE.i2505".parse().unwrap(),
            vec![
                SimBehavior::RejectInsert { reason: "limit".into() },
                SimBehavior::RejectInsert { reason: "limit".into() },
                SimBehavior::RejectInsert { reason: "limit".into() },
            ],
        );

        let filename = todays_filename();
        engine
            .import_csv(CSV, &filename, ImportMode::Replace)
            .unwrap();
        engine.execute(false).await;

        let today = Local::now().format("%Y%m%d").to_string();
        let rows = engine.store.instructions_by_date(&today).unwrap();
        assert_eq!(rows[0].status, InstructionStatus::Failed);
        assert_eq!(rows[0].error_message.as_deref(), Some("ERROR"));
    }

    #[tokio::test]
    async fn reentrant_execute_is_refused() {
        let gateway = SimGateway::new("ACC");
        let engine = Arc::new(engine_with(&gateway, PathBuf::from("/nonexistent")).await);
        gateway.script(
            &"DCE.i2505".parse().unwrap(),
            vec![SimBehavior::FillAfter {
                delay: Duration::from_millis(200),
            }],
        );
        let filename = todays_filename();
        engine
            .import_csv(CSV, &filename, ImportMode::Replace)
            .unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute(false).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.is_working());
        assert!(!engine.execute(false).await);

        assert!(first.await.unwrap());
        assert!(!engine.is_working());
    }

    #[tokio::test]
    async fn scan_inbox_imports_once() {
        let gateway = SimGateway::new("ACC");
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&gateway, dir.path().to_path_buf()).await;

        let today = Local::now().format("%Y%m%d").to_string();
        let day_dir = dir.path().join(&today);
        std::fs::create_dir_all(&day_dir).unwrap();
        let filename = format!("{today}_ACC_r.csv");
        let (gbk, _, _) = encoding_rs::GBK.encode(CSV);
        std::fs::write(day_dir.join(&filename), &gbk).unwrap();
        // A file for another account is ignored.
        std::fs::write(day_dir.join(format!("{today}_OTHER.csv")), b"x").unwrap();

        assert_eq!(engine.scan_inbox(), 1);
        assert_eq!(engine.store.instructions_by_date(&today).unwrap().len(), 1);
        // Second scan: already recorded.
        assert_eq!(engine.scan_inbox(), 0);
        assert_eq!(engine.store.instructions_by_date(&today).unwrap().len(), 1);
    }
}
