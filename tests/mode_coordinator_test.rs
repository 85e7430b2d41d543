//! 模式协调器集成测试

use kline_rollup::klaggregate::{CoordinatorState, FlushPolicy, LiveAggregator, ModeCoordinator, WriteMode};
use kline_rollup::klcommon::config::{BackfillConfig, LiveConfig, SwitchConfig};
use kline_rollup::klcommon::models::{PersistedBucket, SourceBar};
use kline_rollup::klcommon::store::{MemoryStore, PathUpdate, SeriesWatch, TimeSeriesStore};
use kline_rollup::klcommon::switch::{ModeSignals, StoreSwitch, SwitchSource};
use kline_rollup::klcommon::timeframe::Timeframe;
use kline_rollup::klcommon::{AppError, Result};
use kline_rollup::kldata::TimeframeBackfiller;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "market_data/M1";

/// 记录每次读取源系列时仍存活的订阅数
struct RecordingStore {
    inner: MemoryStore,
    watchers_at_read: Mutex<Vec<usize>>,
    fail_source_reads: AtomicBool,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            watchers_at_read: Mutex::new(Vec::new()),
            fail_source_reads: AtomicBool::new(false),
        }
    }
}

impl TimeSeriesStore for RecordingStore {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        self.inner.read(path).await
    }

    async fn read_page(&self, series: &str, start_at: Option<i64>, limit: usize) -> Result<Vec<(i64, Value)>> {
        if series == SOURCE {
            self.watchers_at_read.lock().unwrap().push(self.inner.active_watchers(SOURCE));
            if self.fail_source_reads.load(Ordering::SeqCst) {
                return Err(AppError::StoreError("源系列不可读".to_string()));
            }
        }
        self.inner.read_page(series, start_at, limit).await
    }

    async fn read_last(&self, series: &str, limit: usize) -> Result<Vec<(i64, Value)>> {
        self.inner.read_last(series, limit).await
    }

    async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        self.inner.merge(path, fields).await
    }

    async fn write_batch(&self, updates: Vec<PathUpdate>) -> Result<()> {
        self.inner.write_batch(updates).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.inner.remove(path).await
    }

    async fn transact<F>(&self, path: &str, update: F) -> Result<Option<Value>>
    where
        F: FnMut(Option<Value>) -> Option<Value> + Send + 'static,
    {
        self.inner.transact(path, update).await
    }

    async fn watch_latest(&self, series: &str) -> Result<SeriesWatch> {
        self.inner.watch_latest(series).await
    }
}

fn coordinator<W: SwitchSource>(store: Arc<RecordingStore>, switch: Arc<W>) -> ModeCoordinator<RecordingStore, W> {
    let timeframes: Vec<Timeframe> = ["M5", "H1"].iter().map(|c| Timeframe::from_code(c).unwrap()).collect();
    let live_config = LiveConfig {
        flush_policy: FlushPolicy::Debounce,
        flush_interval_ms: 5_000,
        write_mode: WriteMode::Overwrite,
        resume_from_store: false,
    };
    let live = Arc::new(LiveAggregator::new(store.clone(), "market_data", "M1", timeframes.clone(), &live_config));
    let backfiller = TimeframeBackfiller::new(store, "market_data", "M1", timeframes, &BackfillConfig::default());
    ModeCoordinator::new(switch, live, backfiller, Duration::from_millis(20))
}

fn store_switch(store: &Arc<RecordingStore>) -> Arc<StoreSwitch<RecordingStore>> {
    Arc::new(StoreSwitch::new(store.clone(), SwitchConfig::default()))
}

fn put_bar(store: &RecordingStore, time: i64, close: f64) {
    let bar = SourceBar { time, open: 1.0, high: close.max(1.0), low: close.min(1.0), close };
    store.inner.set(&format!("{}/{}", SOURCE, time), bar.to_record());
}

#[tokio::test]
async fn test_live_toggles_with_switch() {
    let store = Arc::new(RecordingStore::new());
    let coordinator = coordinator(store.clone(), store_switch(&store));

    assert_eq!(coordinator.poll_once().await.unwrap(), CoordinatorState::Idle);
    assert!(!coordinator.live().is_running().await);

    store.inner.set("config/auto_tf_live", json!(true));
    store.inner.set("config/tf_live_throttle_ms", json!(250));
    assert_eq!(coordinator.poll_once().await.unwrap(), CoordinatorState::LiveRunning);
    assert!(coordinator.live().is_running().await);
    assert_eq!(coordinator.live().flush_interval_ms(), 250);
    assert_eq!(store.inner.active_watchers(SOURCE), 1);

    put_bar(&store, 60, 1.3);

    // 关闭实时聚合时最后的更新必须写出
    store.inner.set("config/auto_tf_live", json!(false));
    assert_eq!(coordinator.poll_once().await.unwrap(), CoordinatorState::Idle);
    assert!(!coordinator.live().is_running().await);
    assert_eq!(store.inner.active_watchers(SOURCE), 0);
    let m5 = PersistedBucket::from_record(&store.inner.get("market_data/M5/0").unwrap()).unwrap();
    assert_eq!(m5.close, 1.3);
}

#[tokio::test]
async fn test_backfill_preempts_live_and_turns_itself_off() {
    let store = Arc::new(RecordingStore::new());
    let coordinator = coordinator(store.clone(), store_switch(&store));
    for (i, close) in [1.1, 1.2, 1.15].iter().enumerate() {
        put_bar(&store, i as i64 * 60, *close);
    }

    store.inner.set("config/auto_tf_live", json!(true));
    coordinator.poll_once().await.unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::LiveRunning);

    store.inner.set("config/auto_market_tf_backfill", json!(true));
    assert_eq!(coordinator.poll_once().await.unwrap(), CoordinatorState::Idle);

    // 回填第一次读取源系列时实时聚合已经退订
    let seen = store.watchers_at_read.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert_eq!(seen[0], 0);
    assert!(!coordinator.live().is_running().await);

    assert_eq!(store.inner.get("config/auto_market_tf_backfill"), Some(json!(false)));
    assert_eq!(store.inner.get("config/auto_market_tf_backfill_done"), Some(json!(true)));
    let m5 = PersistedBucket::from_record(&store.inner.get("market_data/M5/0").unwrap()).unwrap();
    assert_eq!((m5.high, m5.close), (1.2, 1.15));

    // 回填完成后实时开关仍开启，下一轮恢复实时聚合
    assert_eq!(coordinator.poll_once().await.unwrap(), CoordinatorState::LiveRunning);
    coordinator.live().stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_backfill_leaves_flags_untouched() {
    let store = Arc::new(RecordingStore::new());
    let coordinator = coordinator(store.clone(), store_switch(&store));
    put_bar(&store, 0, 1.1);
    store.inner.set("config/auto_market_tf_backfill", json!(true));
    store.fail_source_reads.store(true, Ordering::SeqCst);

    let err = coordinator.poll_once().await.unwrap_err();
    assert!(matches!(err, AppError::StoreError(_)));
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert_eq!(store.inner.get("config/auto_market_tf_backfill"), Some(json!(true)));
    assert!(store.inner.get("config/auto_market_tf_backfill_done").is_none());

    // 下一轮重试
    store.fail_source_reads.store(false, Ordering::SeqCst);
    coordinator.poll_once().await.unwrap();
    assert_eq!(store.inner.get("config/auto_market_tf_backfill_done"), Some(json!(true)));
}

/// 读取开关总是失败
struct BrokenSwitch;

impl SwitchSource for BrokenSwitch {
    async fn read_signals(&self) -> Result<ModeSignals> {
        Err(AppError::StoreError("开关不可读".to_string()))
    }

    async fn mark_backfill_completed(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_switch_read_failure_keeps_state() {
    let store = Arc::new(RecordingStore::new());
    let coordinator = coordinator(store, Arc::new(BrokenSwitch));
    assert!(coordinator.poll_once().await.is_err());
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn test_run_stops_live_on_cancel() {
    let store = Arc::new(RecordingStore::new());
    let coordinator = Arc::new(coordinator(store.clone(), store_switch(&store)));
    store.inner.set("config/auto_tf_live", json!(true));

    let cancel = CancellationToken::new();
    let runner = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    for _ in 0..100 {
        if coordinator.live().is_running().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(coordinator.live().is_running().await);
    put_bar(&store, 3_600, 1.4);

    cancel.cancel();
    runner.await.unwrap().unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert!(!coordinator.live().is_running().await);
    assert!(store.inner.get("market_data/H1/3600").is_some());
}

#[tokio::test]
async fn test_completed_backfill_flag_does_not_suspend_live() {
    let store = Arc::new(RecordingStore::new());
    let coordinator = coordinator(store.clone(), store_switch(&store));
    put_bar(&store, 0, 1.1);

    // 回填开关残留为开启，但已标记完成
    store.inner.set("config/auto_tf_live", json!(true));
    store.inner.set("config/auto_market_tf_backfill", json!(true));
    store.inner.set("config/auto_market_tf_backfill_done", json!(true));

    assert_eq!(coordinator.poll_once().await.unwrap(), CoordinatorState::LiveRunning);
    assert!(coordinator.live().is_running().await);
    assert!(store.watchers_at_read.lock().unwrap().is_empty());
    assert_eq!(store.inner.get("config/auto_market_tf_backfill"), Some(json!(true)));

    // 清除完成标记后回填重新抢占
    store.inner.set("config/auto_market_tf_backfill_done", json!(false));
    assert_eq!(coordinator.poll_once().await.unwrap(), CoordinatorState::Idle);
    assert!(!store.watchers_at_read.lock().unwrap().is_empty());
    assert_eq!(store.inner.get("config/auto_market_tf_backfill_done"), Some(json!(true)));
    coordinator.live().stop().await.unwrap();
}
