//! 实时聚合在 SQLite 存储上的端到端测试

use kline_rollup::klaggregate::{FlushPolicy, LiveAggregator, WriteMode};
use kline_rollup::klcommon::config::LiveConfig;
use kline_rollup::klcommon::models::{PersistedBucket, SourceBar};
use kline_rollup::klcommon::store::{SqliteStore, TimeSeriesStore};
use kline_rollup::klcommon::timeframe::default_timeframes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn temp_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("kline_rollup_live_{}_{}.db", name, std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

fn config(policy: FlushPolicy, write_mode: WriteMode) -> LiveConfig {
    LiveConfig {
        flush_policy: policy,
        flush_interval_ms: 80,
        write_mode,
        resume_from_store: true,
    }
}

async fn put_bar(store: &SqliteStore, bar: SourceBar) {
    store
        .write_batch(vec![(format!("market_data/M1/{}", bar.time), bar.to_record())])
        .await
        .unwrap();
}

async fn bucket(store: &SqliteStore, path: &str) -> Option<PersistedBucket> {
    store
        .read(path)
        .await
        .unwrap()
        .and_then(|v| PersistedBucket::from_record(&v))
}

#[tokio::test]
async fn test_revisions_reach_every_timeframe() {
    let path = temp_db("revisions");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let live = LiveAggregator::new(
        store.clone(),
        "market_data",
        "M1",
        default_timeframes(),
        &config(FlushPolicy::Throttle, WriteMode::Overwrite),
    );
    live.start().await.unwrap();

    // 2024-01-01 00:00 UTC，周一
    let t0 = 1_704_067_200;
    put_bar(&store, SourceBar { time: t0, open: 10.0, high: 10.5, low: 9.8, close: 10.2 }).await;
    // 同一根M1被改写
    put_bar(&store, SourceBar { time: t0, open: 10.0, high: 10.9, low: 9.8, close: 10.7 }).await;
    put_bar(&store, SourceBar { time: t0 + 60, open: 10.7, high: 10.8, low: 9.5, close: 9.9 }).await;

    // 节流间隔过后定时器补写
    tokio::time::sleep(Duration::from_millis(300)).await;
    let m5 = bucket(&store, &format!("market_data/M5/{}", t0)).await.unwrap();
    assert_eq!((m5.open, m5.high, m5.low, m5.close), (10.0, 10.9, 9.5, 9.9));

    live.stop().await.unwrap();
    for tf in default_timeframes() {
        let b = bucket(&store, &format!("market_data/{}/{}", tf.code, t0)).await;
        let b = b.unwrap_or_else(|| panic!("{} 桶缺失", tf));
        assert_eq!((b.high, b.low, b.close), (10.9, 9.5, 9.9), "{}", tf);
        assert_eq!(b.last_src_time, Some(t0 + 60));
    }

    drop(store);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_restart_resumes_open_bucket() {
    let path = temp_db("restart");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let timeframes = vec![kline_rollup::klcommon::Timeframe::from_code("H1").unwrap()];

    let first = LiveAggregator::new(
        store.clone(),
        "market_data",
        "M1",
        timeframes.clone(),
        &config(FlushPolicy::Debounce, WriteMode::Transactional),
    );
    first.start().await.unwrap();
    put_bar(&store, SourceBar { time: 0, open: 1.0, high: 1.8, low: 0.7, close: 1.1 }).await;
    first.stop().await.unwrap();

    // 新实例从已持久化的桶继续，而不是用下一根K线重新开桶
    let second = LiveAggregator::new(
        store.clone(),
        "market_data",
        "M1",
        timeframes,
        &config(FlushPolicy::Debounce, WriteMode::Transactional),
    );
    second.start().await.unwrap();
    put_bar(&store, SourceBar { time: 120, open: 1.1, high: 1.2, low: 0.9, close: 1.15 }).await;
    second.stop().await.unwrap();

    let h1 = bucket(&store, "market_data/H1/0").await.unwrap();
    assert_eq!((h1.open, h1.high, h1.low, h1.close), (1.0, 1.8, 0.7, 1.15));
    assert_eq!(h1.last_src_time, Some(120));

    drop(store);
    let _ = std::fs::remove_file(&path);
}
