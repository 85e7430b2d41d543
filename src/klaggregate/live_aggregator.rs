//! 实时聚合器
//!
//! 订阅源系列（M1）最新键的变化，把每根新增或修订的源K线折叠进所有目标周期，
//! 再按刷新策略把脏桶写回存储：
//!
//! - `FlushPolicy::Debounce`: 事件只更新内存，定时器每个窗口统一写一次
//! - `FlushPolicy::Throttle`: 每个事件后写出距离上次写入已超过间隔的周期，
//!   定时器按同一间隔补写被节流压住的变化
//!
//! 桶切换产生的退役桶和停止时的最终刷新总是强制写出，不受上述策略限制。
//! 写入失败只记日志并放回状态，下一个事件或定时器触发时重试，事件循环不会因此阻塞或退出。

use super::aggregator_state::{AggregatorState, FlushSelect, PendingWrite, TickSummary};
use super::types::{merge_bucket, BucketAccumulator, FlushPolicy, WriteMode};
use crate::klcommon::config::LiveConfig;
use crate::klcommon::log_targets::LIVE_AGGREGATOR;
use crate::klcommon::models::{PersistedBucket, SourceBar};
use crate::klcommon::store::{bucket_path, series_path, SeriesEvent, SeriesWatch, TimeSeriesStore};
use crate::klcommon::switch::MAX_FLUSH_INTERVAL_MS;
use crate::klcommon::timeframe::{format_bucket_time, Timeframe};
use crate::klcommon::{AppError, Result};
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 定时器的最小周期，间隔为0时也不会空转
const MIN_TICK_MS: u64 = 10;

/// 一次刷新的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

/// 运行计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveStats {
    pub events: u64,
    pub malformed: u64,
    pub buckets_written: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct LiveCounters {
    events: AtomicU64,
    malformed: AtomicU64,
    buckets_written: AtomicU64,
    write_failures: AtomicU64,
}

struct LiveInner<S> {
    store: Arc<S>,
    market_root: String,
    source_series: String,
    policy: FlushPolicy,
    write_mode: WriteMode,
    resume_from_store: bool,
    flush_interval_ms: AtomicU64,
    state: Mutex<AggregatorState>,
    /// 串行化刷新，同一个桶不会被两次刷新并发写入
    flush_lock: Mutex<()>,
    counters: LiveCounters,
}

struct LiveRuntime {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 实时多周期聚合器
pub struct LiveAggregator<S> {
    inner: Arc<LiveInner<S>>,
    runtime: Mutex<Option<LiveRuntime>>,
}

impl<S: TimeSeriesStore> LiveAggregator<S> {
    pub fn new(
        store: Arc<S>,
        market_root: &str,
        source_code: &str,
        timeframes: Vec<Timeframe>,
        config: &LiveConfig,
    ) -> Self {
        let inner = LiveInner {
            store,
            market_root: market_root.to_string(),
            source_series: series_path(market_root, source_code),
            policy: config.flush_policy,
            write_mode: config.write_mode,
            resume_from_store: config.resume_from_store,
            flush_interval_ms: AtomicU64::new(config.flush_interval_ms.min(MAX_FLUSH_INTERVAL_MS)),
            state: Mutex::new(AggregatorState::new(timeframes)),
            flush_lock: Mutex::new(()),
            counters: LiveCounters::default(),
        };
        Self {
            inner: Arc::new(inner),
            runtime: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map_or(false, |rt| !rt.handle.is_finished())
    }

    /// 启动：清空已写出的状态，可选地从存储恢复，订阅源系列并启动事件循环
    ///
    /// 已在运行时直接返回。
    #[instrument(target = "实时聚合", skip_all, err)]
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if let Some(rt) = runtime.as_ref() {
            if !rt.handle.is_finished() {
                debug!(target: LIVE_AGGREGATOR, event_name = "实时聚合已在运行");
                return Ok(());
            }
        }

        let kept = self.inner.state.lock().await.reset_settled();
        if kept > 0 {
            warn!(target: LIVE_AGGREGATOR, event_name = "保留上次未写出的桶", kept);
        }
        if self.inner.resume_from_store {
            self.inner.bootstrap_from_store().await;
        }

        let watch = self.inner.store.watch_latest(&self.inner.source_series).await?;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_event_loop(self.inner.clone(), watch, cancel.clone()));
        *runtime = Some(LiveRuntime { cancel, handle });

        info!(
            target: LIVE_AGGREGATOR,
            event_name = "实时聚合已启动",
            source = %self.inner.source_series,
            policy = ?self.inner.policy,
            write_mode = ?self.inner.write_mode,
            flush_interval_ms = self.flush_interval_ms(),
        );
        Ok(())
    }

    /// 停止：取消订阅并等待事件循环完成最终的强制刷新后才返回
    #[instrument(target = "实时聚合", skip_all, err)]
    pub async fn stop(&self) -> Result<()> {
        let Some(rt) = self.runtime.lock().await.take() else {
            return Ok(());
        };
        rt.cancel.cancel();
        rt.handle
            .await
            .map_err(|e| AppError::AggregationError(format!("实时聚合事件循环异常退出: {}", e)))?;
        info!(target: LIVE_AGGREGATOR, event_name = "实时聚合已停止", stats = ?self.stats());
        Ok(())
    }

    /// 折叠一根源K线，不触发写入
    pub async fn apply_tick(&self, bar: &SourceBar) -> TickSummary {
        self.inner.state.lock().await.apply_tick(bar)
    }

    /// 处理一条订阅事件（解析、折叠、按策略刷新）
    pub async fn handle_event(&self, event: SeriesEvent) {
        self.inner.handle_event(event).await
    }

    /// 强制写出所有未写入的桶
    pub async fn flush_all(&self) -> FlushReport {
        self.inner.flush(FlushSelect::All).await
    }

    pub async fn flush(&self, select: FlushSelect) -> FlushReport {
        self.inner.flush(select).await
    }

    /// 运行时调整刷新间隔，范围 0..=5000 毫秒
    pub fn set_flush_interval_ms(&self, ms: u64) {
        let clamped = ms.min(MAX_FLUSH_INTERVAL_MS);
        let previous = self.inner.flush_interval_ms.swap(clamped, Ordering::Relaxed);
        if previous != clamped {
            info!(target: LIVE_AGGREGATOR, event_name = "刷新间隔已调整", previous, current = clamped);
        }
    }

    pub fn flush_interval_ms(&self) -> u64 {
        self.inner.flush_interval_ms.load(Ordering::Relaxed)
    }

    pub async fn has_pending(&self) -> bool {
        self.inner.state.lock().await.has_pending()
    }

    /// 当前状态的快照，供测试和诊断使用
    pub async fn snapshot(&self) -> AggregatorState {
        self.inner.state.lock().await.clone()
    }

    pub fn stats(&self) -> LiveStats {
        let c = &self.inner.counters;
        LiveStats {
            events: c.events.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            buckets_written: c.buckets_written.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl<S: TimeSeriesStore> LiveInner<S> {
    fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.load(Ordering::Relaxed))
    }

    /// 每个周期读取最后一个已持久化的桶作为起点；失败只影响该周期
    async fn bootstrap_from_store(&self) {
        let timeframes: Vec<Timeframe> = self.state.lock().await.timeframes().cloned().collect();
        let mut seeded = 0usize;
        for (tf_index, timeframe) in timeframes.iter().enumerate() {
            let series = series_path(&self.market_root, &timeframe.code);
            match self.store.read_last(&series, 1).await {
                Ok(records) => {
                    let last = records.last().and_then(|(_, v)| PersistedBucket::from_record(v));
                    if let Some(bucket) = last {
                        let mut state = self.state.lock().await;
                        if state.seed(tf_index, BucketAccumulator::from_persisted(&bucket)) {
                            seeded += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        target: LIVE_AGGREGATOR,
                        event_name = "恢复周期状态失败",
                        timeframe = %timeframe,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                    );
                }
            }
        }
        info!(target: LIVE_AGGREGATOR, event_name = "周期状态已恢复", seeded, total = timeframes.len());
    }

    /// 解析并折叠事件，格式错误返回 `None`
    async fn absorb_event(&self, event: &SeriesEvent) -> Option<TickSummary> {
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        let Some(bar) = SourceBar::from_record(event.value()) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            debug!(target: LIVE_AGGREGATOR, event_name = "跳过格式错误的源K线", key = event.key());
            return None;
        };

        let summary = self.state.lock().await.apply_tick(&bar);
        if summary.transitions > 0 {
            debug!(
                target: LIVE_AGGREGATOR,
                event_name = "桶切换",
                source_time = %format_bucket_time(bar.time),
                transitions = summary.transitions,
            );
        }
        Some(summary)
    }

    async fn handle_event(&self, event: SeriesEvent) {
        if self.absorb_event(&event).await.is_none() {
            return;
        }

        let interval = self.flush_interval();
        let select = match self.policy {
            FlushPolicy::Debounce if interval.is_zero() => FlushSelect::All,
            FlushPolicy::Debounce => FlushSelect::RetiredOnly,
            FlushPolicy::Throttle => FlushSelect::Due { min_interval: interval },
        };
        self.flush(select).await;
    }

    async fn on_tick(&self) {
        let select = match self.policy {
            FlushPolicy::Debounce => FlushSelect::All,
            FlushPolicy::Throttle => FlushSelect::Due {
                min_interval: self.flush_interval(),
            },
        };
        self.flush(select).await;
    }

    async fn flush(&self, select: FlushSelect) -> FlushReport {
        let _serial = self.flush_lock.lock().await;

        let now = tokio::time::Instant::now().into_std();
        let writes = self.state.lock().await.take_flush(select, now);
        if writes.is_empty() {
            return FlushReport::default();
        }

        // 按周期分组，每个周期一个并发写入
        let mut groups: Vec<Vec<PendingWrite>> = Vec::new();
        for write in writes {
            match groups.iter_mut().find(|g| g[0].tf_index == write.tf_index) {
                Some(group) => group.push(write),
                None => groups.push(vec![write]),
            }
        }

        let results = join_all(groups.into_iter().map(|group| self.write_group(group))).await;

        let mut report = FlushReport::default();
        let mut failed_writes = Vec::new();
        for (written, failed) in results {
            report.written += written;
            report.failed += failed.len();
            failed_writes.extend(failed);
        }
        if !failed_writes.is_empty() {
            let mut state = self.state.lock().await;
            for write in failed_writes {
                state.restore_failed(write);
            }
        }

        self.counters
            .buckets_written
            .fetch_add(report.written as u64, Ordering::Relaxed);
        self.counters
            .write_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        debug!(target: LIVE_AGGREGATOR, event_name = "刷新完成", ?select, written = report.written, failed = report.failed);
        report
    }

    /// 写出同一周期的一组桶，返回 (成功数, 失败的写入)
    async fn write_group(&self, group: Vec<PendingWrite>) -> (usize, Vec<PendingWrite>) {
        match self.write_mode {
            WriteMode::Overwrite => {
                let updates = group
                    .iter()
                    .map(|w| {
                        (
                            bucket_path(&self.market_root, &w.code, w.bucket.bucket_start),
                            w.bucket.to_persisted().to_record(),
                        )
                    })
                    .collect();
                match self.store.write_batch(updates).await {
                    Ok(()) => (group.len(), Vec::new()),
                    Err(e) => {
                        log_write_failure(&group[0].code, group.len(), &e);
                        (0, group)
                    }
                }
            }
            WriteMode::Transactional => {
                // 逐个事务提交；失败时已提交的不再重写
                let mut written = 0usize;
                let mut remaining = group.into_iter();
                while let Some(write) = remaining.next() {
                    let path = bucket_path(&self.market_root, &write.code, write.bucket.bucket_start);
                    let ours = write.bucket.to_persisted();
                    let committed = self
                        .store
                        .transact(&path, move |current| {
                            let existing = current.as_ref().and_then(PersistedBucket::from_record);
                            Some(merge_bucket(existing.as_ref(), &ours).to_record())
                        })
                        .await;
                    match committed {
                        Ok(_) => written += 1,
                        Err(e) => {
                            let mut failed = vec![write];
                            failed.extend(remaining.by_ref());
                            log_write_failure(&failed[0].code, failed.len(), &e);
                            return (written, failed);
                        }
                    }
                }
                (written, Vec::new())
            }
        }
    }
}

fn log_write_failure(code: &str, failed: usize, e: &AppError) {
    if e.is_retryable() {
        warn!(
            target: LIVE_AGGREGATOR,
            event_name = "写入周期桶失败，稍后重试",
            timeframe = %code,
            failed,
            error.summary = e.get_error_type_summary(),
            error.details = %e,
        );
    } else {
        error!(
            target: LIVE_AGGREGATOR,
            event_name = "写入周期桶失败",
            timeframe = %code,
            failed,
            error.summary = e.get_error_type_summary(),
            error.details = %e,
        );
    }
}

async fn run_event_loop<S: TimeSeriesStore>(
    inner: Arc<LiveInner<S>>,
    mut watch: SeriesWatch,
    cancel: CancellationToken,
) {
    let mut period = inner.flush_interval();
    let mut ticker = new_ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = watch.recv() => match event {
                Some(event) => inner.handle_event(event).await,
                None => {
                    warn!(target: LIVE_AGGREGATOR, event_name = "源订阅已关闭", source = %inner.source_series);
                    break;
                }
            },
            _ = ticker.tick() => inner.on_tick().await,
        }

        let current = inner.flush_interval();
        if current != period {
            period = current;
            ticker = new_ticker(period);
        }
    }

    // 已经送达的事件先折叠进来，再退订并做最终刷新
    while let Some(event) = watch.try_recv() {
        inner.absorb_event(&event).await;
    }
    drop(watch);
    let report = inner.flush(FlushSelect::All).await;
    if report.failed > 0 {
        error!(
            target: LIVE_AGGREGATOR,
            event_name = "停止前的最终刷新未完成",
            written = report.written,
            failed = report.failed,
        );
    } else {
        debug!(target: LIVE_AGGREGATOR, event_name = "最终刷新完成", written = report.written);
    }
}

fn new_ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(MIN_TICK_MS));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}
