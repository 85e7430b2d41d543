//! 多周期历史回填
//!
//! 一次性任务：清空所有目标周期，再按键顺序分页读取全部源K线，
//! 逐根折叠进每个周期的累加器，切桶时把完成的桶排入批量写队列。

use crate::klaggregate::types::BucketAccumulator;
use crate::klcommon::config::BackfillConfig;
use crate::klcommon::log_targets::BACKFILL;
use crate::klcommon::models::SourceBar;
use crate::klcommon::store::{bucket_path, series_path, PathUpdate, TimeSeriesStore};
use crate::klcommon::timeframe::Timeframe;
use crate::klcommon::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// 一次回填的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// 实际折叠进聚合的源K线数
    pub source_bars: usize,
    /// 格式错误被跳过的记录数
    pub malformed: usize,
    /// 与后一条时间相同、被后者替换的记录数
    pub duplicates: usize,
    /// 落在已完成桶之前而被忽略的 (周期, K线) 次数
    pub stale: usize,
    pub pages: usize,
    pub batches: usize,
    /// 每个周期写入的桶数
    pub buckets_written: BTreeMap<String, usize>,
}

impl BackfillReport {
    pub fn total_buckets(&self) -> usize {
        self.buckets_written.values().sum()
    }
}

struct Lane {
    timeframe: Timeframe,
    current: Option<BucketAccumulator>,
}

/// 多周期回填器
pub struct TimeframeBackfiller<S> {
    store: Arc<S>,
    market_root: String,
    source_series: String,
    timeframes: Vec<Timeframe>,
    page_size: usize,
    max_pending_writes: usize,
}

impl<S: TimeSeriesStore> TimeframeBackfiller<S> {
    pub fn new(
        store: Arc<S>,
        market_root: &str,
        source_code: &str,
        timeframes: Vec<Timeframe>,
        config: &BackfillConfig,
    ) -> Self {
        Self {
            store,
            market_root: market_root.to_string(),
            source_series: series_path(market_root, source_code),
            timeframes,
            page_size: config.page_size.max(2),
            max_pending_writes: config.max_pending_writes.max(1),
        }
    }

    /// 执行一次完整回填
    ///
    /// 任何读写错误都会中止并返回；已写出的批次保留。由于先清空再确定性重算，重跑是幂等的。
    #[instrument(target = "历史回填", skip_all, err)]
    pub async fn run_once(&self) -> Result<BackfillReport> {
        let started = Instant::now();
        info!(
            target: BACKFILL,
            event_name = "回填开始",
            source = %self.source_series,
            timeframes = self.timeframes.len(),
            page_size = self.page_size,
        );

        for timeframe in &self.timeframes {
            let path = series_path(&self.market_root, &timeframe.code);
            self.store.remove(&path).await?;
            debug!(target: BACKFILL, event_name = "目标周期已清空", path = %path);
        }

        let mut report = BackfillReport::default();
        for timeframe in &self.timeframes {
            report.buckets_written.insert(timeframe.code.clone(), 0);
        }
        let mut lanes: Vec<Lane> = self
            .timeframes
            .iter()
            .map(|timeframe| Lane {
                timeframe: timeframe.clone(),
                current: None,
            })
            .collect();
        let mut pending: Vec<PathUpdate> = Vec::new();

        // 同一时间的重复记录以后读到的为准，所以每根K线要等看到下一根才折叠
        let mut lookahead: Option<SourceBar> = None;
        let mut last_key: Option<i64> = None;

        loop {
            let page = self.store.read_page(&self.source_series, last_key, self.page_size).await?;
            report.pages += 1;
            let page_len = page.len();
            let mut fresh = 0usize;

            for (key, record) in page {
                // 后续页的第一条就是上一页的最后一条
                if last_key.map_or(false, |last| key <= last) {
                    continue;
                }
                last_key = Some(key);
                fresh += 1;

                let Some(bar) = SourceBar::from_record(&record) else {
                    report.malformed += 1;
                    debug!(target: BACKFILL, event_name = "跳过格式错误的源K线", key);
                    continue;
                };

                match lookahead.replace(bar) {
                    Some(previous) if previous.time == bar.time => {
                        report.duplicates += 1;
                    }
                    Some(previous) => {
                        self.fold(&mut lanes, &previous, &mut pending, &mut report);
                        self.flush_if_full(&mut pending, &mut report).await?;
                    }
                    None => {}
                }
            }

            if fresh == 0 || page_len < self.page_size {
                break;
            }
        }

        if let Some(last) = lookahead.take() {
            self.fold(&mut lanes, &last, &mut pending, &mut report);
        }

        // 输入结束时仍未关闭的桶
        for lane in &mut lanes {
            if let Some(open) = lane.current.take() {
                self.queue(&lane.timeframe, &open, &mut pending, &mut report);
            }
        }
        self.write_pending(&mut pending, &mut report).await?;

        info!(
            target: BACKFILL,
            event_name = "回填完成",
            source_bars = report.source_bars,
            malformed = report.malformed,
            duplicates = report.duplicates,
            stale = report.stale,
            pages = report.pages,
            batches = report.batches,
            buckets = report.total_buckets(),
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
        Ok(report)
    }

    fn fold(&self, lanes: &mut [Lane], bar: &SourceBar, pending: &mut Vec<PathUpdate>, report: &mut BackfillReport) {
        report.source_bars += 1;
        for lane in lanes.iter_mut() {
            let bucket_start = lane.timeframe.bucket_start(bar.time);
            match lane.current.as_mut() {
                Some(acc) if acc.bucket_start == bucket_start => acc.absorb(bar),
                Some(acc) if bucket_start < acc.bucket_start => report.stale += 1,
                _ => {
                    let opened = BucketAccumulator::open(bucket_start, bar);
                    if let Some(finished) = lane.current.replace(opened) {
                        self.queue(&lane.timeframe, &finished, pending, report);
                    }
                }
            }
        }
    }

    fn queue(&self, timeframe: &Timeframe, bucket: &BucketAccumulator, pending: &mut Vec<PathUpdate>, report: &mut BackfillReport) {
        pending.push((
            bucket_path(&self.market_root, &timeframe.code, bucket.bucket_start),
            bucket.to_persisted().to_record(),
        ));
        *report.buckets_written.entry(timeframe.code.clone()).or_insert(0) += 1;
    }

    async fn flush_if_full(&self, pending: &mut Vec<PathUpdate>, report: &mut BackfillReport) -> Result<()> {
        if pending.len() >= self.max_pending_writes {
            self.write_pending(pending, report).await?;
        }
        Ok(())
    }

    async fn write_pending(&self, pending: &mut Vec<PathUpdate>, report: &mut BackfillReport) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(pending);
        let size = batch.len();
        self.store.write_batch(batch).await?;
        report.batches += 1;
        debug!(target: BACKFILL, event_name = "批量写入", size, batches = report.batches);
        Ok(())
    }
}
