//! 模式协调器
//!
//! 定时轮询外部开关，在空闲、实时聚合、历史回填三种状态之间切换。
//! 回填总是优先：请求回填时先停止实时聚合（含最终刷新和退订），再开始读取源K线。

use super::live_aggregator::LiveAggregator;
use crate::kldata::backfill::TimeframeBackfiller;
use crate::klcommon::log_targets::MODE_COORDINATOR;
use crate::klcommon::store::TimeSeriesStore;
use crate::klcommon::switch::SwitchSource;
use crate::klcommon::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    LiveRunning,
    BackfillRunning,
}

pub struct ModeCoordinator<S, W> {
    switch: Arc<W>,
    live: Arc<LiveAggregator<S>>,
    backfiller: TimeframeBackfiller<S>,
    poll_interval: Duration,
    state: std::sync::Mutex<CoordinatorState>,
    /// 串行化 `poll_once`
    poll_lock: Mutex<()>,
}

impl<S: TimeSeriesStore, W: SwitchSource> ModeCoordinator<S, W> {
    pub fn new(
        switch: Arc<W>,
        live: Arc<LiveAggregator<S>>,
        backfiller: TimeframeBackfiller<S>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            switch,
            live,
            backfiller,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            state: std::sync::Mutex::new(CoordinatorState::Idle),
            poll_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: CoordinatorState) -> CoordinatorState {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != next {
            info!(target: MODE_COORDINATOR, event_name = "状态切换", from = ?*state, to = ?next);
        }
        *state = next;
        next
    }

    pub fn live(&self) -> &Arc<LiveAggregator<S>> {
        &self.live
    }

    /// 读取一次开关并执行相应的状态切换
    ///
    /// 开关读取失败时状态不变并返回错误；回填失败时开关保持原样，状态回到空闲，错误返回给调用方。
    pub async fn poll_once(&self) -> Result<CoordinatorState> {
        let _serial = self.poll_lock.lock().await;
        let signals = self.switch.read_signals().await?;

        if let Some(ms) = signals.flush_interval_ms {
            self.live.set_flush_interval_ms(ms);
        }

        if signals.backfill_requested() {
            if self.live.is_running().await {
                info!(target: MODE_COORDINATOR, event_name = "回填抢占实时聚合");
            }
            // 必须在回填第一次读取之前完成退订
            if let Err(e) = self.live.stop().await {
                self.set_state(CoordinatorState::Idle);
                return Err(e);
            }
            self.set_state(CoordinatorState::BackfillRunning);

            let outcome = self.run_backfill().await;
            self.set_state(CoordinatorState::Idle);
            outcome?;
            return Ok(CoordinatorState::Idle);
        }

        if signals.live_enabled {
            if !self.live.is_running().await {
                self.live.start().await?;
            }
            Ok(self.set_state(CoordinatorState::LiveRunning))
        } else {
            if self.state() == CoordinatorState::LiveRunning || self.live.is_running().await {
                self.live.stop().await?;
                info!(target: MODE_COORDINATOR, event_name = "实时聚合已关闭");
            }
            Ok(self.set_state(CoordinatorState::Idle))
        }
    }

    async fn run_backfill(&self) -> Result<()> {
        let report = match self.backfiller.run_once().await {
            Ok(report) => report,
            Err(e) => {
                error!(
                    target: MODE_COORDINATOR,
                    event_name = "回填失败，开关保持不变",
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                );
                return Err(e);
            }
        };
        self.switch.mark_backfill_completed().await?;
        info!(
            target: MODE_COORDINATOR,
            event_name = "回填完成并自动关闭",
            buckets = report.total_buckets(),
            source_bars = report.source_bars,
        );
        Ok(())
    }

    /// 按固定间隔轮询，直到 `cancel` 被触发；退出前停止实时聚合（含最终刷新）
    #[instrument(target = "模式协调", skip_all, err)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            target: MODE_COORDINATOR,
            event_name = "模式协调器启动",
            poll_interval_ms = self.poll_interval.as_millis() as u64,
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(
                            target: MODE_COORDINATOR,
                            event_name = "轮询失败，下个周期重试",
                            error.summary = e.get_error_type_summary(),
                            error.details = %e,
                        );
                    }
                }
            }
        }

        let _serial = self.poll_lock.lock().await;
        self.live.stop().await?;
        self.set_state(CoordinatorState::Idle);
        info!(target: MODE_COORDINATOR, event_name = "模式协调器已停止");
        Ok(())
    }
}
