//! 实时聚合状态
//!
//! 每个目标周期一个槽位，记录当前桶、是否有未写入的变化以及上次写入时间。
//! 桶切换时，仍有未写入变化的旧桶进入"退役队列"，下一次刷新时强制写出。
//!
//! 状态由单个 `LiveAggregator` 实例持有，不存在进程级全局状态。

use super::types::BucketAccumulator;
use crate::klcommon::models::{Candle, SourceBar};
use crate::klcommon::timeframe::Timeframe;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct TimeframeSlot {
    timeframe: Timeframe,
    current: Option<BucketAccumulator>,
    dirty: bool,
    last_write: Option<Instant>,
}

/// 待写入的一个桶
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub tf_index: usize,
    pub code: String,
    pub bucket: BucketAccumulator,
    /// 已退役的桶，之后不会再被更新
    pub retired: bool,
}

/// 本次刷新选取哪些当前桶；退役桶总是全部写出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSelect {
    /// 所有脏桶
    All,
    /// 上次写入早于 `min_interval` 的脏桶
    Due { min_interval: Duration },
    /// 只写退役桶
    RetiredOnly,
}

/// 一次 `apply_tick` 的结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub updated: usize,
    pub transitions: usize,
    pub stale: usize,
}

#[derive(Debug, Clone)]
pub struct AggregatorState {
    slots: Vec<TimeframeSlot>,
    retired: BTreeMap<(usize, i64), BucketAccumulator>,
}

impl AggregatorState {
    pub fn new(timeframes: Vec<Timeframe>) -> Self {
        Self {
            slots: timeframes
                .into_iter()
                .map(|timeframe| TimeframeSlot {
                    timeframe,
                    current: None,
                    dirty: false,
                    last_write: None,
                })
                .collect(),
            retired: BTreeMap::new(),
        }
    }

    /// 清空已写出的桶，返回保留下来的未写出桶数
    ///
    /// 上次停止时最终刷新失败的脏桶和退役桶保留，重启后继续重试。
    pub fn reset_settled(&mut self) -> usize {
        let mut kept = self.retired.len();
        for slot in &mut self.slots {
            slot.last_write = None;
            if slot.dirty {
                kept += 1;
            } else {
                slot.current = None;
            }
        }
        kept
    }

    pub fn timeframes(&self) -> impl Iterator<Item = &Timeframe> {
        self.slots.iter().map(|s| &s.timeframe)
    }

    pub fn current(&self, code: &str) -> Option<&BucketAccumulator> {
        self.slots
            .iter()
            .find(|s| s.timeframe.code == code)
            .and_then(|s| s.current.as_ref())
    }

    pub fn current_candle(&self, code: &str) -> Option<Candle> {
        self.current(code).map(|acc| acc.candle)
    }

    pub fn is_dirty(&self, code: &str) -> bool {
        self.slots.iter().any(|s| s.timeframe.code == code && s.dirty)
    }

    /// 是否还有未写出的变化
    pub fn has_pending(&self) -> bool {
        !self.retired.is_empty() || self.slots.iter().any(|s| s.dirty)
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// 用已持久化的桶作为起点，视为已写入；槽位还有未写出的桶时不覆盖
    pub fn seed(&mut self, tf_index: usize, bucket: BucketAccumulator) -> bool {
        match self.slots.get_mut(tf_index) {
            Some(slot) if !slot.dirty => {
                slot.current = Some(bucket);
                true
            }
            _ => false,
        }
    }

    /// 把一根源K线折叠进所有周期
    pub fn apply_tick(&mut self, bar: &SourceBar) -> TickSummary {
        let mut summary = TickSummary::default();
        for (tf_index, slot) in self.slots.iter_mut().enumerate() {
            let bucket_start = slot.timeframe.bucket_start(bar.time);
            match slot.current.as_mut() {
                Some(acc) if acc.bucket_start == bucket_start => {
                    acc.absorb(bar);
                    slot.dirty = true;
                    summary.updated += 1;
                }
                Some(acc) if bucket_start < acc.bucket_start => {
                    // 早于当前桶的迟到K线，已切走的桶不再回头修改
                    summary.stale += 1;
                }
                previous => {
                    if let Some(old) = previous.copied() {
                        if slot.dirty {
                            self.retired.insert((tf_index, old.bucket_start), old);
                        }
                        summary.transitions += 1;
                    }
                    slot.current = Some(BucketAccumulator::open(bucket_start, bar));
                    slot.dirty = true;
                    summary.updated += 1;
                }
            }
        }
        summary
    }

    /// 取出本次要写的桶，并把它们标记为已写入
    ///
    /// 写入失败时调用方用 `restore_failed` 放回。
    pub fn take_flush(&mut self, select: FlushSelect, now: Instant) -> Vec<PendingWrite> {
        let mut writes: Vec<PendingWrite> = std::mem::take(&mut self.retired)
            .into_iter()
            .map(|((tf_index, _), bucket)| PendingWrite {
                tf_index,
                code: self.slots[tf_index].timeframe.code.clone(),
                bucket,
                retired: true,
            })
            .collect();

        for (tf_index, slot) in self.slots.iter_mut().enumerate() {
            let Some(bucket) = slot.current else { continue };
            if !slot.dirty {
                continue;
            }
            let selected = match select {
                FlushSelect::All => true,
                FlushSelect::RetiredOnly => false,
                FlushSelect::Due { min_interval } => slot
                    .last_write
                    .map_or(true, |last| now.saturating_duration_since(last) >= min_interval),
            };
            if selected {
                slot.dirty = false;
                slot.last_write = Some(now);
                writes.push(PendingWrite {
                    tf_index,
                    code: slot.timeframe.code.clone(),
                    bucket,
                    retired: false,
                });
            }
        }
        writes
    }

    /// 写入失败后放回状态，等待下一次刷新重试
    ///
    /// 槽位仍停留在同一个桶时只需重新置脏（当前值不旧于失败的值）；
    /// 桶已切走则放回退役队列，除非队列里已有同一个桶的更新版本。
    pub fn restore_failed(&mut self, write: PendingWrite) {
        let Some(slot) = self.slots.get_mut(write.tf_index) else { return };
        match slot.current {
            Some(current) if current.bucket_start == write.bucket.bucket_start => {
                slot.dirty = true;
            }
            _ => {
                self.retired
                    .entry((write.tf_index, write.bucket.bucket_start))
                    .or_insert(write.bucket);
            }
        }
    }
}
