//! K线聚合的核心数据类型
//!
//! 回填与实时聚合共用同一个OHLC折叠规则（`BucketAccumulator`），
//! 保证两条路径对同一段源K线得到相同的结果。

use crate::klcommon::models::{Candle, PersistedBucket, SourceBar};
use serde::{Deserialize, Serialize};

/// 单个周期当前桶的累加器
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketAccumulator {
    pub bucket_start: i64,
    pub candle: Candle,
    /// 已折叠进来的源K线中最新的时间，决定 close 是否可被覆盖
    pub last_source_time: i64,
}

impl BucketAccumulator {
    /// 用桶内第一根源K线开桶
    pub fn open(bucket_start: i64, bar: &SourceBar) -> Self {
        Self {
            bucket_start,
            candle: Candle {
                time: bucket_start,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
            },
            last_source_time: bar.time,
        }
    }

    /// 折叠同一个桶内的源K线
    ///
    /// high/low 总是取极值；close 只在 `bar.time >= last_source_time` 时更新，
    /// 迟到的旧K线不能覆盖更新的收盘价。
    pub fn absorb(&mut self, bar: &SourceBar) {
        self.candle.high = self.candle.high.max(bar.high);
        self.candle.low = self.candle.low.min(bar.low);
        if bar.time >= self.last_source_time {
            self.candle.close = bar.close;
            self.last_source_time = bar.time;
        }
    }

    pub fn to_persisted(&self) -> PersistedBucket {
        PersistedBucket::new(self.candle, self.last_source_time)
    }

    /// 从已持久化的桶恢复；缺少 `lastSrcTime` 的旧记录按桶起始时间处理
    pub fn from_persisted(bucket: &PersistedBucket) -> Self {
        Self {
            bucket_start: bucket.time,
            candle: bucket.candle(),
            last_source_time: bucket.last_src_time.unwrap_or(bucket.time),
        }
    }
}

/// 把本进程的桶合并进存储里已有的同一个桶（多写者场景）
///
/// high/low 取极值，close 由 `lastSrcTime` 较新的一方决定，open 保留先写入者的值。
pub fn merge_bucket(existing: Option<&PersistedBucket>, ours: &PersistedBucket) -> PersistedBucket {
    let Some(existing) = existing.filter(|e| e.time == ours.time) else {
        return *ours;
    };
    let existing_last = existing.last_src_time.unwrap_or(i64::MIN);
    let ours_last = ours.last_src_time.unwrap_or(i64::MIN);
    let (close, last_src_time) = if ours_last >= existing_last {
        (ours.close, ours.last_src_time)
    } else {
        (existing.close, existing.last_src_time)
    };
    PersistedBucket {
        time: ours.time,
        open: existing.open,
        high: existing.high.max(ours.high),
        low: existing.low.min(ours.low),
        close,
        last_src_time,
    }
}

/// 实时聚合的刷新策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// 窗口内累积所有脏桶，每个窗口写一次
    Debounce,
    /// 每个周期的两次写入之间至少间隔 `flush_interval_ms`
    #[default]
    Throttle,
}

/// 桶的写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// 直接覆盖整条记录
    #[default]
    Overwrite,
    /// 通过存储事务与已有记录合并
    Transactional,
}
