//! 最新键订阅
//!
//! 每个订阅者记录上次看到的 (键, 值)。存储在写入后调用 `publish`，
//! 注册表据此判断是新增键（`Added`）还是最新键被改写（`Changed`）。

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::klcommon::log_targets::TIME_SERIES_STORE;

/// 最新键变化事件
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesEvent {
    Added { key: i64, value: Value },
    Changed { key: i64, value: Value },
}

impl SeriesEvent {
    pub fn key(&self) -> i64 {
        match self {
            SeriesEvent::Added { key, .. } | SeriesEvent::Changed { key, .. } => *key,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            SeriesEvent::Added { value, .. } | SeriesEvent::Changed { value, .. } => value,
        }
    }
}

/// 订阅句柄，drop 即取消订阅
pub struct SeriesWatch {
    series: String,
    receiver: mpsc::UnboundedReceiver<SeriesEvent>,
}

impl SeriesWatch {
    pub fn series(&self) -> &str {
        &self.series
    }

    /// 等待下一个事件；存储端关闭时返回 `None`
    pub async fn recv(&mut self) -> Option<SeriesEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SeriesEvent> {
        self.receiver.try_recv().ok()
    }
}

struct Watcher {
    series: String,
    last: Option<(i64, Value)>,
    sender: mpsc::UnboundedSender<SeriesEvent>,
}

#[derive(Default)]
pub struct WatchRegistry {
    watchers: Mutex<Vec<Watcher>>,
    /// 已有轮询任务的系列，每个系列至多一个
    pollers: Mutex<HashSet<String>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册订阅；若系列已有记录，立即推送一次 `Added`
    pub fn subscribe(&self, series: &str, latest: Option<(i64, Value)>) -> SeriesWatch {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some((key, value)) = &latest {
            let _ = sender.send(SeriesEvent::Added { key: *key, value: value.clone() });
        }
        let mut watchers = self.lock();
        watchers.retain(|w| !w.sender.is_closed());
        watchers.push(Watcher {
            series: series.to_string(),
            last: latest,
            sender,
        });
        debug!(target: TIME_SERIES_STORE, event_name = "订阅已注册", series = %series, watchers = watchers.len());
        SeriesWatch {
            series: series.to_string(),
            receiver,
        }
    }

    /// 当前仍存活的订阅所关注的系列
    pub fn watched_series(&self) -> Vec<String> {
        let mut series: Vec<String> = self
            .lock()
            .iter()
            .filter(|w| !w.sender.is_closed())
            .map(|w| w.series.clone())
            .collect();
        series.sort();
        series.dedup();
        series
    }

    pub fn active_count(&self, series: &str) -> usize {
        self.lock()
            .iter()
            .filter(|w| w.series == series && !w.sender.is_closed())
            .count()
    }

    /// 推送系列当前的最新记录；与订阅者上次看到的相同则不发送
    pub fn publish(&self, series: &str, latest: Option<(i64, Value)>) {
        let Some((key, value)) = latest else { return };
        let mut watchers = self.lock();
        for watcher in watchers.iter_mut().filter(|w| w.series == series) {
            let event = match &watcher.last {
                Some((last_key, _)) if *last_key != key => SeriesEvent::Added { key, value: value.clone() },
                Some((_, last_value)) if *last_value != value => SeriesEvent::Changed { key, value: value.clone() },
                Some(_) => continue,
                None => SeriesEvent::Added { key, value: value.clone() },
            };
            watcher.last = Some((key, value.clone()));
            // 接收端已drop，下面统一清理
            let _ = watcher.sender.send(event);
        }
        watchers.retain(|w| !w.sender.is_closed());
    }

    /// 为系列登记轮询任务；已有任务在跑时返回 `false`
    pub fn claim_poller(&self, series: &str) -> bool {
        self.lock_pollers().insert(series.to_string())
    }

    /// 系列已无订阅者时注销轮询任务并返回 `true`
    ///
    /// 在订阅表锁内完成判断与注销，与 `subscribe` 之后的 `claim_poller` 不会错过彼此。
    pub fn release_poller_if_idle(&self, series: &str) -> bool {
        let watchers = self.lock();
        let idle = !watchers.iter().any(|w| w.series == series && !w.sender.is_closed());
        if idle {
            self.lock_pollers().remove(series);
        }
        idle
    }

    pub fn poller_count(&self) -> usize {
        self.lock_pollers().len()
    }

    fn lock_pollers(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.pollers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Watcher>> {
        // 持锁期间不会panic，中毒后继续使用内部数据
        self.watchers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
