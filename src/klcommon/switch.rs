//! 模式开关
//!
//! 协调器轮询的外部开关。默认实现把开关存放在存储的 `config/` 节点下，
//! 与写入K线的是同一个存储。

use crate::klcommon::config::SwitchConfig;
use crate::klcommon::log_targets::MODE_SWITCH;
use crate::klcommon::store::{join_path, TimeSeriesStore};
use crate::klcommon::Result;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// 刷新间隔的允许范围（毫秒）
pub const MAX_FLUSH_INTERVAL_MS: u64 = 5_000;

/// 一次轮询读到的开关快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeSignals {
    pub live_enabled: bool,
    pub backfill_enabled: bool,
    pub backfill_done: bool,
    /// 未设置或无法解析时为 `None`，保持当前值
    pub flush_interval_ms: Option<u64>,
}

impl ModeSignals {
    /// 只有在开启且尚未完成时才执行回填
    pub fn backfill_requested(&self) -> bool {
        self.backfill_enabled && !self.backfill_done
    }
}

pub trait SwitchSource: Send + Sync + 'static {
    fn read_signals(&self) -> impl Future<Output = Result<ModeSignals>> + Send;

    /// 回填成功后自动关闭：清除开启标志并置完成标志
    fn mark_backfill_completed(&self) -> impl Future<Output = Result<()>> + Send;
}

/// 从存储 `config/` 读取开关
pub struct StoreSwitch<S> {
    store: Arc<S>,
    keys: SwitchConfig,
}

impl<S: TimeSeriesStore> StoreSwitch<S> {
    pub fn new(store: Arc<S>, keys: SwitchConfig) -> Self {
        Self { store, keys }
    }

    fn key_path(&self, key: &str) -> String {
        join_path(&self.keys.config_root, key)
    }
}

/// 宽松的真值判断：`true`、非零数字、对象/数组、非空字符串；字符串 "0" 与 "false" 视为关闭
fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |v| v != 0.0),
        Some(Value::String(s)) => {
            let s = s.trim();
            !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false")
        }
        Some(Value::Object(_)) | Some(Value::Array(_)) => true,
        Some(Value::Null) | None => false,
    }
}

fn interval_ms(value: Option<&Value>) -> Option<u64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.clamp(0.0, MAX_FLUSH_INTERVAL_MS as f64) as u64)
}

impl<S: TimeSeriesStore> SwitchSource for StoreSwitch<S> {
    async fn read_signals(&self) -> Result<ModeSignals> {
        let config = self.store.read(&self.keys.config_root).await?;
        let field = |key: &str| config.as_ref().and_then(|c| c.get(key));
        Ok(ModeSignals {
            live_enabled: truthy(field(&self.keys.live_key)),
            backfill_enabled: truthy(field(&self.keys.backfill_key)),
            backfill_done: truthy(field(&self.keys.backfill_done_key)),
            flush_interval_ms: interval_ms(field(&self.keys.flush_interval_key)),
        })
    }

    async fn mark_backfill_completed(&self) -> Result<()> {
        let mut fields = Map::new();
        fields.insert(self.keys.backfill_key.clone(), Value::Bool(false));
        fields.insert(self.keys.backfill_done_key.clone(), Value::Bool(true));
        self.store.merge(&self.keys.config_root, fields).await?;
        info!(
            target: MODE_SWITCH,
            event_name = "回填开关已自动关闭",
            path = %self.key_path(&self.keys.backfill_key),
        );
        Ok(())
    }
}
