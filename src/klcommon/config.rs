use crate::klaggregate::types::{FlushPolicy, WriteMode};
use crate::klcommon::timeframe::{default_timeframes, Timeframe, SOURCE_CODE};
use crate::klcommon::{AppError, Result};
use serde::{Deserialize, Serialize};

fn default_market_root() -> String {
    "market_data".to_string()
}

fn default_source_code() -> String {
    SOURCE_CODE.to_string()
}

fn default_timeframe_codes() -> Vec<String> {
    default_timeframes().into_iter().map(|tf| tf.code).collect()
}

/// 聚合服务配置，从TOML文件加载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupConfig {
    /// 所有K线的根路径
    #[serde(default = "default_market_root")]
    pub market_root: String,
    /// 源K线周期代码
    #[serde(default = "default_source_code")]
    pub source_code: String,
    /// 目标周期代码列表
    #[serde(default = "default_timeframe_codes")]
    pub timeframes: Vec<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub switch: SwitchConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
    /// 发现其他进程写入的轮询间隔
    pub watch_poll_ms: u64,
}

/// 开关配置：存储中的键名与轮询间隔
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub config_root: String,
    pub live_key: String,
    pub backfill_key: String,
    pub backfill_done_key: String,
    pub flush_interval_key: String,
    pub poll_interval_ms: u64,
}

/// 实时聚合配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub flush_policy: FlushPolicy,
    /// 防抖窗口或节流间隔（毫秒），开关中的值会覆盖它
    pub flush_interval_ms: u64,
    pub write_mode: WriteMode,
    /// 启动时从各周期最后一个已持久化的桶恢复状态
    pub resume_from_store: bool,
}

/// 历史回填配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub page_size: usize,
    pub max_pending_writes: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_dir: String,
    pub file_prefix: String,
    pub json_format: bool,
    pub enable_console_output: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/kline_rollup.db".to_string(),
            watch_poll_ms: 500,
        }
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            config_root: "config".to_string(),
            live_key: "auto_tf_live".to_string(),
            backfill_key: "auto_market_tf_backfill".to_string(),
            backfill_done_key: "auto_market_tf_backfill_done".to_string(),
            flush_interval_key: "tf_live_throttle_ms".to_string(),
            poll_interval_ms: 1_500,
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            flush_policy: FlushPolicy::Throttle,
            flush_interval_ms: 80,
            write_mode: WriteMode::Overwrite,
            resume_from_store: true,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_size: 5_000,
            max_pending_writes: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            file_prefix: "kline_rollup.log".to_string(),
            json_format: false,
            enable_console_output: true,
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            market_root: default_market_root(),
            source_code: default_source_code(),
            timeframes: default_timeframe_codes(),
            store: StoreConfig::default(),
            switch: SwitchConfig::default(),
            live: LiveConfig::default(),
            backfill: BackfillConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RollupConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.market_root.trim_matches('/').is_empty() {
            return Err(AppError::ConfigError("market_root 不能为空".to_string()));
        }
        if self.timeframes.is_empty() {
            return Err(AppError::ConfigError("至少需要一个目标周期".to_string()));
        }
        for code in &self.timeframes {
            if code == &self.source_code {
                return Err(AppError::ConfigError(format!("源周期 {} 不能作为目标周期", code)));
            }
            if Timeframe::from_code(code).is_none() {
                return Err(AppError::ConfigError(format!("未知的周期代码: {}", code)));
            }
        }
        let mut seen = self.timeframes.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.timeframes.len() {
            return Err(AppError::ConfigError("目标周期列表存在重复".to_string()));
        }
        if self.backfill.page_size < 2 {
            // 每页第一条是上一页的最后一条，至少要有一条新记录
            return Err(AppError::ConfigError("backfill.page_size 至少为 2".to_string()));
        }
        if self.backfill.max_pending_writes == 0 {
            return Err(AppError::ConfigError("backfill.max_pending_writes 必须大于 0".to_string()));
        }
        if self.switch.poll_interval_ms == 0 {
            return Err(AppError::ConfigError("switch.poll_interval_ms 必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 解析后的目标周期描述
    pub fn destination_timeframes(&self) -> Result<Vec<Timeframe>> {
        self.timeframes
            .iter()
            .map(|code| {
                Timeframe::from_code(code)
                    .ok_or_else(|| AppError::ConfigError(format!("未知的周期代码: {}", code)))
            })
            .collect()
    }
}
