//! 统一日志系统初始化模块
//!
//! 控制台输出（文本或JSON）加按天滚动的文件日志。文件写入走 `tracing-appender`
//! 的非阻塞通道，返回的 guard 必须由 `main` 持有到进程退出，否则尾部日志会丢失。

use crate::klcommon::config::LoggingConfig;
use crate::klcommon::{AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 日志 guard，drop 时刷新文件缓冲
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 业务过滤器：配置的级别，外加对第三方库的降噪
fn business_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},r2d2=warn,rusqlite=warn", log_level)))
}

/// 初始化日志系统，只应调用一次
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .json()
        .with_filter(business_filter(&config.log_level));

    // 可选的控制台层：JSON 与文本二选一，用 Option<Layer> 表示关闭
    let (console_json, console_text) = match (config.enable_console_output, config.json_format) {
        (false, _) => (None, None),
        (true, true) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_filter(business_filter(&config.log_level)),
            ),
            None,
        ),
        (true, false) => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_filter(business_filter(&config.log_level)),
            ),
        ),
    };

    Registry::default()
        .with(file_layer)
        .with(console_json)
        .with(console_text)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    // r2d2 通过 log crate 输出，桥接进 tracing
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!("log桥接器初始化失败: {}", e);
    }

    tracing::info!(
        log_dir = %config.log_dir,
        log_level = %config.log_level,
        json_format = config.json_format,
        "日志系统初始化完成"
    );

    Ok(LoggingGuard {
        _file_guard: Some(file_guard),
    })
}
