//! 多周期K线聚合服务启动文件
//!
//! 打开 SQLite 存储，轮询开关，在实时聚合与历史回填之间切换，直到收到 Ctrl-C。

use anyhow::{Context, Result};
use clap::Parser;
use kline_rollup::klaggregate::{LiveAggregator, ModeCoordinator};
use kline_rollup::klcommon::log_targets::ROLLUP_SERVICE;
use kline_rollup::klcommon::{init_logging, RollupConfig, SqliteStore, StoreSwitch};
use kline_rollup::kldata::TimeframeBackfiller;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/rollup_config.toml";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "M1 K线到多周期的滚动聚合服务", long_about = None)]
struct Args {
    /// 配置文件路径，不存在时使用默认配置
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 覆盖配置中的数据库路径
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, loaded_from_file) = if Path::new(&args.config).exists() {
        let config = RollupConfig::from_file(&args.config)
            .with_context(|| format!("加载配置文件失败: {}", args.config))?;
        (config, true)
    } else {
        (RollupConfig::default(), false)
    };
    if let Some(db) = args.db {
        config.store.db_path = db;
    }

    let _log_guard = init_logging(&config.logging).context("初始化日志失败")?;
    if loaded_from_file {
        info!(target: ROLLUP_SERVICE, event_name = "配置已加载", path = %args.config);
    } else {
        warn!(target: ROLLUP_SERVICE, event_name = "配置文件不存在，使用默认配置", path = %args.config);
    }

    let timeframes = config.destination_timeframes().context("目标周期配置无效")?;
    let store = Arc::new(
        SqliteStore::open(&config.store.db_path)
            .with_context(|| format!("打开数据库失败: {}", config.store.db_path))?
            .with_watch_poll(Duration::from_millis(config.store.watch_poll_ms)),
    );

    let switch = Arc::new(StoreSwitch::new(store.clone(), config.switch.clone()));
    let live = Arc::new(LiveAggregator::new(
        store.clone(),
        &config.market_root,
        &config.source_code,
        timeframes.clone(),
        &config.live,
    ));
    let backfiller = TimeframeBackfiller::new(
        store.clone(),
        &config.market_root,
        &config.source_code,
        timeframes,
        &config.backfill,
    );
    let coordinator = Arc::new(ModeCoordinator::new(
        switch,
        live,
        backfiller,
        Duration::from_millis(config.switch.poll_interval_ms),
    ));

    info!(
        target: ROLLUP_SERVICE,
        event_name = "聚合服务启动",
        db_path = %config.store.db_path,
        market_root = %config.market_root,
        timeframes = ?config.timeframes,
    );

    let cancel = CancellationToken::new();
    let runner = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: ROLLUP_SERVICE, event_name = "监听关闭信号失败", error.details = %e);
    }
    info!(target: ROLLUP_SERVICE, event_name = "收到关闭信号，开始优雅关闭");
    cancel.cancel();

    match runner.await.context("协调器任务异常退出")? {
        Ok(()) => info!(target: ROLLUP_SERVICE, event_name = "聚合服务已关闭"),
        Err(e) => {
            error!(
                target: ROLLUP_SERVICE,
                event_name = "关闭时停止实时聚合失败",
                error.summary = e.get_error_type_summary(),
                error.details = %e,
            );
            return Err(e.into());
        }
    }
    Ok(())
}
