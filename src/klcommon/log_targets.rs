//! 日志target常量
//!
//! 统一在这里定义，便于用 `RUST_LOG=存储=debug` 这类过滤表达式单独打开某个模块。

pub const TIME_SERIES_STORE: &str = "存储";
pub const MODE_SWITCH: &str = "模式开关";
pub const BACKFILL: &str = "历史回填";
pub const LIVE_AGGREGATOR: &str = "实时聚合";
pub const MODE_COORDINATOR: &str = "模式协调";
pub const ROLLUP_SERVICE: &str = "聚合服务";
