//! 层级键值时间序列存储
//!
//! 存储按路径寻址（`market_data/M1/1700000000`），系列（series）的子键为整数并按数值排序。
//! 本模块定义聚合核心依赖的存储接口，以及两个实现：
//!
//! - `MemoryStore`: 进程内JSON树，用于测试和单机运行
//! - `SqliteStore`: 基于 r2d2 连接池的 SQLite 持久化实现

pub mod memory;
pub mod sqlite;
pub mod watch;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use watch::{SeriesEvent, SeriesWatch, WatchRegistry};

use crate::klcommon::Result;
use serde_json::{Map, Value};
use std::future::Future;

/// 路径与值的多路径批量写入，`Value::Null` 表示删除
pub type PathUpdate = (String, Value);

/// 聚合核心所需的存储原语
///
/// 所有方法返回 `Send` 的 future，以便在 `tokio::spawn` 的任务中调用。
pub trait TimeSeriesStore: Send + Sync + 'static {
    /// 点读取，路径不存在返回 `None`
    fn read(&self, path: &str) -> impl Future<Output = Result<Option<Value>>> + Send;

    /// 按键升序读取一页，`start_at` 为包含的起始键
    fn read_page(
        &self,
        series: &str,
        start_at: Option<i64>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(i64, Value)>>> + Send;

    /// 读取最后 `limit` 条记录（升序返回）
    fn read_last(&self, series: &str, limit: usize) -> impl Future<Output = Result<Vec<(i64, Value)>>> + Send;

    /// 部分字段合并写入
    fn merge(&self, path: &str, fields: Map<String, Value>) -> impl Future<Output = Result<()>> + Send;

    /// 多路径批量写入
    fn write_batch(&self, updates: Vec<PathUpdate>) -> impl Future<Output = Result<()>> + Send;

    /// 删除路径及其所有子节点
    fn remove(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// 事务式读-改-写，返回提交后的值
    ///
    /// `update` 收到当前值，返回 `None` 表示删除。
    fn transact<F>(&self, path: &str, update: F) -> impl Future<Output = Result<Option<Value>>> + Send
    where
        F: FnMut(Option<Value>) -> Option<Value> + Send + 'static;

    /// 订阅系列中最新键的变化（新增或改写）
    fn watch_latest(&self, series: &str) -> impl Future<Output = Result<SeriesWatch>> + Send;
}

/// 拼接路径片段，忽略多余的斜杠
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}/{}", parent, child)
    }
}

/// `<root>/<code>`
pub fn series_path(root: &str, code: &str) -> String {
    join_path(root, code)
}

/// `<root>/<code>/<bucket_start>`
pub fn bucket_path(root: &str, code: &str, bucket_start: i64) -> String {
    join_path(&series_path(root, code), &bucket_start.to_string())
}

/// 拆分路径为非空片段
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// 拆分为 (父路径, 末级键)
pub fn split_parent(path: &str) -> (String, String) {
    let segments = split_path(path);
    match segments.split_last() {
        Some((last, parents)) => (parents.join("/"), last.to_string()),
        None => (String::new(), String::new()),
    }
}

/// 两个路径是否存在祖先/后代关系（含相等）
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = split_path(a);
    let b = split_path(b);
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}
