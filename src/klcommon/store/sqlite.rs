//! SQLite 持久化存储
//!
//! 每一行保存一个路径节点：`(parent, key, key_num, value)`，`value` 为该节点的JSON。
//! 系列下的K线以整数键逐条成行，`key_num` 索引保证按数值顺序分页。
//! 若某个祖先路径本身已作为一行保存（例如整体写入的 `config` 对象），
//! 对其子路径的读写会落到这一行的JSON内部。
//!
//! 所有 rusqlite 调用都在 `spawn_blocking` 中执行。

use super::memory::{lookup, numeric_children, set_at};
use super::{paths_overlap, split_path, PathUpdate, SeriesWatch, TimeSeriesStore, WatchRegistry};
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::log_targets::TIME_SERIES_STORE;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};

pub type DbPool = Pool<SqliteConnectionManager>;

/// 外部写入者（其他进程）的变更通过轮询发现
const DEFAULT_WATCH_POLL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    watches: Arc<WatchRegistry>,
    watch_poll: Duration,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并初始化表结构
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
            ",
            )
        });

        let pool = Pool::builder().max_size(4).build(manager).map_err(|e| {
            let pool_error = AppError::DatabaseError(format!("创建连接池失败: {}", e));
            tracing::error!(
                target: TIME_SERIES_STORE,
                message = "创建连接池失败",
                db_path = %db_path.display(),
                error.summary = pool_error.get_error_type_summary(),
                error.details = %pool_error
            );
            pool_error
        })?;

        let conn = pool.get()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS nodes (
                parent  TEXT NOT NULL,
                key     TEXT NOT NULL,
                key_num INTEGER,
                value   TEXT NOT NULL,
                PRIMARY KEY (parent, key)
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_series ON nodes (parent, key_num);
        ",
        )?;

        info!(target: TIME_SERIES_STORE, event_name = "存储已打开", db_path = %db_path.display());
        Ok(Self {
            pool,
            watches: Arc::new(WatchRegistry::new()),
            watch_poll: DEFAULT_WATCH_POLL,
        })
    }

    /// 设置外部变更的轮询间隔
    pub fn with_watch_poll(mut self, interval: Duration) -> Self {
        self.watch_poll = interval.max(Duration::from_millis(10));
        self
    }

    pub fn active_watchers(&self, series: &str) -> usize {
        self.watches.active_count(series)
    }

    /// 正在运行的订阅轮询任务数
    pub fn active_pollers(&self) -> usize {
        self.watches.poller_count()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let parent_span = tracing::Span::current();
        task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            parent_span.in_scope(|| f(&mut conn))
        })
        .await?
    }

    /// 在写事务中执行 `f`，提交后推送受影响系列的最新记录
    async fn mutate<T, F>(&self, touched: Vec<String>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let watches = self.watches.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            notify_watchers(conn, &watches, &touched)?;
            Ok(out)
        })
        .await
    }
}

fn read_row(conn: &Connection, parent: &str, key: &str) -> Result<Option<Value>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT value FROM nodes WHERE parent = ?1 AND key = ?2",
            params![parent, key],
            |row| row.get(0),
        )
        .optional()?;
    match text {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

/// 从最深处向上查找第一个作为整行保存的节点，返回 (深度, 值)
fn nearest_row(conn: &Connection, segments: &[&str], max_depth: usize) -> Result<Option<(usize, Value)>> {
    for depth in (1..=max_depth.min(segments.len())).rev() {
        let parent = segments[..depth - 1].join("/");
        if let Some(value) = read_row(conn, &parent, segments[depth - 1])? {
            return Ok(Some((depth, value)));
        }
    }
    Ok(None)
}

/// `parent` 落在 `path` 子树内的范围条件参数：`path/` <= parent < `path0`
fn subtree_bounds(path: &str) -> (String, String) {
    (format!("{}/", path), format!("{}0", path))
}

fn read_at(conn: &Connection, path: &str) -> Result<Option<Value>> {
    let segments = split_path(path);
    if let Some((depth, value)) = nearest_row(conn, &segments, segments.len())? {
        return Ok(lookup(&value, &segments[depth..]).cloned());
    }

    // 没有整行，把子树内的所有行拼成对象
    let path = segments.join("/");
    let mut stmt;
    let rows: Vec<(String, String, String)> = if path.is_empty() {
        stmt = conn.prepare("SELECT parent, key, value FROM nodes")?;
        let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        mapped.collect::<std::result::Result<_, _>>()?
    } else {
        let (low, high) = subtree_bounds(&path);
        stmt = conn.prepare(
            "SELECT parent, key, value FROM nodes WHERE parent = ?1 OR (parent >= ?2 AND parent < ?3)",
        )?;
        let mapped = stmt.query_map(params![path, low, high], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        mapped.collect::<std::result::Result<_, _>>()?
    };
    if rows.is_empty() {
        return Ok(None);
    }

    let mut tree = Value::Object(Map::new());
    for (parent, key, text) in rows {
        let relative_parent = parent[path.len()..].trim_start_matches('/').to_string();
        let mut relative = split_path(&relative_parent);
        relative.push(&key);
        set_at(&mut tree, &relative, serde_json::from_str(&text)?);
    }
    Ok(Some(tree))
}

fn write_at(conn: &Connection, path: &str, value: Value) -> Result<()> {
    let segments = split_path(path);
    let Some((last, parents)) = segments.split_last() else {
        conn.execute("DELETE FROM nodes", [])?;
        if let Value::Object(fields) = value {
            for (key, child) in fields {
                write_at(conn, &key, child)?;
            }
        }
        return Ok(());
    };

    // 祖先已整行保存：在该行JSON内部修改
    if let Some((depth, mut row_value)) = nearest_row(conn, &segments, segments.len() - 1)? {
        set_at(&mut row_value, &segments[depth..], value);
        let row_parent = segments[..depth - 1].join("/");
        let row_key = segments[depth - 1];
        let empty = row_value.as_object().map_or(false, Map::is_empty);
        if empty {
            conn.execute("DELETE FROM nodes WHERE parent = ?1 AND key = ?2", params![row_parent, row_key])?;
        } else {
            upsert_row(conn, &row_parent, row_key, &row_value)?;
        }
        return Ok(());
    }

    let parent = parents.join("/");
    let full = segments.join("/");
    let (low, high) = subtree_bounds(&full);
    conn.execute(
        "DELETE FROM nodes WHERE (parent = ?1 AND key = ?2) OR parent = ?3 OR (parent >= ?4 AND parent < ?5)",
        params![parent, last, full, low, high],
    )?;
    if !value.is_null() {
        upsert_row(conn, &parent, last, &value)?;
    }
    Ok(())
}

fn upsert_row(conn: &Connection, parent: &str, key: &str, value: &Value) -> Result<()> {
    let key_num = key.parse::<i64>().ok();
    conn.execute(
        "INSERT OR REPLACE INTO nodes (parent, key, key_num, value) VALUES (?1, ?2, ?3, ?4)",
        params![parent, key, key_num, serde_json::to_string(value)?],
    )?;
    Ok(())
}

fn query_series(conn: &Connection, sql: &str, series: &str, bound: i64, limit: usize) -> Result<Vec<(i64, Value)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![series, bound, limit as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (key, text) = row?;
        out.push((key, serde_json::from_str(&text)?));
    }
    Ok(out)
}

/// 系列没有逐条成行时（整体写入过），退回到读取整个对象
fn series_from_object(conn: &Connection, series: &str) -> Result<Vec<(i64, Value)>> {
    Ok(read_at(conn, series)?
        .map(|obj| numeric_children(&obj, ""))
        .unwrap_or_default())
}

fn read_page_at(conn: &Connection, series: &str, start_at: Option<i64>, limit: usize) -> Result<Vec<(i64, Value)>> {
    let series = split_path(series).join("/");
    let rows = query_series(
        conn,
        "SELECT key_num, value FROM nodes WHERE parent = ?1 AND key_num IS NOT NULL AND key_num >= ?2 ORDER BY key_num ASC LIMIT ?3",
        &series,
        start_at.unwrap_or(i64::MIN),
        limit,
    )?;
    if !rows.is_empty() {
        return Ok(rows);
    }
    Ok(series_from_object(conn, &series)?
        .into_iter()
        .filter(|(key, _)| start_at.map_or(true, |start| *key >= start))
        .take(limit)
        .collect())
}

fn read_last_at(conn: &Connection, series: &str, limit: usize) -> Result<Vec<(i64, Value)>> {
    let series = split_path(series).join("/");
    let mut rows = query_series(
        conn,
        "SELECT key_num, value FROM nodes WHERE parent = ?1 AND key_num IS NOT NULL AND key_num <= ?2 ORDER BY key_num DESC LIMIT ?3",
        &series,
        i64::MAX,
        limit,
    )?;
    if !rows.is_empty() {
        rows.reverse();
        return Ok(rows);
    }
    let all = series_from_object(conn, &series)?;
    let skip = all.len().saturating_sub(limit);
    Ok(all.into_iter().skip(skip).collect())
}

fn notify_watchers(conn: &Connection, watches: &WatchRegistry, touched: &[String]) -> Result<()> {
    for series in watches.watched_series() {
        if touched.iter().any(|path| paths_overlap(path, &series)) {
            let latest = read_last_at(conn, &series, 1)?.pop();
            watches.publish(&series, latest);
        }
    }
    Ok(())
}

impl TimeSeriesStore for SqliteStore {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        let path = path.to_string();
        self.with_conn(move |conn| read_at(conn, &path)).await
    }

    async fn read_page(&self, series: &str, start_at: Option<i64>, limit: usize) -> Result<Vec<(i64, Value)>> {
        let series = series.to_string();
        self.with_conn(move |conn| read_page_at(conn, &series, start_at, limit)).await
    }

    async fn read_last(&self, series: &str, limit: usize) -> Result<Vec<(i64, Value)>> {
        let series = series.to_string();
        self.with_conn(move |conn| read_last_at(conn, &series, limit)).await
    }

    async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        let path = path.to_string();
        self.mutate(vec![path.clone()], move |conn| {
            for (key, value) in fields {
                write_at(conn, &super::join_path(&path, &key), value)?;
            }
            Ok(())
        })
        .await
    }

    async fn write_batch(&self, updates: Vec<PathUpdate>) -> Result<()> {
        let touched = updates.iter().map(|(path, _)| path.clone()).collect();
        let count = updates.len();
        self.mutate(touched, move |conn| {
            for (path, value) in updates {
                write_at(conn, &path, value)?;
            }
            Ok(())
        })
        .await?;
        debug!(target: TIME_SERIES_STORE, event_name = "批量写入完成", count);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.mutate(vec![path.clone()], move |conn| write_at(conn, &path, Value::Null))
            .await
    }

    async fn transact<F>(&self, path: &str, mut update: F) -> Result<Option<Value>>
    where
        F: FnMut(Option<Value>) -> Option<Value> + Send + 'static,
    {
        // IMMEDIATE 事务先拿到写锁，读到的当前值在提交前不会被其他连接改写
        let path = path.to_string();
        self.mutate(vec![path.clone()], move |conn| {
            let current = read_at(conn, &path)?;
            let next = update(current);
            write_at(conn, &path, next.clone().unwrap_or(Value::Null))?;
            Ok(next)
        })
        .await
    }

    async fn watch_latest(&self, series: &str) -> Result<SeriesWatch> {
        let series = split_path(series).join("/");
        let watches = self.watches.clone();
        let subscribe_series = series.clone();
        let watch = self
            .with_conn(move |conn| {
                let latest = read_last_at(conn, &subscribe_series, 1)?.pop();
                Ok(watches.subscribe(&subscribe_series, latest))
            })
            .await?;

        // 同一系列只保留一个轮询任务
        if !self.watches.claim_poller(&series) {
            return Ok(watch);
        }
        let store = self.clone();
        let poll = self.watch_poll;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if store.watches.release_poller_if_idle(&series) {
                    break;
                }
                let read_series = series.clone();
                match store.with_conn(move |conn| read_last_at(conn, &read_series, 1)).await {
                    Ok(mut latest) => store.watches.publish(&series, latest.pop()),
                    Err(e) => {
                        warn!(target: TIME_SERIES_STORE, event_name = "订阅轮询失败", series = %series, error = %e);
                    }
                }
            }
            debug!(target: TIME_SERIES_STORE, event_name = "订阅轮询结束", series = %series);
        });

        Ok(watch)
    }
}
