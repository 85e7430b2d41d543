//! 进程内JSON树存储
//!
//! 语义与实时数据库一致：路径逐级为对象，写入 `null` 即删除，
//! 删除后留下的空对象会被向上清理。

use super::{paths_overlap, split_path, PathUpdate, SeriesWatch, TimeSeriesStore, WatchRegistry};
use crate::klcommon::Result;
use serde_json::{Map, Value};
use std::sync::{Mutex, MutexGuard};

pub struct MemoryStore {
    root: Mutex<Value>,
    watches: WatchRegistry,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(Value::Object(Map::new())),
            watches: WatchRegistry::new(),
        }
    }

    /// 当前订阅某系列的存活订阅数
    pub fn active_watchers(&self, series: &str) -> usize {
        self.watches.active_count(series)
    }

    /// 同步读取，便于测试断言
    pub fn get(&self, path: &str) -> Option<Value> {
        lookup(&self.lock(), &split_path(path)).cloned()
    }

    /// 同步写入单个路径
    pub fn set(&self, path: &str, value: Value) {
        let mut root = self.lock();
        set_at(&mut root, &split_path(path), value);
        self.notify(&root, &[path]);
    }

    /// 系列中所有数字键记录（升序）
    pub fn series_records(&self, series: &str) -> Vec<(i64, Value)> {
        numeric_children(&self.lock(), series)
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 对受影响的被订阅系列推送最新记录
    fn notify(&self, root: &Value, touched: &[&str]) {
        for series in self.watches.watched_series() {
            if touched.iter().any(|path| paths_overlap(path, &series)) {
                let latest = numeric_children(root, &series).pop();
                self.watches.publish(&series, latest);
            }
        }
    }
}

pub(super) fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(*segment)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

pub(super) fn set_at(root: &mut Value, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = if value.is_null() { Value::Object(Map::new()) } else { value };
        return;
    };

    if value.is_null() {
        remove_at(root, segments);
        return;
    }

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(obj) => obj
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Some(obj) = node.as_object_mut() {
        obj.insert(last.to_string(), value);
    }
}

/// 删除节点并清理因此变空的父对象
fn remove_at(node: &mut Value, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else { return false };
    let Some(obj) = node.as_object_mut() else { return false };
    if rest.is_empty() {
        obj.remove(*first);
    } else if let Some(child) = obj.get_mut(*first) {
        if remove_at(child, rest) {
            obj.remove(*first);
        }
    }
    obj.is_empty()
}

pub(super) fn numeric_children(root: &Value, series: &str) -> Vec<(i64, Value)> {
    let Some(obj) = lookup(root, &split_path(series)).and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut children: Vec<(i64, Value)> = obj
        .iter()
        .filter_map(|(k, v)| k.parse::<i64>().ok().map(|key| (key, v.clone())))
        .collect();
    children.sort_by_key(|(key, _)| *key);
    children
}

fn merge_fields(root: &mut Value, segments: &[&str], fields: Map<String, Value>) {
    let mut current = lookup(root, segments)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (k, v) in fields {
        if v.is_null() {
            current.remove(&k);
        } else {
            current.insert(k, v);
        }
    }
    set_at(root, segments, Value::Object(current));
}

impl TimeSeriesStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.get(path))
    }

    async fn read_page(&self, series: &str, start_at: Option<i64>, limit: usize) -> Result<Vec<(i64, Value)>> {
        let records = numeric_children(&self.lock(), series);
        Ok(records
            .into_iter()
            .filter(|(key, _)| start_at.map_or(true, |start| *key >= start))
            .take(limit)
            .collect())
    }

    async fn read_last(&self, series: &str, limit: usize) -> Result<Vec<(i64, Value)>> {
        let records = numeric_children(&self.lock(), series);
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        let mut root = self.lock();
        merge_fields(&mut root, &split_path(path), fields);
        self.notify(&root, &[path]);
        Ok(())
    }

    async fn write_batch(&self, updates: Vec<PathUpdate>) -> Result<()> {
        let mut root = self.lock();
        for (path, value) in &updates {
            set_at(&mut root, &split_path(path), value.clone());
        }
        let touched: Vec<&str> = updates.iter().map(|(path, _)| path.as_str()).collect();
        self.notify(&root, &touched);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut root = self.lock();
        set_at(&mut root, &split_path(path), Value::Null);
        self.notify(&root, &[path]);
        Ok(())
    }

    async fn transact<F>(&self, path: &str, mut update: F) -> Result<Option<Value>>
    where
        F: FnMut(Option<Value>) -> Option<Value> + Send + 'static,
    {
        // 整个读-改-写在同一把锁内完成，不会出现冲突重试
        let mut root = self.lock();
        let segments = split_path(path);
        let current = lookup(&root, &segments).cloned();
        let next = update(current);
        set_at(&mut root, &segments, next.clone().unwrap_or(Value::Null));
        self.notify(&root, &[path]);
        Ok(next)
    }

    async fn watch_latest(&self, series: &str) -> Result<SeriesWatch> {
        let root = self.lock();
        let latest = numeric_children(&root, series).pop();
        Ok(self.watches.subscribe(series, latest))
    }
}
