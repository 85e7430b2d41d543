use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OHLC K线，`time` 为桶起始时间（UTC秒）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// 源K线（M1）
///
/// 同一个key在"实时"期间会被反复改写（high/low/close 变化），直到新key出现。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceBar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// 接受数字或数字字符串，非有限值视为缺失
fn to_num(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn to_time(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let n = to_num(Some(value))?;
    if n.fract() != 0.0 || n < i64::MIN as f64 || n > i64::MAX as f64 {
        return None;
    }
    Some(n as i64)
}

impl SourceBar {
    /// 从存储中的松散JSON记录解析源K线
    ///
    /// 任何字段缺失或非数字都返回 `None`，调用方应跳过该记录。
    pub fn from_record(record: &Value) -> Option<Self> {
        let obj = record.as_object()?;
        Some(Self {
            time: to_time(obj.get("time"))?,
            open: to_num(obj.get("open"))?,
            high: to_num(obj.get("high"))?,
            low: to_num(obj.get("low"))?,
            close: to_num(obj.get("close"))?,
        })
    }

    pub fn to_record(&self) -> Value {
        serde_json::json!({
            "time": self.time,
            "open": self.open,
            "high": self.high,
            "low": self.low,
            "close": self.close,
        })
    }
}

/// 持久化的周期桶，路径为 `<root>/<周期代码>/<桶起始时间>`
///
/// `lastSrcTime` 与OHLC一同保存，使重启后的收盘价比较保持幂等。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistedBucket {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(rename = "lastSrcTime", default, skip_serializing_if = "Option::is_none")]
    pub last_src_time: Option<i64>,
}

impl PersistedBucket {
    pub fn new(candle: Candle, last_src_time: i64) -> Self {
        Self {
            time: candle.time,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            last_src_time: Some(last_src_time),
        }
    }

    /// 宽松解析：与源K线一样容忍数字字符串
    pub fn from_record(record: &Value) -> Option<Self> {
        let obj = record.as_object()?;
        Some(Self {
            time: to_time(obj.get("time"))?,
            open: to_num(obj.get("open"))?,
            high: to_num(obj.get("high"))?,
            low: to_num(obj.get("low"))?,
            close: to_num(obj.get("close"))?,
            last_src_time: to_time(obj.get("lastSrcTime")),
        })
    }

    pub fn to_record(&self) -> Value {
        // 结构体只含数字字段，序列化不会失败
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn candle(&self) -> Candle {
        Candle {
            time: self.time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_bar_accepts_numeric_strings() {
        let bar = SourceBar::from_record(&json!({
            "time": "120", "open": 1.2, "high": "1.25", "low": 1.15, "close": 1.2
        }))
        .unwrap();
        assert_eq!(bar.time, 120);
        assert_eq!(bar.high, 1.25);
    }

    #[test]
    fn test_source_bar_rejects_malformed_records() {
        assert!(SourceBar::from_record(&json!(null)).is_none());
        assert!(SourceBar::from_record(&json!({"time": 60, "open": 1.0, "high": 1.0, "low": 1.0})).is_none());
        assert!(SourceBar::from_record(&json!({"time": 60, "open": "abc", "high": 1.0, "low": 1.0, "close": 1.0})).is_none());
        assert!(SourceBar::from_record(&json!({"time": 60.5, "open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0})).is_none());
        assert!(SourceBar::from_record(&json!({"time": true, "open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0})).is_none());
    }

    #[test]
    fn test_persisted_bucket_uses_last_src_time_field() {
        let bucket = PersistedBucket::new(
            Candle { time: 300, open: 1.0, high: 2.0, low: 0.5, close: 1.5 },
            540,
        );
        let record = bucket.to_record();
        assert_eq!(record["lastSrcTime"], json!(540));
        assert_eq!(PersistedBucket::from_record(&record), Some(bucket));

        let legacy = PersistedBucket::from_record(&json!({
            "time": 300, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5
        }))
        .unwrap();
        assert_eq!(legacy.last_src_time, None);
    }
}
