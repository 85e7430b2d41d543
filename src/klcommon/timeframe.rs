//! 时间周期描述与分桶函数
//!
//! 所有时间戳均为UTC秒。固定周期按整除对齐，日/周/月按日历边界对齐：
//! - 日线：UTC 00:00:00
//! - 周线：周一 UTC 00:00:00
//! - 月线：每月1日 UTC 00:00:00
//!
//! 日历计算使用纯整数算法，对所有非负时间戳都不会panic。

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SECONDS_PER_MINUTE: i64 = 60;
pub const SECONDS_PER_DAY: i64 = 86_400;
pub const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;

/// 源K线（M1）的周期代码
pub const SOURCE_CODE: &str = "M1";

/// 周期类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeframeKind {
    /// 固定长度（秒）
    Fixed { size_seconds: i64 },
    CalendarDay,
    CalendarWeek,
    CalendarMonth,
}

/// 时间周期描述
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe {
    pub code: String,
    pub kind: TimeframeKind,
}

/// 默认的目标周期表（不含源周期M1）
const DEFAULT_TABLE: &[(&str, TimeframeKind)] = &[
    ("M5", TimeframeKind::Fixed { size_seconds: 300 }),
    ("M15", TimeframeKind::Fixed { size_seconds: 900 }),
    ("M30", TimeframeKind::Fixed { size_seconds: 1_800 }),
    ("H1", TimeframeKind::Fixed { size_seconds: 3_600 }),
    ("H2", TimeframeKind::Fixed { size_seconds: 7_200 }),
    ("H4", TimeframeKind::Fixed { size_seconds: 14_400 }),
    ("H8", TimeframeKind::Fixed { size_seconds: 28_800 }),
    ("H12", TimeframeKind::Fixed { size_seconds: 43_200 }),
    ("D1", TimeframeKind::CalendarDay),
    ("W1", TimeframeKind::CalendarWeek),
    ("MN", TimeframeKind::CalendarMonth),
];

impl Timeframe {
    pub fn fixed(code: &str, size_seconds: i64) -> Self {
        Self {
            code: code.to_string(),
            kind: TimeframeKind::Fixed { size_seconds },
        }
    }

    /// 根据周期代码查找描述，`M1` 也可以查到（作为源周期）
    pub fn from_code(code: &str) -> Option<Self> {
        if code == SOURCE_CODE {
            return Some(Self::fixed(SOURCE_CODE, SECONDS_PER_MINUTE));
        }
        DEFAULT_TABLE
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(c, kind)| Self {
                code: c.to_string(),
                kind: *kind,
            })
    }

    /// 固定周期的长度；日历周期返回 `None`
    pub fn size_seconds(&self) -> Option<i64> {
        match self.kind {
            TimeframeKind::Fixed { size_seconds } => Some(size_seconds),
            _ => None,
        }
    }

    pub fn bucket_start(&self, time_sec: i64) -> i64 {
        bucket_start(time_sec, self)
    }

    pub fn bucket_end(&self, bucket_start_sec: i64) -> i64 {
        bucket_end(bucket_start_sec, self)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// 全部11个默认目标周期
pub fn default_timeframes() -> Vec<Timeframe> {
    DEFAULT_TABLE
        .iter()
        .map(|(code, kind)| Timeframe {
            code: code.to_string(),
            kind: *kind,
        })
        .collect()
}

/// 计算时间戳所属桶的起始时间
pub fn bucket_start(time_sec: i64, timeframe: &Timeframe) -> i64 {
    match timeframe.kind {
        TimeframeKind::Fixed { size_seconds } => {
            if size_seconds <= 0 {
                return time_sec;
            }
            time_sec.div_euclid(size_seconds) * size_seconds
        }
        TimeframeKind::CalendarDay => start_of_day(time_sec),
        TimeframeKind::CalendarWeek => {
            let days = time_sec.div_euclid(SECONDS_PER_DAY);
            // 1970-01-01 是周四，(days + 3) mod 7 即距周一的天数
            let days_since_monday = (days + 3).rem_euclid(7);
            (days - days_since_monday) * SECONDS_PER_DAY
        }
        TimeframeKind::CalendarMonth => {
            let days = time_sec.div_euclid(SECONDS_PER_DAY);
            let (year, month, _) = civil_from_days(days);
            days_from_civil(year, month, 1) * SECONDS_PER_DAY
        }
    }
}

/// 桶的结束时间（不含）
pub fn bucket_end(bucket_start_sec: i64, timeframe: &Timeframe) -> i64 {
    match timeframe.kind {
        TimeframeKind::Fixed { size_seconds } => bucket_start_sec.saturating_add(size_seconds.max(1)),
        TimeframeKind::CalendarDay => bucket_start_sec.saturating_add(SECONDS_PER_DAY),
        TimeframeKind::CalendarWeek => bucket_start_sec.saturating_add(SECONDS_PER_WEEK),
        TimeframeKind::CalendarMonth => {
            let days = bucket_start_sec.div_euclid(SECONDS_PER_DAY);
            let (year, month, _) = civil_from_days(days);
            let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            days_from_civil(next_year, next_month, 1).saturating_mul(SECONDS_PER_DAY)
        }
    }
}

fn start_of_day(time_sec: i64) -> i64 {
    time_sec.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY
}

/// 天数（自1970-01-01）转为公历 (年, 月, 日)
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

/// 公历 (年, 月, 日) 转为天数（自1970-01-01）
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let m = month as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// 格式化为可读的UTC时间，仅用于日志
pub fn format_bucket_time(time_sec: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(time_sec, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| time_sec.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Utc};

    fn tf(code: &str) -> Timeframe {
        Timeframe::from_code(code).unwrap()
    }

    #[test]
    fn test_default_table_has_eleven_timeframes() {
        let codes: Vec<String> = default_timeframes().into_iter().map(|t| t.code).collect();
        assert_eq!(
            codes,
            vec!["M5", "M15", "M30", "H1", "H2", "H4", "H8", "H12", "D1", "W1", "MN"]
        );
        assert!(Timeframe::from_code("M1").is_some());
        assert!(Timeframe::from_code("X7").is_none());
    }

    #[test]
    fn test_fixed_bucket_contains_time() {
        for timeframe in default_timeframes() {
            let Some(size) = timeframe.size_seconds() else { continue };
            for t in [0i64, 1, 59, 299, 300, 3_599, 3_600, 1_704_283_199, 1_735_689_600] {
                let b = bucket_start(t, &timeframe);
                assert!(b <= t && t < b + size, "{} t={} b={}", timeframe, t, b);
                assert_eq!(b % size, 0);
            }
        }
    }

    #[test]
    fn test_weekly_alignment_is_monday() {
        // 2024-01-03 12:00:00 UTC 周三
        let t = 1_704_283_200;
        let b = bucket_start(t, &tf("W1"));
        let dt = Utc.timestamp_opt(b, 0).unwrap();
        assert_eq!(dt.weekday(), chrono::Weekday::Mon);
        assert_eq!(b, 1_704_067_200); // 2024-01-01 周一

        // 纪元本身是周四，所属周从 1969-12-29 开始
        assert_eq!(bucket_start(0, &tf("W1")), -3 * SECONDS_PER_DAY);
    }

    #[test]
    fn test_calendar_alignment_matches_chrono() {
        let mut t = 0i64;
        while t < 2_000_000_000 {
            let dt = Utc.timestamp_opt(t, 0).unwrap();

            let day = bucket_start(t, &tf("D1"));
            let expected_day = Utc
                .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
                .unwrap()
                .timestamp();
            assert_eq!(day, expected_day);

            let week = bucket_start(t, &tf("W1"));
            let expected_week = expected_day - dt.weekday().num_days_from_monday() as i64 * SECONDS_PER_DAY;
            assert_eq!(week, expected_week);

            let month = bucket_start(t, &tf("MN"));
            let expected_month = Utc
                .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .unwrap()
                .timestamp();
            assert_eq!(month, expected_month, "t={}", t);
            let month_dt = Utc.timestamp_opt(month, 0).unwrap();
            assert_eq!((month_dt.day(), month_dt.hour()), (1, 0));

            t += 7_777_777;
        }
    }

    #[test]
    fn test_buckets_partition_time() {
        for timeframe in default_timeframes() {
            let mut start = bucket_start(1_700_000_000, &timeframe);
            for _ in 0..30 {
                let end = bucket_end(start, &timeframe);
                assert!(end > start);
                assert_eq!(bucket_start(end - 1, &timeframe), start, "{}", timeframe);
                assert_eq!(bucket_start(end, &timeframe), end, "{}", timeframe);
                start = end;
            }
        }
    }

    #[test]
    fn test_month_end_handles_december_and_leap_years() {
        let mn = tf("MN");
        // 2023-12-15
        let dec = bucket_start(1_702_598_400, &mn);
        assert_eq!(dec, 1_701_388_800); // 2023-12-01
        assert_eq!(bucket_end(dec, &mn), 1_704_067_200); // 2024-01-01
        // 2024-02 有29天
        let feb = bucket_start(1_707_955_200, &mn);
        assert_eq!(bucket_end(feb, &mn) - feb, 29 * SECONDS_PER_DAY);
    }

    #[test]
    fn test_bucket_start_is_total() {
        for timeframe in default_timeframes() {
            for t in [0, 1, i64::MAX / 2, i64::MAX] {
                let b = bucket_start(t, &timeframe);
                assert!(b <= t);
            }
        }
    }
}
