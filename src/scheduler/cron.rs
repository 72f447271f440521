//! 5 段 cron 表达式与调度时区
//!
//! `分 时 日 月 周`，每段支持 `*`、列表 `1,15`、范围 `1-5`、步长 `*/10` / `0-30/5`，
//! 月份与星期可用英文缩写（JAN..DEC、SUN..SAT），星期 0 与 7 都表示周日。
//! 日与周同时受限时按「任一匹配」处理，与常见 cron 实现一致。
//! 另支持 `@hourly`、`@daily`、`@weekly`、`@monthly`、`@yearly`。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDateTime, Timelike, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CronError {
    #[error("cron expression '{0}' must have 5 fields")]
    FieldCount(String),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid timezone '{0}': expected UTC, local, or an offset like +08:00")]
    Timezone(String),
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"],
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// 一段的取值集合（位图）；restricted 为 false 表示 `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    restricted: bool,
}

impl Field {
    fn contains(&self, v: u32) -> bool {
        self.bits & (1u64 << v) != 0
    }
}

impl FieldSpec {
    fn error(&self, value: &str, reason: impl Into<String>) -> CronError {
        CronError::InvalidField {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn value(&self, raw: &str) -> Result<u32, CronError> {
        let upper = raw.to_ascii_uppercase();
        if let Some(pos) = self.names.iter().position(|n| *n == upper) {
            // 月份名从 1 开始，星期名从 0 开始
            return Ok(pos as u32 + if self.min == 1 { 1 } else { 0 });
        }
        let v: u32 = raw.parse().map_err(|_| self.error(raw, "not a number"))?;
        if v < self.min || v > self.max {
            return Err(self.error(raw, format!("out of range {}-{}", self.min, self.max)));
        }
        Ok(v)
    }

    fn parse(&self, raw: &str) -> Result<Field, CronError> {
        let mut bits = 0u64;
        let mut restricted = true;
        for item in raw.split(',') {
            if item.is_empty() {
                return Err(self.error(raw, "empty list item"));
            }
            let (range, step) = match item.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s.parse().map_err(|_| self.error(raw, "invalid step"))?;
                    if step == 0 || step > self.max {
                        return Err(self.error(raw, format!("step must be within 1-{}", self.max)));
                    }
                    (r, step)
                }
                None => (item, 1),
            };
            let (start, end) = if range == "*" {
                if step == 1 && raw == "*" {
                    restricted = false;
                }
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (self.value(a)?, self.value(b)?);
                if a > b {
                    return Err(self.error(raw, "range start after end"));
                }
                (a, b)
            } else {
                let a = self.value(range)?;
                // `a/n` 表示从 a 到最大值
                (a, if step > 1 { self.max } else { a })
            };
            let mut v = start;
            while v <= end {
                bits |= 1u64 << v;
                match v.checked_add(step) {
                    Some(next) => v = next,
                    None => break,
                }
            }
        }
        Ok(Field { bits, restricted })
    }
}

/// 解析后的 cron 表达式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expanded = match expr.trim() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(expr.to_string()));
        }
        let mut day_of_week = DAY_OF_WEEK.parse(fields[4])?;
        // 7 与 0 都是周日
        if day_of_week.contains(7) {
            day_of_week.bits |= 1;
        }
        Ok(Self {
            expr: expr.trim().to_string(),
            minute: MINUTE.parse(fields[0])?,
            hour: HOUR.parse(fields[1])?,
            day_of_month: DAY_OF_MONTH.parse(fields[2])?,
            month: MONTH.parse(fields[3])?,
            day_of_week,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// 给定本地时间（分钟精度）是否匹配
    pub fn matches(&self, t: &NaiveDateTime) -> bool {
        if !self.minute.contains(t.minute()) || !self.hour.contains(t.hour()) || !self.month.contains(t.month()) {
            return false;
        }
        let dom = self.day_of_month.contains(t.day());
        let dow = self.day_of_week.contains(t.weekday().num_days_from_sunday());
        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

/// 调度时区
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerTimezone {
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl SchedulerTimezone {
    pub fn parse(s: &str) -> Result<Self, CronError> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "utc" | "z" => return Ok(SchedulerTimezone::Utc),
            "local" => return Ok(SchedulerTimezone::Local),
            _ => {}
        }
        let (sign, rest) = match trimmed.as_bytes().first() {
            Some(b'+') => (1, &trimmed[1..]),
            Some(b'-') => (-1, &trimmed[1..]),
            _ => return Err(CronError::Timezone(s.to_string())),
        };
        let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
        let hours: i32 = h.parse().map_err(|_| CronError::Timezone(s.to_string()))?;
        let minutes: i32 = m.parse().map_err(|_| CronError::Timezone(s.to_string()))?;
        if hours > 23 || minutes > 59 {
            return Err(CronError::Timezone(s.to_string()));
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(SchedulerTimezone::Fixed)
            .ok_or_else(|| CronError::Timezone(s.to_string()))
    }

    /// UTC 时间转为该时区的本地时间
    pub fn localize(&self, now: DateTime<Utc>) -> NaiveDateTime {
        match self {
            SchedulerTimezone::Utc => now.naive_utc(),
            SchedulerTimezone::Local => now.with_timezone(&Local).naive_local(),
            SchedulerTimezone::Fixed(offset) => now.with_timezone(offset).naive_local(),
        }
    }
}

/// 本地时间所在分钟的序号（用于「同一分钟只触发一次」）
pub fn minute_key(t: &NaiveDateTime) -> i64 {
    t.and_utc().timestamp().div_euclid(60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, 0).unwrap()
    }

    #[test]
    fn test_weekday_morning() {
        let cron = CronSchedule::parse("30 8 * * 1-5").unwrap();
        // 2024-06-03 是周一
        assert!(cron.matches(&at(2024, 6, 3, 8, 30)));
        assert!(!cron.matches(&at(2024, 6, 3, 8, 31)));
        assert!(!cron.matches(&at(2024, 6, 2, 8, 30)));
    }

    #[test]
    fn test_steps_lists_and_names() {
        let cron = CronSchedule::parse("*/15 9-17 * JAN,jul MON-FRI").unwrap();
        assert!(cron.matches(&at(2024, 7, 1, 9, 45)));
        assert!(!cron.matches(&at(2024, 7, 1, 9, 50)));
        assert!(!cron.matches(&at(2024, 6, 3, 9, 45)));

        let offset = CronSchedule::parse("5/20 * * * *").unwrap();
        assert!(offset.matches(&at(2024, 1, 1, 0, 25)));
        assert!(!offset.matches(&at(2024, 1, 1, 0, 20)));
    }

    #[test]
    fn test_sunday_as_seven_and_dom_dow_or() {
        let sunday = CronSchedule::parse("0 0 * * 7").unwrap();
        assert!(sunday.matches(&at(2024, 6, 2, 0, 0)));

        // 每月 1 号或每个周五
        let either = CronSchedule::parse("0 12 1 * 5").unwrap();
        assert!(either.matches(&at(2024, 6, 1, 12, 0)));
        assert!(either.matches(&at(2024, 6, 7, 12, 0)));
        assert!(!either.matches(&at(2024, 6, 4, 12, 0)));
    }

    #[test]
    fn test_macros() {
        assert!(CronSchedule::parse("@daily").unwrap().matches(&at(2024, 3, 9, 0, 0)));
        assert!(CronSchedule::parse("@hourly").unwrap().matches(&at(2024, 3, 9, 13, 0)));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(CronSchedule::parse("* * *"), Err(CronError::FieldCount(_))));
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("* * * FOO *").is_err());
    }

    #[test]
    fn test_oversized_step_and_range_rejected() {
        assert!(matches!(
            CronSchedule::parse("1/4294967295 * * * *"),
            Err(CronError::InvalidField { field: "minute", .. })
        ));
        assert!(CronSchedule::parse("*/60 * * * *").is_err());
        assert!(CronSchedule::parse("0-4294967295 * * * *").is_err());
        assert!(CronSchedule::parse("0 0 1-99999999999 * *").is_err());
        let edge = CronSchedule::parse("*/59 * * * *").unwrap();
        assert!(edge.matches(&at(2024, 3, 9, 10, 59)));
        assert!(!edge.matches(&at(2024, 3, 9, 10, 58)));
    }

    #[test]
    fn test_timezone() {
        let tz = SchedulerTimezone::parse("+08:00").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 0, 30, 0).unwrap();
        assert_eq!(tz.localize(now), at(2024, 6, 3, 8, 30));
        assert_eq!(SchedulerTimezone::parse("UTC").unwrap(), SchedulerTimezone::Utc);
        assert_eq!(SchedulerTimezone::parse("local").unwrap(), SchedulerTimezone::Local);
        assert!(SchedulerTimezone::parse("Asia/Shanghai").is_err());
        assert!(SchedulerTimezone::parse("-05:30").is_ok());
    }

    #[test]
    fn test_minute_key() {
        let a = at(2024, 6, 3, 8, 30);
        let b = a + chrono::Duration::seconds(50);
        assert_eq!(minute_key(&a), minute_key(&b));
        assert_ne!(minute_key(&a), minute_key(&at(2024, 6, 3, 8, 31)));
    }
}
