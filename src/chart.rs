//! Time-bucketed priority counts for charting.
//!
//! A chart covers the half-open window `[now - span, now)` split into
//! `ceil(span / width)` buckets. Bucket `i` covers
//! `[start + i * width, start + (i + 1) * width)`, the last one clipped to
//! `now`. A timestamp on a boundary belongs to the bucket it opens.
//!
//! Records whose timestamp cannot be parsed are tallied in `untimed`, and
//! records whose priority is missing or outside the configured levels go to
//! the trailing `unknown` column, so no matching record is dropped silently.

use crate::error::{QueryError, Result};
use crate::record::RawLogRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Name of the column for records without a usable priority.
pub const UNKNOWN_LEVEL: &str = "unknown";

/// syslog(3) priority names, indexed by ordinal.
pub const SYSLOG_LEVELS: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

/// Window span and bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    pub span: Duration,
    pub width: Duration,
}

impl BucketSpec {
    pub fn new(span: Duration, width: Duration) -> Self {
        Self { span, width }
    }

    /// Parse `span` and `width` strings such as `24h` and `15m`.
    pub fn parse(span: &str, width: &str) -> Result<Self> {
        Ok(Self::new(parse_duration(span)?, parse_duration(width)?))
    }

    pub fn validate(&self) -> Result<()> {
        if self.width.is_zero() {
            return Err(QueryError::InvalidSpec("bucket width must be positive".into()));
        }
        if self.width > self.span {
            return Err(QueryError::InvalidSpec(format!(
                "bucket width {}us exceeds span {}us",
                self.width.as_micros(),
                self.span.as_micros()
            )));
        }
        micros(self.span)?;
        Ok(())
    }

    pub fn bucket_count(&self) -> usize {
        let span = self.span.as_micros();
        let width = self.width.as_micros();
        if width == 0 {
            return 0;
        }
        span.div_ceil(width) as usize
    }
}

fn micros(d: Duration) -> Result<i64> {
    i64::try_from(d.as_micros())
        .map_err(|_| QueryError::InvalidSpec(format!("duration {d:?} is too large")))
}

/// Parse a duration with a unit suffix: `us`, `ms`, `s`, `m`, `h` or `d`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| QueryError::InvalidSpec(format!("invalid duration '{input}'")))?;

    let seconds = |n: u64| Duration::from_secs(value.saturating_mul(n));
    let duration = match unit {
        "us" => Duration::from_micros(value),
        "ms" => Duration::from_millis(value),
        "s" | "" => seconds(1),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        "d" => seconds(24 * 60 * 60),
        _ => {
            return Err(QueryError::InvalidSpec(format!(
                "unknown duration unit '{unit}' in '{input}'"
            )));
        }
    };
    Ok(duration)
}

/// Configurable priority enumeration; ordinal `n` maps to `names[n]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityLevels {
    names: Vec<String>,
}

impl Default for PriorityLevels {
    fn default() -> Self {
        Self {
            names: SYSLOG_LEVELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PriorityLevels {
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(QueryError::InvalidSpec("no priority levels configured".into()));
        }
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() || name == UNKNOWN_LEVEL || names[..i].contains(name) {
                return Err(QueryError::InvalidSpec(format!(
                    "invalid or duplicate priority level '{name}'"
                )));
            }
        }
        Ok(Self { names })
    }

    /// Parse a comma-separated list such as `emerg,alert,crit`.
    pub fn parse(list: &str) -> Result<Self> {
        Self::new(list.split(',').map(|s| s.trim().to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Column for a priority ordinal; the unknown column when out of range.
    fn column(&self, priority: Option<u8>) -> usize {
        match priority {
            Some(p) if (p as usize) < self.names.len() => p as usize,
            _ => self.names.len(),
        }
    }

    fn columns(&self) -> Vec<String> {
        let mut columns = self.names.clone();
        columns.push(UNKNOWN_LEVEL.to_string());
        columns
    }
}

/// One time bucket; `counts` is aligned to [`PriorityCountTable::levels`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: i64,
    pub end: i64,
    pub counts: Vec<u64>,
}

impl Bucket {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCountTable {
    /// Priority names followed by `unknown`
    pub levels: Vec<String>,
    pub buckets: Vec<Bucket>,
    /// Per-level counts of records without a parseable timestamp
    pub untimed: Vec<u64>,
}

impl PriorityCountTable {
    pub fn level(&self, name: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == name)
    }

    pub fn count(&self, bucket: usize, level: &str) -> Option<u64> {
        let col = self.level(level)?;
        self.buckets.get(bucket).map(|b| b.counts[col])
    }

    /// Sum of every count, including untimed records.
    pub fn total(&self) -> u64 {
        self.buckets.iter().map(Bucket::total).sum::<u64>() + self.untimed.iter().sum::<u64>()
    }
}

/// Streaming accumulator behind [`aggregate`].
#[derive(Debug)]
pub struct Aggregator {
    levels: PriorityLevels,
    start: i64,
    now: i64,
    width: i64,
    table: PriorityCountTable,
}

impl Aggregator {
    pub fn new(bucket: &BucketSpec, now: i64, levels: PriorityLevels) -> Result<Self> {
        bucket.validate()?;
        let span = micros(bucket.span)?;
        let width = micros(bucket.width)?;
        let start = now.saturating_sub(span);
        let columns = levels.columns();

        let buckets = (0..bucket.bucket_count() as i64)
            .map(|i| {
                let lo = start.saturating_add(i.saturating_mul(width));
                Bucket {
                    start: lo,
                    end: lo.saturating_add(width).min(now),
                    counts: vec![0; columns.len()],
                }
            })
            .collect();

        Ok(Self {
            levels,
            start,
            now,
            width,
            table: PriorityCountTable {
                untimed: vec![0; columns.len()],
                levels: columns,
                buckets,
            },
        })
    }

    pub fn add(&mut self, record: &RawLogRecord) {
        let col = self.levels.column(record.priority());
        match record.timestamp_micros() {
            None => self.table.untimed[col] += 1,
            Some(ts) if ts >= self.start && ts < self.now => {
                let index = ((ts - self.start) / self.width) as usize;
                self.table.buckets[index].counts[col] += 1;
            }
            Some(ts) => trace!("timestamp {} outside chart window", ts),
        }
    }

    pub fn finish(self) -> PriorityCountTable {
        self.table
    }
}

/// Count `records` per bucket and syslog priority.
pub fn aggregate<I>(records: I, bucket: &BucketSpec, now: i64) -> Result<PriorityCountTable>
where
    I: IntoIterator<Item = RawLogRecord>,
{
    let mut aggregator = Aggregator::new(bucket, now, PriorityLevels::default())?;
    for record in records {
        aggregator.add(&record);
    }
    Ok(aggregator.finish())
}
