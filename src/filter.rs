//! Record filtering by unit, boot, transport, priority, time and free text.

use crate::error::{QueryError, Result};
use crate::record::{RawLogRecord, fields};
use crate::source::ScanRange;
use serde::{Deserialize, Serialize};

/// Highest syslog priority ordinal ("debug").
pub const MAX_PRIORITY: u8 = 7;

/// Caller-facing filter options. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    pub unit: Option<String>,
    pub boot: Option<String>,
    pub quick_filter: Option<String>,
    /// Keep records at this priority or more severe
    pub priority: Option<u8>,
    /// `_TRANSPORT` values to keep, e.g. `kernel`, `syslog`, `stdout`.
    /// Any of them may match; empty keeps every transport.
    #[serde(default)]
    pub transports: Vec<String>,
}

impl FilterSpec {
    pub fn unit(&self) -> Option<&str> {
        non_empty(&self.unit)
    }

    pub fn boot(&self) -> Option<&str> {
        non_empty(&self.boot)
    }

    pub fn quick_filter(&self) -> Option<&str> {
        non_empty(&self.quick_filter)
    }

    pub fn transports(&self) -> impl Iterator<Item = &str> {
        self.transports
            .iter()
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.unit().is_none()
            && self.boot().is_none()
            && self.quick_filter().is_none()
            && self.priority.is_none()
            && self.transports().next().is_none()
    }

    pub fn validate(&self) -> Result<()> {
        let named = [("unit", self.unit()), ("boot", self.boot())]
            .into_iter()
            .chain(self.transports().map(|t| ("transport", Some(t))));
        for (name, value) in named {
            if value.is_some_and(|v| v.contains('\0')) {
                return Err(QueryError::InvalidSpec(format!(
                    "{name} filter contains a NUL byte"
                )));
            }
        }
        if let Some(p) = self.priority
            && p > MAX_PRIORITY
        {
            return Err(QueryError::InvalidSpec(format!(
                "priority {p} is above the highest priority {MAX_PRIORITY}"
            )));
        }
        Ok(())
    }

    /// Validate and build the predicate.
    pub fn compile(&self) -> Result<RecordFilter> {
        self.validate()?;
        Ok(RecordFilter {
            unit: self.unit().map(str::to_string),
            boot: self.boot().map(str::to_string),
            needle: self.quick_filter().map(str::to_lowercase),
            priority: self.priority,
            transports: self.transports().map(str::to_string).collect(),
            range: ScanRange::default(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Check that `since < until` when both bounds are set.
pub fn validate_range(range: &ScanRange) -> Result<()> {
    if let (Some(since), Some(until)) = (range.since, range.until)
        && since >= until
    {
        return Err(QueryError::InvalidSpec(format!(
            "time range start {since} is not before its end {until}"
        )));
    }
    Ok(())
}

/// Compiled form of a [`FilterSpec`]; all present predicates are ANDed.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    unit: Option<String>,
    boot: Option<String>,
    needle: Option<String>,
    priority: Option<u8>,
    transports: Vec<String>,
    range: ScanRange,
}

impl RecordFilter {
    /// Also require the record timestamp to lie in `[since, until)`.
    /// Records without a timestamp fail a bounded window.
    pub fn within(mut self, range: ScanRange) -> Self {
        self.range = range;
        self
    }

    pub fn matches(&self, record: &RawLogRecord) -> bool {
        if let Some(unit) = &self.unit
            && record.get(fields::SYSTEMD_UNIT) != Some(unit.as_str())
        {
            return false;
        }
        if let Some(boot) = &self.boot
            && record.get(fields::BOOT_ID) != Some(boot.as_str())
        {
            return false;
        }
        if !self.transports.is_empty()
            && !record
                .get(fields::TRANSPORT)
                .is_some_and(|t| self.transports.iter().any(|want| want == t))
        {
            return false;
        }
        if let Some(max) = self.priority
            && !record.priority().is_some_and(|p| p <= max)
        {
            return false;
        }
        if !self.in_range(record) {
            return false;
        }
        if let Some(needle) = &self.needle
            && !record
                .values()
                .any(|v| v.to_lowercase().contains(needle.as_str()))
        {
            return false;
        }
        true
    }

    fn in_range(&self, record: &RawLogRecord) -> bool {
        let ScanRange { since, until } = self.range;
        if since.is_none() && until.is_none() {
            return true;
        }
        match record.timestamp_micros() {
            Some(ts) => since.is_none_or(|s| ts >= s) && until.is_none_or(|u| ts < u),
            None => false,
        }
    }

    pub fn apply<'a, I>(&'a self, records: I) -> impl Iterator<Item = RawLogRecord> + 'a
    where
        I: IntoIterator<Item = RawLogRecord>,
        I::IntoIter: 'a,
    {
        records.into_iter().filter(move |r| self.matches(r))
    }

    /// Filter a fallible stream, letting errors through so they abort the
    /// consumer.
    pub fn apply_fallible<'a, I>(&'a self, records: I) -> impl Iterator<Item = Result<RawLogRecord>> + 'a
    where
        I: Iterator<Item = Result<RawLogRecord>> + 'a,
    {
        records.filter(move |r| match r {
            Ok(record) => self.matches(record),
            Err(_) => true,
        })
    }
}

/// Stream `records` through `spec`.
pub fn apply<I>(records: I, spec: &FilterSpec) -> Result<Vec<RawLogRecord>>
where
    I: IntoIterator<Item = RawLogRecord>,
{
    let filter = spec.compile()?;
    Ok(filter.apply(records).collect())
}
