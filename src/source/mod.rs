//! Record sources: the journal, journal exports, in-memory records and /proc.

pub mod memory;
pub mod procfs;

use crate::budget::ScanBudget;
use crate::error::{QueryError, Result};
use crate::filter::FilterSpec;
use crate::process::{ProcessSample, SystemStatus};
use crate::record::RawLogRecord;
use tracing::debug;

pub use memory::MemorySource;
pub use procfs::ProcfsSource;

/// Time bounds a source may use to skip entries early, in epoch
/// microseconds. Consumers still enforce their own windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanRange {
    pub since: Option<i64>,
    pub until: Option<i64>,
}

/// What a log fetch asks of a source.
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    /// Sources may push unit and boot matches down; the filter engine
    /// re-applies the full filter afterwards.
    pub filter: FilterSpec,
    pub range: ScanRange,
}

/// Result of one cursor step.
#[derive(Debug)]
pub enum Pull {
    Record(RawLogRecord),
    End,
}

/// Pull-based cursor over raw records.
///
/// An entry that cannot be parsed is reported as
/// `Err(QueryError::SourceCorrupt)`; the cursor must stay usable afterwards.
/// Any other error ends the scan.
pub trait LogCursor {
    fn pull(&mut self) -> Result<Pull>;
}

pub trait RecordSource: Send + Sync {
    /// Open a cursor for one request. Fails with `SourceUnavailable` when the
    /// underlying facility cannot be opened.
    fn fetch_logs(&self, params: &FetchParams) -> Result<Box<dyn LogCursor + '_>>;

    /// The entry whose `__REALTIME_TIMESTAMP` is exactly `realtime`, if any.
    fn fetch_entry(&self, realtime: i64) -> Result<Option<RawLogRecord>>;
}

pub trait ProcessSource: Send + Sync {
    fn fetch_processes(&self) -> Result<Vec<ProcessSample>>;

    fn fetch_system_status(&self) -> Result<SystemStatus>;

    /// CPUs that share the capacity CPU percentages are relative to.
    fn cpus(&self) -> usize {
        1
    }
}

/// Iterator over a cursor that checks the budget on every pull and counts
/// the corrupt records it skips.
pub struct RecordStream<'a> {
    cursor: Box<dyn LogCursor + 'a>,
    budget: &'a ScanBudget,
    scanned: u64,
    corrupt: u64,
    done: bool,
}

impl<'a> RecordStream<'a> {
    pub fn new(cursor: Box<dyn LogCursor + 'a>, budget: &'a ScanBudget) -> Self {
        Self {
            cursor,
            budget,
            scanned: 0,
            corrupt: 0,
            done: false,
        }
    }

    /// Records successfully read so far.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    pub fn corrupt(&self) -> u64 {
        self.corrupt
    }
}

impl Iterator for RecordStream<'_> {
    type Item = Result<RawLogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Err(e) = self.budget.check() {
                self.done = true;
                return Some(Err(e));
            }
            match self.cursor.pull() {
                Ok(Pull::Record(record)) => {
                    self.scanned += 1;
                    return Some(Ok(record));
                }
                Err(QueryError::SourceCorrupt(reason)) => {
                    self.corrupt += 1;
                    debug!("skipping corrupt record: {}", reason);
                }
                Ok(Pull::End) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
