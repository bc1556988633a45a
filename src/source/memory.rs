//! In-memory record source, also used for journalctl JSON exports.

use super::{FetchParams, LogCursor, Pull, RecordSource};
use crate::error::{QueryError, Result};
use crate::record::{RawLogRecord, fields};
use std::io::BufRead;
use std::path::Path;

#[derive(Debug, Clone)]
enum Entry {
    Record(RawLogRecord),
    Corrupt(String),
}

/// Records held in memory, served in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entries: Vec<Entry>,
}

impl MemorySource {
    pub fn new(records: Vec<RawLogRecord>) -> Self {
        Self {
            entries: records.into_iter().map(Entry::Record).collect(),
        }
    }

    /// Parse `journalctl -o json` output: one object per line. Lines that
    /// are not journal objects become corrupt entries.
    pub fn from_export<R: BufRead>(reader: R) -> Result<Self> {
        let mut entries = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                QueryError::SourceUnavailable(format!("reading export failed: {e}"))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = match serde_json::from_str::<RawLogRecord>(&line) {
                Ok(record) => Entry::Record(record),
                Err(e) => Entry::Corrupt(format!("line {}: {}", number + 1, e)),
            };
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn open_export(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            QueryError::SourceUnavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::from_export(std::io::BufReader::new(file))
    }

    pub fn push(&mut self, record: RawLogRecord) {
        self.entries.push(Entry::Record(record));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct MemoryCursor<'a> {
    entries: std::slice::Iter<'a, Entry>,
}

impl LogCursor for MemoryCursor<'_> {
    fn pull(&mut self) -> Result<Pull> {
        match self.entries.next() {
            Some(Entry::Record(r)) => Ok(Pull::Record(r.clone())),
            Some(Entry::Corrupt(reason)) => Err(QueryError::SourceCorrupt(reason.clone())),
            None => Ok(Pull::End),
        }
    }
}

impl RecordSource for MemorySource {
    fn fetch_logs(&self, _params: &FetchParams) -> Result<Box<dyn LogCursor + '_>> {
        Ok(Box::new(MemoryCursor {
            entries: self.entries.iter(),
        }))
    }

    fn fetch_entry(&self, realtime: i64) -> Result<Option<RawLogRecord>> {
        let found = self.entries.iter().find_map(|e| match e {
            Entry::Record(r)
                if r.get(fields::REALTIME_TIMESTAMP)
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    == Some(realtime) =>
            {
                Some(r.clone())
            }
            _ => None,
        });
        Ok(found)
    }
}
