//! Per-boot summaries built from journal records.

use crate::record::{RawLogRecord, fields};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootSummary {
    pub boot_id: String,
    /// Epoch microseconds of the oldest entry seen
    pub first_entry: i64,
    pub last_entry: i64,
    pub entries: u64,
}

/// Accumulates [`BootSummary`] values from a record stream.
#[derive(Debug, Default)]
pub struct BootIndex {
    boots: HashMap<String, BootSummary>,
}

impl BootIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records without a boot id or timestamp are ignored.
    pub fn add(&mut self, record: &RawLogRecord) {
        let (Some(boot_id), Some(ts)) = (record.get(fields::BOOT_ID), record.timestamp_micros())
        else {
            return;
        };
        if boot_id.is_empty() {
            return;
        }
        self.boots
            .entry(boot_id.to_string())
            .and_modify(|b| {
                b.first_entry = b.first_entry.min(ts);
                b.last_entry = b.last_entry.max(ts);
                b.entries += 1;
            })
            .or_insert_with(|| BootSummary {
                boot_id: boot_id.to_string(),
                first_entry: ts,
                last_entry: ts,
                entries: 1,
            });
    }

    /// Boots ordered newest first by their last entry.
    pub fn finish(self) -> Vec<BootSummary> {
        let mut boots: Vec<BootSummary> = self.boots.into_values().collect();
        boots.sort_by(|a, b| {
            b.last_entry
                .cmp(&a.last_entry)
                .then_with(|| a.boot_id.cmp(&b.boot_id))
        });
        boots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summarize_boots(records: Vec<RawLogRecord>) -> Vec<BootSummary> {
        let mut index = BootIndex::new();
        for record in &records {
            index.add(record);
        }
        index.finish()
    }

    fn rec(boot: &str, ts: &str) -> RawLogRecord {
        RawLogRecord::new()
            .with(fields::REALTIME_TIMESTAMP, ts)
            .with(fields::BOOT_ID, boot)
    }

    #[test]
    fn test_summarize_boots() {
        let boots = summarize_boots(vec![
            rec("b2", "5000"),
            rec("b2", "4000"),
            rec("b1", "2000"),
            rec("b1", "1000"),
            rec("b1", "1500"),
            RawLogRecord::new().with(fields::REALTIME_TIMESTAMP, "9000"),
            rec("b3", "not a time"),
        ]);
        assert_eq!(
            boots,
            vec![
                BootSummary {
                    boot_id: "b2".into(),
                    first_entry: 4000,
                    last_entry: 5000,
                    entries: 2,
                },
                BootSummary {
                    boot_id: "b1".into(),
                    first_entry: 1000,
                    last_entry: 2000,
                    entries: 3,
                },
            ]
        );
    }

    #[test]
    fn test_empty() {
        assert!(summarize_boots(Vec::new()).is_empty());
    }
}
