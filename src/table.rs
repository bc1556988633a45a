//! Normalization of heterogeneous records into a header/rows table.

use crate::record::RawLogRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Ordered headers plus rows of string cells aligned to them.
///
/// Every row has exactly `headers.len()` cells. A field missing from a
/// record renders as an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Ordered set of field names in first-seen order.
#[derive(Debug, Default)]
struct HeaderSet {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl HeaderSet {
    fn insert(&mut self, name: &str) {
        if !self.index.contains_key(name) {
            self.index.insert(name.to_string(), self.names.len());
            self.names.push(name.to_string());
        }
    }

    fn from_names(names: Vec<String>) -> Self {
        let mut set = HeaderSet::default();
        for name in &names {
            set.insert(name);
        }
        set
    }
}

impl Table {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Cell of `row` under header `name`.
    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        let col = self.column(name)?;
        self.rows.get(row).map(|r| r[col].as_str())
    }

    fn build(headers: HeaderSet, records: &[RawLogRecord]) -> Self {
        let rows = records
            .iter()
            .map(|record| {
                let mut row = vec![String::new(); headers.names.len()];
                for (name, value) in record.iter() {
                    if let Some(&col) = headers.index.get(name) {
                        row[col] = value.to_string();
                    }
                }
                row
            })
            .collect();

        Self {
            headers: headers.names,
            rows,
        }
    }
}

/// Build a table whose headers are the union of all field names, in the
/// order they are first seen. Rows keep the order of `records`.
pub fn normalize<I>(records: I) -> Table
where
    I: IntoIterator<Item = RawLogRecord>,
{
    let records: Vec<RawLogRecord> = records.into_iter().collect();
    let mut headers = HeaderSet::default();
    for record in &records {
        for name in record.names() {
            headers.insert(name);
        }
    }
    Table::build(headers, &records)
}

/// Build a table with caller-chosen headers; duplicate names are dropped.
pub fn project<I>(headers: Vec<String>, records: I) -> Table
where
    I: IntoIterator<Item = RawLogRecord>,
{
    let records: Vec<RawLogRecord> = records.into_iter().collect();
    Table::build(HeaderSet::from_names(headers), &records)
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.headers.join("\t"))?;
        for row in &self.rows {
            writeln!(f, "{}", row.join("\t"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<RawLogRecord> {
        vec![
            RawLogRecord::new().with("MESSAGE", "a").with("PRIORITY", "6"),
            RawLogRecord::new().with("_PID", "12").with("MESSAGE", "b"),
            RawLogRecord::new(),
            RawLogRecord::new().with("PRIORITY", "3").with("_BOOT_ID", "x"),
        ]
    }

    #[test]
    fn test_headers_in_first_seen_order() {
        let table = normalize(records());
        assert_eq!(table.headers, ["MESSAGE", "PRIORITY", "_PID", "_BOOT_ID"]);
    }

    #[test]
    fn test_rows_aligned_to_headers() {
        let table = normalize(records());
        assert_eq!(table.row_count(), 4);
        for row in &table.rows {
            assert_eq!(row.len(), table.headers.len());
        }
        assert_eq!(table.rows[1], ["b", "", "12", ""]);
        assert_eq!(table.rows[2], ["", "", "", ""]);
        assert_eq!(table.cell(3, "_BOOT_ID"), Some("x"));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let first = normalize(records());
        let second = normalize(records());
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_empty_input() {
        let table = normalize(Vec::new());
        assert!(table.headers.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_project_selected_fields() {
        let table = project(
            vec!["PRIORITY".into(), "MESSAGE".into(), "PRIORITY".into(), "MISSING".into()],
            records(),
        );
        assert_eq!(table.headers, ["PRIORITY", "MESSAGE", "MISSING"]);
        assert_eq!(table.rows[0], ["6", "a", ""]);
        assert_eq!(table.rows[1], ["", "b", ""]);
    }

    #[test]
    fn test_json_shape() {
        let table = normalize(vec![RawLogRecord::new().with("A", "1")]);
        assert_eq!(
            serde_json::to_string(&table).unwrap(),
            r#"{"headers":["A"],"rows":[["1"]]}"#
        );
    }
}
