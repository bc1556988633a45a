//! Raw journal records as emitted by a source.

use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use serde::{Serialize, Serializer, ser::SerializeMap};
use std::fmt;

/// Well-known journal field names.
pub mod fields {
    /// human-readable message string for this entry
    pub const MESSAGE: &str = "MESSAGE";
    /// priority value between 0 ("emerg") and 7 ("debug")
    pub const PRIORITY: &str = "PRIORITY";
    /// time in microseconds since the epoch UTC at which the entry was created
    pub const SOURCE_REALTIME_TIMESTAMP: &str = "_SOURCE_REALTIME_TIMESTAMP";
    /// time in microseconds since the epoch UTC at which the journal received the entry
    pub const REALTIME_TIMESTAMP: &str = "__REALTIME_TIMESTAMP";
    /// the systemd unit name
    pub const SYSTEMD_UNIT: &str = "_SYSTEMD_UNIT";
    /// The kernel boot ID
    pub const BOOT_ID: &str = "_BOOT_ID";
    pub const PID: &str = "_PID";
    pub const COMM: &str = "_COMM";
    pub const SYSLOG_IDENTIFIER: &str = "SYSLOG_IDENTIFIER";
    pub const TRANSPORT: &str = "_TRANSPORT";
}

/// One journal entry: field name to value.
///
/// Fields keep the order in which the source produced them. A repeated field
/// name keeps its first value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLogRecord {
    fields: Vec<(String, String)>,
}

impl RawLogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field. Returns `false` if the name was already present.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        if self.get(&name).is_some() {
            return false;
        }
        self.fields.push((name, value.into()));
        true
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Entry timestamp in epoch microseconds, preferring the time the entry
    /// was created over the time the journal received it.
    pub fn timestamp_micros(&self) -> Option<i64> {
        [fields::SOURCE_REALTIME_TIMESTAMP, fields::REALTIME_TIMESTAMP]
            .iter()
            .filter_map(|f| self.get(f))
            .find_map(|v| v.trim().parse::<i64>().ok())
    }

    pub fn priority(&self) -> Option<u8> {
        self.get(fields::PRIORITY)
            .and_then(|p| p.trim().parse::<u8>().ok())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawLogRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = RawLogRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl Serialize for RawLogRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Accepts journalctl `-o json` objects: strings are kept, numbers and
/// booleans are stringified, byte arrays are decoded lossily, `null` is
/// skipped.
impl<'de> Deserialize<'de> for RawLogRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = RawLogRecord;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a journal entry object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawLogRecord, A::Error> {
                let mut record = RawLogRecord::new();
                while let Some((name, value)) = map.next_entry::<String, serde_json::Value>()? {
                    if let Some(text) = value_to_text(value).map_err(de::Error::custom)? {
                        record.insert(name, text);
                    }
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

fn value_to_text(value: serde_json::Value) -> Result<Option<String>, String> {
    use serde_json::Value;

    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Array(items) => {
            // Binary field data is exported as an array of byte values
            let bytes = items
                .iter()
                .map(|i| i.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| "field array is not a byte sequence".to_string())?;
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Value::Object(_) => Err("nested objects are not journal fields".to_string()),
    }
}
