//! Query and aggregation core for the systemd journal and `/proc`.
//!
//! Records flow from a [`source::RecordSource`] through a
//! [`filter::RecordFilter`] into either the [`table`] normalizer or the
//! [`chart`] aggregator. [`query::LogQuery`] ties the stages together.

pub mod boot;
pub mod budget;
pub mod chart;
pub mod error;
pub mod filter;
pub mod format;
pub mod process;
pub mod query;
pub mod record;
pub mod source;
pub mod systemd;
pub mod table;

pub use budget::ScanBudget;
pub use chart::{BucketSpec, PriorityCountTable, PriorityLevels};
pub use error::{QueryError, Result};
pub use filter::FilterSpec;
pub use format::{EpochFormat, format_epoch};
pub use query::{ChartRequest, LogQuery, LogRequest, ProcessRequest, Response};
pub use record::RawLogRecord;
pub use table::Table;
