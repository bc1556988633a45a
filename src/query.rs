//! Query facade: composes source, filter, normalizer and aggregator.
//!
//! Every request validates its options before touching a source, then runs
//! its pipeline on the blocking pool under a fresh [`ScanBudget`]. A request
//! either completes or fails as a whole; there are no partial results.

use crate::boot::{BootIndex, BootSummary};
use crate::budget::ScanBudget;
use crate::chart::{Aggregator, BucketSpec, PriorityCountTable, PriorityLevels};
use crate::error::{QueryError, Result};
use crate::filter::{FilterSpec, validate_range};
use crate::process::{
    ProcessSample, SortKey, SortOrder, SystemStatus, apply_windowed_cpu, sort_processes,
};
use crate::record::RawLogRecord;
use crate::source::{FetchParams, ProcessSource, RecordSource, RecordStream, ScanRange};
use crate::systemd::{SystemdClient, UnitInfo};
use crate::table::{self, Table};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Default)]
pub struct LogRequest {
    pub filter: FilterSpec,
    /// Maximum number of rows, newest first for the journal
    pub limit: Option<usize>,
    /// Fixed column selection; all fields seen when absent
    pub fields: Option<Vec<String>>,
    /// Oldest timestamp to include, epoch microseconds
    pub since: Option<i64>,
    /// Exclusive upper bound, epoch microseconds
    pub until: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ChartRequest {
    pub filter: FilterSpec,
    pub bucket: BucketSpec,
    /// Window end in epoch microseconds; the current time when absent
    pub now: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub sort_by: Option<SortKey>,
    pub order: SortOrder,
    pub limit: Option<usize>,
    /// Measure CPU usage over this interval instead of process lifetime
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseMeta {
    pub scanned_records: u64,
    /// Records skipped because they could not be parsed
    pub corrupt_records: u64,
}

impl ResponseMeta {
    fn from_stream(stream: &RecordStream<'_>) -> Self {
        Self {
            scanned_records: stream.scanned(),
            corrupt_records: stream.corrupt(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response<T> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl LogRequest {
    pub fn range(&self) -> ScanRange {
        ScanRange {
            since: self.since,
            until: self.until,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        validate_range(&self.range())?;
        if self.limit == Some(0) {
            return Err(QueryError::InvalidSpec("limit must be positive".into()));
        }
        if let Some(fields) = &self.fields
            && (fields.is_empty() || fields.iter().any(String::is_empty))
        {
            return Err(QueryError::InvalidSpec(
                "field selection must name at least one non-empty field".into(),
            ));
        }
        Ok(())
    }
}

impl ProcessRequest {
    pub fn validate(&self) -> Result<()> {
        if self.limit == Some(0) {
            return Err(QueryError::InvalidSpec("limit must be positive".into()));
        }
        if self.interval.is_some_and(|i| i.is_zero()) {
            return Err(QueryError::InvalidSpec("sampling interval must be positive".into()));
        }
        Ok(())
    }
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Filtered, normalized journal rows.
pub fn run_logs(
    source: &dyn RecordSource,
    request: &LogRequest,
    budget: &ScanBudget,
) -> Result<Response<Table>> {
    request.validate()?;
    let range = request.range();
    let filter = request.filter.compile()?.within(range);

    let params = FetchParams {
        filter: request.filter.clone(),
        range,
    };
    let mut stream = RecordStream::new(source.fetch_logs(&params)?, budget);
    let records: Vec<RawLogRecord> = {
        let matched = filter.apply_fallible(stream.by_ref());
        match request.limit {
            Some(limit) => matched.take(limit).collect::<Result<_>>()?,
            None => matched.collect::<Result<_>>()?,
        }
    };
    let meta = ResponseMeta::from_stream(&stream);
    debug!(
        "matched {} of {} records ({} corrupt)",
        records.len(),
        meta.scanned_records,
        meta.corrupt_records
    );

    let data = match &request.fields {
        Some(fields) => table::project(fields.clone(), records),
        None => table::normalize(records),
    };
    Ok(Response { data, meta })
}

/// Priority counts per time bucket over `[now - span, now)`.
pub fn run_chart(
    source: &dyn RecordSource,
    levels: &PriorityLevels,
    request: &ChartRequest,
    budget: &ScanBudget,
) -> Result<Response<PriorityCountTable>> {
    let filter = request.filter.compile()?;
    let now = request.now.unwrap_or_else(now_micros);
    let mut aggregator = Aggregator::new(&request.bucket, now, levels.clone())?;

    let span = i64::try_from(request.bucket.span.as_micros()).unwrap_or(i64::MAX);
    let width = i64::try_from(request.bucket.width.as_micros()).unwrap_or(i64::MAX);
    // Sources seek by receive time while buckets use the creation time, so
    // read one bucket past the window; the aggregator drops the excess.
    let params = FetchParams {
        filter: request.filter.clone(),
        range: ScanRange {
            since: Some(now.saturating_sub(span)),
            until: Some(now.saturating_add(width)),
        },
    };
    let mut stream = RecordStream::new(source.fetch_logs(&params)?, budget);
    for record in filter.apply_fallible(stream.by_ref()) {
        aggregator.add(&record?);
    }
    let meta = ResponseMeta::from_stream(&stream);
    let data = aggregator.finish();
    debug!(
        "charted {} records in {} buckets",
        data.total(),
        data.buckets.len()
    );
    Ok(Response { data, meta })
}

/// Boots seen among the matching records, newest first.
pub fn run_boots(
    source: &dyn RecordSource,
    filter: &FilterSpec,
    budget: &ScanBudget,
) -> Result<Response<Vec<BootSummary>>> {
    let compiled = filter.compile()?;
    let params = FetchParams {
        filter: filter.clone(),
        range: ScanRange::default(),
    };
    let mut stream = RecordStream::new(source.fetch_logs(&params)?, budget);
    let mut index = BootIndex::new();
    for record in compiled.apply_fallible(stream.by_ref()) {
        index.add(&record?);
    }
    let meta = ResponseMeta::from_stream(&stream);
    Ok(Response {
        data: index.finish(),
        meta,
    })
}

/// A single entry looked up by its exact `__REALTIME_TIMESTAMP`.
pub fn run_entry(
    source: &dyn RecordSource,
    realtime: i64,
    budget: &ScanBudget,
) -> Result<Option<RawLogRecord>> {
    budget.check()?;
    source.fetch_entry(realtime)
}

pub fn run_system_status(source: &dyn ProcessSource, budget: &ScanBudget) -> Result<SystemStatus> {
    budget.check()?;
    source.fetch_system_status()
}

pub fn run_processes(
    source: &dyn ProcessSource,
    request: &ProcessRequest,
    budget: &ScanBudget,
) -> Result<Vec<ProcessSample>> {
    request.validate()?;
    budget.check()?;
    let mut processes = source.fetch_processes()?;
    budget.check()?;

    if let Some(interval) = request.interval {
        let started = Instant::now();
        budget.pause(interval)?;
        let previous = processes;
        processes = source.fetch_processes()?;
        budget.check()?;
        apply_windowed_cpu(&previous, &mut processes, started.elapsed(), source.cpus());
    }

    if let Some(key) = request.sort_by {
        sort_processes(&mut processes, key, request.order);
    }
    if let Some(limit) = request.limit {
        processes.truncate(limit);
    }
    Ok(processes)
}

/// Entry point for callers. Cheap to clone; requests share nothing but the
/// sources, which open fresh handles per fetch.
#[derive(Clone)]
pub struct LogQuery {
    records: Arc<dyn RecordSource>,
    processes: Arc<dyn ProcessSource>,
    levels: PriorityLevels,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl LogQuery {
    pub fn new(records: Arc<dyn RecordSource>, processes: Arc<dyn ProcessSource>) -> Self {
        Self {
            records,
            processes,
            levels: PriorityLevels::default(),
            timeout: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_levels(mut self, levels: PriorityLevels) -> Self {
        self.levels = levels;
        self
    }

    /// Deadline applied to each request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancelling `token` aborts every in-flight request.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    fn budget(&self) -> ScanBudget {
        let budget = ScanBudget::new(self.shutdown.child_token());
        match self.timeout {
            Some(timeout) => budget.with_timeout(timeout),
            None => budget,
        }
    }

    /// Run `job` on the blocking pool. Dropping the returned future cancels
    /// the scan.
    async fn run_blocking<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ScanBudget) -> Result<T> + Send + 'static,
    {
        let budget = self.budget();
        let _guard = budget.token().clone().drop_guard();
        tokio::task::spawn_blocking(move || job(&budget)).await?
    }

    #[instrument(skip(self), err)]
    pub async fn get_logs(&self, request: LogRequest) -> Result<Response<Table>> {
        request.validate()?;
        let source = self.records.clone();
        self.run_blocking(move |budget| run_logs(source.as_ref(), &request, budget))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_log_chart(&self, request: ChartRequest) -> Result<Response<PriorityCountTable>> {
        request.filter.validate()?;
        request.bucket.validate()?;
        let source = self.records.clone();
        let levels = self.levels.clone();
        self.run_blocking(move |budget| run_chart(source.as_ref(), &levels, &request, budget))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn list_boots(&self, filter: FilterSpec) -> Result<Response<Vec<BootSummary>>> {
        filter.validate()?;
        let source = self.records.clone();
        self.run_blocking(move |budget| run_boots(source.as_ref(), &filter, budget))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_processes(&self, request: ProcessRequest) -> Result<Vec<ProcessSample>> {
        request.validate()?;
        let source = self.processes.clone();
        self.run_blocking(move |budget| run_processes(source.as_ref(), &request, budget))
            .await
    }

    /// Every field of the entry received at `realtime` (epoch µs). `None`
    /// when no entry has exactly that timestamp.
    #[instrument(skip(self), err)]
    pub async fn get_entry(&self, realtime: i64) -> Result<Option<RawLogRecord>> {
        let source = self.records.clone();
        self.run_blocking(move |budget| run_entry(source.as_ref(), realtime, budget))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        let source = self.processes.clone();
        self.run_blocking(move |budget| run_system_status(source.as_ref(), budget))
            .await
    }

    /// Service units known to systemd.
    #[instrument(skip(self), err)]
    pub async fn list_services(&self) -> Result<Vec<UnitInfo>> {
        let client = SystemdClient::new()
            .await
            .map_err(|e| QueryError::SourceUnavailable(format!("D-Bus: {e:#}")))?;
        client
            .list_services()
            .await
            .map_err(|e| QueryError::SourceUnavailable(format!("listing units: {e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::UNKNOWN_LEVEL;
    use crate::record::fields;
    use crate::source::{LogCursor, MemorySource, Pull};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rec(unit: &str, priority: &str, ts: i64) -> RawLogRecord {
        RawLogRecord::new()
            .with(fields::REALTIME_TIMESTAMP, ts.to_string())
            .with(fields::SYSTEMD_UNIT, unit)
            .with(fields::PRIORITY, priority)
            .with(fields::BOOT_ID, "b1")
    }

    fn sshd_and_cron() -> MemorySource {
        MemorySource::new(vec![rec("sshd", "3", 1000), rec("cron", "6", 2000)])
    }

    fn sshd_filter() -> FilterSpec {
        FilterSpec {
            unit: Some("sshd".into()),
            ..FilterSpec::default()
        }
    }

    /// Counts fetches so tests can prove validation happens first.
    #[derive(Default)]
    struct CountingSource {
        fetches: AtomicUsize,
    }

    struct FailingCursor;

    impl RecordSource for CountingSource {
        fn fetch_logs(&self, _params: &FetchParams) -> Result<Box<dyn LogCursor + '_>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FailingCursor))
        }

        fn fetch_entry(&self, _realtime: i64) -> Result<Option<RawLogRecord>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    /// Remembers the range of the last fetch and serves nothing.
    #[derive(Default)]
    struct RangeRecorder {
        last: Mutex<Option<ScanRange>>,
    }

    impl RecordSource for RangeRecorder {
        fn fetch_logs(&self, params: &FetchParams) -> Result<Box<dyn LogCursor + '_>> {
            *self.last.lock().unwrap() = Some(params.range);
            Ok(Box::new(EmptyCursor))
        }

        fn fetch_entry(&self, _realtime: i64) -> Result<Option<RawLogRecord>> {
            Ok(None)
        }
    }

    struct EmptyCursor;

    impl LogCursor for EmptyCursor {
        fn pull(&mut self) -> Result<Pull> {
            Ok(Pull::End)
        }
    }

    impl LogCursor for FailingCursor {
        fn pull(&mut self) -> Result<Pull> {
            Err(QueryError::SourceUnavailable("journal rotated away".into()))
        }
    }

    impl ProcessSource for CountingSource {
        fn fetch_processes(&self) -> Result<Vec<ProcessSample>> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            Ok(vec![
                ProcessSample {
                    pid: "1".into(),
                    rss_in_kb: 10,
                    time_userspace_milliseconds: 50 * n,
                    ..ProcessSample::default()
                },
                ProcessSample {
                    pid: "2".into(),
                    rss_in_kb: 30,
                    ..ProcessSample::default()
                },
                ProcessSample {
                    pid: "3".into(),
                    rss_in_kb: 20,
                    ..ProcessSample::default()
                },
            ])
        }

        fn fetch_system_status(&self) -> Result<SystemStatus> {
            Ok(SystemStatus {
                uptime_seconds: 12.5,
                user_mode_clicks: 7,
                ..SystemStatus::default()
            })
        }
    }

    fn query(records: impl RecordSource + 'static) -> LogQuery {
        LogQuery::new(Arc::new(records), Arc::new(CountingSource::default()))
    }

    #[tokio::test]
    async fn test_get_logs_filters_by_unit() {
        let q = query(sshd_and_cron());
        let response = q
            .get_logs(LogRequest {
                filter: sshd_filter(),
                ..LogRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(response.data.row_count(), 1);
        assert_eq!(response.data.cell(0, fields::SYSTEMD_UNIT), Some("sshd"));
        assert_eq!(
            response.meta,
            ResponseMeta {
                scanned_records: 2,
                corrupt_records: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_get_log_chart_end_to_end() {
        let q = query(sshd_and_cron());
        let response = q
            .get_log_chart(ChartRequest {
                filter: sshd_filter(),
                bucket: BucketSpec::new(Duration::from_micros(10_000), Duration::from_micros(5_000)),
                now: Some(10_000),
            })
            .await
            .unwrap();
        let chart = response.data;
        assert_eq!(chart.buckets.len(), 2);
        assert_eq!((chart.buckets[0].start, chart.buckets[0].end), (0, 5_000));
        assert_eq!(chart.count(0, "err"), Some(1));
        assert_eq!(chart.buckets[1].total(), 0);
        assert_eq!(chart.total(), 1);
        assert_eq!(chart.levels.last().map(String::as_str), Some(UNKNOWN_LEVEL));
    }

    #[tokio::test]
    async fn test_invalid_bucket_rejected_before_source_access() {
        let source = Arc::new(CountingSource::default());
        let q = LogQuery::new(source.clone(), source.clone());
        let err = q
            .get_log_chart(ChartRequest {
                filter: FilterSpec::default(),
                bucket: BucketSpec::new(Duration::from_micros(100), Duration::from_micros(200)),
                now: Some(1_000),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidSpec(_)));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_failure_is_not_an_empty_table() {
        let q = query(CountingSource::default());
        let err = q.get_logs(LogRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), "source_unavailable");
    }

    #[tokio::test]
    async fn test_cancelled_query() {
        let token = CancellationToken::new();
        token.cancel();
        let q = query(sshd_and_cron()).with_cancellation(token);
        let err = q.get_logs(LogRequest::default()).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_get_logs_limit_and_fields() {
        let q = query(sshd_and_cron());
        let response = q
            .get_logs(LogRequest {
                limit: Some(1),
                fields: Some(vec![fields::PRIORITY.into(), "MISSING".into()]),
                ..LogRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(response.data.headers, vec!["PRIORITY", "MISSING"]);
        assert_eq!(response.data.rows, vec![vec!["3".to_string(), String::new()]]);
        assert_eq!(response.meta.scanned_records, 1);

        let err = q
            .get_logs(LogRequest {
                fields: Some(Vec::new()),
                ..LogRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn test_get_processes_sorted_and_limited() {
        let q = query(MemorySource::default());
        let processes = q
            .get_processes(ProcessRequest {
                sort_by: Some(SortKey::RssInKb),
                order: SortOrder::Desc,
                limit: Some(2),
                ..ProcessRequest::default()
            })
            .await
            .unwrap();
        let pids: Vec<&str> = processes.iter().map(|p| p.pid.as_str()).collect();
        assert_eq!(pids, ["2", "3"]);
    }

    #[tokio::test]
    async fn test_list_boots() {
        let q = query(sshd_and_cron());
        let response = q.list_boots(FilterSpec::default()).await.unwrap();
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].boot_id, "b1");
        assert_eq!(response.data[0].entries, 2);
        assert_eq!(response.data[0].last_entry, 2000);
    }

    #[test]
    fn test_run_logs_is_idempotent() {
        let source = sshd_and_cron();
        let budget = ScanBudget::unlimited();
        let first = run_logs(&source, &LogRequest::default(), &budget).unwrap();
        let second = run_logs(&source, &LogRequest::default(), &budget).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_get_logs_time_window() {
        let q = query(MemorySource::new(vec![
            rec("a", "6", 1000),
            rec("b", "6", 2000),
            rec("c", "6", 3000),
        ]));
        let response = q
            .get_logs(LogRequest {
                since: Some(1500),
                until: Some(3000),
                ..LogRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(response.data.row_count(), 1);
        assert_eq!(response.data.cell(0, fields::SYSTEMD_UNIT), Some("b"));

        let err = q
            .get_logs(LogRequest {
                since: Some(3000),
                until: Some(1000),
                ..LogRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn test_chart_reads_one_bucket_past_now() {
        let source = Arc::new(RangeRecorder::default());
        let q = LogQuery::new(source.clone(), Arc::new(CountingSource::default()));
        q.get_log_chart(ChartRequest {
            filter: FilterSpec::default(),
            bucket: BucketSpec::new(Duration::from_micros(10_000), Duration::from_micros(5_000)),
            now: Some(10_000),
        })
        .await
        .unwrap();
        assert_eq!(
            *source.last.lock().unwrap(),
            Some(ScanRange {
                since: Some(0),
                until: Some(15_000),
            })
        );
    }

    #[tokio::test]
    async fn test_get_entry() {
        let q = query(sshd_and_cron());
        let entry = q.get_entry(2000).await.unwrap().unwrap();
        assert_eq!(entry.get(fields::SYSTEMD_UNIT), Some("cron"));
        assert!(q.get_entry(2001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_system_status() {
        let status = query(sshd_and_cron()).get_system_status().await.unwrap();
        assert_eq!(status.uptime_seconds, 12.5);
        assert_eq!(status.user_mode_clicks, 7);
    }

    #[tokio::test]
    async fn test_get_processes_over_interval() {
        let q = query(MemorySource::default());
        let processes = q
            .get_processes(ProcessRequest {
                sort_by: Some(SortKey::Pid),
                order: SortOrder::Asc,
                interval: Some(Duration::from_millis(100)),
                ..ProcessRequest::default()
            })
            .await
            .unwrap();
        // 50ms of cpu between the two samples, at least 100ms apart
        let cpu = processes[0].cpu_usage_percentage;
        assert!(cpu > 0.0 && cpu <= 50.0, "{cpu}");
        assert_eq!(processes[1].cpu_usage_percentage, 0.0);

        let err = q
            .get_processes(ProcessRequest {
                interval: Some(Duration::ZERO),
                ..ProcessRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidSpec(_)));
    }
}
