use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use journal_lens::chart::{BucketSpec, PriorityLevels, parse_duration};
use journal_lens::format::parse_time;
use journal_lens::process::{SortKey, SortOrder};
use journal_lens::source::{MemorySource, ProcfsSource, RecordSource};
use journal_lens::systemd::JournalSource;
use journal_lens::{
    ChartRequest, EpochFormat, FilterSpec, LogQuery, LogRequest, ProcessRequest, QueryError,
    format_epoch,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "journal-lens", version, about = "Query the systemd journal and /proc")]
struct Cli {
    /// Log filter for stderr diagnostics, e.g. `debug` or `journal_lens=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Abort queries that run longer than this (e.g. `30s`)
    #[arg(long, global = true, env = "JOURNAL_LENS_TIMEOUT")]
    timeout: Option<String>,

    /// Comma-separated priority names, most severe first
    #[arg(long, global = true, env = "JOURNAL_LENS_LEVELS")]
    levels: Option<String>,

    #[arg(long, global = true, env = "JOURNAL_LENS_PROC_ROOT", default_value = "/proc")]
    proc_root: PathBuf,

    /// Read a `journalctl -o json` export instead of the live journal
    #[arg(long, global = true)]
    export: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Exact `_SYSTEMD_UNIT` value, e.g. `sshd.service`
    #[arg(long)]
    unit: Option<String>,

    /// Exact `_BOOT_ID` value
    #[arg(long)]
    boot: Option<String>,

    /// Case-insensitive substring of any field value
    #[arg(long)]
    quick_filter: Option<String>,

    /// Keep records at this priority (0-7) or more severe
    #[arg(long)]
    priority: Option<u8>,

    /// `_TRANSPORT` values to keep, e.g. `kernel,syslog`
    #[arg(long = "transport", value_delimiter = ',')]
    transports: Vec<String>,
}

impl From<FilterArgs> for FilterSpec {
    fn from(args: FilterArgs) -> Self {
        FilterSpec {
            unit: args.unit,
            boot: args.boot,
            quick_filter: args.quick_filter,
            priority: args.priority,
            transports: args.transports,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Filtered journal entries as a table
    Logs {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long)]
        limit: Option<usize>,

        /// Only these fields, in this order
        #[arg(long, value_delimiter = ',')]
        fields: Option<Vec<String>>,

        /// Oldest entry to include: epoch microseconds or RFC 3339
        #[arg(long)]
        since: Option<String>,

        /// Only entries before this time: epoch microseconds or RFC 3339
        #[arg(long)]
        until: Option<String>,

        /// Tab-separated text instead of JSON
        #[arg(long)]
        text: bool,
    },
    /// Every field of the entry with this `__REALTIME_TIMESTAMP`
    Entry { timestamp: i64 },
    /// Entry counts per time bucket and priority
    Chart {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long, default_value = "24h")]
        span: String,

        #[arg(long, default_value = "15m")]
        width: String,

        /// Window end in epoch microseconds; defaults to now
        #[arg(long)]
        now: Option<i64>,
    },
    /// Per-process resource usage
    Processes {
        /// Field to sort by, e.g. `cpu_usage_percentage` or `rss_in_kb`
        #[arg(long)]
        sort_by: Option<String>,

        #[arg(long, default_value = "desc")]
        order: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Report CPU usage over this interval (e.g. `1s`) instead of the
        /// process lifetime
        #[arg(long)]
        interval: Option<String>,
    },
    /// Uptime and host-wide CPU time
    Status,
    /// Boots present in the journal, newest first
    Boots {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Service units known to systemd
    Units,
    /// Render epoch microseconds as local time
    FormatEpoch {
        #[arg(required = true)]
        epochs: Vec<String>,

        #[arg(long)]
        without_seconds: bool,
    },
}

impl Command {
    fn reads_logs(&self) -> bool {
        matches!(
            self,
            Command::Logs { .. }
                | Command::Entry { .. }
                | Command::Chart { .. }
                | Command::Boots { .. }
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Print the structured error body and pick an exit status.
fn report(err: &anyhow::Error) -> ExitCode {
    error!("{:#}", err);
    let (body, code) = match err.downcast_ref::<QueryError>() {
        Some(e) => {
            let code = match e {
                QueryError::InvalidSpec(_) => 2,
                QueryError::Cancelled(_) => 130,
                _ => 1,
            };
            (serde_json::to_value(e.body()).unwrap_or_default(), code)
        }
        None => (
            serde_json::json!({ "error": { "kind": "internal", "message": format!("{err:#}") } }),
            1,
        ),
    };
    println!("{body}");
    ExitCode::from(code)
}

fn emit<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if pretty {
        serde_json::to_writer_pretty(&mut stdout, value)?;
    } else {
        serde_json::to_writer(&mut stdout, value)?;
    }
    writeln!(stdout)?;
    Ok(())
}

fn record_source(cli: &Cli) -> Result<Arc<dyn RecordSource>> {
    if !cli.command.reads_logs() {
        return Ok(Arc::new(MemorySource::default()));
    }
    match &cli.export {
        Some(path) => {
            let source = MemorySource::open_export(path)?;
            debug!("Loaded {} entries from {}", source.len(), path.display());
            Ok(Arc::new(source))
        }
        None => Ok(Arc::new(JournalSource::local()?)),
    }
}

fn build_query(cli: &Cli, token: CancellationToken) -> Result<LogQuery> {
    let mut query = LogQuery::new(
        record_source(cli)?,
        Arc::new(ProcfsSource::new(&cli.proc_root)),
    )
    .with_cancellation(token);
    if let Some(levels) = &cli.levels {
        query = query.with_levels(PriorityLevels::parse(levels)?);
    }
    if let Some(timeout) = &cli.timeout {
        let timeout = parse_duration(timeout).context("invalid --timeout")?;
        query = query.with_timeout(timeout);
    }
    Ok(query)
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::FormatEpoch {
        epochs,
        without_seconds,
    } = &cli.command
    {
        let format = if *without_seconds {
            EpochFormat::WithoutSeconds
        } else {
            EpochFormat::WithSeconds
        };
        let formatted: Vec<String> = epochs.iter().map(|e| format_epoch(e, format)).collect();
        return emit(&formatted, cli.pretty);
    }

    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling query");
            on_signal.cancel();
        }
    });

    let query = build_query(&cli, token)?;
    let pretty = cli.pretty;

    match cli.command {
        Command::Logs {
            filter,
            limit,
            fields,
            since,
            until,
            text,
        } => {
            let response = query
                .get_logs(LogRequest {
                    filter: filter.into(),
                    limit,
                    fields,
                    since: since.as_deref().map(parse_time).transpose()?,
                    until: until.as_deref().map(parse_time).transpose()?,
                })
                .await?;
            if text {
                debug!(
                    "scanned {} records, {} corrupt",
                    response.meta.scanned_records, response.meta.corrupt_records
                );
                print!("{}", response.data);
                Ok(())
            } else {
                emit(&response, pretty)
            }
        }
        Command::Entry { timestamp } => {
            let entry = query.get_entry(timestamp).await?;
            emit(&entry, pretty)
        }
        Command::Chart {
            filter,
            span,
            width,
            now,
        } => {
            let response = query
                .get_log_chart(ChartRequest {
                    filter: filter.into(),
                    bucket: BucketSpec::parse(&span, &width)?,
                    now,
                })
                .await?;
            emit(&response, pretty)
        }
        Command::Processes {
            sort_by,
            order,
            limit,
            interval,
        } => {
            let sort_by = sort_by.map(|key| key.parse::<SortKey>()).transpose()?;
            let order = order.parse::<SortOrder>()?;
            let interval = interval.as_deref().map(parse_duration).transpose()?;
            let processes = query
                .get_processes(ProcessRequest {
                    sort_by,
                    order,
                    limit,
                    interval,
                })
                .await?;
            emit(&processes, pretty)
        }
        Command::Status => {
            let status = query.get_system_status().await?;
            emit(&status, pretty)
        }
        Command::Boots { filter } => {
            let response = query.list_boots(filter.into()).await?;
            emit(&response, pretty)
        }
        Command::Units => {
            let units = query.list_services().await?;
            emit(&units, pretty)
        }
        Command::FormatEpoch { .. } => Ok(()),
    }
}
