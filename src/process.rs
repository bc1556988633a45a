//! Per-process resource usage samples.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: String,
    pub cmd: String,
    pub process_name: String,
    pub pss_in_kb: u64,
    pub rss_in_kb: u64,
    /// Pss - Pss_Shmem
    pub uss_in_kb: u64,
    pub time_userspace_milliseconds: u64,
    pub time_kernel_milliseconds: u64,
    /// Epoch seconds
    pub start_time: i64,
    pub cpu_usage_percentage: f32,
    pub fds: u64,
}

impl ProcessSample {
    pub fn cpu_time_milliseconds(&self) -> u64 {
        self.time_userspace_milliseconds + self.time_kernel_milliseconds
    }

    fn pid_number(&self) -> u64 {
        self.pid.parse().unwrap_or(u64::MAX)
    }
}

/// Host-wide CPU time from the aggregate `cpu` line of `/proc/stat`, in
/// clock ticks, plus uptime.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SystemStatus {
    pub uptime_seconds: f64,
    pub user_mode_clicks: u64,
    pub kernel_mode_clicks: u64,
    pub idle_time_clicks: u64,
}

/// Share of total CPU capacity consumed over `elapsed`, clamped to 0–100.
pub fn cpu_percentage(cpu_ms: u64, elapsed: Duration, cpus: usize) -> f32 {
    let capacity_ms = elapsed.as_secs_f64() * 1000.0 * cpus.max(1) as f64;
    if capacity_ms <= 0.0 {
        return 0.0;
    }
    ((cpu_ms as f64 * 100.0 / capacity_ms) as f32).clamp(0.0, 100.0)
}

/// Replace each sample's lifetime CPU usage with the usage between
/// `previous` and `current`, taken `elapsed` apart. Samples for processes
/// that are new in `current` keep their lifetime value.
pub fn apply_windowed_cpu(
    previous: &[ProcessSample],
    current: &mut [ProcessSample],
    elapsed: Duration,
    cpus: usize,
) {
    let before: HashMap<(&str, i64), u64> = previous
        .iter()
        .map(|p| ((p.pid.as_str(), p.start_time), p.cpu_time_milliseconds()))
        .collect();

    for sample in current.iter_mut() {
        if let Some(&prev_ms) = before.get(&(sample.pid.as_str(), sample.start_time)) {
            let used = sample.cpu_time_milliseconds().saturating_sub(prev_ms);
            sample.cpu_usage_percentage = cpu_percentage(used, elapsed, cpus);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Pid,
    Cmd,
    ProcessName,
    PssInKb,
    RssInKb,
    UssInKb,
    TimeUserspaceMilliseconds,
    TimeKernelMilliseconds,
    CpuUsagePercentage,
    Fds,
}

impl FromStr for SortKey {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        let key = match s {
            "pid" => SortKey::Pid,
            "cmd" => SortKey::Cmd,
            "process_name" => SortKey::ProcessName,
            "pss_in_kb" => SortKey::PssInKb,
            "rss_in_kb" => SortKey::RssInKb,
            "uss_in_kb" => SortKey::UssInKb,
            "time_userspace_milliseconds" => SortKey::TimeUserspaceMilliseconds,
            "time_kernel_milliseconds" => SortKey::TimeKernelMilliseconds,
            "cpu_usage_percentage" => SortKey::CpuUsagePercentage,
            "fds" => SortKey::Fds,
            other => {
                return Err(QueryError::InvalidSpec(format!("unknown sort key '{other}'")));
            }
        };
        Ok(key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(QueryError::InvalidSpec(format!("unknown sort order '{other}'"))),
        }
    }
}

fn compare(key: SortKey, a: &ProcessSample, b: &ProcessSample) -> Ordering {
    match key {
        SortKey::Pid => a.pid_number().cmp(&b.pid_number()),
        SortKey::Cmd => a.cmd.cmp(&b.cmd),
        SortKey::ProcessName => a.process_name.cmp(&b.process_name),
        SortKey::PssInKb => a.pss_in_kb.cmp(&b.pss_in_kb),
        SortKey::RssInKb => a.rss_in_kb.cmp(&b.rss_in_kb),
        SortKey::UssInKb => a.uss_in_kb.cmp(&b.uss_in_kb),
        SortKey::TimeUserspaceMilliseconds => a
            .time_userspace_milliseconds
            .cmp(&b.time_userspace_milliseconds),
        SortKey::TimeKernelMilliseconds => {
            a.time_kernel_milliseconds.cmp(&b.time_kernel_milliseconds)
        }
        SortKey::CpuUsagePercentage => a.cpu_usage_percentage.total_cmp(&b.cpu_usage_percentage),
        SortKey::Fds => a.fds.cmp(&b.fds),
    }
}

/// Stable sort; ties keep pid order.
pub fn sort_processes(processes: &mut [ProcessSample], key: SortKey, order: SortOrder) {
    processes.sort_by(|a, b| {
        let ord = compare(key, a, b);
        let ord = match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        ord.then_with(|| a.pid_number().cmp(&b.pid_number()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn sample(pid: &str, cpu: f32, rss: u64, name: &str) -> ProcessSample {
        ProcessSample {
            pid: pid.to_string(),
            process_name: name.to_string(),
            cpu_usage_percentage: cpu,
            rss_in_kb: rss,
            ..ProcessSample::default()
        }
    }

    fn processes() -> Vec<ProcessSample> {
        vec![
            sample("10", 5.0, 300, "bash"),
            sample("2", 50.0, 100, "kthreadd"),
            sample("100", 5.0, 200, "sshd"),
        ]
    }

    fn pids(p: &[ProcessSample]) -> Vec<&str> {
        p.iter().map(|s| s.pid.as_str()).collect()
    }

    #[test_case(SortKey::Pid, SortOrder::Asc, &["2", "10", "100"]; "pid is numeric")]
    #[test_case(SortKey::CpuUsagePercentage, SortOrder::Desc, &["2", "10", "100"]; "cpu ties by pid")]
    #[test_case(SortKey::RssInKb, SortOrder::Asc, &["2", "100", "10"]; "rss ascending")]
    #[test_case(SortKey::ProcessName, SortOrder::Desc, &["100", "2", "10"]; "name descending")]
    fn test_sort_processes(key: SortKey, order: SortOrder, expected: &[&str]) {
        let mut p = processes();
        sort_processes(&mut p, key, order);
        assert_eq!(pids(&p), expected);
    }

    #[test]
    fn test_parse_sort_options() {
        assert_eq!("rss_in_kb".parse::<SortKey>().unwrap(), SortKey::RssInKb);
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("memory".parse::<SortKey>().is_err());
        assert!("up".parse::<SortOrder>().is_err());
    }

    #[test]
    fn test_cpu_percentage() {
        assert_eq!(cpu_percentage(500, Duration::from_secs(1), 1), 50.0);
        assert_eq!(cpu_percentage(500, Duration::from_secs(1), 2), 25.0);
        assert_eq!(cpu_percentage(5000, Duration::from_secs(1), 1), 100.0);
        assert_eq!(cpu_percentage(10, Duration::ZERO, 4), 0.0);
    }

    #[test]
    fn test_windowed_cpu() {
        let previous = vec![ProcessSample {
            pid: "1".into(),
            start_time: 100,
            time_userspace_milliseconds: 1000,
            ..ProcessSample::default()
        }];
        let mut current = vec![
            ProcessSample {
                pid: "1".into(),
                start_time: 100,
                time_userspace_milliseconds: 1600,
                time_kernel_milliseconds: 200,
                cpu_usage_percentage: 1.0,
                ..ProcessSample::default()
            },
            ProcessSample {
                pid: "2".into(),
                start_time: 150,
                cpu_usage_percentage: 3.0,
                ..ProcessSample::default()
            },
        ];
        apply_windowed_cpu(&previous, &mut current, Duration::from_secs(2), 1);
        assert_eq!(current[0].cpu_usage_percentage, 40.0);
        assert_eq!(current[1].cpu_usage_percentage, 3.0);
    }
}
