//! Process accounting read from a procfs tree.

use super::ProcessSource;
use crate::error::{QueryError, Result};
use crate::process::{ProcessSample, SystemStatus, cpu_percentage};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub struct ProcfsSource {
    root: PathBuf,
    clock_ticks: u64,
    cpus: usize,
}

/// Fields of `/proc/<pid>/stat` that feed a sample.
#[derive(Debug, PartialEq)]
struct PidStat {
    comm: String,
    utime_ticks: u64,
    stime_ticks: u64,
    start_ticks: u64,
}

#[derive(Debug, Default, PartialEq)]
struct SmapsRollup {
    rss_kb: u64,
    pss_kb: u64,
    pss_shmem_kb: u64,
}

impl ProcfsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let clock_ticks = match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
            n if n > 0 => n as u64,
            _ => 100,
        };
        let cpus = match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
            n if n > 0 => n as usize,
            _ => 1,
        };
        Self {
            root: root.into(),
            clock_ticks,
            cpus,
        }
    }

    /// Override the tick rate and CPU count, e.g. for a captured tree.
    pub fn with_clock(mut self, clock_ticks: u64, cpus: usize) -> Self {
        self.clock_ticks = clock_ticks.max(1);
        self.cpus = cpus.max(1);
        self
    }

    fn unavailable(&self, what: &str, e: impl std::fmt::Display) -> QueryError {
        QueryError::SourceUnavailable(format!(
            "cannot read {}/{}: {}",
            self.root.display(),
            what,
            e
        ))
    }

    fn read_stat(&self) -> Result<String> {
        fs::read_to_string(self.root.join("stat")).map_err(|e| self.unavailable("stat", e))
    }

    fn boot_time(&self) -> Result<i64> {
        self.read_stat()?
            .lines()
            .find_map(|l| l.strip_prefix("btime "))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| self.unavailable("stat", "no btime line"))
    }

    fn uptime(&self) -> Result<f64> {
        let uptime =
            fs::read_to_string(self.root.join("uptime")).map_err(|e| self.unavailable("uptime", e))?;
        uptime
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| self.unavailable("uptime", "malformed"))
    }

    fn running_pids(&self) -> Result<Vec<u32>> {
        let mut pids: Vec<u32> = fs::read_dir(&self.root)
            .map_err(|e| self.unavailable("", e))?
            .flatten()
            .filter(|d| d.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|d| d.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn ticks_to_ms(&self, ticks: u64) -> u64 {
        ticks * 1000 / self.clock_ticks
    }

    fn sample(&self, pid: u32, boot_time: i64, uptime: f64) -> Option<ProcessSample> {
        let dir = self.root.join(pid.to_string());
        let stat = match fs::read_to_string(dir.join("stat")) {
            Ok(s) => s,
            Err(e) => {
                // The process most likely exited since the directory listing
                debug!("skipping pid {}: {}", pid, e);
                return None;
            }
        };
        let Some(stat) = parse_pid_stat(&stat) else {
            warn!("malformed stat for pid {}", pid);
            return None;
        };

        let cmd = read_cmdline(&dir).unwrap_or_default();
        let smaps = read_smaps_rollup(&dir).unwrap_or_default();
        let fds = fs::read_dir(dir.join("fd"))
            .map(|d| d.count() as u64)
            .unwrap_or(0);

        let time_userspace_milliseconds = self.ticks_to_ms(stat.utime_ticks);
        let time_kernel_milliseconds = self.ticks_to_ms(stat.stime_ticks);
        let started_after_boot = stat.start_ticks as f64 / self.clock_ticks as f64;
        let age = Duration::from_secs_f64((uptime - started_after_boot).max(0.0));

        Some(ProcessSample {
            pid: pid.to_string(),
            cmd: if cmd.is_empty() {
                format!("[{}]", stat.comm)
            } else {
                cmd
            },
            process_name: stat.comm,
            pss_in_kb: smaps.pss_kb,
            rss_in_kb: smaps.rss_kb,
            uss_in_kb: smaps.pss_kb.saturating_sub(smaps.pss_shmem_kb),
            time_userspace_milliseconds,
            time_kernel_milliseconds,
            start_time: boot_time + started_after_boot as i64,
            cpu_usage_percentage: cpu_percentage(
                time_userspace_milliseconds + time_kernel_milliseconds,
                age,
                self.cpus,
            ),
            fds,
        })
    }
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessSource for ProcfsSource {
    fn fetch_processes(&self) -> Result<Vec<ProcessSample>> {
        let boot_time = self.boot_time()?;
        let uptime = self.uptime()?;
        let pids = self.running_pids()?;
        debug!("found {} pids under {}", pids.len(), self.root.display());

        let samples: Vec<ProcessSample> = pids
            .into_iter()
            .filter_map(|pid| self.sample(pid, boot_time, uptime))
            .collect();
        debug!("sampled {} processes", samples.len());
        Ok(samples)
    }

    fn fetch_system_status(&self) -> Result<SystemStatus> {
        let stat = self.read_stat()?;
        let mut status = parse_cpu_line(&stat)
            .ok_or_else(|| self.unavailable("stat", "no aggregate cpu line"))?;
        status.uptime_seconds = self.uptime()?;
        Ok(status)
    }

    fn cpus(&self) -> usize {
        self.cpus
    }
}

/// `cpu  user nice system idle ...`, the aggregate over all cores.
fn parse_cpu_line(stat: &str) -> Option<SystemStatus> {
    let line = stat.lines().find_map(|l| l.strip_prefix("cpu "))?;
    let ticks: Vec<u64> = line
        .split_whitespace()
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    Some(SystemStatus {
        uptime_seconds: 0.0,
        user_mode_clicks: *ticks.first()?,
        kernel_mode_clicks: *ticks.get(2)?,
        idle_time_clicks: *ticks.get(3)?,
    })
}

/// The command name is wrapped in parentheses and may itself contain spaces
/// and parentheses, so fields are counted from the last `)`.
fn parse_pid_stat(stat: &str) -> Option<PidStat> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = stat[open + 1..close].to_string();
    let rest: Vec<&str> = stat[close + 1..].split_whitespace().collect();

    // rest[0] is field 3 (state) in proc(5) numbering
    let field = |n: usize| rest.get(n - 3).and_then(|v| v.parse::<u64>().ok());
    Some(PidStat {
        comm,
        utime_ticks: field(14)?,
        stime_ticks: field(15)?,
        start_ticks: field(22)?,
    })
}

fn read_cmdline(dir: &Path) -> Option<String> {
    let raw = fs::read(dir.join("cmdline")).ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|a| !a.is_empty())
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();
    Some(args.join(" "))
}

fn read_smaps_rollup(dir: &Path) -> Option<SmapsRollup> {
    let text = fs::read_to_string(dir.join("smaps_rollup")).ok()?;
    Some(parse_smaps_rollup(&text))
}

fn parse_smaps_rollup(text: &str) -> SmapsRollup {
    let mut rollup = SmapsRollup::default();
    for line in text.lines() {
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        match label.trim() {
            "Rss" => rollup.rss_kb = kb,
            "Pss" => rollup.pss_kb = kb,
            "Pss_Shmem" => rollup.pss_shmem_kb = kb,
            _ => {}
        }
    }
    rollup
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PID1_STAT: &str = "1 (systemd) S 0 1 1 0 -1 4194560 100 200 0 0 500 300 0 0 20 0 1 0 10000 171008000 3000 18446744073709551615";
    const SMAPS: &str = "55d1c8a3e000-7ffc0cbf9000 ---p 00000000 00:00 0                          [rollup]
Rss:               86828 kB
Pss:               50469 kB
Pss_Dirty:         12000 kB
Pss_Shmem:          7056 kB
";

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "uptime", b"1000.50 3000.00\n");
        write(root, "stat", b"cpu  1 2 3 4\nbtime 1700000000\nprocesses 42\n");
        write(root, "1/stat", PID1_STAT.as_bytes());
        write(root, "1/cmdline", b"/sbin/init\0splash\0");
        write(root, "1/smaps_rollup", SMAPS.as_bytes());
        write(root, "1/fd/0", b"");
        write(root, "1/fd/1", b"");
        write(
            root,
            "42/stat",
            b"42 (my (weird) proc) R 1 42 42 0 -1 0 0 0 0 0 100 0 0 0 20 0 1 0 90000 0 0",
        );
        write(root, "42/cmdline", b"");
        fs::create_dir_all(root.join("77")).unwrap();
        fs::create_dir_all(root.join("self_not_a_pid")).unwrap();
        dir
    }

    #[test]
    fn test_parse_pid_stat() {
        let stat = parse_pid_stat(PID1_STAT).unwrap();
        assert_eq!(
            stat,
            PidStat {
                comm: "systemd".into(),
                utime_ticks: 500,
                stime_ticks: 300,
                start_ticks: 10000,
            }
        );
        assert_eq!(
            parse_pid_stat("9 (a) b) S 0").map(|s| s.comm),
            None,
            "too few fields"
        );
    }

    #[test]
    fn test_parse_smaps_rollup() {
        let rollup = parse_smaps_rollup(SMAPS);
        assert_eq!(rollup.rss_kb, 86828);
        assert_eq!(rollup.pss_kb, 50469);
        assert_eq!(rollup.pss_shmem_kb, 7056);
    }

    #[test]
    fn test_fetch_processes() {
        let dir = fixture();
        let source = ProcfsSource::new(dir.path()).with_clock(100, 1);
        let samples = source.fetch_processes().unwrap();
        assert_eq!(samples.len(), 2);

        let init = &samples[0];
        assert_eq!(init.pid, "1");
        assert_eq!(init.process_name, "systemd");
        assert_eq!(init.cmd, "/sbin/init splash");
        assert_eq!(init.rss_in_kb, 86828);
        assert_eq!(init.pss_in_kb, 50469);
        assert_eq!(init.uss_in_kb, 50469 - 7056);
        assert_eq!(init.time_userspace_milliseconds, 5000);
        assert_eq!(init.time_kernel_milliseconds, 3000);
        assert_eq!(init.start_time, 1_700_000_100);
        assert_eq!(init.fds, 2);
        // 8s of cpu over 900.5s of age
        assert!((init.cpu_usage_percentage - 0.888).abs() < 0.01);

        let weird = &samples[1];
        assert_eq!(weird.process_name, "my (weird) proc");
        assert_eq!(weird.cmd, "[my (weird) proc]");
        assert_eq!(weird.rss_in_kb, 0);
        assert_eq!(weird.fds, 0);
    }

    #[test]
    fn test_fetch_system_status() {
        let dir = fixture();
        let status = ProcfsSource::new(dir.path()).fetch_system_status().unwrap();
        assert_eq!(
            status,
            SystemStatus {
                uptime_seconds: 1000.5,
                user_mode_clicks: 1,
                kernel_mode_clicks: 3,
                idle_time_clicks: 4,
            }
        );
        assert_eq!(parse_cpu_line("cpu0 1 2 3 4\n"), None, "per-core lines are skipped");
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let source = ProcfsSource::new("/nonexistent/proc");
        assert!(matches!(
            source.fetch_processes(),
            Err(QueryError::SourceUnavailable(_))
        ));
        assert!(matches!(
            source.fetch_system_status(),
            Err(QueryError::SourceUnavailable(_))
        ));
    }
}
