//! Live journal access through `libsystemd`, loaded at runtime.

use crate::error::{QueryError, Result};
use crate::record::{RawLogRecord, fields};
use crate::source::{FetchParams, LogCursor, Pull, RecordSource};
use dlopen2::wrapper::{Container, WrapperApi};
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, trace};

/// Candidate names for the shared library, tried in order.
const LIBSYSTEMD_NAMES: [&str; 3] = ["libsystemd.so.0", "libsystemd.so", "libsystemd-journal.so.0"];

/// Only files generated on the local machine
pub const SD_JOURNAL_LOCAL_ONLY: c_int = 1 << 0;
/// System services and the kernel
pub const SD_JOURNAL_SYSTEM: c_int = 1 << 2;
/// Current user
pub const SD_JOURNAL_CURRENT_USER: c_int = 1 << 3;

/// Selected functions from `systemd/sd-journal.h`.
#[derive(WrapperApi)]
struct SdJournalApi {
    sd_journal_open: unsafe extern "C" fn(ret: *mut *mut c_void, flags: c_int) -> c_int,
    sd_journal_close: unsafe extern "C" fn(j: *mut c_void),
    sd_journal_add_match:
        unsafe extern "C" fn(j: *mut c_void, data: *const c_void, size: usize) -> c_int,
    sd_journal_seek_tail: unsafe extern "C" fn(j: *mut c_void) -> c_int,
    sd_journal_seek_realtime_usec: unsafe extern "C" fn(j: *mut c_void, usec: u64) -> c_int,
    sd_journal_previous: unsafe extern "C" fn(j: *mut c_void) -> c_int,
    sd_journal_next: unsafe extern "C" fn(j: *mut c_void) -> c_int,
    sd_journal_get_realtime_usec: unsafe extern "C" fn(j: *mut c_void, ret: *mut u64) -> c_int,
    sd_journal_restart_data: unsafe extern "C" fn(j: *mut c_void),
    sd_journal_enumerate_data:
        unsafe extern "C" fn(j: *mut c_void, data: *mut *const c_void, length: *mut usize) -> c_int,
}

type Api = Arc<Container<SdJournalApi>>;

static LIBSYSTEMD: OnceLock<std::result::Result<Api, String>> = OnceLock::new();

/// Load `libsystemd` once per process.
fn load_api() -> Result<Api> {
    LIBSYSTEMD
        .get_or_init(|| {
            let mut last_error = String::from("no candidates");
            for name in LIBSYSTEMD_NAMES {
                match unsafe { Container::<SdJournalApi>::load(name) } {
                    Ok(container) => {
                        info!("Loaded {}", name);
                        return Ok(Arc::new(container));
                    }
                    Err(e) => {
                        debug!("Failed to load {}: {}", name, e);
                        last_error = e.to_string();
                    }
                }
            }
            Err(last_error)
        })
        .clone()
        .map_err(|e| QueryError::SourceUnavailable(format!("libsystemd not available: {e}")))
}

fn errno_message(rc: c_int) -> String {
    std::io::Error::from_raw_os_error(-rc).to_string()
}

/// Reads the local journal. Every fetch opens its own handle, so concurrent
/// requests never share journal state.
pub struct JournalSource {
    api: Api,
    flags: c_int,
}

impl JournalSource {
    pub fn open(flags: c_int) -> Result<Self> {
        let api = load_api()?;
        Ok(Self { api, flags })
    }

    /// Local system and current-user journals.
    pub fn local() -> Result<Self> {
        Self::open(SD_JOURNAL_LOCAL_ONLY | SD_JOURNAL_SYSTEM | SD_JOURNAL_CURRENT_USER)
    }
}

impl JournalSource {
    fn open_cursor(&self, since: Option<i64>) -> Result<JournalCursor> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let rc = unsafe { self.api.sd_journal_open(&mut ptr, self.flags) };
        if rc < 0 || ptr.is_null() {
            return Err(QueryError::SourceUnavailable(format!(
                "sd_journal_open failed: {}",
                errno_message(rc)
            )));
        }
        Ok(JournalCursor {
            api: self.api.clone(),
            ptr,
            since,
        })
    }
}

impl RecordSource for JournalSource {
    fn fetch_logs(&self, params: &FetchParams) -> Result<Box<dyn LogCursor + '_>> {
        let mut cursor = self.open_cursor(params.range.since)?;

        if let Some(unit) = params.filter.unit() {
            cursor.add_match(fields::SYSTEMD_UNIT, unit)?;
        }
        if let Some(boot) = params.filter.boot() {
            cursor.add_match(fields::BOOT_ID, boot)?;
        }
        // Matches on the same field are ORed by the journal
        for transport in params.filter.transports() {
            cursor.add_match(fields::TRANSPORT, transport)?;
        }

        let rc = match params.range.until {
            Some(until) if until > 0 => unsafe {
                self.api.sd_journal_seek_realtime_usec(cursor.ptr, until as u64)
            },
            _ => unsafe { self.api.sd_journal_seek_tail(cursor.ptr) },
        };
        cursor.check_seek(rc)?;

        Ok(Box::new(cursor))
    }

    fn fetch_entry(&self, realtime: i64) -> Result<Option<RawLogRecord>> {
        let Ok(usec) = u64::try_from(realtime) else {
            return Ok(None);
        };
        let mut cursor = self.open_cursor(None)?;
        let rc = unsafe { self.api.sd_journal_seek_realtime_usec(cursor.ptr, usec) };
        cursor.check_seek(rc)?;

        let rc = unsafe { self.api.sd_journal_next(cursor.ptr) };
        if rc < 0 {
            return Err(QueryError::SourceUnavailable(format!(
                "journal iteration failed: {}",
                errno_message(rc)
            )));
        }
        if rc == 0 {
            debug!("No entry at or after {}", realtime);
            return Ok(None);
        }

        let found = cursor.realtime()?;
        if found != usec {
            debug!("Closest entry to {} is at {}", realtime, found);
            return Ok(None);
        }
        match cursor.read_entry(found)? {
            Pull::Record(record) => Ok(Some(record)),
            Pull::End => Ok(None),
        }
    }
}

/// Walks the journal backwards from the seek position, newest entry first.
struct JournalCursor {
    api: Api,
    ptr: *mut c_void,
    since: Option<i64>,
}

impl JournalCursor {
    fn add_match(&mut self, field: &str, value: &str) -> Result<()> {
        let data = CString::new(format!("{field}={value}"))
            .map_err(|_| QueryError::InvalidSpec(format!("{field} filter contains a NUL byte")))?;
        let bytes = data.as_bytes();
        let rc = unsafe {
            self.api
                .sd_journal_add_match(self.ptr, bytes.as_ptr() as *const c_void, bytes.len())
        };
        if rc < 0 {
            return Err(QueryError::InvalidSpec(format!(
                "journal rejected match {}: {}",
                field,
                errno_message(rc)
            )));
        }
        Ok(())
    }

    fn check_seek(&self, rc: c_int) -> Result<()> {
        if rc < 0 {
            return Err(QueryError::SourceUnavailable(format!(
                "journal seek failed: {}",
                errno_message(rc)
            )));
        }
        Ok(())
    }

    fn realtime(&self) -> Result<u64> {
        let mut realtime: u64 = 0;
        let rc = unsafe { self.api.sd_journal_get_realtime_usec(self.ptr, &mut realtime) };
        if rc < 0 {
            return Err(QueryError::SourceCorrupt(format!(
                "entry without realtime timestamp: {}",
                errno_message(rc)
            )));
        }
        Ok(realtime)
    }

    fn read_entry(&mut self, realtime: u64) -> Result<Pull> {
        let mut record = RawLogRecord::new();
        record.insert(fields::REALTIME_TIMESTAMP, realtime.to_string());

        unsafe { self.api.sd_journal_restart_data(self.ptr) };
        loop {
            let mut data: *const c_void = std::ptr::null();
            let mut length: usize = 0;
            let rc = unsafe { self.api.sd_journal_enumerate_data(self.ptr, &mut data, &mut length) };
            if rc == 0 {
                break;
            }
            if rc < 0 || data.is_null() {
                return Err(QueryError::SourceCorrupt(format!(
                    "entry at {} unreadable: {}",
                    realtime,
                    errno_message(rc.min(-1))
                )));
            }

            let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, length) };
            let text = String::from_utf8_lossy(bytes);
            match text.split_once('=') {
                Some((name, value)) => {
                    record.insert(name, value);
                }
                None => {
                    return Err(QueryError::SourceCorrupt(format!(
                        "entry at {} has field without '='",
                        realtime
                    )));
                }
            }
        }
        Ok(Pull::Record(record))
    }
}

impl LogCursor for JournalCursor {
    fn pull(&mut self) -> Result<Pull> {
        let rc = unsafe { self.api.sd_journal_previous(self.ptr) };
        if rc < 0 {
            return Err(QueryError::SourceUnavailable(format!(
                "journal iteration failed: {}",
                errno_message(rc)
            )));
        }
        if rc == 0 {
            debug!("No more entries");
            return Ok(Pull::End);
        }

        let realtime = self.realtime()?;
        if let Some(since) = self.since
            && (realtime as i64) < since
        {
            trace!("Reached epoch time of {}", since);
            return Ok(Pull::End);
        }

        self.read_entry(realtime)
    }
}

impl Drop for JournalCursor {
    fn drop(&mut self) {
        unsafe { self.api.sd_journal_close(self.ptr) };
    }
}
