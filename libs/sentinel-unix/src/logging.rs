//! Capture a daemon's stdout and stderr into rotated log files, via a
//! separate log proxy process.

use std::{
    ffi::CString,
    fs::{remove_file, rename, File, OpenOptions},
    io::{stderr, BufRead, BufReader, Write},
    os::{fd::FromRawFd, unix::fs::MetadataExt},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::SystemTime,
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use cj_path_util::path_util::AppendToPath;
use nix::{
    libc::{prctl, PR_SET_NAME},
    unistd::{close, dup2, pipe, setsid, Pid},
};

use crate::{daemon::DaemonError, fork::easy_fork};

/// Whether `line` already starts with a timestamp followed by a tab,
/// in one of the formats `TimestampFormatter` produces.
pub fn starts_with_timestamp(line: &str) -> bool {
    let Some((prefix, _)) = line.split_once('\t') else {
        return false;
    };
    // Cheap reject before trying the parsers.
    if prefix.len() > 40 || !prefix.starts_with(|c: char| c.is_ascii_digit()) {
        return false;
    }
    let prefix = prefix.trim_end_matches(',');
    DateTime::parse_from_rfc3339(prefix).is_ok()
        || DateTime::parse_from_str(prefix, "%Y-%m-%d %H:%M:%S%.f %:z").is_ok()
        || prefix
            .strip_suffix(" UTC")
            .map(|p| NaiveDateTime::parse_from_str(p, "%Y-%m-%d %H:%M:%S%.f").is_ok())
            .unwrap_or(false)
}

#[test]
fn t_starts_with_timestamp() {
    let cases = [
        ("2026-10-19 07:12:01.000445551 +02:00\tcommitted action stop", true),
        ("2026-10-19T07:12:01.000319897+02:00\tcommitted action stop", true),
        ("2026-10-19 05:12:01.000319897 UTC\tcommitted action stop", true),
        ("2026-10-19 05:12:01.000319897 UTC,\tcommitted action stop", true),
        ("committed action stop", false),
        ("12\tsomething with a tab", false),
        ("src/orchestrator.rs:88:17\tcommitted action stop", false),
    ];
    for (s, expected) in &cases {
        assert!(
            starts_with_timestamp(s) == *expected,
            "{s:?} to yield {expected:?}"
        );
    }
}

#[derive(Debug, Clone)]
pub struct TimestampFormatter {
    /// Whether rfc3339 format is to be used (default: whatever chrono
    /// uses for `Display`).
    pub use_rfc3339: bool,
    pub local_time: bool,
}

impl TimestampFormatter {
    pub fn format_systemtime(&self, t: SystemTime) -> String {
        if self.local_time {
            let t: DateTime<Local> = t.into();
            if self.use_rfc3339 {
                t.to_rfc3339()
            } else {
                t.to_string()
            }
        } else {
            let t: DateTime<Utc> = t.into();
            if self.use_rfc3339 {
                t.to_rfc3339()
            } else {
                t.to_string()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum TimestampMode {
    /// Always add a timestamp
    Always,
    /// Add a timestamp to lines that don't already start with one
    Automatic,
}

/// These settings are set statically by the app, not exposed to the
/// user, thus not deriving clap::Args.
#[derive(Debug, Clone)]
pub struct TimestampOpts {
    pub use_rfc3339: bool,
    pub mode: TimestampMode,
}

#[derive(Debug, Clone, clap::Args)]
pub struct LoggingOpts {
    /// If true, write log time stamps in the local time zone.
    /// Default: in UTC.
    #[clap(long)]
    pub local_time: bool,

    /// The maximum size of the 'current.log' file in bytes before it
    /// is renamed and a new one opened.
    #[clap(long, default_value = "10000000")]
    pub max_log_file_size: u64,

    /// The maximum number of numbered log files (i.e. excluding
    /// `current.log`) before the oldest are deleted. Careful: as many
    /// files are deleted as needed to get their count down to the
    /// given number (0 deletes them all)!
    #[clap(long, default_value = "50")]
    pub max_log_files: u32,
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| anyhow!("opening {path:?} for appending"))
}

pub struct Logger {
    pub logging_opts: LoggingOpts,
    pub timestamp_opts: TimestampOpts,
    pub dir_path: Arc<Path>,
}

impl Logger {
    fn dir(&self) -> &Path {
        &self.dir_path
    }

    pub fn current_log_path(&self) -> PathBuf {
        self.dir().append("current.log")
    }

    /// Rename "current.log" (if present) to the next free number,
    /// like "000001.log", and delete the oldest numbered files beyond
    /// `max_log_files`.
    pub fn rotate_logs(&self) -> anyhow::Result<()> {
        let mut numbered_logfiles = Vec::new();
        for entry in std::fs::read_dir(&self.dir_path)
            .with_context(|| anyhow!("listing {:?}", self.dir_path))?
        {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(num) = file_name
                .strip_suffix(".log")
                .and_then(|numstr| usize::from_str(numstr).ok())
            {
                numbered_logfiles.push((num, entry.path()));
            }
        }
        numbered_logfiles.sort_by_key(|(num, _)| *num);
        let new_number = numbered_logfiles.last().map(|(num, _)| *num).unwrap_or(0) + 1;
        let new_log_path = self.dir().append(format!("{new_number:06}.log"));
        let current_log_path = self.current_log_path();
        if current_log_path.exists() {
            rename(&current_log_path, &new_log_path)
                .with_context(|| anyhow!("renaming {current_log_path:?} to {new_log_path:?}"))?;
            numbered_logfiles.push((new_number, new_log_path));
        }
        let max_log_files =
            usize::try_from(self.logging_opts.max_log_files).expect("u32 fits in usize");
        if numbered_logfiles.len() > max_log_files {
            let delete_n = numbered_logfiles.len() - max_log_files;
            for (_, path) in &numbered_logfiles[0..delete_n] {
                remove_file(path).with_context(|| anyhow!("deleting log file {path:?}"))?;
            }
        }
        Ok(())
    }

    fn run_log_proxy(&self, logging_r: i32, session_pid: Pid) -> anyhow::Result<()> {
        // A session of our own, so that killing the daemon's process
        // group leaves us alive to record its end.
        let _logging_session_pid = setsid()?;

        std::fs::create_dir_all(&self.dir_path)
            .with_context(|| anyhow!("creating log dir {:?}", self.dir_path))?;

        let timestamp_formatter = TimestampFormatter {
            use_rfc3339: self.timestamp_opts.use_rfc3339,
            local_time: self.logging_opts.local_time,
        };

        let mut messagesfh = BufReader::new(unsafe {
            // Safe because nothing else in this process uses or
            // closes this fd.
            File::from_raw_fd(logging_r)
        });

        let mut input_line = String::new();
        let mut output_line = Vec::new();

        let mut logfh = open_append(&self.current_log_path())?;
        let mut total_written: u64 = logfh.metadata()?.size();
        loop {
            input_line.clear();
            output_line.clear();
            let nread = messagesfh.read_line(&mut input_line)?;
            let daemon_ended = nread == 0;
            let needs_timestamp = match self.timestamp_opts.mode {
                TimestampMode::Always => true,
                TimestampMode::Automatic => daemon_ended || !starts_with_timestamp(&input_line),
            };
            if needs_timestamp {
                let s = timestamp_formatter.format_systemtime(SystemTime::now());
                output_line.extend_from_slice(s.as_bytes());
                output_line.push(b'\t');
            }
            if daemon_ended {
                write!(&mut output_line, "daemon {session_pid} ended")?;
            } else {
                output_line.extend_from_slice(input_line.trim_end().as_bytes());
            }
            output_line.push(b'\n');

            logfh.write_all(&output_line)?;
            total_written += output_line.len() as u64;

            if daemon_ended {
                break;
            }

            if total_written >= self.logging_opts.max_log_file_size {
                drop(logfh);
                self.rotate_logs()?;
                logfh = open_append(&self.current_log_path())?;
                total_written = 0;
            }
        }
        logfh.flush()?;
        Ok(())
    }

    /// Fork off the log proxy process and redirect our stdout and
    /// stderr into it. `session_pid` identifies the daemon instance in
    /// the "ended" line the proxy writes when the pipe closes. Flush
    /// stdout and stderr before calling this.
    pub fn redirect_to_logger(self, session_pid: Pid) -> Result<(), DaemonError> {
        let (logging_r, logging_w) = pipe().map_err(|error| DaemonError::Errno {
            context: "pipe for logging",
            error,
        })?;

        if let Some(_logging_pid) = easy_fork().map_err(|error| DaemonError::Errno {
            context: "forking the log proxy",
            error,
        })? {
            // In the daemon.
            close(logging_r).map_err(|error| DaemonError::Errno {
                context: "daemon: closing logging_r",
                error,
            })?;
            dup2(logging_w, 1).map_err(|error| DaemonError::Errno {
                context: "daemon: dup to stdout",
                error,
            })?;
            dup2(logging_w, 2).map_err(|error| DaemonError::Errno {
                context: "daemon: dup to stderr",
                error,
            })?;
            close(logging_w).map_err(|error| DaemonError::Errno {
                context: "daemon: closing logging_w",
                error,
            })?;
            Ok(())
        } else {
            // In the log proxy.

            // Visible via `head -1 /proc/$pid/status`.
            if let Ok(name) = CString::new("sentinel-log") {
                unsafe {
                    // Safe: the kernel copies the name.
                    prctl(PR_SET_NAME, name.as_ptr(), 0, 0, 0);
                }
            }

            // Never writing from this process; closing it lets us
            // see EOF when the daemon ends.
            _ = close(logging_w);
            _ = close(1);
            _ = close(2);

            if let Err(e) = self.run_log_proxy(logging_r, session_pid) {
                // stderr is closed, this is a last attempt only.
                _ = writeln!(&mut stderr(), "log proxy: ending because of error: {e:#}");
            }
            std::process::exit(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(dir: &Path, max_log_files: u32) -> Logger {
        Logger {
            logging_opts: LoggingOpts {
                local_time: false,
                max_log_file_size: 100,
                max_log_files,
            },
            timestamp_opts: TimestampOpts {
                use_rfc3339: false,
                mode: TimestampMode::Automatic,
            },
            dir_path: dir.into(),
        }
    }

    #[test]
    fn t_rotate_logs_numbers_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path(), 2);
        for i in 0..3 {
            std::fs::write(logger.current_log_path(), format!("round {i}\n")).unwrap();
            logger.rotate_logs().unwrap();
        }
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["000002.log", "000003.log"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("000003.log")).unwrap(),
            "round 2\n"
        );
    }

    #[test]
    fn t_rotate_logs_without_current_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path(), 5);
        logger.rotate_logs().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
