//! Quarantining the logger's segments before it is started afresh,
//! so that no segment set ever spans two master epochs.

use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use cj_path_util::path_util::AppendToPath;

use crate::{
    process_control::{ProcessControl, ProcessControlError},
    shutdown::{sleep_unless_shutdown, Interrupted, ShutdownCheck},
    supervisor::LoggerSupervisor,
};

/// Format of the per-restart directory names; sorts lexicographically
/// by time.
pub const ARCHIVE_DIR_NAME_FORMAT: &str = "%Y_%m_%d_%H:%M.%S";

/// The name is always built from UTC, so that names keep sorting in
/// time order across DST changes and zone changes of the host.
pub fn archive_dir_name<Tz: TimeZone>(time: &DateTime<Tz>) -> String {
    time.with_timezone(&Utc)
        .format(ARCHIVE_DIR_NAME_FORMAT)
        .to_string()
}

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("creating archive directory {path:?}: {error}")]
    CreateDir {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("listing log segments in {path:?}: {error}")]
    ListSegments {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("moving log segment {from:?} to {to:?}: {error}")]
    MoveSegment {
        from: PathBuf,
        to: PathBuf,
        error: std::io::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum RestartError {
    #[error("{0}")]
    Interrupted(#[from] Interrupted),
    #[error("{0}")]
    Process(#[from] ProcessControlError),
    #[error("{0}")]
    Archive(#[from] ArchiveError),
}

/// What an archive step did. Partial failures are reported, not
/// rolled back.
#[derive(Debug)]
pub struct ArchiveReport {
    pub archive_dir: PathBuf,
    /// File names moved into `archive_dir`.
    pub moved: Vec<String>,
    /// `ArchiveError::MoveSegment` errors.
    pub failed: Vec<ArchiveError>,
}

impl ArchiveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ArchiveManager {
    /// The logger's data directory, holding its segments.
    pub data_path: PathBuf,
    /// Below `data_path`.
    pub archive_subdir: String,
    /// Segment files are the regular files in `data_path` whose name
    /// contains this.
    pub segment_marker: String,
    /// Segments must not be moved while a process of this name runs.
    pub recovery_process_name: String,
    pub poll_interval: Duration,
}

impl ArchiveManager {
    pub fn archive_root(&self) -> PathBuf {
        (&self.data_path).append(self.archive_subdir.as_str())
    }

    /// The segment files currently in `data_path`, sorted by name.
    pub fn list_segments(&self) -> Result<Vec<String>, ArchiveError> {
        let list_err = |error| ArchiveError::ListSegments {
            path: self.data_path.clone(),
            error,
        };
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.data_path).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            if !entry.file_type().map_err(list_err)?.is_file() {
                continue;
            }
            // Non-UTF-8 names are not the logger's.
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.contains(self.segment_marker.as_str()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Move all segments into a directory named after `now` under
    /// `archive_root()`, which is created (or reused if it exists).
    /// Failing to create it is an error; failing to move single files
    /// is recorded in the report. Without segments nothing is created,
    /// and the report has no moves.
    pub fn archive_segments<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
    ) -> Result<ArchiveReport, ArchiveError> {
        let archive_dir = self.archive_root().append(archive_dir_name(now));
        let segments = self.list_segments()?;
        let mut moved = Vec::new();
        let mut failed = Vec::new();
        if segments.is_empty() {
            return Ok(ArchiveReport {
                archive_dir,
                moved,
                failed,
            });
        }
        std::fs::create_dir_all(&archive_dir).map_err(|error| ArchiveError::CreateDir {
            path: archive_dir.clone(),
            error,
        })?;
        for name in segments {
            let from = (&self.data_path).append(name.as_str());
            let to = (&archive_dir).append(name.as_str());
            match std::fs::rename(&from, &to) {
                Ok(()) => moved.push(name),
                Err(error) => failed.push(ArchiveError::MoveSegment { from, to, error }),
            }
        }
        Ok(ArchiveReport {
            archive_dir,
            moved,
            failed,
        })
    }

    fn wait_for_recovery_to_finish<P: ProcessControl>(
        &self,
        control: &P,
        shutdown: &dyn ShutdownCheck,
    ) -> Result<(), RestartError> {
        let mut logged = false;
        while control.is_process_running(&self.recovery_process_name)? {
            if !logged {
                eprintln!(
                    "{:?} is running, waiting for it to finish before archiving",
                    self.recovery_process_name
                );
                logged = true;
            }
            sleep_unless_shutdown(self.poll_interval, shutdown)?;
        }
        if logged {
            eprintln!("{:?} has finished", self.recovery_process_name);
        }
        Ok(())
    }

    /// Wait (without limit, but interruptible) until no recovery
    /// process runs, stop the logger and confirm it is gone, move its
    /// segments away, start it. Any error aborts the sequence at that
    /// point; in particular the logger is not started if its segments
    /// could not be archived at all.
    pub fn restart<P: ProcessControl>(
        &self,
        supervisor: &LoggerSupervisor<P>,
        shutdown: &dyn ShutdownCheck,
    ) -> Result<ArchiveReport, RestartError> {
        self.wait_for_recovery_to_finish(supervisor.control(), shutdown)?;
        supervisor.stop_and_confirm(shutdown)?;
        let report = self.archive_segments(&Utc::now())?;
        if report.moved.is_empty() && report.is_complete() {
            eprintln!("no log segments to archive");
        } else {
            eprintln!(
                "archived {} log segment(s) to {:?}",
                report.moved.len(),
                report.archive_dir
            );
        }
        for e in &report.failed {
            eprintln!("warning: {e}");
        }
        supervisor.start()?;
        Ok(report)
    }
}
