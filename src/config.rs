//! Where the settings come from: built-in defaults, the logger's own
//! configuration file, an optional TOML settings file for us, and the
//! command line, each overriding the previous.

use std::{
    collections::BTreeMap,
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

pub const DEFAULT_LOGGER_CONFIG_PATH: &str = "/etc/mfsmetalogger.cfg";
pub const DEFAULT_MASTER_HOST: &str = "mfsmaster";
pub const DEFAULT_DATA_PATH: &str = "/var/lib/mfs";

/// Upper limit for all intervals and timeouts given in seconds (one
/// week).
pub const MAX_SECONDS: u64 = 7 * 24 * 3600;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {path:?}: {error}")]
    Read {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("settings file {path:?}: {error}")]
    Toml {
        path: PathBuf,
        error: toml::de::Error,
    },
    #[error("{key} in {source_name}: {message}")]
    Invalid {
        key: &'static str,
        source_name: String,
        message: String,
    },
    #[error("getting the current directory: {0}")]
    CurrentDir(std::io::Error),
}

/// The logger's `KEY = VALUE` configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggerConfigFile {
    pub values: BTreeMap<String, String>,
}

impl LoggerConfigFile {
    /// `#` comments, blank lines and lines without `=` are ignored.
    pub fn parse(contents: &str) -> Self {
        let values = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        Self { values }
    }

    /// A missing file is the same as an empty one.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(ConfigError::Read {
                path: path.into(),
                error,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Our own settings, from the TOML file given via `--settings`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub poll_interval_seconds: u64,
    /// Called with `start` / `stop`.
    pub logger_program: String,
    pub logger_process_name: String,
    pub recovery_process_name: String,
    /// Below the data path.
    pub archive_subdir: String,
    /// Part of the file names of the logger's segments.
    pub segment_marker: String,
    pub probe_attempts: u32,
    pub probe_timeout_seconds: u64,
    pub arping_program: PathBuf,
    pub stop_confirm_timeout_seconds: u64,
    pub interface_path: PathBuf,
    pub proc_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            logger_program: "mfsmetalogger".into(),
            logger_process_name: "mfsmetalogger".into(),
            recovery_process_name: "mfsmetarestore".into(),
            archive_subdir: "metalogs".into(),
            segment_marker: "_ml".into(),
            probe_attempts: 2,
            probe_timeout_seconds: 1,
            arping_program: "arping".into(),
            stop_confirm_timeout_seconds: 30,
            interface_path: "/sys/class/net".into(),
            proc_path: "/proc".into(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.into(),
            error,
        })?;
        toml::from_str(&contents).map_err(|error| ConfigError::Toml {
            path: path.into(),
            error,
        })
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct ConfigOpts {
    /// The logger's configuration file, read for MASTER_HOST and
    /// DATA_PATH. A missing file means the defaults (mfsmaster,
    /// /var/lib/mfs).
    #[clap(long, default_value = DEFAULT_LOGGER_CONFIG_PATH)]
    pub config: PathBuf,

    /// TOML file with settings for the sentinel itself (poll
    /// interval, program names, archive layout, probe parameters).
    #[clap(long)]
    pub settings: Option<PathBuf>,

    /// Host name or address of the master; overrides MASTER_HOST.
    #[clap(long)]
    pub master_host: Option<String>,

    /// The logger's data directory; overrides DATA_PATH.
    #[clap(long)]
    pub data_path: Option<PathBuf>,

    /// Seconds between probes; overrides `poll_interval_seconds`.
    #[clap(long)]
    pub poll_interval: Option<u64>,
}

/// Everything resolved, validated, paths absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub master_host: String,
    pub data_path: PathBuf,
    pub poll_interval: Duration,
    pub probe_attempts: NonZeroU32,
    pub probe_timeout: Duration,
    pub stop_confirm_timeout: Duration,
    pub settings: Settings,
}

fn bounded_seconds(
    key: &'static str,
    seconds: u64,
    source_name: impl FnOnce() -> String,
) -> Result<Duration, ConfigError> {
    if seconds > MAX_SECONDS {
        return Err(ConfigError::Invalid {
            key,
            source_name: source_name(),
            message: format!("must not be greater than {MAX_SECONDS}"),
        });
    }
    Ok(Duration::from_secs(seconds))
}

fn absolute(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()
            .map_err(ConfigError::CurrentDir)?
            .join(path))
    }
}

impl Config {
    pub fn resolve(
        logger_config: &LoggerConfigFile,
        settings: Settings,
        opts: &ConfigOpts,
    ) -> Result<Self, ConfigError> {
        let settings_source = || match &opts.settings {
            Some(path) => format!("{path:?}"),
            None => "built-in settings".into(),
        };

        let master_host = opts
            .master_host
            .clone()
            .or_else(|| logger_config.get("MASTER_HOST").map(String::from))
            .unwrap_or_else(|| DEFAULT_MASTER_HOST.into());
        if master_host.is_empty() {
            return Err(ConfigError::Invalid {
                key: "master host",
                source_name: "--master-host".into(),
                message: "must not be empty".into(),
            });
        }
        let data_path = absolute(
            opts.data_path
                .clone()
                .or_else(|| logger_config.get("DATA_PATH").map(PathBuf::from))
                .unwrap_or_else(|| DEFAULT_DATA_PATH.into()),
        )?;

        let poll_interval_seconds = opts.poll_interval.unwrap_or(settings.poll_interval_seconds);
        let poll_interval_source = || {
            if opts.poll_interval.is_some() {
                "--poll-interval".into()
            } else {
                settings_source()
            }
        };
        if poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "poll interval",
                source_name: poll_interval_source(),
                message: "must be greater than 0".into(),
            });
        }
        let poll_interval =
            bounded_seconds("poll interval", poll_interval_seconds, poll_interval_source)?;
        let probe_timeout = bounded_seconds(
            "probe_timeout_seconds",
            settings.probe_timeout_seconds,
            settings_source,
        )?;
        let stop_confirm_timeout = bounded_seconds(
            "stop_confirm_timeout_seconds",
            settings.stop_confirm_timeout_seconds,
            settings_source,
        )?;
        let probe_attempts =
            NonZeroU32::new(settings.probe_attempts).ok_or_else(|| ConfigError::Invalid {
                key: "probe_attempts",
                source_name: settings_source(),
                message: "must be at least 1".into(),
            })?;

        let settings = Settings {
            interface_path: absolute(settings.interface_path)?,
            proc_path: absolute(settings.proc_path)?,
            ..settings
        };
        Ok(Self {
            master_host,
            data_path,
            poll_interval,
            probe_attempts,
            probe_timeout,
            stop_confirm_timeout,
            settings,
        })
    }

    /// Read the files named in `opts` and resolve. Call before
    /// daemonizing, which changes the working directory.
    pub fn load(opts: &ConfigOpts) -> Result<Self, ConfigError> {
        let logger_config = LoggerConfigFile::load(&opts.config)?;
        let settings = match &opts.settings {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        Self::resolve(&logger_config, settings, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ConfigOpts {
        ConfigOpts {
            config: "/nonexistent/mfsmetalogger.cfg".into(),
            settings: None,
            master_host: None,
            data_path: None,
            poll_interval: None,
        }
    }

    #[test]
    fn t_parse_logger_config() {
        let cfg = LoggerConfigFile::parse(
            "# WORKING_USER = mfs\n\
             \n\
             MASTER_HOST = 10.1.2.3\n\
             DATA_PATH=/srv/mfs \n\
             garbage line\n\
             BACK_LOGS = 50\n\
             EMPTY =\n",
        );
        assert_eq!(cfg.get("MASTER_HOST"), Some("10.1.2.3"));
        assert_eq!(cfg.get("DATA_PATH"), Some("/srv/mfs"));
        assert_eq!(cfg.get("BACK_LOGS"), Some("50"));
        assert_eq!(cfg.get("WORKING_USER"), None);
        assert_eq!(cfg.get("EMPTY"), None);
        assert_eq!(cfg.values.len(), 4);
    }

    #[test]
    fn t_defaults() {
        let config = Config::load(&opts()).unwrap();
        assert_eq!(config.master_host, "mfsmaster");
        assert_eq!(config.data_path, PathBuf::from("/var/lib/mfs"));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.probe_attempts.get(), 2);
        assert_eq!(config.settings, Settings::default());
    }

    #[test]
    fn t_layers_override_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("mfsmetalogger.cfg");
        std::fs::write(&cfg_path, "MASTER_HOST = master.lan\nDATA_PATH = /data/mfs\n").unwrap();
        let settings_path = dir.path().join("sentinel.toml");
        std::fs::write(
            &settings_path,
            "poll_interval_seconds = 3\nsegment_marker = \"_seg\"\n",
        )
        .unwrap();

        let mut opts = opts();
        opts.config = cfg_path;
        opts.settings = Some(settings_path);
        let config = Config::load(&opts).unwrap();
        assert_eq!(config.master_host, "master.lan");
        assert_eq!(config.data_path, PathBuf::from("/data/mfs"));
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.settings.segment_marker, "_seg");
        assert_eq!(config.settings.logger_program, "mfsmetalogger");

        opts.master_host = Some("10.0.0.1".into());
        opts.poll_interval = Some(7);
        let config = Config::load(&opts).unwrap();
        assert_eq!(config.master_host, "10.0.0.1");
        assert_eq!(config.poll_interval, Duration::from_secs(7));
    }

    #[test]
    fn t_validation() {
        let mut o = opts();
        o.poll_interval = Some(0);
        assert!(matches!(
            Config::load(&o),
            Err(ConfigError::Invalid {
                key: "poll interval",
                ..
            })
        ));

        let settings = Settings {
            probe_attempts: 0,
            ..Settings::default()
        };
        assert!(matches!(
            Config::resolve(&LoggerConfigFile::default(), settings, &opts()),
            Err(ConfigError::Invalid {
                key: "probe_attempts",
                ..
            })
        ));
    }

    #[test]
    fn t_durations_are_bounded() {
        let mut o = opts();
        o.poll_interval = Some(u64::MAX);
        assert!(matches!(
            Config::load(&o),
            Err(ConfigError::Invalid {
                key: "poll interval",
                ..
            })
        ));
        o.poll_interval = Some(MAX_SECONDS);
        assert_eq!(
            Config::load(&o).unwrap().poll_interval,
            Duration::from_secs(MAX_SECONDS)
        );

        let resolve = |settings| Config::resolve(&LoggerConfigFile::default(), settings, &opts());
        assert!(matches!(
            resolve(Settings {
                probe_timeout_seconds: u64::MAX,
                ..Settings::default()
            }),
            Err(ConfigError::Invalid {
                key: "probe_timeout_seconds",
                ..
            })
        ));
        assert!(matches!(
            resolve(Settings {
                stop_confirm_timeout_seconds: MAX_SECONDS + 1,
                ..Settings::default()
            }),
            Err(ConfigError::Invalid {
                key: "stop_confirm_timeout_seconds",
                ..
            })
        ));
        assert!(matches!(
            resolve(Settings {
                poll_interval_seconds: u64::MAX,
                ..Settings::default()
            }),
            Err(ConfigError::Invalid {
                key: "poll interval",
                ..
            })
        ));
    }

    #[test]
    fn t_unknown_settings_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        std::fs::write(&path, "poll_intervall_seconds = 3\n").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::Toml { .. })
        ));
    }

    #[test]
    fn t_relative_data_path_is_made_absolute() {
        let mut o = opts();
        o.data_path = Some("mfs".into());
        let config = Config::load(&o).unwrap();
        assert!(config.data_path.is_absolute());
        assert!(config.data_path.ends_with("mfs"));
    }
}
