use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use metalogger_sentinel::{
    address_resolver::{AddressResolver, SystemAddressResolver},
    archive::ArchiveManager,
    config::{Config, ConfigOpts},
    failover::{decide, is_local_master},
    orchestrator::Orchestrator,
    process_control::SystemProcessControl,
    supervisor::LoggerSupervisor,
};
use sentinel_unix::{
    daemon::{Daemon, DaemonMode},
    logging::{LoggingOpts, TimestampMode, TimestampOpts},
    state::DaemonStateReader,
};

#[derive(clap::Parser, Debug)]
/// Watch which host answers for the metadata master, and keep the
/// local metalogger from mixing log segments of two masters: stop it
/// while this host is the master, archive its segments and restart it
/// when the master moved to another host, keep it running otherwise.
struct Opts {
    #[clap(flatten)]
    config: ConfigOpts,

    #[clap(flatten)]
    logging: LoggingOpts,

    /// Log every probe and the action computed from it (default:
    /// only changes, restarts and errors).
    #[clap(long, short)]
    verbose: bool,

    /// When not verbose, log a line every this many seconds to show
    /// that the daemon is alive.
    #[clap(long, default_value = "300")]
    activity_log_interval: u64,

    /// Directory for the lock and state files of the daemon, and its
    /// `logs` directory.
    #[clap(long, default_value = "/var/run/metalogger-sentinel")]
    state_dir: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    #[clap(flatten)]
    Daemon(DaemonMode),

    /// Probe the master once and show what would be done, without
    /// doing it.
    Probe,
}

fn address_resolver(config: &Config) -> SystemAddressResolver {
    SystemAddressResolver {
        interface_path: config.settings.interface_path.clone(),
        arping_program: config.settings.arping_program.clone(),
        attempts: config.probe_attempts,
        timeout: config.probe_timeout,
    }
}

fn orchestrator(
    config: Config,
    verbose: bool,
    activity_log_interval: Duration,
) -> Result<Orchestrator<SystemAddressResolver, SystemProcessControl>> {
    let resolver = address_resolver(&config);
    // Interfaces are assumed stable for our lifetime.
    let local = resolver
        .local_identity()
        .context("determining the local hardware addresses")?;
    let Config {
        master_host,
        data_path,
        poll_interval,
        stop_confirm_timeout,
        settings,
        ..
    } = config;
    Ok(Orchestrator {
        resolver,
        supervisor: LoggerSupervisor {
            control: SystemProcessControl::new(settings.proc_path),
            program: settings.logger_program,
            process_name: settings.logger_process_name,
            stop_confirm_timeout,
        },
        archive: ArchiveManager {
            data_path,
            archive_subdir: settings.archive_subdir,
            segment_marker: settings.segment_marker,
            recovery_process_name: settings.recovery_process_name,
            poll_interval,
        },
        local,
        master_host,
        poll_interval,
        verbose,
        activity_log_interval,
    })
}

fn daemon<F: FnOnce(DaemonStateReader) -> Result<()>>(
    state_dir: PathBuf,
    logging_opts: LoggingOpts,
    run: F,
) -> Daemon<F> {
    Daemon {
        state_dir: state_dir.into(),
        logging_opts,
        timestamp_opts: TimestampOpts {
            use_rfc3339: true,
            mode: TimestampMode::Automatic,
        },
        run,
    }
}

fn probe(config: &Config) -> Result<()> {
    let resolver = address_resolver(config);
    let local = resolver.local_identity()?;
    let observed = resolver.probe_master(&config.master_host)?;
    println!("local addresses: {local}");
    println!("master {:?} answered from: {observed}", config.master_host);
    println!("local host is master: {}", is_local_master(&observed, &local));
    println!("action at startup: {}", decide(None, &observed, &local));
    Ok(())
}

fn main() -> Result<()> {
    let Opts {
        config: config_opts,
        logging,
        verbose,
        activity_log_interval,
        state_dir,
        command,
    } = Opts::parse();

    let daemon_mode = match command {
        Command::Probe => return probe(&Config::load(&config_opts)?),
        Command::Daemon(daemon_mode) => daemon_mode,
    };

    match daemon_mode {
        DaemonMode::Stop(_) | DaemonMode::Status => {
            daemon(state_dir, logging, |_reader| Ok(())).execute(daemon_mode)?
        }
        DaemonMode::Run | DaemonMode::Start | DaemonMode::Restart(_) => {
            // Before forking: relative paths, and errors seen on the
            // terminal.
            let config = Config::load(&config_opts)?;
            let orchestrator = orchestrator(
                config,
                verbose,
                Duration::from_secs(activity_log_interval),
            )?;
            daemon(state_dir, logging, move |reader| {
                orchestrator.run(&|| reader.want_exit());
                Ok(())
            })
            .execute(daemon_mode)?
        }
    }
    Ok(())
}
