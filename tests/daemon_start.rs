//! `start` mode, run through the binary with stand-ins for arping,
//! the logger and the system tables.

use std::{
    path::Path,
    process::{Command, Stdio},
    thread::sleep,
    time::{Duration, Instant},
};

fn sentinel(dir: &Path, args: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_metalogger-sentinel"));
    command
        .arg("--config")
        .arg(dir.join("mfsmetalogger.cfg"))
        .arg("--settings")
        .arg(dir.join("sentinel.toml"))
        .arg("--data-path")
        .arg(dir.join("data"))
        .arg("--state-dir")
        .arg(dir.join("state"))
        .args(args)
        .stdin(Stdio::null());
    command
}

/// Run without capturing output: a forked daemon would keep captured
/// pipes open.
fn run_detached(dir: &Path, args: &[&str]) {
    let status = sentinel(dir, args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success(), "{args:?}: {status}");
}

fn status(dir: &Path) -> String {
    let output = sentinel(dir, &["status"]).output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap()
}

/// `(state, session id)` from `/proc/<pid>/stat`, `None` if the
/// process does not exist.
fn proc_stat(pid: &str) -> Option<(char, String)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces; fields after it are fixed.
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some((fields[0].chars().next()?, fields[3].to_string()))
}

#[test]
fn t_daemon_is_not_a_session_leader() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path();
    let interfaces = dir.join("net");
    std::fs::create_dir_all(interfaces.join("eth0")).unwrap();
    std::fs::write(interfaces.join("eth0/type"), "1\n").unwrap();
    std::fs::write(interfaces.join("eth0/address"), "52:54:00:12:34:56\n").unwrap();
    std::fs::create_dir(dir.join("proc")).unwrap();
    std::fs::create_dir(dir.join("data")).unwrap();
    std::fs::write(
        dir.join("sentinel.toml"),
        format!(
            "poll_interval_seconds = 1\n\
             arping_program = \"true\"\n\
             logger_program = \"true\"\n\
             interface_path = {:?}\n\
             proc_path = {:?}\n",
            interfaces,
            dir.join("proc")
        ),
    )
    .unwrap();

    run_detached(dir, &["start"]);

    // The daemon stores its session id once detached.
    let start = Instant::now();
    let session = loop {
        let s = status(dir);
        if let Some(rest) = s.strip_prefix("running (pid: ") {
            break rest.split(',').next().unwrap().to_string();
        }
        assert!(start.elapsed() < Duration::from_secs(20), "status: {s}");
        sleep(Duration::from_millis(100));
    };

    // The session leader exits (it may stay unreaped) ...
    let start = Instant::now();
    while let Some((state, _)) = proc_stat(&session) {
        if state == 'Z' {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "session leader {session} still alive"
        );
        sleep(Duration::from_millis(100));
    }
    // ... while the daemon lives on in its session.
    let members: Vec<String> = std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(|e| e.ok()?.file_name().into_string().ok())
        .filter(|pid| pid.bytes().all(|b| b.is_ascii_digit()) && *pid != session)
        .filter(|pid| matches!(proc_stat(pid), Some((state, sid)) if state != 'Z' && sid == session))
        .collect();
    assert!(!members.is_empty(), "no live process in session {session}");

    run_detached(dir, &["stop", "--wait"]);
    assert!(status(dir).starts_with("stopped"));
}
