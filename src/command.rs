//! Running the external programs we depend on (the logger's control
//! script, the neighbor probe tool), with their exit codes checked.

use std::{
    ffi::OsStr,
    fmt::Debug,
    process::{Command, ExitStatus, Stdio},
};

use anyhow::{anyhow, bail, Context, Result};

fn cmd_args<P: AsRef<OsStr>, A: AsRef<OsStr>>(cmd: P, arguments: &[A]) -> Vec<String> {
    let mut vec = vec![cmd.as_ref().to_string_lossy().to_string()];
    vec.extend(
        arguments
            .iter()
            .map(|v| v.as_ref().to_string_lossy().to_string()),
    );
    vec
}

/// Returns the exit code if it is in `acceptable_status_codes`.
fn check_exitstatus(
    exitstatus: &ExitStatus,
    acceptable_status_codes: &[i32],
    get_cmd_args: &dyn Fn() -> Vec<String>,
) -> Result<i32> {
    match exitstatus.code() {
        Some(code) if acceptable_status_codes.contains(&code) => Ok(code),
        Some(code) => bail!("running {:?}: command exited with code {code}", get_cmd_args()),
        None => bail!(
            "running {:?}: command exited via signal, or other problem",
            get_cmd_args()
        ),
    }
}

fn command<P: AsRef<OsStr>, A: AsRef<OsStr>>(cmd: P, arguments: &[A]) -> Command {
    let mut c = Command::new(cmd);
    c.args(arguments).stdin(Stdio::null());
    c
}

/// Run `cmd` with `arguments`, wait for its completion, stdout and
/// stderr going to ours. Returns an error if it exited with a code
/// not in `acceptable_status_codes`, otherwise the code.
pub fn run<P: AsRef<OsStr> + Debug, A: AsRef<OsStr> + Debug>(
    cmd: P,
    arguments: &[A],
    acceptable_status_codes: &[i32],
) -> Result<i32> {
    let get_cmd_args = || cmd_args(&cmd, arguments);
    let exitstatus = command(&cmd, arguments)
        .status()
        .with_context(|| anyhow!("running {:?}", get_cmd_args()))?;
    check_exitstatus(&exitstatus, acceptable_status_codes, &get_cmd_args)
}

/// Same as `run` but captures and returns stdout, too.
pub fn run_stdout<P: AsRef<OsStr> + Debug, A: AsRef<OsStr> + Debug>(
    cmd: P,
    arguments: &[A],
    acceptable_status_codes: &[i32],
) -> Result<(i32, Vec<u8>)> {
    let get_cmd_args = || cmd_args(&cmd, arguments);
    let output = command(&cmd, arguments)
        .stderr(Stdio::inherit())
        .output()
        .with_context(|| anyhow!("running {:?}", get_cmd_args()))?;
    let code = check_exitstatus(&output.status, acceptable_status_codes, &get_cmd_args)?;
    Ok((code, output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_run() {
        assert_eq!(run("true", &[] as &[&str], &[0]).unwrap(), 0);
        assert_eq!(run("false", &[] as &[&str], &[0, 1]).unwrap(), 1);
        let e = run("false", &[] as &[&str], &[0]).unwrap_err();
        assert!(e.to_string().contains("exited with code 1"), "{e}");
        assert!(run("/nonexistent/program", &["x"], &[0]).is_err());
    }

    #[test]
    fn t_run_stdout() {
        let (code, out) = run_stdout("echo", &["a", "b"], &[0]).unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, b"a b\n");
    }
}
