//! Native process listing via the `/proc` filesystem (no `ps`
//! output parsing).

use std::{
    ffi::OsStr,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use nix::unistd::{getpid, Pid};

/// Upper bound for reads of single `/proc/<pid>/*` files.
const MAX_PROC_READ_SIZE: u64 = 4096;

/// The kernel truncates `comm` to this many bytes.
const COMM_LEN: usize = 15;

#[derive(thiserror::Error, Debug)]
pub enum ProcTableError {
    #[error("listing processes in {path:?}: {error}")]
    List {
        path: PathBuf,
        error: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: Pid,
    /// Contents of `/proc/<pid>/comm`, without the newline.
    pub comm: String,
    /// The first element of `/proc/<pid>/cmdline`, if any (kernel
    /// threads have none).
    pub argv0: Option<String>,
}

impl ProcEntry {
    /// Whether this process is running the program called `name`:
    /// either its `comm` is `name` (truncated the way the kernel
    /// does it), or the file name of its `argv[0]` is `name`.
    pub fn is_named(&self, name: &str) -> bool {
        let truncated = match name.char_indices().nth(COMM_LEN) {
            Some((i, _)) => &name[..i],
            None => name,
        };
        if self.comm == truncated {
            return true;
        }
        match &self.argv0 {
            Some(argv0) => Path::new(argv0).file_name() == Some(OsStr::new(name)),
            None => false,
        }
    }
}

fn read_bounded(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)?
        .take(MAX_PROC_READ_SIZE)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

#[derive(Debug, Clone)]
pub struct ProcTable {
    pub proc_path: PathBuf,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self {
            proc_path: "/proc".into(),
        }
    }
}

impl ProcTable {
    /// All processes visible right now. Processes that vanish while
    /// scanning, or whose entries can't be read, are skipped.
    pub fn list(&self) -> Result<Vec<ProcEntry>, ProcTableError> {
        let list_err = |error| ProcTableError::List {
            path: self.proc_path.clone(),
            error,
        };
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.proc_path).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
                .filter(|pid| *pid > 0)
            else {
                continue;
            };
            let dir = entry.path();
            let comm = match read_bounded(&dir.join("comm")) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).trim_end().to_string(),
                // Gone in the meantime, or not ours to read.
                Err(_) => continue,
            };
            let argv0 = read_bounded(&dir.join("cmdline")).ok().and_then(|bytes| {
                let first = bytes.split(|b| *b == 0).next()?;
                if first.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(first).into_owned())
                }
            });
            entries.push(ProcEntry {
                pid: Pid::from_raw(pid),
                comm,
                argv0,
            });
        }
        entries.sort_by_key(|e| e.pid.as_raw());
        Ok(entries)
    }

    /// Processes running the program `name`, excluding ourselves.
    pub fn find_named(&self, name: &str) -> Result<Vec<ProcEntry>, ProcTableError> {
        let own_pid = getpid();
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.pid != own_pid && e.is_named(name))
            .collect())
    }
}
