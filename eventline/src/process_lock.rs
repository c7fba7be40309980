//! Single-runner guard for the CLI.
//!
//! The pipeline library assumes one writer process per database and does no
//! cross-process coordination of its own. Separate CLI invocations are
//! separate processes, so `eventline run` and `eventline sync` take an
//! advisory `flock` on `<database>.runner.lock` before recovering in-flight
//! batches or delivering. The kernel drops the lock if the process dies.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Held while this process drives delivery for one database
#[derive(Debug)]
pub struct RunnerLock {
    file: File,
    path: PathBuf,
}

impl RunnerLock {
    /// Take the runner lock for `db_path`, failing if another process has it
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = lock_path_for(db_path);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file: {}", path.display()))?;

        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::WouldBlock {
                bail!("another eventline process is running against {}", db_path.display());
            }
            return Err(error).with_context(|| format!("failed to lock {}", path.display()));
        }

        file.set_len(0)?;
        writeln!(file, "pid={}", std::process::id())?;

        tracing::debug!(lock = %path.display(), "Runner lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for RunnerLock {
    fn drop(&mut self) {
        // SAFETY: as in `acquire`.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        tracing::debug!(lock = %self.path.display(), "Runner lock released");
    }
}

fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".runner.lock");
    PathBuf::from(name)
}
