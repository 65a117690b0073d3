use anyhow::{Context as _, Result};
use nix::fcntl::{flock, FlockArg};
use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    path::Path,
};

const LOCK_FILE_NAME: &str = ".cldcapt.lock";

/// Advisory exclusive lock on a snapshot directory. The lock is released when
/// the value is dropped (the descriptor closes).
#[derive(Debug)]
pub struct DirLock {
    _file: File,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .context(format!("failed to open lock file {:?}", path))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).context(format!(
            "snapshot directory {:?} is locked by another process",
            dir
        ))?;
        Ok(Self { _file: file })
    }
}
