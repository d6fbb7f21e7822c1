// ABOUTME: Per-database lock file so only one process changes a database at a time
// ABOUTME: Holds the owner's PID; a file left by a process that is gone is taken over

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Check if a process with the given PID is running.
#[cfg(unix)]
fn is_process_running(pid: i32) -> bool {
    // Signal 0 only checks that the process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: i32) -> bool {
    true
}

fn read_pid(path: &Path) -> Result<Option<i32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read lock file {:?}", path)),
    };
    Ok(content.trim().parse().ok())
}

/// Exclusive ownership of one database's state directory entry.
///
/// Released when dropped.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Lock file path for `database` inside `state_dir`.
    pub fn path_for(state_dir: &Path, database: &str) -> PathBuf {
        state_dir.join(format!("{}.lock", database))
    }

    /// Take the lock or fail if a live process holds it.
    pub fn acquire(state_dir: &Path, database: &str) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {:?}", state_dir))?;
        let path = Self::path_for(state_dir, database);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .with_context(|| format!("Failed to write lock file {:?}", path))?;
                    tracing::debug!("Acquired lock {:?}", path);
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match read_pid(&path)? {
                        Some(pid) if is_process_running(pid) => bail!(
                            "Database {} is in use by process {} (lock file {:?})",
                            database,
                            pid,
                            path
                        ),
                        _ => {
                            tracing::warn!("Removing stale lock file {:?}", path);
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => {
                                    return Err(e).with_context(|| {
                                        format!("Failed to remove stale lock file {:?}", path)
                                    })
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create lock file {:?}", path))
                }
            }
        }
        bail!("Database {} is being locked by another process", database)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file {:?}: {}", self.path, e);
        }
    }
}
