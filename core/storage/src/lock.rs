//! Advisory lock file guarding a backup root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use snapsync_common::{Error, Result};

/// Lock file name inside the backup root.
pub const LOCK_FILE_NAME: &str = ".snapsync.lock";

/// Attempts before giving up on a lock that keeps reappearing.
const ACQUIRE_ATTEMPTS: usize = 3;

/// Held lock on a backup root; released on drop.
///
/// The lock file holds the owner's pid. A lock whose owner is no longer
/// running is treated as stale and reclaimed.
#[derive(Debug)]
pub struct BackupLock {
    path: PathBuf,
}

impl BackupLock {
    /// Acquire the lock for `root`.
    ///
    /// # Errors
    /// - `Locked` if a live process holds the lock
    /// - `Io` if the lock file cannot be created or inspected
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE_NAME);

        for _ in 0..ACQUIRE_ATTEMPTS {
            // Linking a finished side file creates the lock with its content in one step.
            let claim = write_claim(&path)?;
            let linked = fs::hard_link(&claim, &path);
            let _ = fs::remove_file(&claim);

            match linked {
                Ok(()) => {
                    debug!("Acquired lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let stale = match fs::read_to_string(&path) {
                        Ok(text) => text,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };

                    match parse_pid(&stale) {
                        Some(pid) if process_alive(pid) => return Err(Error::Locked { path }),
                        Some(pid) => warn!("Taking over stale lock held by pid {}", pid),
                        None => warn!("Taking over unreadable lock {}", path.display()),
                    }

                    if take_over(&path, &stale)? {
                        debug!("Acquired lock {}", path.display());
                        return Ok(Self { path });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Locked { path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| parse_pid(&text))
            == Some(std::process::id());

        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to release lock {}: {}", self.path.display(), e);
            }
        }
    }
}

fn parse_pid(text: &str) -> Option<u32> {
    text.trim().parse().ok()
}

/// Write this process's pid to a uniquely named file next to the lock.
fn write_claim(path: &Path) -> io::Result<PathBuf> {
    let claim = path.with_file_name(format!("{}.{}", LOCK_FILE_NAME, Uuid::new_v4()));
    fs::write(&claim, format!("{}\n", std::process::id()))?;
    Ok(claim)
}

/// Replace a lock file that still reads `stale` with one naming this process.
///
/// The new content is written to a side file and renamed over the lock, so
/// the lock path never disappears. Returns whether the lock now names us.
fn take_over(path: &Path, stale: &str) -> io::Result<bool> {
    let claim = write_claim(path)?;

    let renamed = match fs::read_to_string(path) {
        Ok(current) if current == stale => fs::rename(&claim, path).map(|()| true),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    };
    if !matches!(renamed, Ok(true)) {
        let _ = fs::remove_file(&claim);
    }
    if !renamed? {
        return Ok(false);
    }

    // Another process may have renamed its own claim over ours.
    Ok(fs::read_to_string(path)
        .ok()
        .and_then(|text| parse_pid(&text))
        == Some(std::process::id()))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without a portable liveness probe every recorded owner counts as live.
    true
}
