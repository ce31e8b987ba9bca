//! Named exclusive locks scoped to a table directory
//!
//! A lock is a file holding the owner's pid. Grabbing writes the pid to
//! a temp file and renames it into place; a stale lock left by a dead
//! process is recovered by renaming it into the table's stomache
//! directory. A lock whose pid cannot be probed (pid <= 0) is never
//! recovered automatically; `recover` must be called explicitly.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use crate::{Result, LOCK_SLEEP, LOCK_TRIES};

/// Directory used for recovery staging inside a table.
pub const STOMACHE_DIR: &str = "stomache";

#[derive(Debug, Clone)]
pub struct Lock {
    table_dir: PathBuf,
    name: String,
}

enum GrabOutcome {
    Grabbed,
    HeldAlive,
    NeedsRecovery,
}

fn pid_alive(pid: i64) -> bool {
    if pid <= 0 || pid > i32::MAX as i64 {
        // Can't probe; treat the lock as held until someone recovers it.
        return true;
    }
    let ret = unsafe { libc::kill(pid as i32, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl Lock {
    pub fn new(table_dir: &Path, name: &str) -> Self {
        Self {
            table_dir: table_dir.to_path_buf(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_path(&self) -> PathBuf {
        self.table_dir.join(format!("{}.lock", self.name))
    }

    fn tmp_path(&self) -> PathBuf {
        self.table_dir
            .join(format!("{}.lock.{}.tmp", self.name, std::process::id()))
    }

    fn stomache_path(&self) -> PathBuf {
        self.table_dir
            .join(STOMACHE_DIR)
            .join(format!("{}.lock.stale", self.name.replace('/', "_")))
    }

    /// Plant a lock file owned by an arbitrary pid. Used to simulate
    /// crashed owners.
    pub fn force_make_file(&self, pid: i64) -> Result<()> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, pid.to_string())?;
        Ok(())
    }

    fn read_owner(&self) -> Option<i64> {
        let contents = fs::read_to_string(self.lock_path()).ok()?;
        contents.trim().parse::<i64>().ok()
    }

    fn grab_once(&self) -> GrabOutcome {
        let path = self.lock_path();

        if path.exists() {
            return match self.read_owner() {
                Some(pid) if pid_alive(pid) => {
                    if pid <= 0 {
                        GrabOutcome::NeedsRecovery
                    } else {
                        GrabOutcome::HeldAlive
                    }
                }
                // Dead owner, or an unreadable lock file: recoverable.
                _ => {
                    log::warn!("recovering stale lock {:?}", path);
                    if self.recover().is_err() {
                        return GrabOutcome::HeldAlive;
                    }
                    GrabOutcome::NeedsRecovery
                }
            };
        }

        let tmp = self.tmp_path();
        if let Some(parent) = tmp.parent() {
            if fs::create_dir_all(parent).is_err() {
                return GrabOutcome::HeldAlive;
            }
        }
        let created = OpenOptions::new().write(true).create_new(true).open(&tmp);
        let mut file = match created {
            Ok(f) => f,
            Err(_) => return GrabOutcome::HeldAlive,
        };
        if write!(file, "{}", std::process::id()).is_err() {
            let _ = fs::remove_file(&tmp);
            return GrabOutcome::HeldAlive;
        }
        drop(file);

        if path.exists() {
            let _ = fs::remove_file(&tmp);
            return GrabOutcome::HeldAlive;
        }
        match fs::rename(&tmp, &path) {
            Ok(()) => GrabOutcome::Grabbed,
            Err(_) => {
                let _ = fs::remove_file(&tmp);
                GrabOutcome::HeldAlive
            }
        }
    }

    /// Try to take the lock, retrying on contention. Returns false when
    /// the lock stays held, or when it is owned by a pid that cannot be
    /// probed (explicit recovery required).
    pub fn grab(&self) -> bool {
        for attempt in 0..LOCK_TRIES {
            match self.grab_once() {
                GrabOutcome::Grabbed => return true,
                GrabOutcome::NeedsRecovery => {
                    if self.read_owner().map_or(false, |pid| pid <= 0) {
                        return false;
                    }
                    // Stale lock was moved aside; take it on the next spin.
                }
                GrabOutcome::HeldAlive => {
                    if attempt + 1 < LOCK_TRIES {
                        thread::sleep(LOCK_SLEEP);
                    }
                }
            }
        }
        matches!(self.grab_once(), GrabOutcome::Grabbed)
    }

    /// Rename the lock file away and delete it.
    pub fn release(&self) -> Result<()> {
        let path = self.lock_path();
        if !path.exists() {
            return Ok(());
        }
        let released = self
            .table_dir
            .join(format!("{}.lock.released", self.name.replace('/', "_")));
        fs::rename(&path, &released)?;
        fs::remove_file(&released)?;
        Ok(())
    }

    /// Move a stale lock into the stomache so the next grab succeeds.
    pub fn recover(&self) -> Result<()> {
        let path = self.lock_path();
        if !path.exists() {
            return Ok(());
        }
        let stomache = self.stomache_path();
        if let Some(parent) = stomache.parent() {
            fs::create_dir_all(parent)?;
        }
        let _ = fs::remove_file(&stomache);
        fs::rename(&path, &stomache)?;
        log::debug!("stomached stale lock {} at {:?}", self.name, stomache);
        Ok(())
    }
}
