use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::Duration,
};

use sha1::Digest;

use crate::support;

/// Derives the OS-level lock identifier for a resource path.
///
/// The digest is a pure function of the lowercased path, so unrelated
/// processes targeting the same installation contend on the same lock
/// regardless of path casing, and the identifier never runs into filesystem
/// name-length limits.
pub fn lock_name(resource: &Path) -> String {
    let normalized = resource.to_string_lossy().to_lowercase();
    let mut hasher = sha1::Sha1::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock busy after {timeout:?}: {resource}")]
    Busy {
        resource: PathBuf,
        timeout: Duration,
    },
    #[error("lock io error for {resource}: {source}")]
    Io {
        resource: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive ownership of one resource's mutation rights.
///
/// Held for the full duration of a lifecycle operation. Release is idempotent
/// and also runs on drop, so every exit path releases exactly once.
#[derive(Debug)]
pub struct LockHandle {
    file: Option<File>,
    path: PathBuf,
}

impl LockHandle {
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        drop(file);

        #[cfg(not(unix))]
        {
            let _ = std::fs::remove_file(&self.path);
        }

        tracing::debug!(path = %self.path.display(), "lock released");
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Serializes lifecycle operations against a resource path across threads and
/// processes via flock-backed lock files named by [`lock_name`].
#[derive(Debug, Clone)]
pub struct MutexGate {
    lock_dir: PathBuf,
}

impl MutexGate {
    pub fn new(data_root: &Path) -> Self {
        Self {
            lock_dir: data_root.join("locks"),
        }
    }

    /// Non-blocking attempt first; on contention, retries until `timeout`
    /// elapses. A timeout is reported as [`LockError::Busy`] — fatal to the
    /// requested operation, never to the host process.
    pub async fn acquire(
        &self,
        resource: &Path,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let io_err = |source| LockError::Io {
            resource: resource.to_path_buf(),
            source,
        };

        std::fs::create_dir_all(&self.lock_dir).map_err(io_err)?;
        let path = self.lock_dir.join(format!("{}.lock", lock_name(resource)));

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match try_lock_file(&path) {
                Ok(Some(file)) => {
                    tracing::debug!(
                        resource = %resource.display(),
                        path = %path.display(),
                        "lock acquired"
                    );
                    return Ok(LockHandle {
                        file: Some(file),
                        path,
                    });
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(LockError::Io {
                        resource: resource.to_path_buf(),
                        source,
                    });
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Busy {
                    resource: resource.to_path_buf(),
                    timeout,
                });
            }
            tokio::time::sleep(support::lock_poll_interval()).await;
        }
    }

    /// Acquire with the operator-tunable default timeout.
    pub async fn acquire_default(&self, resource: &Path) -> Result<LockHandle, LockError> {
        self.acquire(resource, support::lock_timeout()).await
    }
}

#[cfg(unix)]
fn try_lock_file(path: &Path) -> std::io::Result<Option<File>> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(Some(file));
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(None)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_file(path: &Path) -> std::io::Result<Option<File>> {
    // Exclusive-create semantics stand in for flock where it is unavailable.
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err),
    }
}
