//! Exclusive locking of the shared build-output directory.
//!
//! The Xcode build cache is unsafe under concurrent writers, so an entire
//! directory build holds one coarse advisory lock for its full duration.
//! The lock is a `flock`ed file inside the output directory; it is released
//! when the [`DirectoryLock`] is dropped, on every exit path including
//! cancellation. Contention is logged after a short grace period.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock acquisition
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for build directory lock")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Scoped exclusive ownership of a build-output directory.
///
/// Dropping the handle releases the lock exactly once.
pub struct DirectoryLock {
    lock_path: PathBuf,
    #[allow(dead_code)]
    lock_file: File,
}

impl DirectoryLock {
    const LOCK_FILENAME: &'static str = ".xcforge.lock";
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    const CONTENTION_WARNING_AFTER: Duration = Duration::from_millis(500);

    /// Acquire the lock for `directory`, creating the directory and lock
    /// file as needed, waiting up to `timeout` for a competing holder.
    pub fn acquire(directory: &Path, timeout: Duration) -> LockResult<Self> {
        fs::create_dir_all(directory)?;
        let lock_path = directory.join(Self::LOCK_FILENAME);

        let started = Instant::now();
        let mut warned = false;
        loop {
            match Self::try_exclusive(&lock_path) {
                Ok(file) => {
                    if warned {
                        eprintln!(
                            "[lock] acquired after {:.1}s contention: {}",
                            started.elapsed().as_secs_f64(),
                            lock_path.display()
                        );
                    }
                    return Ok(Self {
                        lock_path,
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && started.elapsed() > Self::CONTENTION_WARNING_AFTER {
                        eprintln!(
                            "[lock] waiting for competing build on {}",
                            lock_path.display()
                        );
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if started.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }
            std::thread::sleep(Self::POLL_INTERVAL);
        }
    }

    #[cfg(unix)]
    fn try_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    #[cfg(not(unix))]
    fn try_exclusive(lock_path: &Path) -> io::Result<File> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
