//! Exclusive ownership of a history directory.
//!
//! Only one process may append to a directory's write-ahead log. Ownership is
//! an advisory OS lock on `<dir>/history.lock`; the owner writes its process
//! id into the file so a refused opener can say who holds it.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "history.lock";

/// Held exclusive lock on a history directory. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock without blocking and records the current process id.
    ///
    /// # Errors
    ///
    /// - `ErrorKind::WouldBlock` if another owner holds the lock
    /// - `ErrorKind::Unsupported` on platforms without file locking, unless
    ///   the `allow_no_lock` feature is enabled
    /// - any error from creating or writing the lock file
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !sys::try_lock_exclusive(&file)? {
            let owner = read_owner(&mut file);
            let message = match owner {
                Some(pid) => format!("history directory is locked by process {pid}"),
                None => "history directory is locked by another process".to_string(),
            };
            return Err(IoError::new(ErrorKind::WouldBlock, message));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Self { _file: file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_owner(file: &mut File) -> Option<u32> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::unix::io::AsRawFd;

    /// Returns false when another descriptor already holds the lock.
    pub fn try_lock_exclusive(file: &File) -> IoResult<bool> {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    /// Returns false when another handle already holds the lock.
    pub fn try_lock_exclusive(file: &File) -> IoResult<bool> {
        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data and
        // may be zeroed.
        let ok = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;
    use std::io::Result as IoResult;

    #[cfg(feature = "allow_no_lock")]
    pub fn try_lock_exclusive(_file: &File) -> IoResult<bool> {
        tracing::warn!("file locking not supported on this platform; opening without a lock");
        Ok(true)
    }

    #[cfg(not(feature = "allow_no_lock"))]
    pub fn try_lock_exclusive(_file: &File) -> IoResult<bool> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}
