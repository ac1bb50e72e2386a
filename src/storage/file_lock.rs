//! Advisory exclusive file locks.
//!
//! Used for two things: the durable key-value store holds one on its data
//! directory for as long as it is open, and merge passes hold one (in the
//! configured merge lock directory, or next to a SQLite database file) so
//! that only one pass runs at a time across processes.
//!
//! The lock is released when the [`FileLock`] is dropped. Acquisition never
//! blocks: a held lock fails immediately with `ErrorKind::WouldBlock`.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Exclusive lock on a named file inside a directory.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Attempts to lock `dir/name`, creating the file if needed.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another holder owns the lock
    /// - `ErrorKind::PermissionDenied` if the file cannot be opened for writing
    pub fn acquire(dir: &Path, name: &str) -> IoResult<Self> {
        Self::acquire_path(&dir.join(name))
    }

    /// Attempts to lock the file at `lock_path`, creating it if needed.
    ///
    /// # Errors
    /// Same as [`FileLock::acquire`].
    pub fn acquire_path(lock_path: &Path) -> IoResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        Self::try_lock(&file, lock_path)?;

        Ok(Self {
            _file: file,
            path: lock_path.to_path_buf(),
        })
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File, path: &Path) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        // SAFETY: `fd` is a valid open descriptor owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let errno = IoError::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(IoError::new(
                    ErrorKind::WouldBlock,
                    format!("{} is locked by another holder", path.display()),
                ));
            }
            return Err(errno);
        }

        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File, path: &Path) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` is valid for the lifetime of `file`; OVERLAPPED is plain data.
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };

        if result == 0 {
            let err = IoError::last_os_error();
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("{} is locked by another holder: {err}", path.display()),
            ));
        }

        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File, _path: &Path) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}
