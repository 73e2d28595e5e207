use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::MetadataExt as _;
use std::os::unix::io::AsFd as _;
use std::os::unix::io::AsRawFd as _;
use std::os::unix::io::BorrowedFd;
use std::os::unix::io::FromRawFd as _;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::path::PathBuf;

use crate::log::debug;
use crate::log::warn;
use crate::Pid;


fn open_path_fd(path: &Path) -> io::Result<OwnedFd> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    // SAFETY: The path is valid and we check the result.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error())
    }
    // SAFETY: We just opened the file descriptor and it is not owned by
    //         anything else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn exe_inode(pid: Pid) -> Option<u64> {
    fs::metadata(format!("/proc/{pid}/exe"))
        .map(|metadata| metadata.ino())
        .ok()
}


/// The identity of a process being symbolized.
///
/// The object pins down the process' file system view by keeping an
/// `O_PATH` file descriptor to `/proc/<pid>/root` open. File look-ups
/// relative to that descriptor keep working inside the process' mount
/// namespace (and chroot), without a `setns` that would affect the
/// whole symbolizing process, and they even keep working for a while
/// after the process exited.
#[derive(Debug)]
pub(crate) struct ProcessIdentity {
    pid: Pid,
    /// An `O_PATH` file descriptor for `/proc/<pid>/root`.
    root_fd: Option<OwnedFd>,
    /// The inode of `/proc/<pid>/exe` at the time of the last refresh.
    exe_ino: Option<u64>,
}

impl ProcessIdentity {
    pub fn new(pid: Pid) -> Self {
        let mut slf = Self {
            pid,
            root_fd: None,
            exe_ino: None,
        };
        let _refreshed = slf.refresh_root();
        slf
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// (Re-)open the root file descriptor and capture the executable's
    /// inode. Returns whether the root could be opened.
    pub fn refresh_root(&mut self) -> bool {
        let path = PathBuf::from(format!("/proc/{}/root", self.pid));
        match open_path_fd(&path) {
            Ok(fd) => {
                self.root_fd = Some(fd);
                self.exe_ino = exe_inode(self.pid);
                true
            }
            Err(err) => {
                // Without privileges the root link is not accessible;
                // degrade to plain path based access in that case.
                warn!("failed to open `{}`: {err}", path.display());
                self.root_fd = None;
                self.exe_ino = exe_inode(self.pid);
                false
            }
        }
    }

    pub fn root_fd(&self) -> Option<BorrowedFd<'_>> {
        self.root_fd.as_ref().map(|fd| fd.as_fd())
    }

    /// A path under which the process' root directory can be accessed.
    ///
    /// If the root file descriptor is available the path goes through
    /// `/proc/self/fd/`, which stays valid even once the process is
    /// gone.
    pub fn root_path(&self) -> PathBuf {
        match &self.root_fd {
            Some(fd) => PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd())),
            None => PathBuf::from(format!("/proc/{}/root", self.pid)),
        }
    }

    /// Check whether the process underwent an exec (or got replaced by
    /// an entirely different process) since the last refresh.
    pub fn is_stale(&self) -> bool {
        let current = exe_inode(self.pid);
        if current != self.exe_ino {
            debug!(
                "process {} changed executable ({:?} -> {current:?})",
                self.pid, self.exe_ino
            );
            true
        } else {
            false
        }
    }

    /// Re-capture the executable's inode, marking the current state as
    /// up-to-date.
    pub fn reset(&mut self) {
        self.exe_ino = exe_inode(self.pid);
    }
}
