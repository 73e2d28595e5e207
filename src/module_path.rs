use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::io::AsRawFd as _;
use std::os::unix::io::BorrowedFd;
use std::os::unix::io::FromRawFd as _;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::path::PathBuf;

use crate::proc::ProcessIdentity;
use crate::ErrorExt as _;
use crate::Result;


fn openat_read(dirfd: BorrowedFd<'_>, path: &Path) -> io::Result<OwnedFd> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    // SAFETY: The path is valid and we check the result.
    let fd = unsafe {
        libc::openat(
            dirfd.as_raw_fd(),
            path.as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error())
    }
    // SAFETY: We just opened the file descriptor and it is not owned by
    //         anything else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}


/// A module's backing file, pinned open.
///
/// The file is opened through the owning process' mount namespace root
/// and the descriptor is kept for the lifetime of the object. That way
/// the contents stay accessible even if the file is unlinked or the
/// process goes away.
#[derive(Debug)]
pub(crate) struct ModulePath {
    /// The path as seen by the process owning the module.
    path: PathBuf,
    /// A read-only descriptor for the module file.
    fd: OwnedFd,
}

impl ModulePath {
    pub fn open(identity: &ProcessIdentity, path: &Path) -> Result<Self> {
        // `/proc/` based paths (e.g., `map_files` entries for deleted
        // files) describe the host view and must not be resolved
        // through the namespace root.
        let fd = if path.starts_with("/proc") {
            File::open(path)
                .map(OwnedFd::from)
                .with_context(|| format!("failed to open `{}`", path.display()))?
        } else {
            match identity.root_fd() {
                Some(root) => {
                    let relative = path.strip_prefix("/").unwrap_or(path);
                    openat_read(root, relative).with_context(|| {
                        format!("failed to open `{}` via namespace root", path.display())
                    })?
                }
                None => {
                    let direct = identity.root_path().join(
                        path.strip_prefix("/").unwrap_or(path),
                    );
                    File::open(&direct)
                        .map(OwnedFd::from)
                        .with_context(|| format!("failed to open `{}`", direct.display()))?
                }
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            fd,
        })
    }

    /// The module path as the owning process sees it, i.e., relative to
    /// its mount namespace. Mostly useful for display purposes; actual
    /// file accesses go through [`fd_path`][Self::fd_path].
    pub fn ns_path(&self) -> &Path {
        &self.path
    }

    /// A path referencing the pinned-open file itself.
    ///
    /// This path works from the symbolizing process' perspective
    /// irrespective of mount namespaces and even after deletion of the
    /// original file.
    pub fn fd_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/self/fd/{}", self.fd.as_raw_fd()))
    }
}
