//! Network namespace handles and scoped namespace switching.
//!
//! A network namespace is a per-thread property on Linux. Code that enters a
//! container namespace must therefore run on an OS thread that is not shared
//! with unrelated work, and must restore the origin namespace before the
//! thread ends. [`NetnsExecutor::run`] spawns a fresh thread per section,
//! hands the closure a [`NetnsScope`] and awaits the result through a
//! oneshot channel. The scope restores the origin namespace when dropped, on
//! every exit path including a panic.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{FwdError, FwdResult};

/// An open network namespace.
///
/// `id` is the namespace inode number rendered as a decimal string, which is
/// the identifier carried in cross-connect requests. `path` and `fd` are set
/// by the kernel-backed implementation and are absent for in-memory doubles.
pub struct Netns {
    id: String,
    path: Option<PathBuf>,
    fd: Option<OwnedFd>,
}

impl Netns {
    /// Creates a handle that carries only an identifier.
    pub fn detached(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
            fd: None,
        }
    }

    /// Creates a handle backed by an open namespace file.
    pub fn from_file(id: impl Into<String>, path: PathBuf, fd: OwnedFd) -> Self {
        Self {
            id: id.into(),
            path: Some(path),
            fd: Some(fd),
        }
    }

    /// Returns the namespace identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the namespace file path, if any.
    ///
    /// The path names the namespace independently of the caller's own
    /// namespace, so it can be handed to a child process.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the open namespace descriptor, if any.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }
}

impl fmt::Debug for Netns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Netns")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

/// Namespace primitives.
///
/// All methods act on the calling OS thread.
pub trait NetnsOps: Send + Sync {
    /// Returns a handle to the namespace the calling thread is in.
    fn current(&self) -> FwdResult<Netns>;

    /// Opens a namespace by identifier (inode number or namespace file path).
    fn open(&self, id: &str) -> FwdResult<Netns>;

    /// Moves the calling thread into `ns`.
    fn enter(&self, ns: &Netns) -> FwdResult<()>;
}

/// A namespace section in progress.
///
/// Remembers the namespace the worker thread started in and moves the thread
/// back there on drop.
pub struct NetnsScope<'a> {
    ops: &'a dyn NetnsOps,
    origin: Netns,
}

impl<'a> NetnsScope<'a> {
    /// Captures the current namespace as the origin.
    pub fn new(ops: &'a dyn NetnsOps) -> FwdResult<Self> {
        let origin = ops.current()?;
        Ok(Self { ops, origin })
    }

    /// The namespace the section started in (the host namespace).
    pub fn origin(&self) -> &Netns {
        &self.origin
    }

    /// Opens a namespace by identifier.
    ///
    /// Failures are reported as [`FwdError::NamespaceUnavailable`].
    pub fn open(&self, id: &str) -> FwdResult<Netns> {
        self.ops.open(id).map_err(|e| match e {
            FwdError::NamespaceUnavailable { .. } => e,
            other => FwdError::namespace_unavailable(id, other.to_string()),
        })
    }

    /// Moves the worker thread into `ns`.
    pub fn enter(&self, ns: &Netns) -> FwdResult<()> {
        self.ops.enter(ns)
    }

    /// Moves the worker thread back to the origin namespace.
    pub fn enter_origin(&self) -> FwdResult<()> {
        self.ops.enter(&self.origin)
    }
}

impl Drop for NetnsScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ops.enter(&self.origin) {
            error!(netns = %self.origin.id(), error = %e, "Failed to restore origin namespace");
        }
    }
}

/// Runs namespace-switching closures on dedicated OS threads.
#[derive(Clone)]
pub struct NetnsExecutor {
    ops: Arc<dyn NetnsOps>,
}

impl NetnsExecutor {
    /// Creates an executor over the given primitives.
    pub fn new(ops: Arc<dyn NetnsOps>) -> Self {
        Self { ops }
    }

    /// Runs `f` on a freshly spawned thread and awaits its result.
    ///
    /// The thread is never reused, so a failed restore cannot leak a foreign
    /// namespace into other work.
    pub async fn run<F, R>(&self, label: &str, f: F) -> FwdResult<R>
    where
        F: FnOnce(&NetnsScope<'_>) -> FwdResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let ops = Arc::clone(&self.ops);
        let (tx, rx) = oneshot::channel();

        debug!(section = %label, "Spawning namespace worker");
        std::thread::Builder::new()
            .name(format!("netns-{}", label))
            .spawn(move || {
                let result = NetnsScope::new(ops.as_ref()).and_then(|scope| f(&scope));
                // Receiver gone means the caller was dropped; nothing to report to.
                let _ = tx.send(result);
            })
            .map_err(|e| FwdError::internal(format!("failed to spawn namespace worker: {}", e)))?;

        rx.await.map_err(|_| {
            FwdError::internal(format!("namespace worker '{}' exited without a result", label))
        })?
    }
}

impl fmt::Debug for NetnsExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetnsExecutor").finish_non_exhaustive()
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxNetns;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{self, File};
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};

    use nix::sched::{setns, CloneFlags};

    use super::{Netns, NetnsOps};
    use crate::error::{FwdError, FwdResult};

    /// Kernel-backed namespace primitives using `setns(2)` and procfs.
    #[derive(Debug, Clone)]
    pub struct LinuxNetns {
        proc_root: PathBuf,
    }

    impl LinuxNetns {
        /// Creates primitives reading from `/proc`.
        pub fn new() -> Self {
            Self {
                proc_root: PathBuf::from("/proc"),
            }
        }

        /// Opens a namespace file and names it by our own descriptor.
        ///
        /// `/proc/<pid>/fd/<n>` keeps pointing at the opened namespace even
        /// after the opening thread switches elsewhere, so it is safe to pass
        /// to `ip link set netns`.
        fn open_path(&self, path: &Path) -> FwdResult<Netns> {
            let file = File::open(path).map_err(|e| {
                FwdError::namespace_unavailable(path.display().to_string(), e.to_string())
            })?;
            let inode = file.metadata()?.ino();
            let fd = OwnedFd::from(file);
            let fd_path = self
                .proc_root
                .join(std::process::id().to_string())
                .join("fd")
                .join(fd.as_raw_fd().to_string());
            Ok(Netns::from_file(inode.to_string(), fd_path, fd))
        }

        /// Finds a process whose network namespace has the given inode.
        fn find_by_inode(&self, inode: u64) -> FwdResult<Netns> {
            for entry in fs::read_dir(&self.proc_root)? {
                let Ok(entry) = entry else { continue };
                let name = entry.file_name();
                let Some(pid) = name.to_str() else { continue };
                if !pid.bytes().all(|b| b.is_ascii_digit()) {
                    continue;
                }
                let candidate = self.proc_root.join(pid).join("ns").join("net");
                // Processes come and go while scanning.
                match fs::metadata(&candidate) {
                    Ok(meta) if meta.ino() == inode => return self.open_path(&candidate),
                    _ => continue,
                }
            }
            Err(FwdError::namespace_unavailable(
                inode.to_string(),
                "no process holds this namespace",
            ))
        }
    }

    impl Default for LinuxNetns {
        fn default() -> Self {
            Self::new()
        }
    }

    impl NetnsOps for LinuxNetns {
        fn current(&self) -> FwdResult<Netns> {
            self.open_path(&self.proc_root.join("thread-self").join("ns").join("net"))
        }

        fn open(&self, id: &str) -> FwdResult<Netns> {
            if id.contains('/') {
                return self.open_path(Path::new(id));
            }
            let inode: u64 = id.parse().map_err(|_| {
                FwdError::namespace_unavailable(id, "identifier is neither an inode nor a path")
            })?;
            self.find_by_inode(inode)
        }

        fn enter(&self, ns: &Netns) -> FwdResult<()> {
            let fd = ns.fd().ok_or_else(|| {
                FwdError::namespace_unavailable(ns.id(), "handle has no open descriptor")
            })?;
            setns(fd, CloneFlags::CLONE_NEWNET)
                .map_err(|e| FwdError::namespace_unavailable(ns.id(), format!("setns: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records enter calls; "current" is always the host.
    #[derive(Default)]
    struct CountingOps {
        enters: AtomicUsize,
    }

    impl NetnsOps for CountingOps {
        fn current(&self) -> FwdResult<Netns> {
            Ok(Netns::detached("host"))
        }

        fn open(&self, id: &str) -> FwdResult<Netns> {
            if id == "missing" {
                return Err(FwdError::internal("gone"));
            }
            Ok(Netns::detached(id))
        }

        fn enter(&self, _ns: &Netns) -> FwdResult<()> {
            self.enters.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_restores_on_success() {
        let ops = Arc::new(CountingOps::default());
        let exec = NetnsExecutor::new(ops.clone());

        let id = exec
            .run("ok", |scope| {
                let ns = scope.open("4026532000")?;
                scope.enter(&ns)?;
                Ok(ns.id().to_string())
            })
            .await
            .unwrap();

        assert_eq!(id, "4026532000");
        // One explicit enter, one restore from the guard.
        assert_eq!(ops.enters.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_restores_on_error() {
        let ops = Arc::new(CountingOps::default());
        let exec = NetnsExecutor::new(ops.clone());

        let result: FwdResult<()> = exec
            .run("err", |scope| {
                let ns = scope.open("4026532000")?;
                scope.enter(&ns)?;
                Err(FwdError::link("eth0", "set-up", "boom"))
            })
            .await;

        assert!(matches!(result, Err(FwdError::Link { .. })));
        assert_eq!(ops.enters.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_section_is_internal_error() {
        let ops = Arc::new(CountingOps::default());
        let exec = NetnsExecutor::new(ops.clone());

        let result: FwdResult<()> = exec.run("panic", |_scope| panic!("section blew up")).await;

        assert!(matches!(result, Err(FwdError::Internal { .. })));
        // The guard still ran during unwinding.
        assert_eq!(ops.enters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_namespace_unavailable() {
        let exec = NetnsExecutor::new(Arc::new(CountingOps::default()));
        let result = exec.run("open", |scope| scope.open("missing").map(|_| ())).await;
        assert!(matches!(result, Err(FwdError::NamespaceUnavailable { .. })));
    }
}
