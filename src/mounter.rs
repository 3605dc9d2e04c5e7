//! Host mount operations used by the node service.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Command;

use async_trait::async_trait;
use tracing::{debug, warn};

const ESTALE: i32 = 116;
const ENOTCONN: i32 = 107;
const EIO: i32 = 5;

/// Whether `err` from probing a path means a mount whose backend is gone,
/// such as an NFS export after the server restarted.
pub fn is_corrupted_mount(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(ESTALE | ENOTCONN | EIO))
}

/// Mount-table access on the node.
///
/// Errors are plain [`io::Error`]s; callers attach the target path.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Cheap check whether `target` is *not* a mount point.
    ///
    /// Compares the device of `target` with the device of its parent, so bind
    /// mounts from the same filesystem are reported as not mounted. Returns an
    /// error of kind [`io::ErrorKind::NotFound`] if `target` does not exist.
    async fn is_likely_not_mount_point(&self, target: &Path) -> io::Result<bool>;

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> io::Result<()>;

    /// Unmount `target`. A `lazy` unmount detaches it even if it is busy or
    /// its server is unreachable.
    async fn unmount(&self, target: &Path, lazy: bool) -> io::Result<()>;

    /// Unmount `target` if it is mounted, then remove the directory.
    ///
    /// A target that does not exist is already clean. A corrupted mount is
    /// treated as mounted; if a normal unmount fails it is detached lazily.
    async fn cleanup_mount_point(&self, target: &Path) -> io::Result<()> {
        let (mounted, corrupted) = match self.is_likely_not_mount_point(target).await {
            Ok(not_mounted) => (!not_mounted, false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if is_corrupted_mount(&e) => {
                warn!(target = %target.display(), error = %e, "corrupted mount point");
                (true, true)
            }
            Err(e) => return Err(e),
        };

        if mounted {
            debug!(target = %target.display(), "unmounting");
            match self.unmount(target, false).await {
                Err(e) if corrupted => {
                    warn!(error = %e, "unmount failed, detaching lazily");
                    self.unmount(target, true).await?;
                }
                other => other?,
            }
        }

        match tokio::fs::remove_dir(target).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// [`Mounter`] backed by the host's `mount` and `umount` binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl SystemMounter {
    pub fn new() -> Self {
        Self
    }
}

/// Run a command, turning a non-zero exit into an error carrying stderr.
fn run(mut cmd: Command) -> io::Result<()> {
    let output = cmd.output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(io::Error::other(format!("{:?} failed: {stderr}", cmd.get_program())))
}

async fn blocking<F>(f: F) -> io::Result<()>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::other(format!("task join error: {e}")))?
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_likely_not_mount_point(&self, target: &Path) -> io::Result<bool> {
        let meta = tokio::fs::symlink_metadata(target).await?;
        let parent = target.parent().unwrap_or(Path::new("/"));
        let parent_meta = tokio::fs::symlink_metadata(parent).await?;
        Ok(meta.dev() == parent_meta.dev())
    }

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> io::Result<()> {
        debug_assert!(!source.is_empty(), "source must not be empty");

        let mut cmd = Command::new("mount");
        if !fs_type.is_empty() {
            cmd.args(["-t", fs_type]);
        }
        for opt in options {
            cmd.args(["-o", opt]);
        }
        cmd.arg(source).arg(target);
        debug!(source, target = %target.display(), fs_type, ?options, "mounting");

        // mount(8) can block on an unreachable NFS server.
        blocking(move || run(cmd)).await
    }

    async fn unmount(&self, target: &Path, lazy: bool) -> io::Result<()> {
        let mut cmd = Command::new("umount");
        if lazy {
            cmd.arg("-l");
        }
        cmd.arg(target);
        blocking(move || run(cmd)).await
    }
}
