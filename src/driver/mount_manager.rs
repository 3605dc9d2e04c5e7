//! Node-side publish and unpublish of volumes onto target paths.
//!
//! Both operations are idempotent: publishing an already mounted target and
//! unpublishing a target that was never mounted succeed without touching the
//! mount table.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mounter::Mounter;

/// Filesystem type passed to every mount.
pub const NFS_FS_TYPE: &str = "nfs";
/// Maximum number of mount options to prevent argv overflow.
const MOUNT_OPTIONS_MAX: usize = 32;

/// Mount options for a publish call: the capability's flags, plus `ro` if
/// the volume is published read-only.
pub fn mount_options(mount_flags: &[String], readonly: bool) -> Vec<String> {
    let mut options = mount_flags.to_vec();
    if readonly {
        options.push("ro".to_string());
    }
    options
}

pub struct MountManager {
    mounter: Arc<dyn Mounter>,
}

impl MountManager {
    pub fn new(mounter: Arc<dyn Mounter>) -> Self {
        Self { mounter }
    }

    /// Mount `mount_url` on `target` unless something is mounted there already.
    pub async fn publish(&self, mount_url: &str, target: &Path, options: &[String]) -> Result<()> {
        if options.len() > MOUNT_OPTIONS_MAX {
            return Err(Error::TooManyMountOptions {
                count: options.len(),
                max: MOUNT_OPTIONS_MAX,
            });
        }

        let not_mounted = match self.mounter.is_likely_not_mount_point(target).await {
            Ok(not_mounted) => not_mounted,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(target = %target.display(), "creating target directory");
                create_target(target).await?;
                true
            }
            Err(source) => {
                return Err(Error::MountPointProbe {
                    target: target.display().to_string(),
                    source,
                });
            }
        };

        if !not_mounted {
            debug!(target = %target.display(), "mount already present at target path");
            return Ok(());
        }

        self.mounter
            .mount(mount_url, target, NFS_FS_TYPE, options)
            .await
            .map_err(|source| Error::Mount {
                mount_source: mount_url.to_string(),
                target: target.display().to_string(),
                source,
            })?;

        info!(mount_url, target = %target.display(), "volume mounted");
        Ok(())
    }

    /// Unmount and remove `target`. Missing or unmounted targets are fine.
    pub async fn unpublish(&self, target: &Path) -> Result<()> {
        self.mounter
            .cleanup_mount_point(target)
            .await
            .map_err(|source| Error::Unmount {
                target: target.display().to_string(),
                source,
            })?;

        info!(target = %target.display(), "volume unmounted");
        Ok(())
    }
}

async fn create_target(target: &Path) -> Result<()> {
    match tokio::fs::create_dir(target).await {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(Error::CreateTarget {
            target: target.display().to_string(),
            source: e,
        }),
        _ => Ok(()),
    }
}
