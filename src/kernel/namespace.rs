//! Mount namespace isolation for the staging root.
//!
//! Gives an executor its own view of the staging directory so concurrent
//! jobs on one host never see each other's files.

use crate::config::types::{MountBacking, Result, Settings, XprocError};
use std::path::Path;

/// Something that can make the staging root private to this process.
pub trait IsolationProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Called after the staging root exists and before anything is written to it.
    fn isolate(&self, staging_root: &Path) -> Result<()>;
}

/// Shares the host staging directory as-is.
pub struct SharedRoot;

impl IsolationProvider for SharedRoot {
    fn name(&self) -> &'static str {
        "shared"
    }

    fn isolate(&self, staging_root: &Path) -> Result<()> {
        log::debug!("staging root {} is shared with the host", staging_root.display());
        Ok(())
    }
}

/// Private mount namespace with a fresh filesystem over the staging root.
pub struct PrivateMount {
    backing: MountBacking,
}

impl PrivateMount {
    pub fn new(backing: MountBacking) -> Self {
        Self { backing }
    }

    /// Check if mount namespaces can be inspected on this system
    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }
}

#[cfg(target_os = "linux")]
impl IsolationProvider for PrivateMount {
    fn name(&self) -> &'static str {
        "private-mount"
    }

    fn isolate(&self, staging_root: &Path) -> Result<()> {
        use nix::mount::{mount, umount2, MntFlags, MsFlags};
        use nix::sched::{unshare, CloneFlags};

        unshare(CloneFlags::CLONE_NEWNS).map_err(|e| {
            XprocError::Namespace(format!("Failed to unshare mount namespace: {}", e))
        })?;
        harden_mount_propagation()?;

        // A stale mount from an earlier job may sit on the root; drop it lazily.
        if let Err(e) = umount2(staging_root, MntFlags::MNT_DETACH) {
            log::trace!("no previous mount on {}: {}", staging_root.display(), e);
        }

        match self.backing {
            MountBacking::Tmpfs => mount(
                Some("xproc"),
                staging_root,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some("mode=0755"),
            ),
            MountBacking::Bind => mount(
                Some(staging_root),
                staging_root,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            ),
        }
        .map_err(|e| {
            XprocError::Namespace(format!(
                "Failed to mount {} over {}: {}",
                self.backing.as_str(),
                staging_root.display(),
                e
            ))
        })?;

        mount(
            None::<&str>,
            staging_root,
            None::<&str>,
            MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| {
            XprocError::Namespace(format!(
                "Failed to mark {} private: {}",
                staging_root.display(),
                e
            ))
        })?;

        log::info!(
            "staging root {} is private ({})",
            staging_root.display(),
            self.backing.as_str()
        );
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl IsolationProvider for PrivateMount {
    fn name(&self) -> &'static str {
        "private-mount"
    }

    fn isolate(&self, _staging_root: &Path) -> Result<()> {
        Err(XprocError::Namespace(
            "private mounts need Linux mount namespaces".to_string(),
        ))
    }
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
/// Keeps mounts made in this namespace from propagating back to the host.
#[cfg(target_os = "linux")]
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        XprocError::Namespace(format!(
            "Failed to make / private and recursive: {}. Refusing to stage into a shared mount tree.",
            e
        ))
    })?;

    log::debug!("mount propagation hardened: / set to MS_PRIVATE|MS_REC");
    Ok(())
}

/// Provider selected by the settings.
pub fn provider_for(settings: &Settings) -> Box<dyn IsolationProvider> {
    if settings.private_mount {
        if !PrivateMount::is_supported() {
            log::warn!("/proc/self/ns is unreadable; private staging will likely fail");
        }
        Box::new(PrivateMount::new(settings.mount_backing))
    } else {
        Box::new(SharedRoot)
    }
}
