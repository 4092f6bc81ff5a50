//! Rootfs builder (C2): creates and tears down the per-sandbox overlayfs directories.
//!
//! Grounded on the original `sandbox/rootfs.go`: a shared, read-only lower layer (the
//! unpacked image) with a per-sandbox writable upper layer and scratch work directory.

use anyhow::{Context, Result};
use std::{
    fs,
    os::unix::fs::{chown, PermissionsExt},
    path::PathBuf,
};

/// Overlayfs directories backing one sandbox's rootfs.
pub struct Overlayfs {
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl Overlayfs {
    /// Compute the overlayfs paths for `sandbox_id` under `overlayfs_dir`, without
    /// touching the filesystem.
    pub fn new(overlayfs_dir: &std::path::Path, sandbox_id: &str, lower_dir: PathBuf) -> Self {
        let base = overlayfs_dir.join(format!("sandbox-{}", sandbox_id));
        Self {
            lower_dir,
            upper_dir: base.join("upper"),
            work_dir: base.join("work"),
        }
    }

    fn base_dir(&self) -> &std::path::Path {
        self.upper_dir
            .parent()
            .expect("upper_dir always has a sandbox-<id> parent")
    }

    /// Create the upper/work directories, chowned to the sandbox's host-side root UID/GID.
    pub fn prepare(&self, host_uid: u32, host_gid: u32) -> Result<()> {
        for dir in [&self.upper_dir, &self.work_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create overlayfs dir {}", dir.display()))?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("chmod overlayfs dir {}", dir.display()))?;
            chown(dir, Some(host_uid), Some(host_gid))
                .with_context(|| format!("chown overlayfs dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// The overlay mount options string: `rw,userxattr,xino=off,index=off,lowerdir=...`.
    pub fn mount_options(&self) -> String {
        format!(
            "rw,userxattr,xino=off,index=off,lowerdir={},upperdir={},workdir={}",
            self.lower_dir.display(),
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }

    /// Remove this sandbox's overlayfs subtree. Idempotent: a missing directory is not an
    /// error.
    pub fn destroy(&self) -> Result<()> {
        let base = self.base_dir();
        match fs::remove_dir_all(base) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("remove overlayfs subtree {}", base.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prepare_creates_directories() -> Result<()> {
        let dir = tempdir()?;
        let ov = Overlayfs::new(dir.path(), "abc", PathBuf::from("/images/cpp"));
        ov.prepare(nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())?;

        assert!(ov.upper_dir.is_dir());
        assert!(ov.work_dir.is_dir());
        Ok(())
    }

    #[test]
    fn destroy_removes_only_this_sandbox() -> Result<()> {
        let dir = tempdir()?;
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let ov1 = Overlayfs::new(dir.path(), "one", PathBuf::from("/images/cpp"));
        let ov2 = Overlayfs::new(dir.path(), "two", PathBuf::from("/images/cpp"));
        ov1.prepare(uid, gid)?;
        ov2.prepare(uid, gid)?;

        ov1.destroy()?;
        assert!(!ov1.base_dir().exists());
        assert!(ov2.base_dir().exists());
        Ok(())
    }

    #[test]
    fn destroy_missing_directory_is_ok() -> Result<()> {
        let dir = tempdir()?;
        let ov = Overlayfs::new(dir.path(), "never-created", PathBuf::from("/images/cpp"));
        ov.destroy()
    }

    #[test]
    fn mount_options_contains_all_layers() {
        let ov = Overlayfs::new(
            std::path::Path::new("/overlayfs"),
            "id",
            PathBuf::from("/images/cpp"),
        );
        let opts = ov.mount_options();
        assert!(opts.contains("lowerdir=/images/cpp"));
        assert!(opts.contains("upperdir=/overlayfs/sandbox-id/upper"));
        assert!(opts.contains("workdir=/overlayfs/sandbox-id/work"));
    }
}
