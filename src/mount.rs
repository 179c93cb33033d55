//! Container mount table: bind mounts, tmpfs and proc.
//!
//! The table is loaded once from a JSON config file (or the built-in
//! default) and applied inside each child's fresh mount namespace before
//! pivoting into the rootfs.

use crate::error::{Error, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, pivot_root};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mount {
    Bind {
        source: PathBuf,
        /// Target path relative to the sandbox root.
        target: PathBuf,
        #[serde(default)]
        readonly: bool,
    },
    Tmpfs {
        target: PathBuf,
        #[serde(default)]
        data: String,
    },
    Proc,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MountTable {
    pub mounts: Vec<Mount>,
}

impl Default for MountTable {
    fn default() -> Self {
        let ro_binds = ["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc/alternatives"];
        let mut mounts: Vec<Mount> = ro_binds
            .iter()
            .map(|p| Mount::Bind {
                source: PathBuf::from(p),
                target: PathBuf::from(&p[1..]),
                readonly: true,
            })
            .collect();
        mounts.push(Mount::Tmpfs {
            target: PathBuf::from("tmp"),
            data: "size=128m,nr_inodes=4k".to_string(),
        });
        mounts.push(Mount::Proc);
        Self { mounts }
    }
}

impl MountTable {
    /// Load the table from `path`, or fall back to the default table when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Mount(format!("parse {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("mount config {} not found, using built-in table", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Mount(format!("read {}: {}", path.display(), e))),
        }
    }

    /// Directories inside `root` that must exist before the child can mount
    /// over them. Called once at environment build time.
    pub fn prepare_targets(&self, root: &Path) -> Result<()> {
        for m in &self.mounts {
            let target = match m {
                Mount::Bind { target, .. } | Mount::Tmpfs { target, .. } => target.clone(),
                Mount::Proc => PathBuf::from("proc"),
            };
            let dir = root.join(target);
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::Mount(format!("create mount point {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }

    /// Apply the table inside the child's mount namespace and pivot into
    /// `root`. Only safe to call after `clone(CLONE_NEWNS)`.
    pub fn apply_and_pivot(&self, root: &Path) -> Result<()> {
        // Keep every mount below private so nothing leaks back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| Error::Mount(format!("make / private: {e}")))?;

        // pivot_root requires the new root to be a mount point.
        mount(
            Some(root),
            root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| Error::Mount(format!("bind root {}: {}", root.display(), e)))?;

        for m in &self.mounts {
            self.apply_one(root, m)?;
        }

        chdir(root).map_err(|e| Error::Mount(format!("chdir new root: {e}")))?;
        pivot_root(".", ".").map_err(|e| Error::Mount(format!("pivot_root: {e}")))?;
        umount2(".", MntFlags::MNT_DETACH)
            .map_err(|e| Error::Mount(format!("detach old root: {e}")))?;
        chdir("/").map_err(|e| Error::Mount(format!("chdir /: {e}")))?;
        Ok(())
    }

    fn apply_one(&self, root: &Path, m: &Mount) -> Result<()> {
        match m {
            Mount::Bind {
                source,
                target,
                readonly,
            } => {
                if !source.exists() {
                    log::warn!("bind source {} missing, skipped", source.display());
                    return Ok(());
                }
                let target = root.join(target);
                mount(
                    Some(source),
                    &target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None::<&str>,
                )
                .map_err(|e| {
                    Error::Mount(format!("bind {} -> {}: {}", source.display(), target.display(), e))
                })?;
                if *readonly {
                    mount(
                        None::<&str>,
                        &target,
                        None::<&str>,
                        MsFlags::MS_BIND
                            | MsFlags::MS_REMOUNT
                            | MsFlags::MS_RDONLY
                            | MsFlags::MS_NOSUID,
                        None::<&str>,
                    )
                    .map_err(|e| {
                        Error::Mount(format!("remount ro {}: {}", target.display(), e))
                    })?;
                }
                Ok(())
            }
            Mount::Tmpfs { target, data } => {
                let target = root.join(target);
                let data = if data.is_empty() { None } else { Some(data.as_str()) };
                mount(
                    Some("tmpfs"),
                    &target,
                    Some("tmpfs"),
                    MsFlags::MS_NOSUID,
                    data,
                )
                .map_err(|e| Error::Mount(format!("tmpfs {}: {}", target.display(), e)))
            }
            Mount::Proc => mount(
                Some("proc"),
                &root.join("proc"),
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                None::<&str>,
            )
            .map_err(|e| Error::Mount(format!("mount proc: {e}"))),
        }
    }
}
