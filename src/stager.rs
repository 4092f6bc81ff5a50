//! File Stager (C7): places the files a job step declares onto disk inside the sandbox's
//! box directory before the sandbox runs.
//!
//! Grounded on the same host-side filesystem setup pattern as `rootfs.rs`: create parent
//! directories, then either copy an existing file byte-for-byte or write inline content,
//! failing fast on the first entry that cannot be staged.

use crate::sandbox::config::{FileEntry, FileSource};
use anyhow::{Context, Result};
use std::{fs, os::unix::fs::PermissionsExt, path::Path};

/// Permission bits applied to a file staged from inline content: owner read/write/execute
/// only, matching the box directory's single-UID ownership.
const STAGED_CONTENT_MODE: u32 = 0o744;

/// Stage every entry in `files` under `box_dir`, in order. Stops at the first failure.
pub fn stage(box_dir: &Path, files: &[FileEntry]) -> Result<()> {
    for entry in files {
        stage_one(box_dir, entry)?;
    }
    Ok(())
}

fn stage_one(box_dir: &Path, entry: &FileEntry) -> Result<()> {
    let dst = box_dir.join(&entry.dst);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent dir for {}", dst.display()))?;
    }

    match &entry.src {
        FileSource::Path(src) => {
            fs::copy(src, &dst)
                .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
        }
        FileSource::Content(content) => {
            fs::write(&dst, content)
                .with_context(|| format!("write staged content to {}", dst.display()))?;
            fs::set_permissions(&dst, fs::Permissions::from_mode(STAGED_CONTENT_MODE))
                .with_context(|| format!("chmod staged file {}", dst.display()))?;
        }
    }

    Ok(())
}
