use anyhow::{Context, Result};
use std::path::Path;

use super::tree::copy_tree;
use crate::host::Host;

/// Unpack an xz tarball straight into `dest`, keeping xattrs and ownership.
pub fn extract_tar_xz(host: &dyn Host, archive: &Path, dest: &Path) -> Result<()> {
    info!("extracting {} to {}", archive.display(), dest.display());
    let archive = archive.to_string_lossy();
    let dest = dest.to_string_lossy();
    host.run("tar", &["--xattrs", "-xJvpf", &archive, "-C", &dest])
}

/// For filesystems that cannot hold ownership (vfat): unpack into a scratch
/// directory first, then copy the tree over.
pub fn extract_tar_xz_via_scratch(host: &dyn Host, archive: &Path, dest: &Path) -> Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix("recovery-extract-")
        .tempdir()
        .context("Failed to create scratch directory")?;
    info!("extracting {} to {}", archive.display(), dest.display());
    let archive = archive.to_string_lossy();
    let dir = scratch.path().to_string_lossy();
    host.run("tar", &["-xpJvf", &archive, "-C", &dir])?;
    copy_tree(scratch.path(), dest)
}

pub fn unsquash(host: &dyn Host, image: &Path, dest: &Path) -> Result<()> {
    info!("unpacking {} to {}", image.display(), dest.display());
    let image = image.to_string_lossy();
    let dest = dest.to_string_lossy();
    host.run("unsquashfs", &["-f", "-d", &dest, &image])
}
