use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively copy `src` into `dst` keeping symlinks and permission bits.
/// Existing files in `dst` are overwritten.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(anyhow::anyhow!("Directory not found: {}", src.display()));
    }
    fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.context("Failed to walk directory")?;
        let path = entry.path();
        let rel = path
            .strip_prefix(src)
            .context("Failed to compute relative path")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(path)
                .with_context(|| format!("Failed to read link: {}", path.display()))?;
            if out.symlink_metadata().is_ok() {
                fs::remove_file(&out)
                    .with_context(|| format!("Failed to replace: {}", out.display()))?;
            }
            symlink(&link, &out)
                .with_context(|| format!("Failed to create link: {}", out.display()))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&out)
                .with_context(|| format!("Failed to create directory: {}", out.display()))?;
            let perms = entry.metadata().context("Failed to stat directory")?.permissions();
            fs::set_permissions(&out, perms).ok();
        } else {
            fs::copy(path, &out).with_context(|| {
                format!("Failed to copy {} to {}", path.display(), out.display())
            })?;
        }
    }
    Ok(())
}
