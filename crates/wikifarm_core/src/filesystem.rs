use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Removes everything inside `dir` but keeps `dir` itself, so bind mounts and
/// open handles on the directory stay valid.
pub fn clear_dir_contents(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to inspect {}", path.display()))?;
        if file_type.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        } else {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

/// Recursively copies the contents of `source` into `target`, creating
/// directories as needed. Existing files are overwritten. Returns the number
/// of files copied.
pub fn copy_dir_contents(source: &Path, target: &Path) -> Result<usize> {
    fs::create_dir_all(target).with_context(|| format!("failed to create {}", target.display()))?;
    let mut copied = 0usize;
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("{} escapes {}", entry.path().display(), source.display()))?;
        let destination = target.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&destination)
                .with_context(|| format!("failed to create {}", destination.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("failed to read link {}", entry.path().display()))?;
            if destination.symlink_metadata().is_ok() {
                fs::remove_file(&destination)
                    .with_context(|| format!("failed to replace {}", destination.display()))?;
            }
            create_symlink(&link, &destination)?;
            copied += 1;
        } else {
            copy_file(entry.path(), &destination)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Makes `target` hold exactly what `source` holds, keeping the `target`
/// directory inode.
pub fn replace_dir_contents(source: &Path, target: &Path) -> Result<usize> {
    clear_dir_contents(target)?;
    copy_dir_contents(source, target)
}

pub fn copy_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(source, target).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &Path, destination: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, destination)
        .with_context(|| format!("failed to create symlink {}", destination.display()))
}

#[cfg(not(unix))]
fn create_symlink(link: &Path, destination: &Path) -> Result<()> {
    let resolved = destination
        .parent()
        .map(|parent| parent.join(link))
        .unwrap_or_else(|| link.to_path_buf());
    copy_file(&resolved, destination)
}
