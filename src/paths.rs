//! Keep peer-supplied paths inside the local shared folder

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Component, Path, PathBuf};

/// Resolve a path a peer asked for to an existing entry inside `root`.
///
/// Only plain names and `.` are accepted in `requested`. The result is
/// canonical, so a symlink inside the share that leads elsewhere is refused
/// too.
pub fn confine(root: &Path, requested: &Path) -> Result<PathBuf> {
    let relative = relative_to_share(requested)?;
    let share = root
        .canonicalize()
        .with_context(|| format!("shared folder {} is unavailable", root.display()))?;
    let target = share
        .join(relative)
        .canonicalize()
        .with_context(|| format!("{} does not exist in the shared folder", requested.display()))?;
    if !target.starts_with(&share) {
        bail!("{} points outside the shared folder", requested.display());
    }
    Ok(target)
}

fn relative_to_share(requested: &Path) -> Result<PathBuf> {
    if requested.to_string_lossy().contains('\0') {
        bail!("{:?} contains a NUL byte", requested);
    }
    requested
        .components()
        .filter(|c| *c != Component::CurDir)
        .map(|c| match c {
            // `name:stream` addresses an alternate data stream on NTFS
            Component::Normal(name) if cfg!(windows) && name.to_string_lossy().contains(':') => {
                Err(anyhow!("{:?} is not a plain file name", name))
            }
            Component::Normal(name) => Ok(name),
            other => Err(anyhow!("{:?} is not allowed in a shared path", other.as_os_str())),
        })
        .collect()
}

/// File or folder name usable inside a tag (no whitespace, no `|`).
pub fn wire_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    if name.chars().any(|c| c.is_whitespace() || c == crate::protocol::TAG_SEPARATOR) {
        bail!("names with spaces or '|' cannot be sent: {:?}", name);
    }
    Ok(name)
}
