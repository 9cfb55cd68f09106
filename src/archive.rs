//! Folder packing for folder transfers
//!
//! A folder travels as a single tar archive. The sender packs into a
//! temporary file (deleted when dropped), the receiver unpacks next to
//! where it stored the archive and deletes it afterwards.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tar::{Archive, Builder};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// Pack `source` into a temporary tar file.
/// Returns the file and the number of regular files packed.
pub fn pack_folder(source: &Path) -> Result<(NamedTempFile, u64)> {
    let mut temp = NamedTempFile::new().context("create temporary archive")?;
    let mut file_count = 0u64;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let mut builder = Builder::new(&mut writer);

        for entry in WalkDir::new(source)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            let rel_path = path.strip_prefix(source).unwrap_or(path);
            if entry.file_type().is_dir() {
                builder
                    .append_dir(rel_path, path)
                    .with_context(|| format!("pack {}", path.display()))?;
            } else if entry.file_type().is_file() {
                builder
                    .append_path_with_name(path, rel_path)
                    .with_context(|| format!("pack {}", path.display()))?;
                file_count += 1;
            }
        }

        builder.finish()?;
        drop(builder);
        writer.flush()?;
    }
    Ok((temp, file_count))
}

/// Unpack a received archive into `dest` (created if missing).
pub fn unpack_folder(archive_path: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let file = File::open(archive_path)
        .with_context(|| format!("open archive {}", archive_path.display()))?;
    let mut archive = Archive::new(file);
    archive
        .unpack(dest)
        .with_context(|| format!("extract {} into {}", archive_path.display(), dest.display()))?;
    Ok(())
}
