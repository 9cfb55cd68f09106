//! Directory listing of a shared folder, as sent in LOOK_RESPONSE
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::protocol::listing::{EMPTY, FILES_HEADER, FOLDERS_HEADER};

/// Entry with size information
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the listed root, `/`-separated
    pub path: PathBuf,
    pub size: u64,
    pub is_directory: bool,
}

impl FileEntry {
    fn render(&self) -> String {
        let label = if self.is_directory { "[FOLDER]" } else { "[FILE]" };
        let rel = self
            .path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        format!("{} {} (Size: {} bytes)", label, rel, self.size)
    }
}

/// Walk `root` recursively (sorted by name), skipping the root itself.
/// Unreadable entries are skipped.
pub fn enumerate(root: &Path) -> Result<Vec<FileEntry>> {
    let meta = std::fs::metadata(root)
        .with_context(|| format!("cannot access shared folder {}", root.display()))?;
    if !meta.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        entries.push(FileEntry {
            path: rel.to_path_buf(),
            size: metadata.len(),
            is_directory: metadata.is_dir(),
        });
    }
    Ok(entries)
}

/// Folders first, then files, each under its section header.
pub fn render_listing(entries: &[FileEntry]) -> Vec<String> {
    let folders: Vec<String> = entries.iter().filter(|e| e.is_directory).map(FileEntry::render).collect();
    let files: Vec<String> = entries.iter().filter(|e| !e.is_directory).map(FileEntry::render).collect();

    let mut lines = Vec::with_capacity(folders.len() + files.len() + 2);
    if !folders.is_empty() {
        lines.push(FOLDERS_HEADER.to_string());
        lines.extend(folders);
    }
    if !files.is_empty() {
        lines.push(FILES_HEADER.to_string());
        lines.extend(files);
    }
    if lines.is_empty() {
        lines.push(EMPTY.to_string());
    }
    lines
}

pub fn list_directory(root: &Path) -> Result<Vec<String>> {
    Ok(render_listing(&enumerate(root)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        assert_eq!(list_directory(dir.path()).unwrap(), vec!["Directory is empty".to_string()]);
    }

    #[test]
    fn test_one_file_one_folder() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();

        let listing = list_directory(dir.path()).unwrap();
        let folders_at = listing.iter().position(|l| l == "=== FOLDERS ===").unwrap();
        let files_at = listing.iter().position(|l| l == "=== FILES ===").unwrap();
        assert!(folders_at < files_at);
        assert!(listing[folders_at + 1].starts_with("[FOLDER] b (Size: "));
        assert_eq!(listing[files_at + 1], "[FILE] a.txt (Size: 10 bytes)");
        assert_eq!(listing.len(), 4);
    }

    #[test]
    fn test_nested_entries_use_relative_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/y/z.bin"), [0u8; 3]).unwrap();

        let listing = list_directory(dir.path()).unwrap();
        assert_eq!(listing[0], "=== FOLDERS ===");
        assert!(listing[1].starts_with("[FOLDER] x "));
        assert!(listing[2].starts_with("[FOLDER] x/y "));
        assert_eq!(listing[3], "=== FILES ===");
        assert_eq!(listing[4], "[FILE] x/y/z.bin (Size: 3 bytes)");
    }

    #[test]
    fn test_only_files_has_no_folder_header() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("only.txt"), b"1").unwrap();
        assert_eq!(
            list_directory(dir.path()).unwrap(),
            vec!["=== FILES ===".to_string(), "[FILE] only.txt (Size: 1 bytes)".to_string()]
        );
    }

    #[test]
    fn test_missing_root_errors() {
        let dir = TempDir::new().unwrap();
        assert!(list_directory(&dir.path().join("nope")).is_err());
        fs::write(dir.path().join("file"), b"").unwrap();
        assert!(list_directory(&dir.path().join("file")).is_err());
    }
}
