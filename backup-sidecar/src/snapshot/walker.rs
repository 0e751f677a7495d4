//! Directory traversal for snapshotting.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// File names containing any of these are skipped (with their subtree)
    pub exclude_patterns: Vec<String>,
}

/// An entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,

    /// Path relative to the walk root; used as the archive entry name
    pub relative_path: PathBuf,

    /// Size in bytes; zero for directories and symlinks
    pub size: u64,

    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = entry.path_is_symlink();
        let is_dir = metadata.is_dir();
        let size = if is_dir || is_symlink { 0 } else { metadata.len() };

        Ok(Self {
            path,
            relative_path,
            size,
            is_dir,
            is_symlink,
        })
    }
}

/// Walk `root` and collect every entry below it, parents before children.
/// The root itself is not returned.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !should_exclude(e, &options.exclude_patterns));

    for entry in walker {
        let entry = entry?;
        entries.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(entries)
}

fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_includes_directories_in_order() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("world"))?;
        fs::write(temp_dir.path().join("server.properties"), b"motd=hi")?;
        fs::write(temp_dir.path().join("world/level.dat"), b"12345")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let names: Vec<_> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["server.properties", "world", "world/level.dat"]);
        assert!(files[1].is_dir);
        assert_eq!(files[1].size, 0);
        Ok(())
    }

    #[test]
    fn test_exclude_patterns_prune_subtrees() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("logs"))?;
        fs::write(temp_dir.path().join("logs/latest.log"), b"noise")?;
        fs::write(temp_dir.path().join("session.lock"), b"lock")?;
        fs::write(temp_dir.path().join("keep.dat"), b"keep")?;

        let options = WalkOptions {
            exclude_patterns: vec!["logs".to_string(), "session.lock".to_string()],
        };
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("keep.dat"));
        Ok(())
    }
}
