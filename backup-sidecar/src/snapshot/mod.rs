//! Snapshot engine: packs the data volume into a checksummed `.tar.zst`.
//!
//! The archive is written to `<name>.partial` in the staging directory,
//! hashed on the way out, synced, size-checked and then renamed into place.
//! A `<name>.sha256` sidecar in `sha256sum` format is written next to it.

pub mod walker;

use crate::record::BackupRecord;
use crate::utils::errors::CaptureError;
use crate::utils::format_bytes;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walker::{walk_directory, FileInfo, WalkOptions};

/// A finished local artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub checksum_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
    pub entries: usize,
}

pub struct SnapshotEngine {
    staging_dir: PathBuf,
    prefix: String,
    level: i32,
    options: WalkOptions,
}

impl SnapshotEngine {
    pub fn new(staging_dir: impl Into<PathBuf>, prefix: impl Into<String>, level: i32) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            prefix: prefix.into(),
            level,
            options: WalkOptions::default(),
        }
    }

    pub fn with_excludes(mut self, patterns: Vec<String>) -> Self {
        self.options.exclude_patterns = patterns;
        self
    }

    /// Pack `source` into a new artifact named after `record`.
    pub async fn capture(
        &self,
        record: &BackupRecord,
        source: &Path,
    ) -> Result<Artifact, CaptureError> {
        let name = record.artifact_name(&self.prefix);
        let source = source.to_path_buf();
        let staging = self.staging_dir.clone();
        let options = self.options.clone();
        let level = self.level;

        let artifact = tokio::task::spawn_blocking(move || {
            pack(&source, &staging, &name, level, &options)
        })
        .await
        .map_err(|e| CaptureError::Task(e.to_string()))??;

        info!(
            record_id = %record.id,
            path = %artifact.path.display(),
            entries = artifact.entries,
            size = %format_bytes(artifact.size_bytes),
            "Snapshot captured"
        );
        Ok(artifact)
    }
}

/// Path of the checksum sidecar for `artifact`.
pub fn checksum_path(artifact: &Path) -> PathBuf {
    let mut name = OsString::from(artifact.as_os_str());
    name.push(".sha256");
    PathBuf::from(name)
}

/// Recompute the artifact's SHA-256 and compare it with its sidecar.
pub fn verify(artifact: &Path) -> Result<bool, CaptureError> {
    let recorded = fs::read_to_string(checksum_path(artifact))?;
    let expected = recorded.split_whitespace().next().unwrap_or_default();

    let mut hasher = Sha256::new();
    let mut file = File::open(artifact)?;
    io::copy(&mut file, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());

    Ok(expected.eq_ignore_ascii_case(&actual))
}

fn pack(
    source: &Path,
    staging: &Path,
    name: &str,
    level: i32,
    options: &WalkOptions,
) -> Result<Artifact, CaptureError> {
    if !source.is_dir() {
        return Err(CaptureError::SourceMissing(source.to_path_buf()));
    }
    fs::create_dir_all(staging)?;

    let entries = walk_directory(source, options)?;
    let required: u64 = entries.iter().map(|e| e.size).sum();
    let available = fs2::available_space(staging)?;
    if available < required {
        return Err(CaptureError::InsufficientSpace {
            required,
            available,
        });
    }
    debug!(entries = entries.len(), bytes = required, "Packing source directory");

    let final_path = staging.join(name);
    let partial = staging.join(format!("{}.partial", name));

    let (checksum, size_bytes) = match write_archive(&partial, &entries, level) {
        Ok(done) => done,
        Err(e) => {
            if let Err(rm) = fs::remove_file(&partial) {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %rm, "Failed to remove partial artifact");
                }
            }
            return Err(e);
        }
    };

    fs::rename(&partial, &final_path)?;
    let sidecar = checksum_path(&final_path);
    if let Err(e) = fs::write(&sidecar, format!("{}  {}\n", checksum, name)) {
        let _ = fs::remove_file(&final_path);
        return Err(e.into());
    }

    Ok(Artifact {
        path: final_path,
        checksum_path: sidecar,
        size_bytes,
        checksum,
        entries: entries.len(),
    })
}

fn write_archive(
    path: &Path,
    entries: &[FileInfo],
    level: i32,
) -> Result<(String, u64), CaptureError> {
    let file = File::create(path)?;
    let encoder = zstd::stream::write::Encoder::new(HashingWriter::new(file), level)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in entries {
        if entry.is_dir {
            builder.append_dir(&entry.relative_path, &entry.path)?;
        } else {
            builder.append_path_with_name(&entry.path, &entry.relative_path)?;
        }
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    let (file, checksum, written) = writer.into_parts();
    file.sync_all()?;

    let on_disk = file.metadata()?.len();
    if on_disk != written {
        return Err(CaptureError::PartialWrite {
            expected: written,
            written: on_disk,
        });
    }
    Ok((checksum, written))
}

/// Counts and hashes every byte written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn into_parts(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BackupKind;
    use chrono::Utc;
    use std::io::Read;
    use tempfile::TempDir;

    fn source_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("world/region")).unwrap();
        fs::write(dir.path().join("server.properties"), b"level-name=world\n").unwrap();
        fs::write(dir.path().join("world/level.dat"), vec![7u8; 4096]).unwrap();
        fs::write(dir.path().join("world/region/r.0.0.mca"), vec![1u8; 64 * 1024]).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_capture_writes_archive_and_sidecar() {
        let source = source_tree();
        let staging = TempDir::new().unwrap();
        let engine = SnapshotEngine::new(staging.path(), "MineCraftBackup", 3);
        let record = BackupRecord::new(BackupKind::Regular, Utc::now(), None);

        let artifact = engine.capture(&record, source.path()).await.unwrap();

        assert_eq!(
            artifact.path.file_name().unwrap().to_string_lossy(),
            record.artifact_name("MineCraftBackup")
        );
        assert_eq!(artifact.size_bytes, fs::metadata(&artifact.path).unwrap().len());
        assert_eq!(artifact.entries, 5);
        assert!(verify(&artifact.path).unwrap());

        let sidecar = fs::read_to_string(&artifact.checksum_path).unwrap();
        assert!(sidecar.starts_with(&artifact.checksum));
        assert!(sidecar.trim_end().ends_with(&record.artifact_name("MineCraftBackup")));

        let leftovers: Vec<_> = fs::read_dir(staging.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_archive_contents_unpack() {
        let source = source_tree();
        let staging = TempDir::new().unwrap();
        let engine = SnapshotEngine::new(staging.path(), "Backup", 1);
        let record = BackupRecord::new(BackupKind::Archive, Utc::now(), None);
        let artifact = engine.capture(&record, source.path()).await.unwrap();

        let decoder = zstd::stream::read::Decoder::new(File::open(&artifact.path).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let mut level_dat = Vec::new();
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            if path == "world/level.dat" {
                entry.read_to_end(&mut level_dat).unwrap();
            }
            names.push(path);
        }
        assert!(names.contains(&"world/region/r.0.0.mca".to_string()));
        assert_eq!(level_dat, vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn test_excluded_files_stay_out_of_archive() {
        let source = source_tree();
        fs::write(source.path().join("world/session.lock"), b"lock").unwrap();
        let staging = TempDir::new().unwrap();
        let engine = SnapshotEngine::new(staging.path(), "Backup", 3)
            .with_excludes(vec!["session.lock".to_string()]);
        let record = BackupRecord::new(BackupKind::Regular, Utc::now(), None);
        let artifact = engine.capture(&record, source.path()).await.unwrap();
        assert_eq!(artifact.entries, 5);

        let decoder = zstd::stream::read::Decoder::new(File::open(&artifact.path).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert!(!entry.path().unwrap().to_string_lossy().contains("session.lock"));
        }
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let source = source_tree();
        let staging = TempDir::new().unwrap();
        let engine = SnapshotEngine::new(staging.path(), "Backup", 3);
        let record = BackupRecord::new(BackupKind::Regular, Utc::now(), None);
        let artifact = engine.capture(&record, source.path()).await.unwrap();

        let mut bytes = fs::read(&artifact.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&artifact.path, bytes).unwrap();

        assert!(!verify(&artifact.path).unwrap());
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_artifact() {
        let staging = TempDir::new().unwrap();
        let engine = SnapshotEngine::new(staging.path(), "Backup", 3);
        let record = BackupRecord::new(BackupKind::Regular, Utc::now(), None);

        let err = engine
            .capture(&record, &staging.path().join("does-not-exist"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::SourceMissing(_)));
        assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
    }
}
