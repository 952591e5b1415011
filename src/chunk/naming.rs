//! Chunk File Naming
//!
//! Chunk files are named `<prefix><number>.<version>` with both parts
//! zero-padded to six digits. Replacing chunk N means writing a file with a
//! higher version; enumeration always picks the highest one.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;

/// Maps chunk numbers and versions to file paths
pub trait FileNamingStrategy: Send + Sync {
    /// Directory the chunk files live in
    fn directory(&self) -> &Path;

    /// Path for a chunk number at a given version
    fn filename_for(&self, index: i32, version: i32) -> PathBuf;

    /// Every version present for a chunk number, newest first
    fn all_versions_for(&self, index: i32) -> Result<Vec<PathBuf>>;

    /// Every chunk file present, sorted by number then version
    fn all_present_files(&self) -> Result<Vec<PathBuf>>;

    /// A fresh, unique temporary file path
    fn temp_filename(&self) -> PathBuf;

    /// Every temporary file present
    fn all_temp_files(&self) -> Result<Vec<PathBuf>>;

    /// Chunk number and version encoded in a path
    fn index_and_version(&self, path: &Path) -> Option<(i32, i32)>;

    /// Path for the next version of a chunk number
    fn next_version_filename_for(&self, index: i32) -> Result<PathBuf> {
        let version = self
            .all_versions_for(index)?
            .first()
            .and_then(|path| self.index_and_version(path))
            .map(|(_, version)| version + 1)
            .unwrap_or(1);
        Ok(self.filename_for(index, version))
    }
}

/// `<prefix>000000.000000` naming
#[derive(Debug, Clone)]
pub struct VersionedPatternNamingStrategy {
    dir: PathBuf,
    prefix: String,
}

const TEMP_EXTENSION: &str = "tmp";

impl VersionedPatternNamingStrategy {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    fn parse_name(&self, name: &str) -> Option<(i32, i32)> {
        let rest = name.strip_prefix(&self.prefix)?;
        let (index, version) = rest.split_once('.')?;
        if index.len() != 6 || version.len() != 6 {
            return None;
        }
        if !index.bytes().chain(version.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((index.parse().ok()?, version.parse().ok()?))
    }

    fn list(&self) -> Result<Vec<(i32, i32, PathBuf)>> {
        let mut files = Vec::new();

        if !self.dir.exists() {
            return Ok(files);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| self.parse_name(n));
            if let Some((index, version)) = parsed {
                files.push((index, version, path));
            }
        }

        files.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(files)
    }
}

impl FileNamingStrategy for VersionedPatternNamingStrategy {
    fn directory(&self) -> &Path {
        &self.dir
    }

    fn filename_for(&self, index: i32, version: i32) -> PathBuf {
        self.dir
            .join(format!("{}{:06}.{:06}", self.prefix, index, version))
    }

    fn all_versions_for(&self, index: i32) -> Result<Vec<PathBuf>> {
        let mut versions: Vec<(i32, PathBuf)> = self
            .list()?
            .into_iter()
            .filter(|(i, _, _)| *i == index)
            .map(|(_, v, path)| (v, path))
            .collect();
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(versions.into_iter().map(|(_, path)| path).collect())
    }

    fn all_present_files(&self) -> Result<Vec<PathBuf>> {
        Ok(self.list()?.into_iter().map(|(_, _, path)| path).collect())
    }

    fn temp_filename(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", Uuid::new_v4(), TEMP_EXTENSION))
    }

    fn all_temp_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        if !self.dir.exists() {
            return Ok(files);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == TEMP_EXTENSION) {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    fn index_and_version(&self, path: &Path) -> Option<(i32, i32)> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| self.parse_name(n))
    }
}
