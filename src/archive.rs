//! Creation and extraction of `tar.gz` archives of a directory tree.
//!
//! The tree is walked in file name order, so archiving the same tree twice
//! yields the same entry order. Two kinds of entries are left out:
//!
//! - directories named like the configured excluded directory (e.g.
//!   `node_modules`), at any depth, including their contents.
//! - symbolic links. They are neither archived nor followed, so links of a
//!   site are lost in its backup.
//!
//! Packing ([ArchiveEngine::write_tar]) and compression are separate layers:
//! the tar stream is written into any [Write], [ArchiveEngine::create] wraps
//! the destination in a gzip encoder.

use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::HeaderMode;
use walkdir::{DirEntry, WalkDir};

use crate::util::artifact;

/// Directory name excluded from archives by default.
pub const DEFAULT_EXCLUDED_DIR: &str = "node_modules";

#[derive(Debug, Display, Error, From)]
/// Errors on creation or extraction of an archive.
pub enum ArchiveError {
    /// The source of an archive isn't a directory.
    #[display("Source is not a directory: {}", _0.display())]
    NotADirectory(#[error(ignore)] PathBuf),
    /// Walking the source tree failed.
    #[display("Walking the source tree failed: {_0}")]
    #[from]
    Walk(walkdir::Error),
    /// An entry of the archive would be extracted outside the destination.
    #[display("Archive entry escapes the destination: {}", _0.display())]
    UnsafeEntry(#[error(ignore)] PathBuf),
    /// Reading or writing failed.
    #[display("Archive I/O failed: {_0}")]
    #[from]
    Io(io::Error),
}

/// Statistics of a created archive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    pub directories: usize,
    /// Uncompressed size of all regular files.
    pub bytes: u64,
}

/// Creates and extracts archives of site trees.
#[derive(Clone, Debug)]
pub struct ArchiveEngine {
    excluded_dir: String,
    compression: Compression,
}

impl Default for ArchiveEngine {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_DIR)
    }
}

impl ArchiveEngine {
    pub fn new(excluded_dir: impl Into<String>) -> Self {
        Self {
            excluded_dir: excluded_dir.into(),
            compression: Compression::default(),
        }
    }

    /// Sets the gzip compression level, clamped to `0..=9`.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    pub fn excluded_dir(&self) -> &str {
        &self.excluded_dir
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Walks `root` the same way archives are built: sorted, without the
    /// root itself, without symlinks and without excluded directories.
    pub fn walk(&self, root: &Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
        let excluded = self.excluded_dir.clone();
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter()
            .filter_entry(move |entry| {
                let file_type = entry.file_type();
                !file_type.is_symlink() && !(file_type.is_dir() && entry.file_name() == excluded.as_str())
            })
    }

    /// Writes an uncompressed tar stream of `source_dir` into `writer`.
    pub fn write_tar<W: Write>(&self, source_dir: &Path, writer: W) -> Result<(W, ArchiveStats), ArchiveError> {
        if !source_dir.is_dir() {
            return Err(ArchiveError::NotADirectory(source_dir.to_path_buf()));
        }

        let mut builder = tar::Builder::new(writer);
        builder.mode(HeaderMode::Complete);
        builder.follow_symlinks(false);

        let mut stats = ArchiveStats::default();
        for entry in self.walk(source_dir) {
            let entry = entry?;
            let Ok(relative) = entry.path().strip_prefix(source_dir) else {
                continue;
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                builder.append_dir(relative, entry.path())?;
                stats.directories += 1;
            } else if file_type.is_file() {
                let mut file = File::open(entry.path())?;
                stats.bytes += file.metadata()?.len();
                builder.append_file(relative, &mut file)?;
                stats.files += 1;
            } else {
                log::trace!(target: "backup::archive", "Skipping special file {}", entry.path().display());
            }
        }

        let writer = builder.into_inner()?;
        Ok((writer, stats))
    }

    /// Archives `source_dir` into the gzip compressed tarball `dest`.
    ///
    /// The archive is staged next to `dest` and only moved there once it is
    /// complete, so `dest` is either absent or a complete archive.
    pub fn create(&self, source_dir: &Path, dest: &Path) -> Result<ArchiveStats, ArchiveError> {
        let dest_dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let staging = artifact::staging_file(dest_dir)?;

        let encoder = GzEncoder::new(staging, self.compression);
        let (encoder, stats) = self.write_tar(source_dir, encoder)?;
        let staging = encoder.finish()?;
        artifact::commit(staging, dest)?;

        log::debug!(
            target: "backup::archive",
            "Archived {} file(s) and {} directories ({} bytes) of {} into {}",
            stats.files,
            stats.directories,
            stats.bytes,
            source_dir.display(),
            dest.display(),
        );
        Ok(stats)
    }

    /// Extracts the gzip compressed tarball `archive` into `dest_dir`.
    ///
    /// Only directories and regular files are extracted; links and other
    /// special entries are skipped.
    pub fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
        let file = File::open(archive)?;
        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        archive.set_preserve_mtime(true);
        fs::create_dir_all(dest_dir)?;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_type = entry.header().entry_type();
            if !(entry_type.is_dir() || entry_type.is_file()) {
                log::trace!(target: "backup::archive", "Skipping {entry_type:?} entry {}", entry.path_bytes().escape_ascii());
                continue;
            }

            // creates missing parent directories of files
            if !entry.unpack_in(dest_dir)? {
                return Err(ArchiveError::UnsafeEntry(entry.path()?.into_owned()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("app/Http")).unwrap();
        fs::create_dir_all(root.join("storage/empty")).unwrap();
        fs::create_dir_all(root.join("node_modules/lodash")).unwrap();
        fs::create_dir_all(root.join("resources/node_modules")).unwrap();
        fs::write(root.join("index.php"), "<?php echo 'hi';").unwrap();
        fs::write(root.join("app/Http/Kernel.php"), vec![7u8; 100_000]).unwrap();
        fs::write(root.join("node_modules/lodash/index.js"), "module.exports = {}").unwrap();
        fs::write(root.join("resources/node_modules/x.js"), "x").unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(root.join("index.php"), root.join("link.php")).unwrap();
            std::os::unix::fs::symlink(root.join("app"), root.join("app-link")).unwrap();
        }
        dir
    }

    /// Relative paths of all entries below `root`, with file contents.
    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
                let contents = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
                (relative, contents)
            })
            .collect()
    }

    #[test]
    fn round_trip_reproduces_included_entries() {
        let source = tree();
        let out = TempDir::new().unwrap();
        let archive = out.path().join("files_2024-01-01_000000.tar.gz");
        let engine = ArchiveEngine::default();

        let stats = engine.create(source.path(), &archive).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 100_000 + 16);

        let extracted = out.path().join("extracted");
        engine.extract(&archive, &extracted).unwrap();

        let restored = snapshot(&extracted);
        let expected: BTreeMap<_, _> = snapshot(source.path())
            .into_iter()
            .filter(|(path, _)| {
                !path.components().any(|c| c.as_os_str() == "node_modules")
                    && !path.starts_with("link.php")
                    && !path.starts_with("app-link")
            })
            .collect();
        assert_eq!(restored, expected);
        assert!(restored.contains_key(Path::new("storage/empty")));
    }

    #[test]
    fn archive_entries_are_sorted_and_relative() {
        let source = tree();
        let (bytes, _) = ArchiveEngine::default()
            .write_tar(source.path(), Vec::new())
            .unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .map(|name| name.trim_end_matches('/').to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "app",
                "app/Http",
                "app/Http/Kernel.php",
                "index.php",
                "resources",
                "storage",
                "storage/empty",
            ]
        );
    }

    #[test]
    fn failed_create_leaves_no_artifact() {
        let out = TempDir::new().unwrap();
        let archive = out.path().join("files_2024-01-01_000000.tar.gz");
        let missing = out.path().join("does-not-exist");

        let err = ArchiveEngine::default().create(&missing, &archive).unwrap_err();
        assert!(matches!(err, ArchiveError::NotADirectory(_)));
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn extract_skips_symlink_entries() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, "evil", "/etc/passwd").unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "dir/ok.txt", &b"ok"[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let out = TempDir::new().unwrap();
        let archive = out.path().join("a.tar.gz");
        fs::write(&archive, bytes).unwrap();
        let dest = out.path().join("x");
        ArchiveEngine::default().extract(&archive, &dest).unwrap();

        assert!(fs::symlink_metadata(dest.join("evil")).is_err());
        assert_eq!(fs::read(dest.join("dir/ok.txt")).unwrap(), b"ok");
    }
}
