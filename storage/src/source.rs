// Copyright 2024 The Coder Aggregator Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Template source archives.
//!
//! The backend stores template sources as archives. Text files are exposed
//! for editing. Binary files and explicit directory entries are carried
//! over untouched when the archive is rebuilt from edited files.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::Error;

pub const MAX_ENTRIES: usize = 2000;
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;
pub const MAX_TOTAL_SIZE: u64 = 40 * 1024 * 1024;
pub const MAX_ARCHIVE_SIZE: usize = coder_client::MAX_DOWNLOAD_SIZE;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArchiveError {
    #[error("invalid path {0:?}: {1}")]
    InvalidPath(String, &'static str),

    #[error("duplicate path {0:?}")]
    DuplicatePath(String),

    #[error("too many files: at most {} are allowed", MAX_ENTRIES)]
    TooManyEntries,

    #[error("file {0:?} exceeds {} bytes", MAX_FILE_SIZE)]
    FileTooLarge(String),

    #[error("files exceed {} bytes in total", MAX_TOTAL_SIZE)]
    TotalTooLarge,

    #[error("archive exceeds {} bytes", MAX_ARCHIVE_SIZE)]
    ArchiveTooLarge,

    #[error("malformed archive: {0}")]
    Malformed(String),

    #[error("invariant violated: path {0:?} written twice while packing")]
    WrittenTwice(String),
}

impl From<ArchiveError> for Error {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::WrittenTwice(_) | ArchiveError::Malformed(_) => Error::Internal(err.to_string()),
            _ => Error::BadRequest(format!("spec.files: {}", err)),
        }
    }
}

fn malformed(err: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::Malformed(err.to_string())
}

/// Lexically cleans a relative path. Absolute paths, paths escaping the
/// root and paths that resolve to the root itself are rejected.
pub fn normalize_path(path: &str) -> Result<String, ArchiveError> {
    if path.is_empty() {
        return Err(ArchiveError::InvalidPath(path.to_string(), "path is empty"));
    }
    if path.starts_with('/') {
        return Err(ArchiveError::InvalidPath(path.to_string(), "path must be relative"));
    }

    let mut parts: Vec<&str> = vec![];
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(ArchiveError::InvalidPath(path.to_string(), "path escapes the template root"));
                }
            }
            part => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Err(ArchiveError::InvalidPath(path.to_string(), "path refers to the template root"));
    }
    Ok(parts.join("/"))
}

/// Normalizes the paths of edited files and enforces the archive limits.
pub fn normalize_files(files: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>, ArchiveError> {
    if files.len() > MAX_ENTRIES {
        return Err(ArchiveError::TooManyEntries);
    }

    let mut normalized = BTreeMap::new();
    let mut total = 0u64;
    for (path, contents) in files {
        let clean = normalize_path(path)?;
        let size = contents.len() as u64;
        if size > MAX_FILE_SIZE {
            return Err(ArchiveError::FileTooLarge(clean));
        }
        total += size;
        if total > MAX_TOTAL_SIZE {
            return Err(ArchiveError::TotalTooLarge);
        }
        if normalized.insert(clean.clone(), contents.clone()).is_some() {
            return Err(ArchiveError::DuplicatePath(clean));
        }
    }
    Ok(normalized)
}

#[derive(Debug, Clone)]
struct Entry {
    index: usize,
    contents: Vec<u8>,
    text: bool,
}

/// An extracted source archive.
#[derive(Debug, Clone, Default)]
pub struct SourceArchive {
    raw: Vec<u8>,
    entries: BTreeMap<String, Entry>,
    /// Directory entries by normalized path, pointing into `raw`.
    directories: BTreeMap<String, usize>,
}

impl SourceArchive {
    /// Extracts `raw` within the archive limits.
    pub fn extract(raw: Vec<u8>) -> Result<SourceArchive, ArchiveError> {
        if raw.len() > MAX_ARCHIVE_SIZE {
            return Err(ArchiveError::ArchiveTooLarge);
        }
        if raw.is_empty() {
            return Ok(SourceArchive::default());
        }

        let mut entries = BTreeMap::new();
        let mut directories = BTreeMap::new();
        {
            let mut archive = ZipArchive::new(Cursor::new(raw.as_slice())).map_err(malformed)?;
            if archive.len() > MAX_ENTRIES {
                return Err(ArchiveError::TooManyEntries);
            }

            let mut total = 0u64;
            for index in 0..archive.len() {
                let mut file = archive.by_index(index).map_err(malformed)?;
                if file.is_dir() {
                    let path = normalize_path(file.name().trim_end_matches('/'))?;
                    directories.insert(path, index);
                    continue;
                }

                // Paths are validated before any size accounting.
                let path = normalize_path(file.name())?;
                if entries.contains_key(&path) {
                    return Err(ArchiveError::DuplicatePath(path));
                }
                if file.size() > MAX_FILE_SIZE {
                    return Err(ArchiveError::FileTooLarge(path));
                }

                // The declared size may lie, never read past the limit.
                let mut contents = Vec::new();
                (&mut file).take(MAX_FILE_SIZE + 1).read_to_end(&mut contents).map_err(malformed)?;
                if contents.len() as u64 > MAX_FILE_SIZE {
                    return Err(ArchiveError::FileTooLarge(path));
                }
                total += contents.len() as u64;
                if total > MAX_TOTAL_SIZE {
                    return Err(ArchiveError::TotalTooLarge);
                }

                let text = std::str::from_utf8(&contents).is_ok();
                entries.insert(path, Entry { index, contents, text });
            }
        }

        Ok(SourceArchive { raw, entries, directories })
    }

    /// The UTF-8 files, keyed by normalized path.
    pub fn files(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.text)
            .filter_map(|(path, entry)| String::from_utf8(entry.contents.clone()).ok().map(|text| (path.clone(), text)))
            .collect()
    }

    /// Paths of the entries that are never exposed for editing.
    pub fn binary_paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter(|(_, entry)| !entry.text).map(|(path, _)| path.as_str())
    }

    /// The raw contents of an entry.
    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(path).map(|entry| entry.contents.as_slice())
    }

    /// Whether normalized `files` differ from the exposed text files.
    pub fn differs(&self, files: &BTreeMap<String, String>) -> bool {
        let text = self.entries.iter().filter(|(_, entry)| entry.text);
        text.clone().count() != files.len()
            || text.zip(files).any(|((path, entry), (desired_path, desired))| {
                path != desired_path || entry.contents != desired.as_bytes()
            })
    }

    /// Packs a new archive from the original directory and binary entries,
    /// copied as stored, and the normalized text `files`, written in path
    /// order.
    /// A text file replaces a binary entry at the same path.
    pub fn rebuild(&self, files: &BTreeMap<String, String>) -> Result<Vec<u8>, ArchiveError> {
        let preserved: Vec<(&String, &Entry)> =
            self.entries.iter().filter(|(path, entry)| !entry.text && !files.contains_key(*path)).collect();
        let directories: Vec<(&String, &usize)> =
            self.directories.iter().filter(|(path, _)| !files.contains_key(*path)).collect();
        if directories.len() + preserved.len() + files.len() > MAX_ENTRIES {
            return Err(ArchiveError::TooManyEntries);
        }
        let total: u64 = preserved.iter().map(|(_, entry)| entry.contents.len() as u64).sum::<u64>()
            + files.values().map(|contents| contents.len() as u64).sum::<u64>();
        if total > MAX_TOTAL_SIZE {
            return Err(ArchiveError::TotalTooLarge);
        }

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let mut written = BTreeSet::new();

        if !preserved.is_empty() || !directories.is_empty() {
            let mut original = ZipArchive::new(Cursor::new(self.raw.as_slice())).map_err(malformed)?;
            for (path, index) in directories {
                if !written.insert(format!("{}/", path)) {
                    return Err(ArchiveError::WrittenTwice(path.clone()));
                }
                let directory = original.by_index_raw(*index).map_err(malformed)?;
                writer.raw_copy_file(directory).map_err(malformed)?;
            }
            for (path, entry) in preserved {
                if !written.insert(path.clone()) {
                    return Err(ArchiveError::WrittenTwice(path.clone()));
                }
                let file = original.by_index_raw(entry.index).map_err(malformed)?;
                writer.raw_copy_file(file).map_err(malformed)?;
            }
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644);
        for (path, contents) in files {
            if !written.insert(path.clone()) {
                return Err(ArchiveError::WrittenTwice(path.clone()));
            }
            writer.start_file(path.as_str(), options).map_err(malformed)?;
            writer.write_all(contents.as_bytes()).map_err(malformed)?;
        }

        let archive = writer.finish().map_err(malformed)?.into_inner();
        if archive.len() > MAX_ARCHIVE_SIZE {
            return Err(ArchiveError::ArchiveTooLarge);
        }
        Ok(archive)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0xff, 0xfe];

    pub(crate) fn zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
                continue;
            }
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter().map(|(path, contents)| (path.to_string(), contents.to_string())).collect()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("main.tf").unwrap(), "main.tf");
        assert_eq!(normalize_path("./main.tf").unwrap(), "main.tf");
        assert_eq!(normalize_path("modules//vpc/./main.tf").unwrap(), "modules/vpc/main.tf");
        assert_eq!(normalize_path("modules/../main.tf").unwrap(), "main.tf");

        for path in ["", ".", "/", "/x", "../x", "a/../..", "a/.."] {
            assert!(matches!(normalize_path(path), Err(ArchiveError::InvalidPath(..))), "{:?}", path);
        }
    }

    #[test]
    fn test_extract_exposes_only_text() {
        let raw = zip(&[("main.tf", b"resource {}"), ("images/", b""), ("images/logo.png", PNG)]);
        let archive = SourceArchive::extract(raw).unwrap();

        assert_eq!(archive.files(), files(&[("main.tf", "resource {}")]));
        assert_eq!(archive.binary_paths().collect::<Vec<_>>(), vec!["images/logo.png"]);
    }

    #[test]
    fn test_extract_rejects_unsafe_and_duplicate_paths() {
        let raw = zip(&[("../evil.sh", b"rm -rf /")]);
        assert!(matches!(SourceArchive::extract(raw), Err(ArchiveError::InvalidPath(..))));

        let raw = zip(&[("main.tf", b"a"), ("./main.tf", b"b")]);
        assert_eq!(SourceArchive::extract(raw).unwrap_err(), ArchiveError::DuplicatePath("main.tf".into()));
    }

    #[test]
    fn test_extract_limits() {
        let big = vec![b'a'; MAX_FILE_SIZE as usize + 1];
        let raw = zip(&[("big.txt", &big)]);
        assert_eq!(SourceArchive::extract(raw).unwrap_err(), ArchiveError::FileTooLarge("big.txt".into()));

        let names: Vec<String> = (0..=MAX_ENTRIES).map(|i| format!("f{}.txt", i)).collect();
        let entries: Vec<(&str, &[u8])> = names.iter().map(|name| (name.as_str(), &b"x"[..])).collect();
        assert_eq!(SourceArchive::extract(zip(&entries)).unwrap_err(), ArchiveError::TooManyEntries);

        assert_eq!(
            SourceArchive::extract(vec![0; MAX_ARCHIVE_SIZE + 1]).unwrap_err(),
            ArchiveError::ArchiveTooLarge
        );
        assert!(matches!(SourceArchive::extract(b"not a zip".to_vec()), Err(ArchiveError::Malformed(_))));
    }

    #[test]
    fn test_round_trip_preserves_binary_entries() {
        let raw = zip(&[("main.tf", b"resource {}"), ("README.md", b"# docker"), ("logo.png", PNG)]);
        let archive = SourceArchive::extract(raw).unwrap();

        let repacked = SourceArchive::extract(archive.rebuild(&archive.files()).unwrap()).unwrap();
        assert_eq!(repacked.files(), archive.files());
        assert_eq!(repacked.contents("logo.png"), Some(PNG));
    }

    #[test]
    fn test_rebuild_applies_edits() {
        let raw = zip(&[("main.tf", b"old"), ("obsolete.tf", b"x"), ("logo.png", PNG)]);
        let archive = SourceArchive::extract(raw).unwrap();

        let desired = files(&[("main.tf", "new"), ("variables.tf", "variable \"x\" {}")]);
        let repacked = SourceArchive::extract(archive.rebuild(&desired).unwrap()).unwrap();

        assert_eq!(repacked.files(), desired);
        assert_eq!(repacked.contents("logo.png"), Some(PNG));
        assert_eq!(repacked.contents("obsolete.tf"), None);
    }

    #[test]
    fn test_rebuild_keeps_directory_entries() {
        let raw = zip(&[("modules/", b""), ("modules/vpc.tf", b"old"), ("main.tf", b"a")]);
        let archive = SourceArchive::extract(raw).unwrap();

        let desired = files(&[("main.tf", "b"), ("modules/vpc.tf", "new")]);
        let rebuilt = archive.rebuild(&desired).unwrap();

        let mut reader = ZipArchive::new(Cursor::new(rebuilt.as_slice())).unwrap();
        assert!(reader.by_name("modules/").unwrap().is_dir());
        drop(reader);
        assert_eq!(SourceArchive::extract(rebuilt).unwrap().files(), desired);
    }

    #[test]
    fn test_text_replaces_binary_at_same_path() {
        let archive = SourceArchive::extract(zip(&[("logo.png", PNG)])).unwrap();
        let desired = files(&[("logo.png", "<svg/>")]);

        let repacked = SourceArchive::extract(archive.rebuild(&desired).unwrap()).unwrap();
        assert_eq!(repacked.files(), desired);
        assert_eq!(repacked.binary_paths().count(), 0);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let archive = SourceArchive::default();
        let desired = files(&[("b.tf", "b"), ("a.tf", "a")]);
        assert_eq!(archive.rebuild(&desired).unwrap(), archive.rebuild(&desired).unwrap());
    }

    #[test]
    fn test_differs() {
        let archive = SourceArchive::extract(zip(&[("main.tf", b"a"), ("logo.png", PNG)])).unwrap();

        assert!(!archive.differs(&files(&[("main.tf", "a")])));
        assert!(archive.differs(&files(&[("main.tf", "b")])));
        assert!(archive.differs(&files(&[("main.tf", "a"), ("extra.tf", "")])));
        assert!(archive.differs(&files(&[])));
    }

    #[test]
    fn test_normalize_files() {
        let normalized = normalize_files(&files(&[("./main.tf", "a"), ("modules/x.tf", "b")])).unwrap();
        assert_eq!(normalized, files(&[("main.tf", "a"), ("modules/x.tf", "b")]));

        let err = normalize_files(&files(&[("./main.tf", "a"), ("main.tf", "b")])).unwrap_err();
        assert_eq!(err, ArchiveError::DuplicatePath("main.tf".into()));

        let err: Error = normalize_files(&files(&[("../x", "a")])).unwrap_err().into();
        assert_eq!(err.code(), 400);

        let err: Error = ArchiveError::WrittenTwice("main.tf".into()).into();
        assert_eq!(err.code(), 500);
    }
}
