use std::fs::{self, ReadDir};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LoadError;
use crate::plugins::module::has_extension;
use crate::plugins::ExtensionSource;

/// Lazily lists `*.extension` regular files in a directory.
///
/// The first enumeration error is yielded once and ends the scan. Problems
/// with a single entry are left to that entry's resolver.
#[derive(Debug)]
pub struct Scan {
    directory: PathBuf,
    extension: String,
    entries: Option<ReadDir>,
}

/// Create `directory` if needed and start listing it.
pub fn scan(directory: &Path, extension: &str) -> Result<Scan, LoadError> {
    let failed = |source| LoadError::Scan {
        path: directory.to_path_buf(),
        source,
    };
    fs::create_dir_all(directory).map_err(failed)?;
    let entries = fs::read_dir(directory).map_err(failed)?;
    Ok(Scan {
        directory: directory.to_path_buf(),
        extension: extension.trim_start_matches('.').to_string(),
        entries: Some(entries),
    })
}

impl Scan {
    fn fail(&mut self, source: std::io::Error) -> Option<Result<ExtensionSource, LoadError>> {
        self.entries = None;
        Some(Err(LoadError::Scan {
            path: self.directory.clone(),
            source,
        }))
    }
}

impl Iterator for Scan {
    type Item = Result<ExtensionSource, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.as_mut()?.next()? {
                Ok(entry) => entry,
                Err(e) => return self.fail(e),
            };
            let path = entry.path();
            if !has_extension(&path, &self.extension) || !path.is_file() {
                continue;
            }
            return Some(Ok(ExtensionSource::new(resolved(path))));
        }
    }
}

/// Canonical form of a listed path. A file that vanished or cannot be
/// resolved keeps its listed path and fails later, on its own.
fn resolved(path: PathBuf) -> PathBuf {
    match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Keeping uncanonicalized path");
            path
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(scan: Scan) -> Vec<String> {
        let mut names: Vec<_> = scan.map(|s| s.unwrap().name).collect();
        names.sort();
        names
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested").join("extensions");
        let found = scan(&target, "lua").unwrap();
        assert!(target.is_dir());
        assert_eq!(found.count(), 0);
    }

    #[test]
    fn test_filters_by_extension_and_kind() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("greet.lua"), "return {}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::write(dir.path().join("ok.lua"), "return {}").unwrap();
        fs::create_dir(dir.path().join("folder.lua")).unwrap();

        assert_eq!(names(scan(dir.path(), "lua").unwrap()), vec!["greet", "ok"]);
        assert_eq!(names(scan(dir.path(), ".txt").unwrap()), vec!["notes"]);
    }

    #[test]
    fn test_paths_are_absolute() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("greet.lua"), "").unwrap();
        let source = scan(dir.path(), "lua").unwrap().next().unwrap().unwrap();
        assert!(source.path.is_absolute());
        assert_eq!(source.file_name(), "greet.lua");
    }

    #[test]
    fn test_unresolvable_entry_keeps_listed_path() {
        let dir = tempdir().unwrap();
        let gone = dir.path().join("gone.lua");
        assert_eq!(resolved(gone.clone()), gone);

        fs::write(dir.path().join("here.lua"), "").unwrap();
        let here = resolved(dir.path().join(".").join("here.lua"));
        assert_eq!(here, dir.path().canonicalize().unwrap().join("here.lua"));
    }

    #[test]
    fn test_vanished_file_does_not_end_scan() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.lua"), "").unwrap();
        fs::write(dir.path().join("b.lua"), "").unwrap();

        let mut found = scan(dir.path(), "lua").unwrap();
        let first = found.next().unwrap().unwrap();
        let other = if first.name == "a" { "b.lua" } else { "a.lua" };
        fs::remove_file(dir.path().join(other)).unwrap();

        // a removed entry is skipped, not reported as a scan error
        let rest: Vec<_> = found.collect();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_file_in_place_of_directory_fails() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("extensions");
        fs::write(&file, "").unwrap();
        assert!(matches!(scan(&file, "lua"), Err(LoadError::Scan { .. })));
    }
}
