//! Filesystem enumerator.
//!
//! Walks a source directory and returns the files that match the include
//! globs and none of the exclude globs, as absolute paths in sorted order.
//! `.git`, `target` and `node_modules` are always excluded.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::FilesystemConnectorConfig;
use crate::error::{IngestError, Result};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// What to walk and how to filter it.
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub root: PathBuf,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

impl DiscoverOptions {
    /// Options for `root`, taking filters from the connector config when
    /// present. A non-empty `file_types` list replaces the include globs.
    pub fn resolve(
        root: PathBuf,
        connector: Option<&FilesystemConnectorConfig>,
        file_types: &[String],
    ) -> Self {
        let mut options = match connector {
            Some(c) => Self {
                root,
                include_globs: c.include_globs.clone(),
                exclude_globs: c.exclude_globs.clone(),
                follow_symlinks: c.follow_symlinks,
            },
            None => Self {
                root,
                include_globs: vec!["**/*".to_string()],
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
        };
        if !file_types.is_empty() {
            options.include_globs = file_type_globs(file_types);
        }
        options
    }
}

/// `["md", ".txt"]` → `["**/*.md", "**/*.txt"]`.
pub fn file_type_globs(file_types: &[String]) -> Vec<String> {
    file_types
        .iter()
        .map(|t| t.trim().trim_start_matches('.'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("**/*.{}", t))
        .collect()
}

/// Enumerate matching files.
///
/// An entry the walker fails on is still returned when its path is known, so
/// the caller records it as a failed file instead of silently dropping it.
pub fn discover(options: &DiscoverOptions) -> Result<Vec<PathBuf>> {
    if !options.root.is_dir() {
        return Err(IngestError::NotFound(format!(
            "source directory does not exist: {}",
            options.root.display()
        )));
    }
    let root = options.root.canonicalize()?;

    let include_set = build_globset(&options.include_globs)?;

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(options.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();

    let walker = WalkDir::new(&root).follow_links(options.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => match e.path() {
                Some(path) if matches_filters(&root, path, &include_set, &exclude_set) => {
                    warn!(path = %path.display(), "walk error: {}", e);
                    files.push(path.to_path_buf());
                    continue;
                }
                Some(_) => continue,
                None => return Err(IngestError::Io(std::io::Error::other(e.to_string()))),
            },
        };
        if !entry.file_type().is_file() {
            continue;
        }

        if matches_filters(&root, entry.path(), &include_set, &exclude_set) {
            files.push(entry.into_path());
        }
    }

    // Sort for deterministic ordering
    files.sort();
    files.dedup();
    debug!(root = %root.display(), files = files.len(), "discovered files");

    Ok(files)
}

fn matches_filters(root: &Path, path: &Path, include: &GlobSet, exclude: &GlobSet) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let rel_str = relative.to_string_lossy();

    // Apply exclude patterns
    if exclude.is_match(&*rel_str) {
        return false;
    }

    // Apply include patterns
    include.is_match(&*rel_str)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| IngestError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IngestError::Config(format!("invalid glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn options(root: &Path, include: &[&str]) -> DiscoverOptions {
        DiscoverOptions {
            root: root.to_path_buf(),
            include_globs: include.iter().map(|s| s.to_string()).collect(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }

    fn names(root: &Path, files: &[PathBuf]) -> Vec<String> {
        let root = root.canonicalize().unwrap();
        files
            .iter()
            .map(|p| p.strip_prefix(&root).unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_include_and_default_excludes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::create_dir_all(tmp.path().join("node_modules/pkg")).unwrap();
        fs::write(tmp.path().join("b.md"), "b").unwrap();
        fs::write(tmp.path().join("a.md"), "a").unwrap();
        fs::write(tmp.path().join("sub/c.md"), "c").unwrap();
        fs::write(tmp.path().join("notes.txt"), "t").unwrap();
        fs::write(tmp.path().join(".git/HEAD.md"), "x").unwrap();
        fs::write(tmp.path().join("node_modules/pkg/readme.md"), "x").unwrap();

        let files = discover(&options(tmp.path(), &["**/*.md"])).unwrap();
        assert_eq!(names(tmp.path(), &files), vec!["a.md", "b.md", "sub/c.md"]);
        assert!(files.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn test_user_excludes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("drafts")).unwrap();
        fs::write(tmp.path().join("a.md"), "a").unwrap();
        fs::write(tmp.path().join("drafts/d.md"), "d").unwrap();

        let mut opts = options(tmp.path(), &["**/*.md"]);
        opts.exclude_globs = vec!["drafts/**".to_string()];
        let files = discover(&opts).unwrap();
        assert_eq!(names(tmp.path(), &files), vec!["a.md"]);
    }

    #[test]
    fn test_file_types_replace_includes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "a").unwrap();
        fs::write(tmp.path().join("b.txt"), "b").unwrap();
        fs::write(tmp.path().join("c.rs"), "c").unwrap();

        let opts = DiscoverOptions::resolve(
            tmp.path().to_path_buf(),
            None,
            &["txt".to_string(), ".rs".to_string()],
        );
        let files = discover(&opts).unwrap();
        assert_eq!(names(tmp.path(), &files), vec!["b.txt", "c.rs"]);

        let all = discover(&DiscoverOptions::resolve(tmp.path().to_path_buf(), None, &[])).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_missing_root() {
        let tmp = TempDir::new().unwrap();
        let err = discover(&options(&tmp.path().join("nope"), &["**/*"])).unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[test]
    fn test_invalid_glob_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let err = discover(&options(tmp.path(), &["a["])).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_file_type_globs() {
        assert_eq!(
            file_type_globs(&["md".to_string(), " .txt ".to_string(), "".to_string()]),
            vec!["**/*.md", "**/*.txt"]
        );
    }
}
