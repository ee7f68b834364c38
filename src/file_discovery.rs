use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{Result, ValidationError};

/// Finds the instance documents to validate under a path.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    /// Lower-case extensions without the dot
    extensions: Vec<String>,
    include_set: Option<GlobSet>,
    exclude_set: Option<GlobSet>,
    /// None means unlimited
    max_depth: Option<usize>,
    follow_symlinks: bool,
}

impl Default for FileDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

fn build_glob_set(patterns: &[String], kind: &str) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                ValidationError::Config(format!("Invalid {} pattern '{}': {}", kind, pattern, e))
            })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| ValidationError::Config(format!("Failed to build {} set: {}", kind, e)))?;
    Ok(Some(set))
}

impl FileDiscovery {
    pub fn new() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_set: None,
            exclude_set: None,
            max_depth: None,
            follow_symlinks: false,
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    pub fn with_include_patterns(mut self, patterns: Vec<String>) -> Result<Self> {
        self.include_set = build_glob_set(&patterns, "include")?;
        Ok(self)
    }

    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Result<Self> {
        self.exclude_set = build_glob_set(&patterns, "exclude")?;
        Ok(self)
    }

    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Instance files under `path`, sorted. A file path is returned as is
    /// when it passes the filters.
    pub async fn discover_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| ValidationError::FileSystemTraversal {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if metadata.is_file() {
            return Ok(if self.should_process(path) {
                vec![path.to_path_buf()]
            } else {
                Vec::new()
            });
        }

        let mut files = Vec::new();
        let mut pending = vec![(path.to_path_buf(), 0usize)];
        while let Some((dir, depth)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_symlink() && !self.follow_symlinks {
                    continue;
                }

                let is_dir = if file_type.is_symlink() {
                    fs::metadata(&entry_path).await.is_ok_and(|m| m.is_dir())
                } else {
                    file_type.is_dir()
                };

                if is_dir {
                    if self.max_depth.is_none_or(|max| depth < max) {
                        pending.push((entry_path, depth + 1));
                    }
                } else if self.should_process(&entry_path) {
                    files.push(entry_path);
                }
            }
        }

        files.sort();
        debug!(root = %path.display(), count = files.len(), "discovered instance files");
        Ok(files)
    }

    /// Whether a file passes the extension, include and exclude filters.
    pub fn should_process(&self, path: &Path) -> bool {
        let extension_ok = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_lowercase()));
        if !extension_ok {
            return false;
        }

        if let Some(include) = &self.include_set
            && !include.is_match(path)
        {
            return false;
        }

        !self
            .exclude_set
            .as_ref()
            .is_some_and(|exclude| exclude.is_match(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/deep")).unwrap();
        std::fs::create_dir_all(root.join("skip")).unwrap();
        for file in [
            "one.xml",
            "two.XML",
            "notes.txt",
            "a/three.xml",
            "a/deep/four.xml",
            "skip/five.xml",
        ] {
            std::fs::write(root.join(file), "<doc/>").unwrap();
        }
        dir
    }

    fn names(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[tokio::test]
    async fn test_discovers_by_extension_sorted() {
        let dir = tree();
        let files = FileDiscovery::new().discover_files(dir.path()).await.unwrap();
        assert_eq!(
            names(dir.path(), &files),
            vec!["a/deep/four.xml", "a/three.xml", "one.xml", "skip/five.xml", "two.XML"]
        );
    }

    #[tokio::test]
    async fn test_exclude_and_depth() {
        let dir = tree();
        let discovery = FileDiscovery::new()
            .with_exclude_patterns(vec!["**/skip/**".to_string()])
            .unwrap()
            .with_max_depth(Some(1));
        let files = discovery.discover_files(dir.path()).await.unwrap();
        assert_eq!(
            names(dir.path(), &files),
            vec!["a/three.xml", "one.xml", "two.XML"]
        );
    }

    #[tokio::test]
    async fn test_single_file() {
        let dir = tree();
        let discovery = FileDiscovery::new();
        let xml = dir.path().join("one.xml");
        assert_eq!(discovery.discover_files(&xml).await.unwrap(), vec![xml]);
        let txt = dir.path().join("notes.txt");
        assert!(discovery.discover_files(&txt).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_path() {
        let dir = TempDir::new().unwrap();
        let err = FileDiscovery::new()
            .discover_files(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::FileSystemTraversal { .. }));
    }

    #[test]
    fn test_filters() {
        let discovery = FileDiscovery::new()
            .with_extensions(vec![".xml".to_string(), "SVRL".to_string()])
            .with_include_patterns(vec!["**/in/**".to_string()])
            .unwrap();
        assert!(discovery.should_process(Path::new("/data/in/a.svrl")));
        assert!(!discovery.should_process(Path::new("/data/out/a.xml")));
        assert!(!discovery.should_process(Path::new("/data/in/a.txt")));
    }

    #[test]
    fn test_invalid_glob() {
        let err = FileDiscovery::new()
            .with_include_patterns(vec!["a[".to_string()])
            .unwrap_err();
        assert!(matches!(err, ValidationError::Config(_)));
    }
}
