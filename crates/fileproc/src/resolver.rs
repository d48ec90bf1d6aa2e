use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// Maps an uploaded file's id to a readable local path.
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn resolve(&self, file_id: &str) -> Option<PathBuf>;
}

/// Resolves `file_id` to `<root>/<file_id>` when that is an existing file.
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// A file id must be a single plain path component.
fn is_plain_name(file_id: &str) -> bool {
    if file_id.is_empty() || file_id.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(file_id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[async_trait]
impl FileResolver for DirectoryResolver {
    async fn resolve(&self, file_id: &str) -> Option<PathBuf> {
        if !is_plain_name(file_id) {
            debug!(file_id, "Rejected file id that is not a plain name");
            return None;
        }
        let path = self.root.join(file_id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolves_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("photo.jpg"), b"jpeg").unwrap();
        let resolver = DirectoryResolver::new(dir.path());

        assert_eq!(
            resolver.resolve("photo.jpg").await,
            Some(dir.path().join("photo.jpg"))
        );
        assert_eq!(resolver.resolve("missing.jpg").await, None);
    }

    #[tokio::test]
    async fn test_rejects_traversal_and_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("x.png"), b"png").unwrap();
        let resolver = DirectoryResolver::new(dir.path().join("sub"));

        assert_eq!(resolver.resolve("../sub/x.png").await, None);
        assert_eq!(resolver.resolve("..").await, None);
        assert_eq!(resolver.resolve("").await, None);
        assert_eq!(resolver.resolve(".").await, None);

        let parent = DirectoryResolver::new(dir.path());
        assert_eq!(parent.resolve("sub").await, None);
    }
}
