use crate::Result;

/// A remote execution sandbox that mirrors workspace projects.
///
/// Paths are relative to the project root and use `/` separators.  Every
/// operation is keyed by the project's logical name rather than its id.
#[async_trait::async_trait]
pub trait Sandbox: Send + Sync {
    /// Create `path` (and any missing parents) as a directory.
    async fn create_dir(&self, project: &str, path: &str) -> Result<()>;

    /// Delete `path`, recursively if it is a directory.
    async fn delete_path(&self, project: &str, path: &str) -> Result<()>;

    /// Write `content` to the file at `path`, replacing any previous content.
    async fn upload_file(&self, project: &str, path: &str, content: &str) -> Result<()>;
}
