//! The output-writer collaborator: takes rendered result data, persists it,
//! and returns a stable location string for the monitor console.

use async_trait::async_trait;
use std::path::PathBuf;

pub type OutputResult<T> = Result<T, OutputError>;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait OutputWriter: Send + Sync {
    /// Persist `contents` under `filename` and return the location the
    /// monitor can fetch it from.
    async fn flush(&self, filename: &str, contents: &str) -> OutputResult<String>;
}

/// Writes result files under a data directory, creating it on demand.
pub struct FsOutputWriter {
    root: PathBuf,
}

impl FsOutputWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for FsOutputWriter {
    fn default() -> Self {
        Self::new("data")
    }
}

#[async_trait]
impl OutputWriter for FsOutputWriter {
    async fn flush(&self, filename: &str, contents: &str) -> OutputResult<String> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(filename);
        tokio::fs::write(&path, contents).await?;
        tracing::info!("Wrote output to {}", path.display());
        Ok(format!("/{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flush_creates_dir_and_returns_location() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let writer = FsOutputWriter::new(&root);

        let location = writer.flush("output1.csv", "a,b\n1,2\n").await.unwrap();
        assert!(location.ends_with("output1.csv"));
        let written = std::fs::read_to_string(root.join("output1.csv")).unwrap();
        assert_eq!(written, "a,b\n1,2\n");
    }
}
