use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use quarry_core::{FileWriter, StoragePartition};

/// Writes sidecar files under a storage root at their partition path.
pub struct PartitionWriter {
    root: PathBuf,
    partition: StoragePartition,
}

impl PartitionWriter {
    /// Bind a writer to one run's partition.
    pub fn new(root: impl Into<PathBuf>, partition: StoragePartition) -> Self {
        PartitionWriter {
            root: root.into(),
            partition,
        }
    }

    /// The absolute path a filename lands at.
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(self.partition.file_path(filename))
    }
}

#[async_trait]
impl FileWriter for PartitionWriter {
    async fn put(&self, filename: &str, content_type: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(filename);
        tracing::debug!(
            path = %path.display(),
            content_type,
            len = data.len(),
            "writing sidecar file"
        );
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || write_file(&path, &data))
            .await
            .context("sidecar write task")??;
        Ok(())
    }
}

fn write_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("invalid sidecar path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
