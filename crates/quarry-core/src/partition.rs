use serde::{Deserialize, Serialize};

/// Partition tuple addressing persisted run output.
///
/// Opaque to the core; the file writer maps it onto a deterministic
/// directory layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoragePartition {
    /// Dataset name.
    pub dataset: String,
    /// Source label (partition hint, not identity).
    pub source: String,
    /// Category label (partition hint, not identity).
    pub category: String,
    /// Day bucket, `YYYY-MM-DD`.
    pub day: String,
    /// Run the output belongs to.
    pub run_id: String,
}

impl StoragePartition {
    /// The relative path a sidecar file lands at under the storage root.
    pub fn file_path(&self, filename: &str) -> String {
        format!(
            "datasets/{}/partitions/source={}/category={}/day={}/run_id={}/files/{}",
            self.dataset, self.source, self.category, self.day, self.run_id, filename
        )
    }
}
