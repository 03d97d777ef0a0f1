/// Snapshot persistence: one NDJSON file per stack
use super::HealthSnapshot;
use crate::error::{append_record, read_records};
use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SnapshotReporter {
    dir: PathBuf,
}

impl SnapshotReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding every snapshot of `stack_id`
    ///
    /// Bytes outside `[A-Za-z0-9-]` are written as `_` plus two hex digits,
    /// so distinct stack ids never share a file.
    pub fn path_for(&self, stack_id: &str) -> PathBuf {
        let mut name = String::with_capacity(stack_id.len());
        for byte in stack_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("_{:02x}", byte));
            }
        }
        self.dir.join(format!("{}.ndjson", name))
    }

    pub fn write(&self, snapshot: &HealthSnapshot) -> Result<()> {
        append_record(&self.path_for(&snapshot.stack_id), snapshot)
    }

    /// All snapshots of a stack, oldest first
    pub fn history(&self, stack_id: &str) -> Result<Vec<HealthSnapshot>> {
        read_records(&self.path_for(stack_id))
    }

    pub fn latest(&self, stack_id: &str) -> Result<Option<HealthSnapshot>> {
        Ok(self.history(stack_id)?.pop())
    }
}
