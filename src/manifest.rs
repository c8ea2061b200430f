use crate::error::{Result, SiltError};
use crate::sstable::SsTableMeta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const MANIFEST_MAGIC: &str = "SILT/MANIFEST";
pub const MANIFEST_FORMAT: u32 = 1;
const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP: &str = "MANIFEST.tmp";

/// The authoritative listing of live SSTables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestState {
    /// Newest first by file number.
    pub sstables: Vec<SsTableMeta>,
    pub next_file_number: u64,
    pub last_flushed_sequence: u64,
    pub version: u64,
    pub created_at: u64,
}

impl ManifestState {
    fn empty() -> Self {
        Self {
            sstables: Vec::new(),
            next_file_number: 1,
            last_flushed_sequence: 0,
            version: 0,
            created_at: crate::unix_millis(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ManifestEdit {
    pub added: Vec<SsTableMeta>,
    pub removed_file_numbers: Vec<u64>,
    pub next_file_number: Option<u64>,
    pub last_flushed_sequence: Option<u64>,
}

/// On-disk envelope; magic and format are checked on load.
#[derive(Serialize, Deserialize)]
struct ManifestDocument {
    magic: String,
    format: u32,
    state: ManifestState,
}

/// Owner of the manifest file. Edits are copy-on-write swaps of the whole
/// state, persisted through `MANIFEST.tmp` + fsync + rename.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    tmp_path: PathBuf,
    state: ManifestState,
}

impl Manifest {
    pub async fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join(MANIFEST_FILE);
        let tmp_path = data_dir.as_ref().join(MANIFEST_TMP);

        let state = if path.exists() {
            let raw = fs::read(&path).await?;
            let document: ManifestDocument = serde_json::from_slice(&raw)
                .map_err(|e| SiltError::Corruption(format!("unreadable manifest: {e}")))?;
            if document.magic != MANIFEST_MAGIC {
                return Err(SiltError::Corruption(format!(
                    "bad manifest magic {:?}",
                    document.magic
                )));
            }
            if document.format != MANIFEST_FORMAT {
                return Err(SiltError::Corruption(format!(
                    "unsupported manifest format {}",
                    document.format
                )));
            }
            document.state
        } else {
            ManifestState::empty()
        };

        Ok(Self {
            path,
            tmp_path,
            state,
        })
    }

    /// A point-in-time snapshot; never a live reference.
    pub fn state(&self) -> ManifestState {
        self.state.clone()
    }

    pub fn last_flushed_sequence(&self) -> u64 {
        self.state.last_flushed_sequence
    }

    /// Reserves a file number. The advance is persisted with the next edit;
    /// reusing a number after a crash only ever overwrites an orphaned
    /// table file that no manifest references.
    pub fn allocate_file_number(&mut self) -> u64 {
        let number = self.state.next_file_number;
        self.state.next_file_number += 1;
        number
    }

    /// Applies an edit as an atomic swap: remove, add, re-sort newest-first,
    /// advance the version, persist, then publish the new state.
    pub async fn apply_edit(&mut self, edit: ManifestEdit) -> Result<ManifestState> {
        let mut next = self.state.clone();

        next.sstables
            .retain(|meta| !edit.removed_file_numbers.contains(&meta.file_number));
        next.sstables.extend(edit.added);
        next.sstables
            .sort_by(|a, b| b.file_number.cmp(&a.file_number));

        let highest = next
            .sstables
            .first()
            .map(|meta| meta.file_number + 1)
            .unwrap_or(1);
        next.next_file_number = next
            .next_file_number
            .max(edit.next_file_number.unwrap_or(0))
            .max(highest);
        if let Some(sequence) = edit.last_flushed_sequence {
            next.last_flushed_sequence = next.last_flushed_sequence.max(sequence);
        }
        next.version += 1;

        self.persist(&next).await?;
        self.state = next;
        Ok(self.state.clone())
    }

    async fn persist(&self, state: &ManifestState) -> Result<()> {
        let document = ManifestDocument {
            magic: MANIFEST_MAGIC.to_string(),
            format: MANIFEST_FORMAT,
            state: state.clone(),
        };
        let raw = serde_json::to_vec_pretty(&document)
            .map_err(|e| SiltError::Corruption(format!("manifest serialization failed: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)
            .await?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }
}
