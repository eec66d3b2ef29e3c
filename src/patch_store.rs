//! On-disk patch files.
//!
//! Layout: `{patch_dir}/{diff_id}/{seq:05}.jsonl`, one [`PatchOperation`]
//! JSON object per line. Files are written to a `.tmp` sibling and renamed
//! into place, so a reader never observes a half-written file. Reads stream
//! the file line by line and verify the recorded sha256 checksum.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use biohub_core::diff::checksum;
use biohub_core::models::{PatchFileRef, PatchOperation};
use biohub_core::store::PatchStore;

pub struct FsPatchStore {
    root: PathBuf,
}

impl FsPatchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn diff_dir(&self, diff_id: &str) -> PathBuf {
        self.root.join(diff_id)
    }

    fn file_path(&self, diff_id: &str, seq: u32) -> PathBuf {
        self.diff_dir(diff_id).join(format!("{:05}.jsonl", seq))
    }
}

#[async_trait]
impl PatchStore for FsPatchStore {
    async fn write_patch(
        &self,
        diff_id: &str,
        seq: u32,
        ops: &[PatchOperation],
    ) -> Result<PatchFileRef> {
        let path = self.file_path(diff_id, seq);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut body = Vec::new();
        for op in ops {
            serde_json::to_writer(&mut body, op)?;
            body.push(b'\n');
        }

        let tmp = path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("Failed to create patch file: {}", tmp.display()))?;
        file.write_all(&body).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        let mut ids: Vec<&str> = ops.iter().map(|o| o.id.as_str()).collect();
        ids.dedup();

        Ok(PatchFileRef {
            seq,
            location: path.display().to_string(),
            operations: ops.len() as u64,
            documents: ids.len() as u64,
            bytes: body.len() as u64,
            checksum: checksum(&body),
            synced: Default::default(),
        })
    }

    async fn read_patch(&self, file: &PatchFileRef) -> Result<Vec<PatchOperation>> {
        let handle = tokio::fs::File::open(&file.location)
            .await
            .with_context(|| format!("Failed to open patch file: {}", file.location))?;
        let mut lines = BufReader::new(handle).lines();
        let mut hasher = Sha256::new();
        let mut ops = Vec::with_capacity(file.operations as usize);
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
            let op: PatchOperation = serde_json::from_str(&line).with_context(|| {
                format!("Malformed operation at {}:{}", file.location, line_no)
            })?;
            ops.push(op);
        }
        let digest = format!("{:x}", hasher.finalize());
        if digest != file.checksum {
            bail!(
                "Checksum mismatch for patch file {} (expected {}, got {})",
                file.location,
                file.checksum,
                digest
            );
        }
        Ok(ops)
    }

    async fn remove_patches(&self, diff_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.diff_dir(diff_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
