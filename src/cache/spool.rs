//! Disk Spool
//!
//! Holds payloads that must not live in memory: dirty entries above the
//! cacheable threshold and streamed uploads above the streaming threshold.
//! Each asset is a `<id>.asset` data file plus a `<id>.meta.json` sidecar,
//! both written atomically through a temp file.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use futures::TryStreamExt;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::asset::{AssetId, AssetMeta, BodyStream};

const DATA_EXT: &str = "asset";
const META_SUFFIX: &str = ".meta.json";
const TMP_SUFFIX: &str = ".tmp";

/// On-disk payload store keyed by asset id
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    /// Open (and create if needed) a spool directory
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create spool directory: {:?}", dir))?;

        let spool = Self { dir };

        // Clean up any stale temp files from previous runs
        spool.cleanup();

        info!(spool_dir = %spool.dir.display(), "Spool initialized");
        Ok(spool)
    }

    /// Path of the data file for an id
    pub fn data_path(&self, id: &AssetId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, DATA_EXT))
    }

    fn meta_path(&self, id: &AssetId) -> PathBuf {
        self.dir.join(format!("{}{}", id, META_SUFFIX))
    }

    /// Write a buffered payload and its sidecar
    pub fn write_bytes(&self, meta: &AssetMeta, data: &[u8]) -> Result<PathBuf> {
        let data_path = self.data_path(&meta.id);

        let mut tmp = self.temp_file()?;
        tmp.write_all(data).context("Failed to write spool file")?;
        tmp.as_file().sync_all().context("Failed to sync spool file")?;
        tmp.persist(&data_path)
            .with_context(|| format!("Failed to persist spool file: {:?}", data_path))?;

        self.write_meta(meta)?;

        debug!(asset = %meta.id, size = data.len(), "Spooled payload");
        Ok(data_path)
    }

    /// Copy a stream into the spool chunk by chunk, hashing as it goes.
    /// The stream must yield exactly `meta.size` bytes; `meta.sha1` is filled in.
    pub async fn write_stream(&self, meta: &mut AssetMeta, mut stream: BodyStream) -> Result<PathBuf> {
        let data_path = self.data_path(&meta.id);

        let tmp = self.temp_file()?;
        let std_file = tmp.reopen().context("Failed to reopen spool temp file")?;
        let mut file = tokio::fs::File::from_std(std_file);

        let mut hasher = Sha1::new();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.try_next().await? {
            written += chunk.len() as u64;
            if written > meta.size {
                bail!(crate::StoreError::InvalidAsset(format!(
                    "asset {} declared {} bytes but the stream produced more",
                    meta.id, meta.size
                )));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.context("Failed to write spool file")?;
        }
        file.flush().await.context("Failed to flush spool file")?;
        file.sync_all().await.context("Failed to sync spool file")?;
        drop(file);

        if written != meta.size {
            bail!(crate::StoreError::InvalidAsset(format!(
                "asset {} declared {} bytes but the stream produced {}",
                meta.id, meta.size, written
            )));
        }

        meta.sha1 = format!("{:x}", hasher.finalize());

        tmp.persist(&data_path)
            .with_context(|| format!("Failed to persist spool file: {:?}", data_path))?;
        self.write_meta(meta)?;

        debug!(asset = %meta.id, size = written, "Spooled streamed payload");
        Ok(data_path)
    }

    fn write_meta(&self, meta: &AssetMeta) -> Result<()> {
        let meta_path = self.meta_path(&meta.id);
        let json = serde_json::to_vec(meta).context("Failed to encode spool sidecar")?;

        let mut tmp = self.temp_file()?;
        tmp.write_all(&json).context("Failed to write spool sidecar")?;
        tmp.persist(&meta_path)
            .with_context(|| format!("Failed to persist spool sidecar: {:?}", meta_path))?;
        Ok(())
    }

    fn temp_file(&self) -> Result<tempfile::NamedTempFile> {
        tempfile::Builder::new()
            .suffix(TMP_SUFFIX)
            .tempfile_in(&self.dir)
            .context("Failed to create temp file for spool")
    }

    /// Remove a spooled payload and its sidecar
    pub fn remove(&self, id: &AssetId) {
        for path in [self.data_path(id), self.meta_path(id)] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove spool file");
                }
            }
        }
        debug!(asset = %id, "Removed spooled payload");
    }

    /// Remove only the sidecar. The data file stays readable but is no
    /// longer recovered as a dirty entry.
    pub fn remove_meta(&self, id: &AssetId) {
        let path = self.meta_path(id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove spool sidecar");
            }
        }
    }

    /// Scan the spool for payloads left by a previous run.
    ///
    /// Entries with a missing or empty data file, or an unreadable sidecar,
    /// are repaired away rather than returned.
    pub fn recover(&self) -> Result<Vec<(AssetMeta, PathBuf)>> {
        let mut found = Vec::new();

        let read_dir = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read spool directory: {:?}", self.dir))?;

        for entry in read_dir.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(&format!(".{}", DATA_EXT)) {
                // Committed payloads lose their sidecar when they settle
                if !self.dir.join(format!("{}{}", stem, META_SUFFIX)).exists() {
                    debug!(path = %path.display(), "Removing settled spool file left by a previous run");
                    let _ = fs::remove_file(&path);
                }
                continue;
            }
            let Some(stem) = name.strip_suffix(META_SUFFIX) else {
                continue;
            };
            let Ok(id) = AssetId::new(stem) else {
                warn!(path = %path.display(), "Ignoring spool sidecar with invalid id");
                continue;
            };

            match self.load(&id) {
                Ok(Some(item)) => found.push(item),
                Ok(None) => {
                    warn!(asset = %id, "Repairing empty or truncated spool entry");
                    self.remove(&id);
                }
                Err(e) => {
                    warn!(asset = %id, error = %e, "Discarding unreadable spool entry");
                    self.remove(&id);
                }
            }
        }

        if !found.is_empty() {
            info!(count = found.len(), "Recovered spooled payloads");
        }
        Ok(found)
    }

    fn load(&self, id: &AssetId) -> Result<Option<(AssetMeta, PathBuf)>> {
        let raw = fs::read(self.meta_path(id)).context("Failed to read spool sidecar")?;
        let meta: AssetMeta = serde_json::from_slice(&raw).context("Failed to parse spool sidecar")?;

        let data_path = self.data_path(id);
        match fs::metadata(&data_path) {
            Ok(m) if m.len() == meta.size => Ok(Some((meta, data_path))),
            Ok(m) => {
                debug!(
                    asset = %id,
                    on_disk = m.len(),
                    expected = meta.size,
                    "Spool size mismatch"
                );
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    /// Clean up stale temp files on startup
    pub fn cleanup(&self) {
        if let Ok(read_dir) = fs::read_dir(&self.dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                let is_tmp = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.ends_with(TMP_SUFFIX));
                if is_tmp {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}
