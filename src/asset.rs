//! Asset types
//!
//! Identity, metadata and body types shared by every tier, plus the
//! re-openable `Payload` used by commits and uploads.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use crate::error::{StoreError, StoreResult};

/// Chunked byte stream used for asset bodies
pub type BodyStream = Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>;

/// Maximum length of an asset id
const MAX_ID_LEN: usize = 128;

/// The nil UUID is never a valid asset id
const NIL_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Number of id characters used to partition objects into containers
const CONTAINER_ID_PREFIX_LEN: usize = 4;

/// Stable identity of an immutable asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    /// Validate and wrap an externally assigned id
    pub fn new(id: impl Into<String>) -> StoreResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(StoreError::InvalidAsset("asset id must not be empty".to_string()));
        }
        if id.len() > MAX_ID_LEN {
            return Err(StoreError::InvalidAsset(format!(
                "asset id longer than {} characters",
                MAX_ID_LEN
            )));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(StoreError::InvalidAsset(format!("asset id '{}' has invalid characters", id)));
        }
        if id == NIL_ID {
            return Err(StoreError::InvalidAsset("assets must not have a nil id".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remote container for this id: prefix plus the first id characters, upper-cased
    pub fn container_name(&self, prefix: &str) -> String {
        let head: String = self.0.chars().take(CONTAINER_ID_PREFIX_LEN).collect();
        format!("{}{}", prefix, head.to_uppercase())
    }

    /// Remote object name: dashes stripped, lower-cased, `.asset` suffix
    pub fn object_name(&self) -> String {
        format!("{}.asset", self.0.replace('-', "").to_lowercase())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AssetId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AssetId> for String {
    fn from(id: AssetId) -> Self {
        id.0
    }
}

/// Lowercase hex SHA-1 of a byte slice
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Milliseconds since the unix epoch
pub fn to_unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Descriptive metadata of a stored asset. Persisted as the spool sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeta {
    pub id: AssetId,
    pub content_type: String,
    pub size: u64,
    /// Creation time in milliseconds since epoch
    pub created_at: u64,
    /// Lowercase hex SHA-1 of the content
    pub sha1: String,
}

/// Asset content, either buffered or streamed
pub enum AssetBody {
    Bytes(Bytes),
    Stream(BodyStream),
}

impl AssetBody {
    /// Buffer the whole body
    pub async fn collect(self) -> StoreResult<Bytes> {
        match self {
            AssetBody::Bytes(bytes) => Ok(bytes),
            AssetBody::Stream(stream) => {
                let mut buf = BytesMut::new();
                let mut stream = stream;
                while let Some(chunk) = stream.try_next().await? {
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for AssetBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetBody::Bytes(b) => write!(f, "AssetBody::Bytes({} bytes)", b.len()),
            AssetBody::Stream(_) => f.write_str("AssetBody::Stream(..)"),
        }
    }
}

/// An asset as handed to or returned from the store
#[derive(Debug)]
pub struct AssetRecord {
    pub id: AssetId,
    pub content_type: String,
    /// Declared size in bytes; streamed bodies must match it
    pub size: u64,
    pub created_at: SystemTime,
    pub body: AssetBody,
}

impl AssetRecord {
    /// Convenience constructor for buffered content
    pub fn new(id: AssetId, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            id,
            content_type: content_type.into(),
            size: data.len() as u64,
            created_at: SystemTime::now(),
            body: AssetBody::Bytes(data),
        }
    }

    /// Constructor for streamed content of a known size
    pub fn streamed(
        id: AssetId,
        content_type: impl Into<String>,
        size: u64,
        stream: BodyStream,
    ) -> Self {
        Self {
            id,
            content_type: content_type.into(),
            size,
            created_at: SystemTime::now(),
            body: AssetBody::Stream(stream),
        }
    }

    /// Buffer the body and return it (convenience for small assets)
    pub async fn into_bytes(self) -> StoreResult<Bytes> {
        self.body.collect().await
    }
}

/// Where a re-openable payload lives
#[derive(Debug, Clone)]
pub enum PayloadSource {
    Memory(Bytes),
    Disk(PathBuf),
}

/// Re-openable asset content, so commits and uploads can be replayed
#[derive(Debug, Clone)]
pub struct Payload {
    pub source: PayloadSource,
    pub size: u64,
    pub sha1: String,
}

impl Payload {
    pub fn from_bytes(bytes: Bytes) -> Self {
        let sha1 = sha1_hex(&bytes);
        Self {
            size: bytes.len() as u64,
            source: PayloadSource::Memory(bytes),
            sha1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.source, PayloadSource::Memory(_))
    }

    /// Open the payload as a stream of chunks no larger than `chunk_size`,
    /// stopping after `limit` bytes when a limit is given
    pub async fn open(&self, chunk_size: usize, limit: Option<u64>) -> StoreResult<BodyStream> {
        let limit = limit.unwrap_or(u64::MAX);
        match &self.source {
            PayloadSource::Memory(bytes) => {
                let end = (bytes.len() as u64).min(limit) as usize;
                Ok(chunk_bytes(bytes.slice(..end), chunk_size))
            }
            PayloadSource::Disk(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(file_stream(file, chunk_size, limit))
            }
        }
    }
}

/// Drain a stream, returning its length and SHA-1 without keeping the bytes
pub async fn digest_stream(mut stream: BodyStream) -> StoreResult<(u64, String)> {
    let mut hasher = Sha1::new();
    let mut size: u64 = 0;
    while let Some(chunk) = stream.try_next().await? {
        hasher.update(&chunk);
        size += chunk.len() as u64;
    }
    Ok((size, format!("{:x}", hasher.finalize())))
}

/// End a stream once `limit` bytes have passed, truncating the last chunk
pub fn limit_stream(stream: BodyStream, limit: u64) -> BodyStream {
    stream
        .scan(limit, |remaining, item| {
            let next = match item {
                Ok(_) if *remaining == 0 => None,
                Ok(mut chunk) => {
                    if chunk.len() as u64 > *remaining {
                        chunk.truncate(*remaining as usize);
                    }
                    *remaining -= chunk.len() as u64;
                    Some(Ok(chunk))
                }
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(next)
        })
        .boxed()
}

/// Split a buffer into zero-copy chunks
pub fn chunk_bytes(bytes: Bytes, chunk_size: usize) -> BodyStream {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<StoreResult<Bytes>> = (0..bytes.len())
        .step_by(chunk_size)
        .map(|start| Ok(bytes.slice(start..(start + chunk_size).min(bytes.len()))))
        .collect();
    Box::pin(stream::iter(chunks))
}

/// Stream a file in bounded chunks
pub fn file_stream(file: tokio::fs::File, chunk_size: usize, limit: u64) -> BodyStream {
    let chunk_size = chunk_size.max(1);
    stream::try_unfold((file, 0u64), move |(file, read)| {
        read_chunk(file, read, chunk_size, limit)
    })
    .boxed()
}

async fn read_chunk(
    mut file: tokio::fs::File,
    read: u64,
    chunk_size: usize,
    limit: u64,
) -> StoreResult<Option<(Bytes, (tokio::fs::File, u64))>> {
    if read >= limit {
        return Ok(None);
    }
    let want = (chunk_size as u64).min(limit - read) as usize;
    let mut buf = vec![0u8; want];
    let n = file.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some((Bytes::from(buf), (file, read + n as u64))))
}
