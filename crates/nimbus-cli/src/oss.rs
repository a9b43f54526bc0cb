use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::api::StsCredentials;
use crate::checkpoint::atomic_write_text;
use crate::error::Result;

pub const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;
pub const PART_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Files at or below this size upload as a single part.
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Fixed at one concurrent part: progress stays monotonic and the
    /// checkpoint only ever moves forward.
    pub part_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: MULTIPART_THRESHOLD,
            part_size: PART_SIZE,
            part_concurrency: 1,
        }
    }
}

#[derive(Debug)]
pub struct UploadRequest<'a> {
    /// Remote object path within the bucket.
    pub key: &'a str,
    pub local: &'a Path,
    /// Root for the backend's own resume bookkeeping. Lives inside the
    /// checkpoint directory so deleting the checkpoint clears it too.
    pub scratch_root: &'a Path,
    pub config: &'a TransferConfig,
}

/// A resumable multi-part upload primitive.
///
/// Implementations keep their own scratch state under
/// [`UploadRequest::scratch_root`] so partially-uploaded objects survive
/// process restarts, and report cumulative progress as
/// `(consumed_bytes, total_bytes)` ticks. The return value is an HTTP-style
/// status code; callers treat anything other than 200 as fatal.
pub trait ResumableUpload {
    fn upload(&self, req: &UploadRequest<'_>, progress: &mut dyn FnMut(u64, u64)) -> Result<u16>;
}

/// The backend's part-level resume journal, one per object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ScratchRecord {
    part_size: u64,
    total_bytes: u64,
    committed_bytes: u64,
}

impl ScratchRecord {
    fn fresh(part_size: u64, total_bytes: u64) -> Self {
        Self {
            part_size,
            total_bytes,
            committed_bytes: 0,
        }
    }
}

fn load_scratch(path: &Path, part_size: u64, total_bytes: u64) -> ScratchRecord {
    let fresh = ScratchRecord::fresh(part_size, total_bytes);
    let Ok(raw) = fs::read_to_string(path) else {
        return fresh;
    };
    match serde_json::from_str::<ScratchRecord>(&raw) {
        // A changed part size or file size invalidates committed positions.
        Ok(rec)
            if rec.part_size == part_size
                && rec.total_bytes == total_bytes
                && rec.committed_bytes <= total_bytes =>
        {
            rec
        }
        _ => fresh,
    }
}

fn save_scratch(path: &Path, rec: &ScratchRecord) -> Result<()> {
    let body = serde_json::to_string(rec)?;
    atomic_write_text(path, &body)
}

/// Bucket handle over the storage service's HTTP surface, authenticated
/// with a short-lived STS triplet.
pub struct Bucket {
    http: reqwest::blocking::Client,
    endpoint: String,
    name: String,
    credentials: StsCredentials,
}

impl Bucket {
    pub fn new(
        name: &str,
        endpoint: &str,
        credentials: StsCredentials,
        allow_proxy: bool,
    ) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder().timeout(Duration::from_secs(300));
        if !allow_proxy {
            builder = builder.no_proxy();
        }
        Ok(Self {
            http: builder.build()?,
            endpoint: endpoint.trim_matches('/').to_string(),
            name: name.to_string(),
            credentials,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://{}.{}/{}", self.name, self.endpoint, key)
    }

    fn scratch_path(&self, scratch_root: &Path, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        scratch_root.join(format!("{}.json", hex::encode(hasher.finalize())))
    }

    fn put(&self, url: &str, body: Vec<u8>) -> Result<u16> {
        let res = self
            .http
            .put(url)
            .header("x-oss-security-token", &self.credentials.security_token)
            .body(body)
            .send()?;
        Ok(res.status().as_u16())
    }
}

impl ResumableUpload for Bucket {
    fn upload(&self, req: &UploadRequest<'_>, progress: &mut dyn FnMut(u64, u64)) -> Result<u16> {
        let total = fs::metadata(req.local)?.len();

        if total <= req.config.multipart_threshold {
            debug!(key = req.key, total, "single-part upload");
            let body = fs::read(req.local)?;
            let status = self.put(&self.object_url(req.key), body)?;
            if status == 200 {
                progress(total, total);
            }
            return Ok(status);
        }

        let scratch = self.scratch_path(req.scratch_root, req.key);
        let mut rec = load_scratch(&scratch, req.config.part_size, total);
        debug!(
            key = req.key,
            committed = rec.committed_bytes,
            total,
            "multi-part upload"
        );

        let mut file = File::open(req.local)?;
        file.seek(SeekFrom::Start(rec.committed_bytes))?;
        let mut buf = vec![0u8; req.config.part_size as usize];

        while rec.committed_bytes < total {
            let want = (total - rec.committed_bytes).min(req.config.part_size) as usize;
            file.read_exact(&mut buf[..want])?;
            let url = format!(
                "{}?append&position={}",
                self.object_url(req.key),
                rec.committed_bytes
            );
            let status = self.put(&url, buf[..want].to_vec())?;
            if !(200..300).contains(&status) {
                return Ok(status);
            }
            rec.committed_bytes += want as u64;
            save_scratch(&scratch, &rec)?;
            progress(rec.committed_bytes, total);
        }
        Ok(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("scratch.json");
        let rec = ScratchRecord {
            part_size: PART_SIZE,
            total_bytes: 10 * PART_SIZE,
            committed_bytes: 3 * PART_SIZE,
        };
        save_scratch(&path, &rec).unwrap();
        assert_eq!(load_scratch(&path, PART_SIZE, 10 * PART_SIZE), rec);
    }

    #[test]
    fn scratch_resets_when_geometry_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("scratch.json");
        let rec = ScratchRecord {
            part_size: PART_SIZE,
            total_bytes: 10 * PART_SIZE,
            committed_bytes: 3 * PART_SIZE,
        };
        save_scratch(&path, &rec).unwrap();

        let reloaded = load_scratch(&path, 2 * PART_SIZE, 10 * PART_SIZE);
        assert_eq!(reloaded.committed_bytes, 0);
        let reloaded = load_scratch(&path, PART_SIZE, 11 * PART_SIZE);
        assert_eq!(reloaded.committed_bytes, 0);
    }

    #[test]
    fn missing_or_corrupt_scratch_starts_at_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("scratch.json");
        assert_eq!(load_scratch(&path, PART_SIZE, 100).committed_bytes, 0);
        fs::write(&path, "garbage").unwrap();
        assert_eq!(load_scratch(&path, PART_SIZE, 100).committed_bytes, 0);
    }
}
