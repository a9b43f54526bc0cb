use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::DatasetCenter;
use crate::config::ClientConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRecord {
    pub id: String,
    pub dataset_center: DatasetCenter,
    pub uploader_id: String,
}

/// Short-lived storage credentials; fetched fresh on every invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct StsCredentials {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "AccessKeySecret")]
    pub access_key_secret: String,
    #[serde(rename = "SecurityToken")]
    pub security_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityRange {
    Public,
    Personal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDatasetRequest {
    pub name: String,
    pub range: VisibilityRange,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeRequest {
    pub uploaded: bool,
    pub domain: String,
    pub path: String,
    pub size: u64,
    pub filename: String,
}

/// The three control-plane calls on the upload path, behind a trait so the
/// pipeline can be exercised without a server.
pub trait ControlPlane {
    fn create_dataset(&self, req: &CreateDatasetRequest) -> Result<DatasetRecord>;
    fn finalize_dataset(&self, dataset_id: &str, req: &FinalizeRequest) -> Result<()>;
    fn storage_credentials(&self) -> Result<StsCredentials>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    Daily,
    Weekly,
    Monthly,
}

pub struct ApiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(cfg: &ClientConfig, allow_proxy: bool) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder().timeout(Duration::from_secs(60));
        if !allow_proxy {
            builder = builder.no_proxy();
        }
        Ok(Self {
            http: builder.build()?,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn parse<T: DeserializeOwned>(res: reqwest::blocking::Response, what: &str) -> Result<T> {
        let status = res.status();
        if !status.is_success() {
            let body = res.text().unwrap_or_default();
            return Err(Error::remote(format!(
                "{what} failed with status {status}: {}",
                snippet(&body)
            )));
        }
        res.json::<T>()
            .map_err(|e| Error::remote(format!("{what} returned invalid JSON: {e}")))
    }

    fn expect_success(res: reqwest::blocking::Response, what: &str) -> Result<()> {
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().unwrap_or_default();
        Err(Error::remote(format!(
            "{what} failed with status {status}: {}",
            snippet(&body)
        )))
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "GET");
        let res = self.http.get(self.url(path)).bearer_auth(&self.token).send()?;
        Self::parse(res, path)
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        debug!(path, "POST");
        let res = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()?;
        Self::parse(res, path)
    }

    pub fn list_ports(&self) -> Result<Vec<PortMapping>> {
        self.get_json("ports")
    }

    pub fn export_port(&self, local_port: u16) -> Result<PortMapping> {
        self.post_json("ports", &serde_json::json!({ "local_port": local_port }))
    }

    pub fn unexport_port(&self, local_port: u16) -> Result<()> {
        let path = format!("ports/{local_port}");
        debug!(path = %path, "DELETE");
        let res = self
            .http
            .delete(self.url(&path))
            .bearer_auth(&self.token)
            .send()?;
        Self::expect_success(res, &path)
    }

    pub fn list_instances(&self, available_only: bool) -> Result<Vec<InstanceSummary>> {
        if available_only {
            self.get_json("instances?available=true")
        } else {
            self.get_json("instances")
        }
    }

    pub fn request_instance(&self, instance_id: &str, term: Term) -> Result<()> {
        let path = format!("instances/{instance_id}/request");
        debug!(path = %path, "POST");
        let res = self
            .http
            .post(self.url(&path))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "term": term }))
            .send()?;
        Self::expect_success(res, &path)
    }

    pub fn release_instance(&self, instance_id: &str) -> Result<()> {
        let path = format!("instances/{instance_id}/release");
        debug!(path = %path, "POST");
        let res = self
            .http
            .post(self.url(&path))
            .bearer_auth(&self.token)
            .send()?;
        Self::expect_success(res, &path)
    }

    /// Streams a dataset archive into `dest_dir`. Plain fetch; the
    /// resumable machinery only applies to uploads.
    pub fn download_dataset(
        &self,
        dataset_id: &str,
        dest_dir: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf> {
        let path = format!("datasets/{dataset_id}/download");
        debug!(path = %path, "GET");
        let mut res = self.http.get(self.url(&path)).bearer_auth(&self.token).send()?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().unwrap_or_default();
            return Err(Error::remote(format!(
                "{path} failed with status {status}: {}",
                snippet(&body)
            )));
        }

        let total = res.content_length().unwrap_or(0);
        let filename = attachment_filename(&res).unwrap_or_else(|| format!("{dataset_id}.zip"));
        let dest = dest_dir.join(&filename);
        let mut file = fs::File::create(&dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;

        let mut buf = [0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            let n = res.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            written += n as u64;
            progress(written, total);
        }
        Ok(dest)
    }
}

impl ControlPlane for ApiClient {
    fn create_dataset(&self, req: &CreateDatasetRequest) -> Result<DatasetRecord> {
        self.post_json("datasets", req)
    }

    fn finalize_dataset(&self, dataset_id: &str, req: &FinalizeRequest) -> Result<()> {
        let path = format!("datasets/{dataset_id}");
        debug!(path = %path, "PUT");
        let res = self
            .http
            .put(self.url(&path))
            .bearer_auth(&self.token)
            .json(req)
            .send()?;
        Self::expect_success(res, &path)
    }

    fn storage_credentials(&self) -> Result<StsCredentials> {
        self.get_json("oss_credentials")
    }
}

fn attachment_filename(res: &reqwest::blocking::Response) -> Option<String> {
    let value = res
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    let raw = value.split("filename=").nth(1)?;
    let name = raw.trim().trim_matches('"').trim();
    // Reject anything that could escape the destination directory.
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return None;
    }
    Some(name.to_string())
}

fn snippet(body: &str) -> &str {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sts_credentials_deserialize_from_remote_field_names() {
        let creds: StsCredentials = serde_json::from_str(
            r#"{"AccessKeyId":"ak","AccessKeySecret":"sk","SecurityToken":"tok"}"#,
        )
        .unwrap();
        assert_eq!(creds.access_key_id, "ak");
        assert_eq!(creds.security_token, "tok");
    }

    #[test]
    fn create_request_serializes_range_as_snake_case() {
        let req = CreateDatasetRequest {
            name: "data.zip".into(),
            range: VisibilityRange::Personal,
            description: String::new(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["range"], "personal");
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let long = "x".repeat(500);
        assert_eq!(snippet(&long).len(), 200);
        assert_eq!(snippet("short"), "short");
    }
}
