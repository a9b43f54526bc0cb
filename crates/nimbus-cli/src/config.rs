use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.nimbus.cloud/v1";
pub const DEFAULT_STORAGE_ENDPOINT: &str = "oss-cn-beijing.aliyuncs.com";
pub const DEFAULT_WORKSPACE_DOMAIN: &str = "workspace.nimbus.cloud";

/// Optional `~/.nimbus/config.toml`. Every field can also come from the
/// environment; env vars win over the file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    api_url: Option<String>,
    token: Option<String>,
    storage_endpoint: Option<String>,
    workspace_domain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub token: String,
    /// Storage service domain the bucket name is prepended to.
    pub storage_endpoint: String,
    /// Domain exported ports are reachable under.
    pub workspace_domain: String,
}

pub fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_else(|| Error::msg("cannot determine home directory (HOME is unset)"))
}

/// Per-user root holding the config file and upload checkpoints.
pub fn config_root() -> Result<PathBuf> {
    Ok(home_dir()?.join(".nimbus"))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn load_file() -> Result<ConfigFile> {
    let path = config_root()?.join("config.toml");
    if !path.is_file() {
        return Ok(ConfigFile::default());
    }
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map_err(|e| Error::msg(format!("failed to parse config {}: {e}", path.display())))
}

pub fn load() -> Result<ClientConfig> {
    dotenv::dotenv().ok();
    let file = load_file()?;

    let token = env_value("NIMBUS_API_TOKEN")
        .or(file.token)
        .ok_or_else(|| {
            Error::validation(
                "api token is not configured (set NIMBUS_API_TOKEN or `token` in ~/.nimbus/config.toml)",
            )
        })?;

    Ok(ClientConfig {
        api_url: env_value("NIMBUS_API_URL")
            .or(file.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        token,
        storage_endpoint: env_value("NIMBUS_STORAGE_ENDPOINT")
            .or(file.storage_endpoint)
            .unwrap_or_else(|| DEFAULT_STORAGE_ENDPOINT.to_string()),
        workspace_domain: file
            .workspace_domain
            .unwrap_or_else(|| DEFAULT_WORKSPACE_DOMAIN.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::ConfigFile;

    #[test]
    fn config_file_accepts_partial_tables() {
        let cfg: ConfigFile = toml::from_str(
            r#"
token = "tok-123"
storage_endpoint = "oss-cn-shanghai.aliyuncs.com"
"#,
        )
        .unwrap();
        assert_eq!(cfg.token.as_deref(), Some("tok-123"));
        assert_eq!(
            cfg.storage_endpoint.as_deref(),
            Some("oss-cn-shanghai.aliyuncs.com")
        );
        assert!(cfg.api_url.is_none());
    }

    #[test]
    fn config_file_rejects_wrong_types() {
        assert!(toml::from_str::<ConfigFile>("token = 5").is_err());
    }
}
