use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_METADATA_REFRESH_INTERVAL_SECS: u64 = 15 * 60;
pub const DEFAULT_ACCESS_CHECK_CONCURRENCY: usize = 5;
pub const DEFAULT_NAMESPACE_SAMPLE_LIMIT: usize = 10;
pub const DEFAULT_NAMESPACE_FORBIDDEN_THRESHOLD: u32 = 3;

/// Directory holding kubeconfigs that were pasted or embedded by the user.
/// Sessions whose kubeconfig lives here own the file.
pub fn default_kubeconfig_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clusterlink")
        .join("kubeconfigs")
}

/// Tunables for the connection lifecycle. Every field has a default, so an
/// empty document is a valid settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub refresh_interval_secs: u64,
    pub metadata_refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub access_check_concurrency: usize,
    pub namespace_sample_limit: usize,
    pub namespace_forbidden_threshold: u32,
    pub proxy_start_timeout_secs: u64,
    pub kubeconfig_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubectl_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            metadata_refresh_interval_secs: DEFAULT_METADATA_REFRESH_INTERVAL_SECS,
            request_timeout_secs: 10,
            access_check_concurrency: DEFAULT_ACCESS_CHECK_CONCURRENCY,
            namespace_sample_limit: DEFAULT_NAMESPACE_SAMPLE_LIMIT,
            namespace_forbidden_threshold: DEFAULT_NAMESPACE_FORBIDDEN_THRESHOLD,
            proxy_start_timeout_secs: 15,
            kubeconfig_dir: default_kubeconfig_dir(),
            kubectl_path: None,
        }
    }
}

impl Settings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn metadata_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.metadata_refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn proxy_start_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_start_timeout_secs)
    }

    pub fn with_kubeconfig_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kubeconfig_dir = dir.into();
        self
    }

    /// `CLUSTERLINK_KUBECONFIG_DIR` and `CLUSTERLINK_KUBECTL` win over file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os("CLUSTERLINK_KUBECONFIG_DIR") {
            self.kubeconfig_dir = PathBuf::from(dir);
        }
        if let Some(bin) = std::env::var_os("CLUSTERLINK_KUBECTL") {
            self.kubectl_path = Some(PathBuf::from(bin));
        }
        self
    }
}

pub fn parse_settings(content: &str) -> Result<Settings, SessionError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

/// Missing file means defaults.
pub fn load_settings(path: &Path) -> Result<Settings, SessionError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.refresh_interval(), Duration::from_secs(30));
        assert_eq!(settings.metadata_refresh_interval(), Duration::from_secs(900));
        assert_eq!(settings.access_check_concurrency, 5);
        assert_eq!(settings.namespace_sample_limit, 10);
        assert_eq!(settings.namespace_forbidden_threshold, 3);
    }

    #[test]
    fn test_parse_partial_document() {
        let yaml = r#"
refresh-interval-secs: 5
kubeconfig-dir: /tmp/kc
"#;
        let settings = parse_settings(yaml).unwrap();
        assert_eq!(settings.refresh_interval_secs, 5);
        assert_eq!(settings.kubeconfig_dir, PathBuf::from("/tmp/kc"));
        assert_eq!(settings.metadata_refresh_interval_secs, 900);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(parse_settings("  \n").unwrap(), Settings::default());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_env_overrides_chain_after_builders() {
        std::env::set_var("CLUSTERLINK_KUBECTL", "/opt/bin/kubectl");
        let settings = Settings::default()
            .with_kubeconfig_dir("/tmp/kc")
            .with_env_overrides();
        std::env::remove_var("CLUSTERLINK_KUBECTL");

        assert_eq!(settings.kubectl_path, Some(PathBuf::from("/opt/bin/kubectl")));
    }
}
