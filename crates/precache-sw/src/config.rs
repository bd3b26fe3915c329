//! Agent configuration

use std::collections::HashSet;
use std::path::Path;

use precache_net::RequestFilter;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::AgentError;

/// Marker used by the default reserved-path filter.
pub const DEFAULT_API_MARKER: &str = "/api/";

/// Consistency policy for handled requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Serve from the store when present, else fetch and store.
    #[default]
    CacheFirst,
    /// Always try the network, fall back to the store, then the offline page.
    NetworkFirst,
}

/// Agent configuration
///
/// Set once at deploy time. The agent keeps it behind an `Arc` and never
/// mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Store generation. Change it whenever the manifest changes.
    pub version_tag: String,

    /// Origin that relative manifest entries are resolved against.
    pub base_url: Url,

    /// Resources pre-cached at install, in order.
    #[serde(default)]
    pub manifest: Vec<String>,

    /// Last-resort page for the network-first policy. Must be in the manifest.
    #[serde(default)]
    pub offline_page: Option<String>,

    /// Any URL containing this marker bypasses the agent.
    #[serde(default = "default_api_marker")]
    pub api_marker: String,

    /// Fetch policy.
    #[serde(default)]
    pub policy: PolicyKind,
}

fn default_api_marker() -> String {
    DEFAULT_API_MARKER.to_string()
}

impl AgentConfig {
    /// Create a config with an empty manifest and the default policy.
    pub fn new(version_tag: impl Into<String>, base_url: Url) -> Self {
        Self {
            version_tag: version_tag.into(),
            base_url,
            manifest: Vec::new(),
            offline_page: None,
            api_marker: default_api_marker(),
            policy: PolicyKind::default(),
        }
    }

    /// Replace the manifest.
    pub fn with_manifest<I, S>(mut self, manifest: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = manifest.into_iter().map(Into::into).collect();
        self
    }

    /// Set the offline page.
    pub fn with_offline_page(mut self, page: impl Into<String>) -> Self {
        self.offline_page = Some(page.into());
        self
    }

    /// Set the policy.
    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Set the reserved API marker. An empty marker reserves nothing.
    pub fn with_api_marker(mut self, marker: impl Into<String>) -> Self {
        self.api_marker = marker.into();
        self
    }

    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        serde_json::from_str(json).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve a manifest address against `base_url`.
    pub fn resolve(&self, address: &str) -> Result<Url, AgentError> {
        let mut url = self
            .base_url
            .join(address)
            .map_err(|e| AgentError::Config(format!("invalid address {address:?}: {e}")))?;
        url.set_fragment(None);
        Ok(url)
    }

    /// Manifest entries resolved to absolute URLs, in manifest order.
    pub fn resolved_manifest(&self) -> Result<Vec<Url>, AgentError> {
        self.manifest.iter().map(|a| self.resolve(a)).collect()
    }

    /// Resolved offline page, if configured.
    pub fn offline_page_url(&self) -> Result<Option<Url>, AgentError> {
        self.offline_page.as_deref().map(|p| self.resolve(p)).transpose()
    }

    /// Request filter for this deployment.
    pub fn request_filter(&self) -> RequestFilter {
        RequestFilter::with_api_marker(&self.api_marker)
    }

    /// Check the config before handing it to an agent.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.version_tag.trim().is_empty() {
            return Err(AgentError::Config("version_tag must not be empty".into()));
        }

        let manifest = self.resolved_manifest()?;
        let mut seen = HashSet::new();
        for url in &manifest {
            if !seen.insert(url.as_str()) {
                return Err(AgentError::Config(format!(
                    "manifest lists {url} more than once"
                )));
            }
        }

        match self.offline_page_url()? {
            Some(page) if !seen.contains(page.as_str()) => {
                return Err(AgentError::Config(format!(
                    "offline page {page} is not in the manifest"
                )));
            }
            Some(_) if self.policy == PolicyKind::CacheFirst => {
                warn!("offline_page is only served by the network_first policy");
            }
            None if self.policy == PolicyKind::NetworkFirst => {
                warn!("network_first without an offline_page: total failures surface as errors");
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://leiseca.example/").unwrap()
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let config = AgentConfig::from_json(
            r#"{ "version_tag": "v6", "base_url": "https://leiseca.example/" }"#,
        )
        .unwrap();

        assert_eq!(config.version_tag, "v6");
        assert_eq!(config.policy, PolicyKind::CacheFirst);
        assert_eq!(config.api_marker, "/api/");
        assert!(config.manifest.is_empty());
        assert!(config.offline_page.is_none());
    }

    #[test]
    fn test_policy_names() {
        let config = AgentConfig::from_json(
            r#"{
                "version_tag": "v7",
                "base_url": "https://leiseca.example/",
                "manifest": ["/offline.html"],
                "offline_page": "/offline.html",
                "policy": "network_first"
            }"#,
        )
        .unwrap();
        assert_eq!(config.policy, PolicyKind::NetworkFirst);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = AgentConfig::from_json(
            r#"{ "version_tag": "v1", "base_url": "https://a.example/", "cache": "x" }"#,
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_resolved_manifest_keeps_order_and_absolute_urls() {
        let config = AgentConfig::new("v1", base()).with_manifest([
            "/",
            "/static/css/output.css",
            "https://cdn.quilljs.com/1.3.6/quill.snow.css",
        ]);

        let urls: Vec<String> = config
            .resolved_manifest()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();

        assert_eq!(
            urls,
            vec![
                "https://leiseca.example/",
                "https://leiseca.example/static/css/output.css",
                "https://cdn.quilljs.com/1.3.6/quill.snow.css",
            ]
        );
    }

    #[test]
    fn test_validate_rejects_empty_tag() {
        let config = AgentConfig::new("  ", base());
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicates_after_resolution() {
        let config = AgentConfig::new("v1", base())
            .with_manifest(["/auth/login", "https://leiseca.example/auth/login"]);
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_validate_requires_offline_page_in_manifest() {
        let config = AgentConfig::new("v1", base())
            .with_manifest(["/"])
            .with_offline_page("/offline.html")
            .with_policy(PolicyKind::NetworkFirst);
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let config = config.with_manifest(["/", "/offline.html"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_strips_fragment() {
        let config = AgentConfig::new("v1", base());
        let url = config.resolve("/auth/login#form").unwrap();
        assert_eq!(url.as_str(), "https://leiseca.example/auth/login");
    }

    #[test]
    fn test_request_filter_uses_marker() {
        let config = AgentConfig::new("v1", base()).with_api_marker("/rpc/");
        let filter = config.request_filter();
        assert_eq!(filter.reserved().len(), 1);
        assert_eq!(filter.reserved()[0].pattern, "/rpc/");
    }

    #[test]
    fn test_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        let config = AgentConfig::new("v7", base())
            .with_manifest(["/", "/offline.html"])
            .with_offline_page("/offline.html");
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(AgentConfig::from_file(&path).unwrap(), config);
        assert!(AgentConfig::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_demo_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/agent.json");
        let config = AgentConfig::from_file(path).unwrap();

        assert_eq!(config.policy, PolicyKind::NetworkFirst);
        assert_eq!(config.manifest.len(), 25);
        assert_eq!(
            config.offline_page_url().unwrap().unwrap().as_str(),
            "https://leiseca.example/offline.html"
        );
    }
}
