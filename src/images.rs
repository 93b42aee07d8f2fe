//! Runtime-kind to container-image resolution.
//!
//! The runtimes directory is fetched once per process lifetime from the
//! configured endpoint and cached; a failed fetch is not cached, so the next
//! resolve retries it.

use std::collections::HashMap;

use serde::Deserialize;

use crate::action::RuntimeKind;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeEntry {
    pub kind: String,
    pub image: String,
}

/// Mapping from runtime kind to candidate images, grouped by language
/// family the way the runtimes endpoint reports them.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageDirectory {
    pub runtimes: HashMap<String, Vec<RuntimeEntry>>,
}

impl ImageDirectory {
    /// Scan all groups for an entry matching the kind exactly.
    pub fn lookup(&self, kind: &RuntimeKind) -> Option<&str> {
        self.runtimes
            .values()
            .flatten()
            .find(|e| e.kind == kind.as_str())
            .map(|e| e.image.as_str())
    }
}

/// Strip a `:latest` suffix; other tags are part of the label.
pub fn untagged_label(image: &str) -> &str {
    image.strip_suffix(":latest").unwrap_or(image)
}

/// Whether `image` is present in a `repository:tag` listing of locally
/// installed images. Images tagged `:latest` (or untagged) match on the
/// repository alone; any other tag must match exactly.
pub fn image_installed(installed: &[String], image: &str) -> bool {
    let label = untagged_label(image);
    if label.contains(':') {
        installed.iter().any(|i| i == label)
    } else {
        installed
            .iter()
            .any(|i| i.split(':').next() == Some(label))
    }
}

/// Resolves runtime kinds to image names against the cached directory.
pub struct ImageResolver {
    endpoint: String,
    default_image: String,
    http: reqwest::Client,
    cached: Option<ImageDirectory>,
}

impl ImageResolver {
    pub fn new(endpoint: impl Into<String>, default_image: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            default_image: default_image.into(),
            http: reqwest::Client::new(),
            cached: None,
        }
    }

    /// Resolve a kind to an image name, fetching the directory on first use.
    /// Unknown kinds fall back to the default image.
    pub async fn resolve(&mut self, kind: &RuntimeKind) -> Result<String> {
        if self.cached.is_none() {
            let dir = self.fetch().await?;
            tracing::debug!(groups = dir.runtimes.len(), "cached the runtimes directory");
            self.cached = Some(dir);
        }
        let image = self
            .cached
            .as_ref()
            .and_then(|dir| dir.lookup(kind))
            .unwrap_or(&self.default_image);
        Ok(image.to_string())
    }

    async fn fetch(&self) -> Result<ImageDirectory> {
        let url = endpoint_url(&self.endpoint);
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ImageDirectoryUnavailable {
                reason: e.to_string(),
            })?;
        res.json::<ImageDirectory>()
            .await
            .map_err(|e| Error::ImageDirectoryUnavailable {
                reason: format!("decoding the runtimes listing: {e}"),
            })
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, dir: ImageDirectory) {
        self.cached = Some(dir);
    }
}

/// The configured endpoint may be a bare host; default the scheme to https.
fn endpoint_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}
