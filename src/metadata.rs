//! IP asset metadata from token URIs
//!
//! Token URIs are usually `ipfs://` links; they are rewritten onto the
//! configured HTTP gateway before fetching.

use crate::config::MetadataConfig;
use crate::error::{RelayerError, RelayerResult};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub attributes: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

/// Video by file extension, image otherwise
pub fn media_type(url: &str) -> MediaType {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if [".mov", ".mp4", ".webm", ".ogg"]
        .iter()
        .any(|ext| path.ends_with(ext))
    {
        MediaType::Video
    } else {
        MediaType::Image
    }
}

/// Rewrite `ipfs://` (and the legacy `ipfs://ipfs/`) onto an HTTP gateway
pub fn resolve_uri(uri: &str, gateway: &str) -> String {
    let Some(path) = uri.strip_prefix("ipfs://") else {
        return uri.to_string();
    };
    let path = path.strip_prefix("ipfs/").unwrap_or(path);
    format!("{}/{}", gateway.trim_end_matches('/'), path)
}

/// Metadata plus the resolved media location, as served by the API
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMetadata {
    pub token_uri: String,
    #[serde(flatten)]
    pub metadata: AssetMetadata,
    pub image_url: Option<String>,
    pub media_type: Option<MediaType>,
}

pub struct MetadataClient {
    http: reqwest::Client,
    gateway: String,
}

impl MetadataClient {
    pub fn new(config: &MetadataConfig) -> RelayerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayerError::Metadata(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            gateway: config.gateway_url.clone(),
        })
    }

    pub async fn fetch(&self, token_uri: &str) -> RelayerResult<ResolvedMetadata> {
        let url = resolve_uri(token_uri, &self.gateway);
        debug!("Fetching metadata from {}", url);

        let metadata: AssetMetadata = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayerError::Metadata(format!("{}: {}", url, e)))?
            .json()
            .await
            .map_err(|e| RelayerError::Metadata(format!("{}: invalid metadata: {}", url, e)))?;

        Ok(self.resolve(token_uri, metadata))
    }

    fn resolve(&self, token_uri: &str, metadata: AssetMetadata) -> ResolvedMetadata {
        let image_url = metadata
            .image
            .as_deref()
            .map(|image| resolve_uri(image, &self.gateway));
        let media_type = image_url.as_deref().map(media_type);
        ResolvedMetadata {
            token_uri: token_uri.to_string(),
            metadata,
            image_url,
            media_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATEWAY: &str = "https://gateway.example/ipfs/";

    #[test]
    fn test_ipfs_uris_map_to_gateway() {
        assert_eq!(
            resolve_uri("ipfs://QmHash/1.json", GATEWAY),
            "https://gateway.example/ipfs/QmHash/1.json"
        );
        assert_eq!(
            resolve_uri("ipfs://ipfs/QmHash", GATEWAY),
            "https://gateway.example/ipfs/QmHash"
        );
        assert_eq!(resolve_uri("https://host/1.json", GATEWAY), "https://host/1.json");
    }

    #[test]
    fn test_media_type_by_extension() {
        assert_eq!(media_type("https://x/clip.MP4"), MediaType::Video);
        assert_eq!(media_type("https://x/clip.webm?v=2"), MediaType::Video);
        assert_eq!(media_type("https://x/cover.png"), MediaType::Image);
    }

    #[test]
    fn test_metadata_resolves_image() {
        let client = MetadataClient::new(&MetadataConfig {
            gateway_url: GATEWAY.to_string(),
            timeout_secs: 1,
        })
        .unwrap();
        let metadata: AssetMetadata = serde_json::from_str(
            r#"{"name":"Song","description":"A track","image":"ipfs://QmVid/a.mov","attributes":[{"trait_type":"genre","value":"jazz"}]}"#,
        )
        .unwrap();

        let resolved = client.resolve("ipfs://QmMeta", metadata);
        assert_eq!(resolved.image_url.as_deref(), Some("https://gateway.example/ipfs/QmVid/a.mov"));
        assert_eq!(resolved.media_type, Some(MediaType::Video));
        assert_eq!(resolved.metadata.attributes.len(), 1);
    }
}
