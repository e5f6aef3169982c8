//! Registry HTTP API client used by the pull path.
//!
//! The pull path never writes layers to disk. Each blob is streamed and fed
//! through SHA-256 so the unit spends comparable CPU to a real pull.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::RegistryError;

/// Manifest media types accepted from the registry.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// A parsed `registry/repository:tag` image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Splits on the first `/`, then on the last `:` of the remainder.
    pub fn parse(item: &str) -> Result<Self, RegistryError> {
        let malformed = || RegistryError::MalformedReference(item.to_string());

        let (registry, rest) = item.split_once('/').ok_or_else(malformed)?;
        let (repository, tag) = rest.rsplit_once(':').ok_or_else(malformed)?;

        if registry.is_empty() || repository.is_empty() || tag.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Registry credentials for the token call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Summary of one streamed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDigest {
    pub bytes: u64,
    pub sha256: String,
}

/// The three registry calls made per pulled item.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Fetches a pull-scoped bearer token for the repository.
    async fn fetch_token(
        &self,
        reference: &ImageReference,
        credentials: Option<&Credentials>,
    ) -> Result<String, RegistryError>;

    /// Fetches the manifest and returns its layer digests. An empty layer
    /// list is `RegistryError::EmptyManifest`.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        token: &str,
    ) -> Result<Vec<String>, RegistryError>;

    /// Streams one blob to completion.
    async fn fetch_layer(
        &self,
        reference: &ImageReference,
        digest: &str,
        token: &str,
    ) -> Result<LayerDigest, RegistryError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LayerDescriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct LegacyLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    layers: Option<Vec<LayerDescriptor>>,
    #[serde(rename = "fsLayers")]
    fs_layers: Option<Vec<LegacyLayer>>,
}

/// Layer digests from `layers[].digest`, or legacy `fsLayers[].blobSum`.
fn layer_digests(manifest: Manifest) -> Vec<String> {
    if let Some(layers) = manifest.layers {
        layers.into_iter().map(|l| l.digest).collect()
    } else if let Some(layers) = manifest.fs_layers {
        layers.into_iter().map(|l| l.blob_sum).collect()
    } else {
        Vec::new()
    }
}

/// Registry client on `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    client: Client,
    scheme: String,
}

impl HttpRegistryClient {
    /// Builds a client. `accept_invalid_certs` disables TLS verification for
    /// registries with self-signed certificates.
    pub fn new(accept_invalid_certs: bool) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RegistryError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            scheme: "https".to_string(),
        })
    }

    /// Talks plain HTTP instead of HTTPS.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn token_url(&self, reference: &ImageReference) -> String {
        format!(
            "{scheme}://{registry}/v2/auth?service={registry}&scope=repository:{repo}:pull",
            scheme = self.scheme,
            registry = reference.registry,
            repo = reference.repository
        )
    }

    pub fn manifest_url(&self, reference: &ImageReference) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme, reference.registry, reference.repository, reference.tag
        )
    }

    pub fn blob_url(&self, reference: &ImageReference, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            self.scheme, reference.registry, reference.repository, digest
        )
    }

    fn check_status(response: &reqwest::Response, url: &str) -> Result<(), RegistryError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RegistryError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

#[async_trait]
impl RegistryApi for HttpRegistryClient {
    async fn fetch_token(
        &self,
        reference: &ImageReference,
        credentials: Option<&Credentials>,
    ) -> Result<String, RegistryError> {
        let url = self.token_url(reference);
        let mut request = self.client.get(&url);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        Self::check_status(&response, &url)?;

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or(RegistryError::MissingToken(url))
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        token: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let url = self.manifest_url(reference);
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, MANIFEST_ACCEPT)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        debug!(reference = %reference, status = %response.status(), "Fetched manifest");
        Self::check_status(&response, &url)?;

        let manifest: Manifest = response.json().await?;
        let digests = layer_digests(manifest);
        if digests.is_empty() {
            return Err(RegistryError::EmptyManifest {
                reference: reference.to_string(),
            });
        }
        Ok(digests)
    }

    async fn fetch_layer(
        &self,
        reference: &ImageReference,
        digest: &str,
        token: &str,
    ) -> Result<LayerDigest, RegistryError> {
        let url = self.blob_url(reference, digest);
        let mut response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        Self::check_status(&response, &url)?;

        let mut hasher = Sha256::new();
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await? {
            bytes += chunk.len() as u64;
            hasher.update(&chunk);
        }

        Ok(LayerDigest {
            bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}
