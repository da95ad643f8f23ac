//! A minimal OCI distribution client: token-authenticated manifest and blob
//! fetches with digest verification, sufficient to resolve image configs and
//! SBOM layers. Mirrors the behavior of go-containerregistry's `remote`
//! package as exercised by the reconciler: anonymous first, then the
//! registry's auth challenge, with tag-to-digest resolution through the
//! manifest (or a platform manifest picked out of an index).

use crate::cache::BlobCache;
use crate::image::ImageRef;
use crate::registry::Keychain;
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

const TARGET_OS: &str = "linux";
const TARGET_ARCH: &str = "amd64";

#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status} fetching {what}")]
    Status { status: StatusCode, what: String },

    #[error("failed to parse {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("manifest list has no {TARGET_OS}/{TARGET_ARCH} manifest")]
    NoPlatformManifest,

    #[error("auth challenge {0:?} is not supported")]
    UnsupportedChallenge(String),
}

pub struct RegistryClient {
    http: reqwest::Client,
    keychain: Keychain,
    // Bearer tokens scoped per repository, held for the reconciliation.
    tokens: Mutex<HashMap<String, String>>,
}

/// A manifest resolved to a concrete image: its (computed) manifest digest,
/// the manifest itself, and the decoded image config.
#[derive(Clone, Debug)]
pub struct ResolvedImage {
    pub digest: String,
    pub manifest: ImageManifest,
    pub config: ImageConfiguration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,

    #[serde(default)]
    access_token: Option<String>,
}

// === impl RegistryClient ===

impl RegistryClient {
    pub fn new(http: reqwest::Client, keychain: Keychain) -> Self {
        Self {
            http,
            keychain,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a reference to its manifest and config, pinning tags to the
    /// manifest digest along the way.
    pub async fn resolve(
        &self,
        image: &ImageRef,
        cache: Option<&BlobCache>,
    ) -> Result<ResolvedImage, OciError> {
        let (bytes, digest) = self.fetch_manifest(image).await?;
        let manifest: ImageManifest =
            serde_json::from_slice(&bytes).map_err(|source| OciError::Parse {
                what: "image manifest",
                source,
            })?;

        let config_bytes = self
            .blob(image, manifest.config().digest().as_str(), cache)
            .await?;
        let config: ImageConfiguration =
            serde_json::from_slice(&config_bytes).map_err(|source| OciError::Parse {
                what: "image config",
                source,
            })?;

        Ok(ResolvedImage {
            digest,
            manifest,
            config,
        })
    }

    /// Fetches a blob, preferring the content-addressed cache. Fetched bytes
    /// are digest-verified before they are returned or cached.
    pub async fn blob(
        &self,
        image: &ImageRef,
        digest: &str,
        cache: Option<&BlobCache>,
    ) -> Result<Vec<u8>, OciError> {
        if let Some(cache) = cache {
            if let Some(bytes) = cache.get(digest).await {
                debug!(%digest, "Blob cache hit");
                return Ok(bytes);
            }
        }

        let url = format!(
            "https://{}/v2/{}/blobs/{}",
            image.api_host(),
            image.repository(),
            digest,
        );
        let rsp = self.authenticated_get(image, &url, None).await?;
        if !rsp.status().is_success() {
            return Err(OciError::Status {
                status: rsp.status(),
                what: url,
            });
        }
        let bytes = rsp.bytes().await?.to_vec();

        let computed = sha256_digest(&bytes);
        if computed != digest {
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                computed,
            });
        }

        if let Some(cache) = cache {
            if let Err(error) = cache.put(digest, &bytes).await {
                warn!(%error, %digest, "Failed to write blob cache");
            }
        }
        Ok(bytes)
    }

    /// Fetches the manifest for the reference, resolving a manifest list to
    /// its `linux/amd64` entry. Returns the manifest bytes and their digest.
    async fn fetch_manifest(&self, image: &ImageRef) -> Result<(Vec<u8>, String), OciError> {
        let mut reference = image.manifest_reference().to_string();
        // A reference resolves through at most one level of index.
        for _ in 0..2 {
            let url = format!(
                "https://{}/v2/{}/manifests/{}",
                image.api_host(),
                image.repository(),
                reference,
            );
            let rsp = self.authenticated_get(image, &url, Some(MANIFEST_ACCEPT)).await?;
            if !rsp.status().is_success() {
                return Err(OciError::Status {
                    status: rsp.status(),
                    what: url,
                });
            }
            let bytes = rsp.bytes().await?.to_vec();

            if !is_index(&bytes) {
                let digest = sha256_digest(&bytes);
                return Ok((bytes, digest));
            }

            let index: ImageIndex =
                serde_json::from_slice(&bytes).map_err(|source| OciError::Parse {
                    what: "image index",
                    source,
                })?;
            reference = select_platform_manifest(&index)?.to_string();
        }
        Err(OciError::NoPlatformManifest)
    }

    async fn authenticated_get(
        &self,
        image: &ImageRef,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, OciError> {
        let scope = format!("{}/{}", image.api_host(), image.repository());

        let mut req = self.http.get(url);
        if let Some(accept) = accept {
            req = req.header(ACCEPT, accept);
        }
        let token = self.tokens.lock().get(&scope).cloned();
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let rsp = req.send().await?;
        if rsp.status() != StatusCode::UNAUTHORIZED {
            return Ok(rsp);
        }

        let challenge = rsp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let auth = self.keychain.resolve(image.registry());

        if let Some(bearer) = BearerChallenge::parse(&challenge) {
            let token = self.fetch_token(&bearer, image, auth).await?;
            self.tokens.lock().insert(scope, token.clone());

            let mut req = self.http.get(url).bearer_auth(token);
            if let Some(accept) = accept {
                req = req.header(ACCEPT, accept);
            }
            return Ok(req.send().await?);
        }

        if challenge.trim_start().to_ascii_lowercase().starts_with("basic") {
            if let Some(auth) = auth {
                let mut req = self
                    .http
                    .get(url)
                    .basic_auth(&auth.username, Some(&auth.password));
                if let Some(accept) = accept {
                    req = req.header(ACCEPT, accept);
                }
                return Ok(req.send().await?);
            }
        }

        Err(OciError::UnsupportedChallenge(challenge))
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        image: &ImageRef,
        auth: Option<&crate::registry::BasicAuth>,
    ) -> Result<String, OciError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", image.repository()));

        let mut req = self.http.get(&challenge.realm).query(&[("scope", scope)]);
        if let Some(service) = &challenge.service {
            req = req.query(&[("service", service)]);
        }
        if let Some(auth) = auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }

        let rsp = req.send().await?;
        if !rsp.status().is_success() {
            return Err(OciError::Status {
                status: rsp.status(),
                what: format!("token from {}", challenge.realm),
            });
        }
        let token: TokenResponse = rsp.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| OciError::UnsupportedChallenge("empty token response".to_string()))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

// === impl BearerChallenge ===

impl BearerChallenge {
    /// Parses a `WWW-Authenticate: Bearer realm="…",service="…",scope="…"`
    /// header value.
    fn parse(header: &str) -> Option<Self> {
        let params = header.trim_start();
        let params = params
            .strip_prefix("Bearer ")
            .or_else(|| params.strip_prefix("bearer "))?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for part in params.split(',') {
            let (key, value) = part.trim().split_once('=')?;
            let value = value.trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn is_index(bytes: &[u8]) -> bool {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(default, rename = "mediaType")]
        media_type: Option<String>,

        #[serde(default)]
        manifests: Option<serde_json::Value>,
    }
    match serde_json::from_slice::<Probe>(bytes) {
        Ok(probe) => {
            probe.manifests.is_some()
                || probe
                    .media_type
                    .map(|m| m.contains("image.index") || m.contains("manifest.list"))
                    .unwrap_or(false)
        }
        Err(_) => false,
    }
}

fn select_platform_manifest(index: &ImageIndex) -> Result<&str, OciError> {
    for descriptor in index.manifests() {
        match descriptor.platform() {
            Some(platform)
                if platform.os().to_string() == TARGET_OS
                    && platform.architecture().to_string() == TARGET_ARCH =>
            {
                return Ok(descriptor.digest().as_str());
            }
            None => return Ok(descriptor.digest().as_str()),
            Some(_) => {}
        }
    }
    Err(OciError::NoPlatformManifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/ubuntu:pull""#,
        )
        .expect("must parse");
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/ubuntu:pull"),
        );
    }

    #[test]
    fn basic_challenge_is_not_bearer() {
        assert!(BearerChallenge::parse(r#"Basic realm="registry""#).is_none());
    }

    #[test]
    fn computes_prefixed_sha256() {
        assert_eq!(
            sha256_digest(b"foo"),
            "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
        );
    }

    #[test]
    fn sniffs_manifest_lists() {
        assert!(is_index(br#"{"manifests": []}"#));
        assert!(is_index(
            br#"{"mediaType": "application/vnd.docker.distribution.manifest.list.v2+json"}"#
        ));
        assert!(!is_index(
            br#"{"mediaType": "application/vnd.oci.image.manifest.v1+json", "layers": []}"#
        ));
    }

    #[test]
    fn selects_amd64_linux_from_index() {
        let index: ImageIndex = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                    "size": 100,
                    "platform": {"os": "linux", "architecture": "arm64"},
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                    "size": 100,
                    "platform": {"os": "linux", "architecture": "amd64"},
                },
            ],
        }))
        .expect("must parse");
        assert_eq!(
            select_platform_manifest(&index).expect("platform"),
            "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        );
    }
}
