//! Registry credential assembly from kubernetes pull secrets.
//!
//! The keychain merges the docker config payloads of the intent's direct pull
//! secrets and the service account's attached pull secrets. Unreadable or
//! wrongly-typed secrets are tolerated so that one stale secret does not take
//! down image resolution for an entire namespace.

use conventions_controller_k8s_api::{Api, Client, Secret};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
pub const DOCKER_CFG_TYPE: &str = "kubernetes.io/dockercfg";

pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
pub const DOCKER_CFG_KEY: &str = ".dockercfg";

#[derive(Clone, Debug, Default)]
pub struct Keychain {
    auths: HashMap<String, BasicAuth>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    username: Option<String>,

    #[serde(default)]
    password: Option<String>,

    /// base64 of `username:password`; takes precedence when present.
    #[serde(default)]
    auth: Option<String>,
}

// === impl Keychain ===

impl Keychain {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads the named pull secrets and merges their registry credentials.
    /// The first secret to provide credentials for a registry wins. Missing
    /// secrets and secrets of an unexpected type are skipped with a warning.
    pub async fn load(
        client: &Client,
        namespace: &str,
        secret_names: &[String],
    ) -> Result<Self, kube::Error> {
        let api = Api::<Secret>::namespaced(client.clone(), namespace);
        let mut payloads = Vec::with_capacity(secret_names.len());
        for name in secret_names {
            let secret = match api.get_opt(name).await? {
                Some(secret) => secret,
                None => {
                    warn!(%namespace, secret = %name, "Pull secret not found");
                    continue;
                }
            };
            match docker_config_payload(&secret) {
                Some(payload) => payloads.push(payload),
                None => {
                    warn!(
                        %namespace,
                        secret = %name,
                        type_ = secret.type_.as_deref().unwrap_or(""),
                        "Pull secret does not carry a docker config payload",
                    );
                }
            }
        }
        Ok(Self::from_docker_configs(payloads.iter().map(Vec::as_slice)))
    }

    /// Builds a keychain from raw docker config payloads. Undecodable
    /// payloads or entries are skipped with a warning.
    pub fn from_docker_configs<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut auths = HashMap::new();
        for payload in payloads {
            let config = match serde_json::from_slice::<DockerConfig>(payload) {
                Ok(config) => config,
                // Legacy .dockercfg payloads are a bare auth map.
                Err(_) => match serde_json::from_slice::<HashMap<String, DockerAuthEntry>>(payload)
                {
                    Ok(legacy) => DockerConfig { auths: legacy },
                    Err(error) => {
                        warn!(%error, "Skipping undecodable docker config payload");
                        continue;
                    }
                },
            };
            for (registry, entry) in config.auths {
                let Some(auth) = entry.into_basic_auth() else {
                    warn!(%registry, "Skipping docker config entry without credentials");
                    continue;
                };
                auths.entry(normalize_registry(&registry)).or_insert(auth);
            }
        }
        Self { auths }
    }

    /// Looks up credentials for a registry host, tolerating the common
    /// docker.io aliases and scheme-qualified keys.
    pub fn resolve(&self, registry: &str) -> Option<&BasicAuth> {
        self.auths.get(&normalize_registry(registry))
    }

    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }
}

// === impl DockerAuthEntry ===

impl DockerAuthEntry {
    fn into_basic_auth(self) -> Option<BasicAuth> {
        if let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            use base64::Engine as _;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth.as_bytes())
                .ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            return Some(BasicAuth {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        match (self.username, self.password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(BasicAuth {
                username,
                password,
            }),
            _ => None,
        }
    }
}

fn docker_config_payload(secret: &Secret) -> Option<Vec<u8>> {
    let data = secret.data.as_ref()?;
    let key = match secret.type_.as_deref() {
        Some(DOCKER_CONFIG_JSON_TYPE) => DOCKER_CONFIG_JSON_KEY,
        Some(DOCKER_CFG_TYPE) => DOCKER_CFG_KEY,
        _ => return None,
    };
    data.get(key).map(|bytes| bytes.0.clone())
}

/// Collapses the registry spellings seen in docker configs onto a single key:
/// scheme and trailing slashes are stripped, the hub's legacy v1 endpoint and
/// its hostname variants collapse to `index.docker.io`.
fn normalize_registry(registry: &str) -> String {
    let mut host = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    host = host.trim_end_matches('/');
    host = host.strip_suffix("/v1").unwrap_or(host);
    host = host.strip_suffix("/v2").unwrap_or(host);
    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            "index.docker.io".to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_username_password_entries() {
        let payload = br#"{"auths": {"ghcr.io": {"username": "bot", "password": "hunter2"}}}"#;
        let keychain = Keychain::from_docker_configs([payload.as_slice()]);
        assert_eq!(
            keychain.resolve("ghcr.io"),
            Some(&BasicAuth {
                username: "bot".to_string(),
                password: "hunter2".to_string(),
            }),
        );
    }

    #[test]
    fn auth_field_takes_precedence() {
        // base64("user:pass")
        let payload =
            br#"{"auths": {"ghcr.io": {"username": "x", "password": "y", "auth": "dXNlcjpwYXNz"}}}"#;
        let keychain = Keychain::from_docker_configs([payload.as_slice()]);
        assert_eq!(
            keychain.resolve("ghcr.io"),
            Some(&BasicAuth {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
        );
    }

    #[test]
    fn docker_hub_aliases_resolve() {
        let payload =
            br#"{"auths": {"https://index.docker.io/v1/": {"username": "bot", "password": "pw"}}}"#;
        let keychain = Keychain::from_docker_configs([payload.as_slice()]);
        for alias in ["docker.io", "index.docker.io", "registry-1.docker.io"] {
            assert!(keychain.resolve(alias).is_some(), "alias {alias}");
        }
        assert!(keychain.resolve("ghcr.io").is_none());
    }

    #[test]
    fn first_secret_wins_per_registry() {
        let a = br#"{"auths": {"ghcr.io": {"username": "first", "password": "pw"}}}"#;
        let b = br#"{"auths": {"ghcr.io": {"username": "second", "password": "pw"}}}"#;
        let keychain = Keychain::from_docker_configs([a.as_slice(), b.as_slice()]);
        assert_eq!(keychain.resolve("ghcr.io").unwrap().username, "first");
    }

    #[test]
    fn legacy_dockercfg_payload_is_accepted() {
        let payload = br#"{"quay.io": {"username": "bot", "password": "pw"}}"#;
        let keychain = Keychain::from_docker_configs([payload.as_slice()]);
        assert!(keychain.resolve("quay.io").is_some());
    }

    #[test]
    fn garbage_payloads_are_skipped() {
        let keychain = Keychain::from_docker_configs([b"not json".as_slice()]);
        assert!(keychain.is_empty());
    }
}
