//! Image reference parsing and digest pinning, following docker reference
//! normalization rules: bare names resolve to `index.docker.io/library/…`,
//! the default tag is `latest`, and Docker Hub API calls go through
//! `registry-1.docker.io`.

use std::fmt;

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidReference {
    #[error("image reference is empty")]
    Empty,

    #[error("image reference {0:?} has an empty repository")]
    EmptyRepository(String),

    #[error("image reference {0:?} has an empty tag")]
    EmptyTag(String),

    #[error("invalid digest {0:?}")]
    Digest(String),
}

// === impl ImageRef ===

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, InvalidReference> {
        if reference.is_empty() {
            return Err(InvalidReference::Empty);
        }

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(digest)?;
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (registry, remainder) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                let registry = if first == "docker.io" {
                    DEFAULT_REGISTRY.to_string()
                } else {
                    first.to_string()
                };
                (registry, remainder)
            }
            _ => (DEFAULT_REGISTRY.to_string(), rest),
        };

        // The tag separator is the last ':' after the last path separator so
        // that registry ports are never mistaken for tags.
        let last_slash = remainder.rfind('/');
        let (repository, tag) = match remainder.rfind(':') {
            Some(idx) if last_slash.map_or(true, |slash| idx > slash) => {
                let (repo, tag) = remainder.split_at(idx);
                let tag = &tag[1..];
                if tag.is_empty() {
                    return Err(InvalidReference::EmptyTag(reference.to_string()));
                }
                (repo.to_string(), Some(tag.to_string()))
            }
            _ => (remainder.to_string(), None),
        };

        if repository.is_empty() {
            return Err(InvalidReference::EmptyRepository(reference.to_string()));
        }

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The host queried for the distribution API; Docker Hub references are
    /// served by a different host than the one in their canonical name.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The manifest reference used to fetch this image: a digest when pinned,
    /// otherwise the tag.
    pub fn manifest_reference(&self) -> &str {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest,
            (None, Some(tag)) => tag,
            (None, None) => DEFAULT_TAG,
        }
    }

    /// Rewrites this reference into its digest-pinned form. References that
    /// already carry a digest are returned unchanged; tagged references keep
    /// their tag so the origin of the pin stays readable.
    pub fn pinned(&self, digest: &str) -> String {
        if self.digest.is_some() {
            self.to_string()
        } else {
            format!("{self}@{digest}")
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
            (None, Some(tag)) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            (None, None) => write!(f, "{}/{}:{}", self.registry, self.repository, DEFAULT_TAG),
        }
    }
}

fn validate_digest(digest: &str) -> Result<(), InvalidReference> {
    let invalid = || InvalidReference::Digest(digest.to_string());
    let (algorithm, hex) = digest.split_once(':').ok_or_else(invalid)?;
    if algorithm.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    if algorithm == "sha256" && hex.len() != 64 {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:45b23dee08af5e43a7fea6c4cf9c25ccf269ee113168c19722f87876677c5cb2";

    #[test]
    fn bare_name_normalizes_to_docker_hub() {
        let r = ImageRef::parse("ubuntu").expect("must parse");
        assert_eq!(r.registry(), "index.docker.io");
        assert_eq!(r.api_host(), "registry-1.docker.io");
        assert_eq!(r.repository(), "library/ubuntu");
        assert_eq!(r.to_string(), "index.docker.io/library/ubuntu:latest");
    }

    #[test]
    fn docker_io_aliases_index() {
        let r = ImageRef::parse("docker.io/library/ubuntu:20.04").expect("must parse");
        assert_eq!(r.to_string(), "index.docker.io/library/ubuntu:20.04");
    }

    #[test]
    fn registry_with_port_keeps_tag_separate() {
        let r = ImageRef::parse("localhost:5000/app").expect("must parse");
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.api_host(), "localhost:5000");
        assert_eq!(r.repository(), "app");
        assert_eq!(r.to_string(), "localhost:5000/app:latest");

        let r = ImageRef::parse("localhost:5000/team/app:v2").expect("must parse");
        assert_eq!(r.repository(), "team/app");
        assert_eq!(r.manifest_reference(), "v2");
    }

    #[test]
    fn digest_reference_is_already_pinned() {
        let r = ImageRef::parse(&format!("ghcr.io/org/app@{DIGEST}")).expect("must parse");
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.manifest_reference(), DIGEST);
        assert_eq!(r.pinned(DIGEST), format!("ghcr.io/org/app@{DIGEST}"));
    }

    #[test]
    fn tagged_reference_pins_with_tag_preserved() {
        let r = ImageRef::parse("ubuntu:20.04").expect("must parse");
        assert_eq!(
            r.pinned(DIGEST),
            format!("index.docker.io/library/ubuntu:20.04@{DIGEST}"),
        );
    }

    #[test]
    fn tag_and_digest_prefers_digest() {
        let r = ImageRef::parse(&format!("ubuntu:20.04@{DIGEST}")).expect("must parse");
        assert_eq!(r.manifest_reference(), DIGEST);
        assert_eq!(
            r.to_string(),
            format!("index.docker.io/library/ubuntu@{DIGEST}"),
        );
    }

    #[test]
    fn rejects_malformed_references() {
        assert_eq!(ImageRef::parse(""), Err(InvalidReference::Empty));
        assert!(matches!(
            ImageRef::parse("ubuntu@sha256:abc"),
            Err(InvalidReference::Digest(_)),
        ));
        assert!(matches!(
            ImageRef::parse("ubuntu:"),
            Err(InvalidReference::EmptyTag(_)),
        ));
        assert!(matches!(
            ImageRef::parse("ghcr.io/"),
            Err(InvalidReference::EmptyRepository(_)),
        ));
    }
}
