//! Image reference parsing
//!
//! Accepts `docker://` image URIs and resolves them to a canonical
//! [`ImageRef`]. The format can vary: there may be a host and there may be a
//! namespace, both optional, but a host cannot appear without a namespace
//! segment (an empty namespace segment is allowed for registries whose
//! repositories live at the top level). Valid shapes:
//!
//!   host/namespace/image[:tag]
//!   namespace/image[:tag]
//!   image[:tag]
//!
//! any of which may instead pin a digest with `@sha256:...`.

use crate::digest::Digest;
use crate::error::{PullError, Result};
use std::fmt;

pub const URI_SCHEME: &str = "docker://";
pub const DEFAULT_HOSTNAME: &str = "index.docker.io";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// A parsed docker:// image coordinate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    hostname: String,
    namespace: String,
    image: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageRef {
    /// Parse a `docker://` image URI, applying hostname/namespace/tag defaults
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix(URI_SCHEME).ok_or_else(|| {
            PullError::Validation("invalid image uri - expected docker:// prefix".to_string())
        })?;

        let (rest, digest) = match rest.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (rest, None),
        };

        // A ':' only separates a tag when it comes after the last path
        // separator, so hostnames with ports still parse.
        let (name, tag) = match rest.rfind(':') {
            Some(pos) if pos > rest.rfind('/').unwrap_or(0) => {
                (&rest[..pos], Some(rest[pos + 1..].to_string()))
            }
            _ => (rest, None),
        };

        let parts: Vec<&str> = name.split('/').collect();
        let (hostname, namespace, image) = match parts.as_slice() {
            [image] => (DEFAULT_HOSTNAME, DEFAULT_NAMESPACE, *image),
            [namespace, image] => (DEFAULT_HOSTNAME, *namespace, *image),
            [hostname, namespace, image] => (*hostname, *namespace, *image),
            _ => {
                return Err(PullError::Validation(
                    "invalid image uri - expected less than 3 separators (/)".to_string(),
                ));
            }
        };

        if image.is_empty() || hostname.is_empty() {
            return Err(PullError::Validation(format!("invalid image uri: {}", uri)));
        }
        if let Some(tag) = &tag {
            if tag.is_empty() {
                return Err(PullError::Validation(format!("invalid image uri: {}", uri)));
            }
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            hostname: hostname.to_string(),
            namespace: namespace.to_string(),
            image: image.to_string(),
            tag,
            digest,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// True when the reference pins a digest rather than a mutable tag
    pub fn is_canonical(&self) -> bool {
        self.digest.is_some()
    }

    pub fn is_tagged(&self) -> bool {
        self.tag.is_some()
    }

    /// The `manifests/{...}` path element: the pinned digest for canonical
    /// references, the tag otherwise.
    pub fn manifest_reference(&self) -> String {
        match &self.digest {
            Some(digest) => digest.to_string(),
            None => self
                .tag
                .clone()
                .unwrap_or_else(|| DEFAULT_TAG.to_string()),
        }
    }

    /// Repository path used in registry URLs and auth scopes, e.g.
    /// `library/redis`, or just `redis` when the namespace is empty.
    pub fn repository_path(&self) -> String {
        if self.namespace.is_empty() {
            self.image.clone()
        } else {
            format!("{}/{}", self.namespace, self.image)
        }
    }

    /// Pull scope for the registry token protocol
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository_path())
    }

    /// The familiar image name, omitting the default hostname and namespace
    pub fn name(&self) -> String {
        let mut name = self.image.clone();
        if self.namespace != DEFAULT_NAMESPACE {
            name = if self.namespace.is_empty() {
                name
            } else {
                format!("{}/{}", self.namespace, name)
            };
        }
        if self.hostname != DEFAULT_HOSTNAME {
            name = format!("{}/{}", self.hostname, name);
        }
        name
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => write!(f, "{}@{}", self.name(), digest),
            (None, Some(tag)) => write!(f, "{}:{}", self.name(), tag),
            (None, None) => write!(f, "{}", self.name()),
        }
    }
}
