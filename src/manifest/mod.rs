//! Registry manifest parsing and verification
//!
//! Schema 1 manifests arrive wrapped in a JWS envelope. The digest a
//! canonical reference pins is computed over the *canonical* byte sequence
//! embedded in that envelope, not over the raw response body, so parsing
//! recovers it from the protected header of the first signature
//! (`formatLength` bytes of the payload plus the decoded `formatTail`).

use crate::digest::Digest;
use crate::error::{PullError, Result};
use crate::reference::ImageRef;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

pub const MEDIA_TYPE_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_SIGNED_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// One filesystem layer reference in a schema 1 manifest (top layer first)
#[derive(Debug, Clone, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

/// One history entry; `v1Compatibility` is an embedded JSON document
/// describing the layer's v1 image config.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// The unsigned schema 1 manifest view
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<HistoryEntry>,
}

/// A schema 1 manifest together with its raw and canonical byte forms
#[derive(Debug, Clone)]
pub struct SignedManifest {
    pub manifest: Manifest,
    pub raw: Vec<u8>,
    pub canonical: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct SignatureEnvelope {
    #[serde(default)]
    signatures: Vec<Signature>,
}

#[derive(Debug, Deserialize)]
struct Signature {
    protected: String,
}

#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
}

fn jose_decode(value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| PullError::Manifest(format!("invalid JWS base64: {}", e)))
}

impl SignedManifest {
    /// Parse raw manifest bytes, recovering the canonical payload from the
    /// JWS envelope when signatures are present.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(raw)
            .map_err(|e| PullError::Manifest(format!("failed to parse manifest: {}", e)))?;

        let envelope: SignatureEnvelope = serde_json::from_slice(raw)
            .map_err(|e| PullError::Manifest(format!("failed to parse manifest: {}", e)))?;

        let canonical = match envelope.signatures.first() {
            Some(signature) => {
                let protected: ProtectedHeader =
                    serde_json::from_slice(&jose_decode(&signature.protected)?).map_err(|e| {
                        PullError::Manifest(format!("invalid JWS protected header: {}", e))
                    })?;
                if protected.format_length > raw.len() {
                    return Err(PullError::Manifest(
                        "JWS formatLength exceeds manifest size".to_string(),
                    ));
                }
                let mut canonical = raw[..protected.format_length].to_vec();
                canonical.extend(jose_decode(&protected.format_tail)?);
                canonical
            }
            None => raw.to_vec(),
        };

        Ok(Self {
            manifest,
            raw: raw.to_vec(),
            canonical,
        })
    }

    /// Verify the manifest against the reference it was fetched for:
    /// canonical references must hash to their pinned digest, and the
    /// schema 1 structural invariants must hold.
    pub fn verify(&self, reference: &ImageRef) -> Result<&Manifest> {
        if let Some(expected) = reference.digest() {
            let computed = Digest::from_bytes(&self.canonical);
            if &computed != expected {
                return Err(PullError::Manifest(format!(
                    "image verification failed for digest {}",
                    expected
                )));
            }
        }

        let manifest = &self.manifest;
        if manifest.schema_version != 1 {
            return Err(PullError::Manifest(format!(
                "unsupported schema version {} for {}",
                manifest.schema_version, reference
            )));
        }
        if manifest.fs_layers.len() != manifest.history.len() {
            return Err(PullError::Manifest(format!(
                "length of history not equal to number of layers for {}",
                reference
            )));
        }
        if manifest.fs_layers.is_empty() {
            return Err(PullError::Manifest(format!(
                "no FSLayers in manifest for {}",
                reference
            )));
        }

        Ok(manifest)
    }
}

/// A blob descriptor in a schema 2 manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: i64,
    pub digest: Digest,
}

/// Schema 2 manifest; only the streaming producer handles these. The
/// reconstructor consumes schema 1 history and rejects this form.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestV2 {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ManifestV2 {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let manifest: ManifestV2 = serde_json::from_slice(raw)
            .map_err(|e| PullError::Manifest(format!("failed to parse manifest: {}", e)))?;
        if manifest.schema_version != 2 {
            return Err(PullError::Manifest(format!(
                "unsupported schema version {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }
}

/// A manifest response as fetched, before parsing
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub raw: Vec<u8>,
    pub content_type: String,
    pub docker_content_digest: Option<String>,
}
