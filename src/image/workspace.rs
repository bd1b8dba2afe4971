//! Per-pull workspace directory
//!
//! Each pull owns a freshly created temporary directory. Once finalized it
//! is a valid image archive directory for a container runtime's image
//! loader:
//!
//! ```text
//! <workspace>/
//!   <imageID-hex>.json
//!   repositories
//!   manifest.json
//!   <v1LayerID-hex>/{VERSION,json,layer.tar}
//! ```
//!
//! The workspace is destroyed on completion, success or failure; a
//! half-finished workspace must never leak.

use crate::digest::Digest;
use crate::error::{PullError, Result};
use crate::reference::ImageRef;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const LAYER_VERSION: &str = "1.0";

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

/// One entry of the top-level `manifest.json` array
#[derive(Debug, Serialize)]
struct ManifestItem {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

impl Workspace {
    /// Create a workspace under the system temp directory
    pub fn create() -> Result<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    /// Create a workspace under a caller-chosen parent directory
    pub fn create_in(parent: &Path) -> Result<Self> {
        let root = parent.join(format!("image-pull-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&root)
            .map_err(|e| PullError::Io(format!("Failed to create workspace: {}", e)))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Stage directory for one in-flight layer. Layers are assembled here
    /// because the v1 layer id is not known until the blob has streamed.
    pub fn stage_layer_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join(format!("tmp_layer_{}", Uuid::new_v4().simple()));
        fs::create_dir(&dir)?;
        Ok(dir)
    }

    /// Move a completed stage directory to its final id-named location
    pub fn commit_layer_dir(&self, stage_dir: &Path, v1_id: &Digest) -> Result<PathBuf> {
        let layer_dir = self.root.join(v1_id.hex());
        fs::rename(stage_dir, &layer_dir)?;
        Ok(layer_dir)
    }

    pub fn delete(&self) -> Result<()> {
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }

    /// Write `<imageID-hex>.json` with the computed image config bytes
    pub fn write_config_file(&self, image_id: &Digest, config: &[u8]) -> Result<()> {
        let filename = self.root.join(format!("{}.json", image_id.hex()));
        fs::write(filename, config)?;
        Ok(())
    }

    /// Write the `repositories` index; requires a tagged reference
    pub fn write_repositories_file(&self, reference: &ImageRef, image_id: &Digest) -> Result<()> {
        let tag = reference.tag().ok_or_else(|| {
            PullError::Validation(format!("Reference is not tagged: {}", reference))
        })?;

        let repositories = serde_json::json!({
            reference.name(): { tag: image_id.hex() }
        });
        fs::write(
            self.root.join("repositories"),
            serde_json::to_vec(&repositories)?,
        )?;
        Ok(())
    }

    /// Write the one-element `manifest.json` array. `layer_v1_ids` is in
    /// bottom-up order, which is the order loaders apply layers in.
    pub fn write_manifest_file(
        &self,
        reference: &ImageRef,
        image_id: &Digest,
        layer_v1_ids: &[Digest],
    ) -> Result<()> {
        let layers = layer_v1_ids
            .iter()
            .map(|id| format!("{}/layer.tar", id.hex()))
            .collect();

        let item = ManifestItem {
            config: format!("{}.json", image_id.hex()),
            repo_tags: vec![reference.to_string()],
            layers,
        };
        fs::write(
            self.root.join("manifest.json"),
            serde_json::to_vec(&[item])?,
        )?;
        Ok(())
    }
}
