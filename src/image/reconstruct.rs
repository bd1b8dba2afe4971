//! Reconstruction of the v1 on-disk export from schema 1 manifest layers
//!
//! The driver (direct pull or stream consumer) walks the manifest's
//! FSLayers in reverse, bottom layer first, and feeds each layer through
//! the [`Reconstructor`]. Invariants carried across iterations: the
//! accumulated history, the rootfs chain, the previous non-throwaway
//! layer's id, and the bottom-up list of v1 layer ids for `manifest.json`.

use crate::digest::Digest;
use crate::error::{PullError, Result};
use crate::image::v1::{
    self, ImageHistory, RootFs, V1Image, create_id, history_from_config,
    make_config_from_v1_config,
};
use crate::image::workspace::{LAYER_VERSION, Workspace};
use crate::reference::ImageRef;
use std::fs;
use std::path::PathBuf;

pub struct Reconstructor<'a> {
    workspace: &'a Workspace,
    rootfs: RootFs,
    history: Vec<ImageHistory>,
    parent: Option<Digest>,
    layer_v1_ids: Vec<Digest>,
}

impl<'a> Reconstructor<'a> {
    pub fn new(workspace: &'a Workspace) -> Self {
        Self {
            workspace,
            rootfs: RootFs::new(),
            history: Vec::new(),
            parent: None,
            layer_v1_ids: Vec::new(),
        }
    }

    /// Record one layer's history entry. Returns true when the layer is a
    /// throwaway: it contributes history but owns no blob content, so the
    /// caller skips the download and the disk writes for it.
    pub fn record_history(&mut self, v1_json: &str) -> Result<bool> {
        let throwaway = v1::is_throwaway(v1_json)?;
        self.history.push(history_from_config(v1_json, throwaway)?);
        Ok(throwaway)
    }

    /// Stage directory for the layer about to be downloaded
    pub fn begin_layer(&self) -> Result<PathBuf> {
        self.workspace.stage_layer_dir()
    }

    /// Finish one non-throwaway layer: write its VERSION and v1 config,
    /// derive the synthetic v1 id, and move the stage directory into place.
    /// `is_top` marks the manifest's first FSLayer (processed last), whose
    /// full v1 config seeds the id derivation.
    pub fn complete_layer(
        &mut self,
        stage_dir: PathBuf,
        v1_json: &str,
        diff_id: Digest,
        is_top: bool,
    ) -> Result<()> {
        fs::write(stage_dir.join("VERSION"), LAYER_VERSION)?;

        // The rootfs must contain this layer before the chain id is taken
        self.rootfs.append(diff_id);
        let chain_id = self.rootfs.chain_id().ok_or_else(|| {
            PullError::Validation("rootfs chain is empty after appending a layer".to_string())
        })?;

        let mut v1_image = if is_top {
            serde_json::from_str::<V1Image>(v1_json)?
        } else {
            V1Image::default()
        };

        let v1_id = create_id(&v1_image, &chain_id, self.parent.as_ref())?;
        v1_image.id = v1_id.hex().to_string();
        if let Some(parent) = &self.parent {
            v1_image.parent = parent.hex().to_string();
        }
        fs::write(stage_dir.join("json"), serde_json::to_vec(&v1_image)?)?;

        self.workspace.commit_layer_dir(&stage_dir, &v1_id)?;

        self.layer_v1_ids.push(v1_id.clone());
        self.parent = Some(v1_id);
        Ok(())
    }

    /// Number of layers committed so far
    pub fn layer_count(&self) -> usize {
        self.layer_v1_ids.len()
    }

    /// Write the image config, `repositories`, and `manifest.json`.
    /// `top_v1_json` is the manifest's History[0] entry. Returns the
    /// computed image id.
    pub fn finalize(self, reference: &ImageRef, top_v1_json: &str) -> Result<Digest> {
        let config = make_config_from_v1_config(top_v1_json, &self.rootfs, &self.history)?;
        let image_id = Digest::from_bytes(&config);

        self.workspace.write_config_file(&image_id, &config)?;
        self.workspace
            .write_repositories_file(reference, &image_id)?;
        self.workspace
            .write_manifest_file(reference, &image_id, &self.layer_v1_ids)?;

        Ok(image_id)
    }
}
