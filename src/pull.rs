//! Pull session orchestration
//!
//! A [`PullSession`] scopes one end-to-end pull: it owns the remote (and
//! with it the auth state and HTTP clients) and the workspace for the
//! duration of the pull. Layers download sequentially in reverse manifest
//! order; any failure removes the workspace before the error is returned.

use crate::error::{PullError, Result};
use crate::image::{Reconstructor, Workspace};
use crate::logging::Logger;
use crate::manifest::{Manifest, SignedManifest};
use crate::digest::Digest;
use crate::registry::BlobUnpacker;
use crate::registry::client::{MANIFEST_V1_MEDIA_TYPES, Remote};
use futures_util::StreamExt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct PullSession {
    remote: Remote,
    logger: Logger,
    workspace_parent: Option<PathBuf>,
}

impl PullSession {
    pub fn new(remote: Remote, logger: Logger) -> Self {
        Self {
            remote,
            logger,
            workspace_parent: None,
        }
    }

    /// Create pull workspaces under a caller-chosen directory instead of
    /// the system temp directory.
    pub fn with_workspace_parent(mut self, parent: PathBuf) -> Self {
        self.workspace_parent = Some(parent);
        self
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// Pull the image from a v2 registry with a schema 1 manifest and
    /// reconstruct it into a loadable workspace.
    pub async fn pull(&self) -> Result<Workspace> {
        if !self.remote.ping().await? {
            return Err(PullError::Registry(
                "Docker registry v2 protocol is not supported by remote".to_string(),
            ));
        }

        // The probe may have cached a token without a repository scope,
        // which would 401 on the manifest request; start over.
        self.remote.clear_auth();

        let response = self.remote.get_manifest_bytes(MANIFEST_V1_MEDIA_TYPES).await?;
        let signed = SignedManifest::parse(&response.raw)?;
        let manifest = signed.verify(self.remote.reference())?;

        self.logger.step(&format!(
            "Pulling {} ({} layers)",
            self.remote.reference(),
            manifest.fs_layers.len()
        ));

        let workspace = match &self.workspace_parent {
            Some(parent) => Workspace::create_in(parent)?,
            None => Workspace::create()?,
        };
        match self.pull_layers(manifest, &workspace).await {
            Ok(()) => Ok(workspace),
            Err(e) => {
                let _ = workspace.delete();
                Err(e)
            }
        }
    }

    /// The v1 registry protocol is not supported; the flag exists for
    /// callers that want to force the old protocol and learn why not.
    pub async fn pull_v1(&self) -> Result<Workspace> {
        self.logger
            .warning("the v1 registry protocol was never implemented; only v2 pulls work");
        Err(PullError::NotImplemented(
            "pulling from a v1 registry is not implemented".to_string(),
        ))
    }

    async fn pull_layers(&self, manifest: &Manifest, workspace: &Workspace) -> Result<()> {
        let mut recon = Reconstructor::new(workspace);

        // Bottom layer first: the manifest lists the top layer at index 0
        for i in (0..manifest.fs_layers.len()).rev() {
            let blob_sum = &manifest.fs_layers[i].blob_sum;
            let v1_json = &manifest.history[i].v1_compatibility;

            let throwaway = recon.record_history(v1_json)?;
            if throwaway {
                self.logger
                    .detail(&format!("Skipping throw away layer: {}", blob_sum));
                continue;
            }

            let stage = recon.begin_layer()?;
            let diff_id = self.download_blob(blob_sum, &stage).await?;
            recon.complete_layer(stage, v1_json, diff_id, i == 0)?;
        }

        let image_id = recon.finalize(
            self.remote.reference(),
            &manifest.history[0].v1_compatibility,
        )?;
        self.logger
            .success(&format!("Pulled image {}", image_id.short()));
        Ok(())
    }

    /// Download one layer blob into `layer_dir/layer.tar`, verifying the
    /// compressed digest and returning the uncompressed DiffID.
    async fn download_blob(&self, blob_sum: &Digest, layer_dir: &Path) -> Result<Digest> {
        let (response, content_length) = self.remote.get_blob(blob_sum, &[]).await?;
        if content_length >= 0 {
            self.logger.detail(&format!(
                "Layer {}: {}",
                blob_sum.short(),
                self.logger.format_size(content_length as u64)
            ));
        }

        let target = layer_dir.join("layer.tar");
        let file = File::create(&target)
            .map_err(|e| PullError::Io(format!("failed to create tar file {}: {}", target.display(), e)))?;
        let mut unpacker = BlobUnpacker::new(BufWriter::new(file));

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            unpacker.write_all(&chunk)?;
        }
        let summary = unpacker.finish(blob_sum)?;

        self.logger.detail(&format!(
            "Downloaded layer {}, with blobsum {}",
            summary.diff_id.short(),
            blob_sum.short()
        ));
        Ok(summary.diff_id)
    }
}
