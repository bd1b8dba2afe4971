//! Pull-to-stream mode
//!
//! The producer serializes one image into a single tar stream: first an
//! entry named `_manifest.json` holding the raw manifest bytes, then one
//! entry per layer blob, named by its blob sum, in *reverse* manifest order.
//! That is exactly the order the consumer reconstructs in, so the consumer
//! can run the same reconstructor without seeking.
//!
//! The producer runs on the fetching side and writes into any `AsyncWrite`
//! (a pipe, stdout). On error the writer is dropped mid-entry, so the
//! consumer observes a short read and fails. The consumer is synchronous
//! and needs no network access.

use crate::digest::Digest;
use crate::error::{PullError, Result};
use crate::image::{Reconstructor, Workspace};
use crate::logging::Logger;
use crate::manifest::{MEDIA_TYPE_MANIFEST_V2, Manifest, ManifestV2, SignedManifest};
use crate::reference::ImageRef;
use crate::registry::BlobUnpacker;
use crate::registry::client::{MANIFEST_ALL_MEDIA_TYPES, Remote};
use futures_util::StreamExt;
use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};

pub const MANIFEST_FILE_NAME: &str = "_manifest.json";

const TAR_BLOCK_SIZE: u64 = 512;

async fn write_tar_header<W: AsyncWrite + Unpin>(out: &mut W, name: &str, size: u64) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header
        .set_path(name)
        .map_err(|e| PullError::Io(format!("invalid tar entry name {}: {}", name, e)))?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    out.write_all(header.as_bytes()).await?;
    Ok(())
}

async fn write_tar_padding<W: AsyncWrite + Unpin>(out: &mut W, size: u64) -> Result<()> {
    let remainder = size % TAR_BLOCK_SIZE;
    if remainder != 0 {
        let padding = vec![0u8; (TAR_BLOCK_SIZE - remainder) as usize];
        out.write_all(&padding).await?;
    }
    Ok(())
}

/// Serialize the remote's image (manifest, then blobs in reverse manifest
/// order) into `out`.
pub async fn produce<W: AsyncWrite + Unpin>(
    remote: &Remote,
    logger: &Logger,
    out: &mut W,
) -> Result<()> {
    if !remote.ping().await? {
        return Err(PullError::Registry(
            "Docker registry v2 protocol is not supported by remote".to_string(),
        ));
    }
    // The probe's token has no repository scope; re-authenticate for pull
    remote.clear_auth();

    let response = remote.get_manifest_bytes(MANIFEST_ALL_MEDIA_TYPES).await?;

    write_tar_header(out, MANIFEST_FILE_NAME, response.raw.len() as u64).await?;
    out.write_all(&response.raw).await?;
    write_tar_padding(out, response.raw.len() as u64).await?;

    // Layer digests in the order they go on the wire: reverse manifest order
    let blob_sums: Vec<Digest> = if response.content_type == MEDIA_TYPE_MANIFEST_V2 {
        let manifest = ManifestV2::parse(&response.raw)?;
        manifest.layers.iter().rev().map(|l| l.digest.clone()).collect()
    } else {
        let signed = SignedManifest::parse(&response.raw)?;
        signed
            .manifest
            .fs_layers
            .iter()
            .rev()
            .map(|l| l.blob_sum.clone())
            .collect()
    };

    for blob_sum in &blob_sums {
        write_blob_entry(remote, logger, out, blob_sum).await?;
    }

    // End-of-archive marker
    out.write_all(&[0u8; 2 * TAR_BLOCK_SIZE as usize]).await?;
    out.flush().await?;
    Ok(())
}

async fn write_blob_entry<W: AsyncWrite + Unpin>(
    remote: &Remote,
    logger: &Logger,
    out: &mut W,
    blob_sum: &Digest,
) -> Result<()> {
    let (response, content_length) = remote.get_blob(blob_sum, &[]).await?;
    if content_length < 0 {
        // Tar headers need the size up front; there is no way to frame an
        // entry of unknown length.
        return Err(PullError::Registry(format!(
            "blob {} response carried no Content-Length",
            blob_sum
        )));
    }

    logger.detail(&format!(
        "Streaming layer {} ({} bytes)",
        blob_sum.short(),
        content_length
    ));
    write_tar_header(out, &blob_sum.to_string(), content_length as u64).await?;

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    if written != content_length as u64 {
        return Err(PullError::Network(format!(
            "blob {}: expected {} bytes, received {}",
            blob_sum, content_length, written
        )));
    }
    write_tar_padding(out, written).await
}

/// Run the producer on a background task, returning the read half of the
/// pipe. On error the write half is dropped, which surfaces to the reader
/// as a truncated archive.
pub fn stream_layers(remote: Arc<Remote>, logger: Logger) -> DuplexStream {
    let (reader, mut writer) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        match produce(&remote, &logger, &mut writer).await {
            Ok(()) => {
                let _ = writer.shutdown().await;
            }
            Err(e) => {
                logger.error(&format!("streaming pull failed: {}", e));
            }
        }
    });
    reader
}

fn next_entry<'a, R: Read>(
    entries: &mut tar::Entries<'a, R>,
    context: &str,
) -> Result<tar::Entry<'a, R>> {
    // EOF is also an error here; a fixed number of entries is expected
    match entries.next() {
        Some(entry) => entry
            .map_err(|e| PullError::Parse(format!("failed to read {} from tar stream: {}", context, e))),
        None => Err(PullError::Parse(format!(
            "failed to read {} from tar stream: unexpected end of archive",
            context
        ))),
    }
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    Ok(entry
        .path()
        .map_err(|e| PullError::Parse(format!("failed to read tar entry name: {}", e)))?
        .to_string_lossy()
        .into_owned())
}

/// Read one image from a tar stream produced by [`produce`] and reconstruct
/// it into a fresh workspace. The stream carries the manifest first, then
/// the expected blobs in reverse manifest order.
pub fn import_from_stream<R: Read>(
    reader: R,
    reference: &ImageRef,
    workspace_parent: Option<&Path>,
    logger: &Logger,
) -> Result<Workspace> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = archive
        .entries()
        .map_err(|e| PullError::Parse(format!("failed to open tar stream: {}", e)))?;

    let mut manifest_entry = next_entry(&mut entries, "manifest")?;
    let name = entry_name(&manifest_entry)?;
    if name != MANIFEST_FILE_NAME {
        return Err(PullError::Parse(format!(
            "expected {:?} but found {:?}",
            MANIFEST_FILE_NAME, name
        )));
    }
    let mut raw = Vec::with_capacity(manifest_entry.size() as usize);
    manifest_entry.read_to_end(&mut raw)?;
    drop(manifest_entry);

    let signed = SignedManifest::parse(&raw)?;
    let manifest = signed.verify(reference)?.clone();

    let workspace = match workspace_parent {
        Some(parent) => Workspace::create_in(parent)?,
        None => Workspace::create()?,
    };
    match import_layers(&mut entries, &manifest, reference, &workspace, logger) {
        Ok(()) => Ok(workspace),
        Err(e) => {
            let _ = workspace.delete();
            Err(e)
        }
    }
}

fn import_layers<R: Read>(
    entries: &mut tar::Entries<'_, R>,
    manifest: &Manifest,
    reference: &ImageRef,
    workspace: &Workspace,
    logger: &Logger,
) -> Result<()> {
    let mut recon = Reconstructor::new(workspace);

    for i in (0..manifest.fs_layers.len()).rev() {
        let blob_sum = &manifest.fs_layers[i].blob_sum;
        let v1_json = &manifest.history[i].v1_compatibility;
        let throwaway = recon.record_history(v1_json)?;

        let mut entry = next_entry(entries, "layer")?;
        let name = entry_name(&entry)?;
        if name != blob_sum.to_string() {
            return Err(PullError::Parse(format!(
                "expected layer {:?}, but got layer {:?}",
                blob_sum.to_string(),
                name
            )));
        }

        if throwaway {
            // Throwaway layers still occupy a stream entry; drain it so the
            // tar position stays aligned
            logger.detail(&format!("Skipping throw away layer: {}", blob_sum));
            io::copy(&mut entry, &mut io::sink())?;
            continue;
        }

        let stage = recon.begin_layer()?;
        let file = File::create(stage.join("layer.tar"))?;
        let mut unpacker = BlobUnpacker::new(BufWriter::new(file));
        io::copy(&mut entry, &mut unpacker)?;
        let summary = unpacker.finish(blob_sum)?;
        logger.detail(&format!(
            "Imported layer {} with blobsum {}",
            summary.diff_id.short(),
            blob_sum.short()
        ));

        recon.complete_layer(stage, v1_json, summary.diff_id, i == 0)?;
    }

    recon.finalize(reference, &manifest.history[0].v1_compatibility)?;
    Ok(())
}
