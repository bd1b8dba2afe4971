//! Loader capability for finalized workspaces
//!
//! The pull pipeline hands its result to an [`ImageLoader`]: anything that
//! accepts a tar stream of the reconstructed workspace. A container
//! runtime's image loader is the intended consumer; the CLI ships a
//! file-writing loader so the archive can be `docker load`ed elsewhere.

use crate::error::{PullError, Result};
use crate::logging::Logger;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, DuplexStream};
use tokio_util::io::SyncIoBridge;

#[async_trait]
pub trait ImageLoader {
    /// Consume a tar stream of a finalized workspace
    async fn load(&mut self, image_tar: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()>;
}

/// Writes the image archive to a file on disk
pub struct FileLoader {
    path: PathBuf,
}

impl FileLoader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ImageLoader for FileLoader {
    async fn load(&mut self, image_tar: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        let mut file = tokio::fs::File::create(&self.path).await.map_err(|e| {
            PullError::Io(format!("failed to create {}: {}", self.path.display(), e))
        })?;
        tokio::io::copy(image_tar, &mut file).await?;
        Ok(())
    }
}

/// Archive a finalized workspace as an uncompressed tar stream. The tar is
/// built on a blocking task writing into a pipe; an archiving error closes
/// the pipe early so the loader observes a truncated stream.
pub fn archive_workspace(workspace: &Path, logger: Logger) -> DuplexStream {
    let (reader, writer) = tokio::io::duplex(64 * 1024);
    let root = workspace.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = write_workspace_tar(&root, SyncIoBridge::new(writer)) {
            logger.error(&format!("failed to archive workspace: {}", e));
        }
    });
    reader
}

fn write_workspace_tar<W: std::io::Write>(root: &Path, out: W) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    let mut entries: Vec<_> = fs::read_dir(root)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        if path.is_dir() {
            builder.append_dir_all(&name, &path)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }
    builder.finish()?;
    Ok(())
}
