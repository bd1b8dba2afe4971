//! Docker Image Puller
//!
//! `docker-image-puller` is a command-line tool and library for pulling
//! container images from any Docker Registry v2 compatible registry
//! (Docker Hub, ECR, Harbor, private registries) and rebuilding them as
//! loadable v1 image archives, without a local container daemon.
//!
//! ## Features
//! - **Challenge-based authentication**: Bearer token exchange, Basic, and
//!   the out-of-band ECR token flow, with transparent re-authentication.
//! - **Digest verification**: every layer is checked against the manifest's
//!   blob sum while it streams, and the uncompressed diff id feeds the
//!   rootfs chain.
//! - **Loadable output**: the finalized workspace is a valid `docker load`
//!   archive directory (per-layer `VERSION`/`json`/`layer.tar`, plus
//!   `manifest.json` and `repositories`).
//! - **Pull-to-stream mode**: the same image serialized into a single tar
//!   stream, reconstructible on the consumer side of a pipe.
//!
//! ## Main Modules
//! - [`cli`] - Command-line interface and argument parsing.
//! - [`digest`] - Content digests and hashing helpers.
//! - [`error`] - Error types.
//! - [`image`] - V1 image reconstruction and the pull workspace.
//! - [`loader`] - Loader capability for finalized workspaces.
//! - [`logging`] - Output control.
//! - [`manifest`] - Manifest parsing and verification.
//! - [`pull`] - Pull session orchestration.
//! - [`reference`] - `docker://` URI parsing.
//! - [`registry`] - Registry client, transport, and authentication.
//! - [`stream`] - Tar stream producer and consumer.
//!
//! ## Example Usage
//!
//! ```sh
//! docker-image-puller pull docker://redis:3.0.5 --output redis.tar
//! ```

pub mod cli;
pub mod digest;
pub mod error;
pub mod image;
pub mod loader;
pub mod logging;
pub mod manifest;
pub mod pull;
pub mod reference;
pub mod registry;
pub mod stream;

pub use digest::Digest;
pub use error::{PullError, Result};
pub use image::Workspace;
pub use pull::PullSession;
pub use reference::ImageRef;
pub use registry::{Credentials, Remote};
