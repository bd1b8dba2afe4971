//! Registry protocol client: transport, authentication, and blob handling

pub mod auth;
pub mod blob;
pub mod client;
pub mod transport;

pub use auth::{AuthResolver, Credentials};
pub use blob::{BlobSummary, BlobUnpacker};
pub use client::{Remote, RemoteBuilder};
