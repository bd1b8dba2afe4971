//! V1 image reconstruction: config model, workspace, and the layer driver

pub mod reconstruct;
pub mod v1;
pub mod workspace;

pub use reconstruct::Reconstructor;
pub use workspace::Workspace;
