//! Command line argument parsing and validation
//!
//! Defines the clap argument structs and the validation logic for user
//! input. Validation failures surface before any network traffic happens.

use crate::error::{PullError, Result};
use crate::reference::URI_SCHEME;
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "docker-image-puller",
    version,
    about = "Pull any Docker image. From anywhere.",
    long_about = "Pulls a container image from any Docker Registry v2 compatible registry, \
verifies every layer's content digest, and rebuilds a loadable v1 image archive."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Pull a Docker image
    Pull(PullArgs),
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Validate command line arguments
    pub fn validate(&self) -> Result<()> {
        match &self.command {
            Some(Commands::Pull(args)) => args.validate(),
            None => Err(PullError::Validation(
                "No command provided. Use --help for usage information.".into(),
            )),
        }
    }
}

/// Arguments for the pull command
#[derive(ClapArgs, Debug, Clone)]
pub struct PullArgs {
    /// Image URI (e.g. docker://redis:3.0.5)
    pub image: String,

    /// HTTP proxy for registry traffic; no-proxy environment rules apply
    #[arg(long)]
    pub proxy: Option<String>,

    /// Skip handing the image to a loader after the pull
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_load: bool,

    /// Force the v1 registry protocol
    #[arg(long, action = ArgAction::SetTrue)]
    pub force_v1: bool,

    /// Pre-acquired bearer token for registry auth
    #[arg(long)]
    pub token: Option<String>,

    /// Registry username (AWS access key id for ECR)
    #[arg(short, long)]
    pub username: Option<String>,

    /// Registry password (AWS secret access key for ECR)
    #[arg(short, long)]
    pub password: Option<String>,

    /// PEM file with an extra root CA for the registry
    #[arg(long, value_name = "FILE")]
    pub ca_file: Option<PathBuf>,

    /// Talk to the registry over plain HTTP (local registries only)
    #[arg(long, action = ArgAction::SetTrue)]
    pub plain_http: bool,

    /// Serialize the manifest and blobs to stdout instead of reconstructing
    #[arg(long, action = ArgAction::SetTrue)]
    pub stream: bool,

    /// Where to write the loadable image tar (default: <image>_<tag>.tar)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl PullArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.image.starts_with(URI_SCHEME) {
            return Err(PullError::Validation(format!(
                "Invalid image URI: {}. Expected a {} prefix",
                self.image, URI_SCHEME
            )));
        }

        if (self.username.is_some() && self.password.is_none())
            || (self.username.is_none() && self.password.is_some())
        {
            return Err(PullError::Validation(
                "Username and password must be provided together".to_string(),
            ));
        }

        if self.token.is_some() && self.username.is_some() {
            return Err(PullError::Validation(
                "Cannot specify both --token and --username/--password".to_string(),
            ));
        }

        if let Some(proxy) = &self.proxy {
            url::Url::parse(proxy).map_err(|e| {
                PullError::Validation(format!("Invalid proxy URL: {}. {}", proxy, e))
            })?;
        }

        if let Some(ca_file) = &self.ca_file {
            if !ca_file.exists() {
                return Err(PullError::Validation(format!(
                    "CA file '{}' does not exist",
                    ca_file.display()
                )));
            }
        }

        if self.stream && (self.output.is_some() || self.no_load) {
            return Err(PullError::Validation(
                "--stream writes to stdout and cannot be combined with --output or --no-load"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
