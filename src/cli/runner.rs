//! Application runner that orchestrates the image pull process

use crate::cli::args::PullArgs;
use crate::error::Result;
use crate::loader::{FileLoader, ImageLoader, archive_workspace};
use crate::logging::Logger;
use crate::pull::PullSession;
use crate::reference::ImageRef;
use crate::registry::client::Remote;
use crate::registry::Credentials;
use crate::stream;
use std::path::PathBuf;

pub struct Runner {
    args: PullArgs,
    logger: Logger,
}

impl Runner {
    pub fn new(args: PullArgs) -> Self {
        // Stream mode owns stdout for the archive; keep log output off it
        let logger = if args.stream {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };
        Self { args, logger }
    }

    pub async fn run(self) -> Result<()> {
        self.args.validate()?;

        let reference = ImageRef::parse(&self.args.image)?;
        self.print_configuration(&reference);

        let remote = Remote::builder(reference.clone())
            .with_credentials(Credentials {
                username: self.args.username.clone(),
                password: self.args.password.clone(),
                token: self.args.token.clone(),
            })
            .with_proxy(self.args.proxy.clone())
            .with_ca_file(self.args.ca_file.clone())
            .with_plain_http(self.args.plain_http)
            .with_logger(self.logger.clone())
            .build()?;

        let session = PullSession::new(remote, self.logger.clone());

        if self.args.force_v1 {
            session.pull_v1().await?;
            return Ok(());
        }

        if self.args.stream {
            let mut stdout = tokio::io::stdout();
            return stream::produce(session.remote(), &self.logger, &mut stdout).await;
        }

        let workspace = session.pull().await?;

        let result = self.load_workspace(&reference, &workspace).await;
        let _ = workspace.delete();
        result
    }

    async fn load_workspace(
        &self,
        reference: &ImageRef,
        workspace: &crate::image::Workspace,
    ) -> Result<()> {
        if self.args.no_load {
            self.logger.step("Skipping image load (--no-load)");
            return Ok(());
        }

        let output = self
            .args
            .output
            .clone()
            .unwrap_or_else(|| default_output_path(reference));
        self.logger
            .step(&format!("Writing image archive to {}", output.display()));

        let mut loader = FileLoader::new(output);
        let mut tar = archive_workspace(workspace.path(), self.logger.clone());
        loader.load(&mut tar).await?;
        self.logger.success("Image archive written");
        Ok(())
    }

    fn print_configuration(&self, reference: &ImageRef) {
        self.logger.phase(&format!("Pulling {}", reference));
        self.logger
            .detail(&format!("registry: {}", reference.hostname()));
        self.logger
            .detail(&format!("repository: {}", reference.repository_path()));
        if let Some(proxy) = &self.args.proxy {
            self.logger.detail(&format!("proxy: {}", proxy));
        }
        if self.args.username.is_some() {
            self.logger.detail("auth: username/password");
        } else if self.args.token.is_some() {
            self.logger.detail("auth: bearer token");
        }
    }
}

fn default_output_path(reference: &ImageRef) -> PathBuf {
    let tag = reference.tag().unwrap_or("latest");
    PathBuf::from(format!(
        "{}_{}.tar",
        reference.image().replace('/', "_"),
        tag.replace(':', "_")
    ))
}
