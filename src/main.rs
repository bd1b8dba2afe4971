use docker_image_puller::cli::{Args, Commands, Runner};
use docker_image_puller::logging::Logger;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let result = match args.command {
        Some(Commands::Pull(pull_args)) => Runner::new(pull_args).run().await,
        None => {
            eprintln!("No command provided. Use --help for usage information.");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        Logger::new(false).error(&e.to_string());
        std::process::exit(1);
    }
}
