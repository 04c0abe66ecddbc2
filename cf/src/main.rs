//! cf - the ClawFlow command-line entrypoint

use clap::Parser;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use clawflow::cli::{build_runtime, print_response, to_command, Cli};
use clawflow::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clawflow=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref())?;
    let project_path = match cli.project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let runtime = build_runtime(&config, &project_path).await?;
    let command = to_command(cli.command)?;
    let response = runtime.handler.handle(command).await;
    print_response(&response);

    if !response.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}
