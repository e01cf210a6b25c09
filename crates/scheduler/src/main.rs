use anyhow::Result;
use clap::Parser;
use scheduler::app::ApplicationBuilder;
use scheduler::config::{Cli, Commands, RunArgs};
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run(*run_args).await,
    }
}

async fn run(run_args: RunArgs) -> Result<()> {
    let _guard = utils::logging::init(run_args.log_file.as_deref());

    tracing::info!(
        branch = utils::version::branch(),
        "Starting offer scheduler {}",
        &**version::VERSION
    );

    let app = ApplicationBuilder::new(run_args).build().await?;

    let result = app.run().await;
    app.shutdown().await?;
    result
}
