use clap::Parser;
use relm_trainer::pipeline::{output_files, run};
use relm_trainer::Args;
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config()?;
    info!(tasks = ?config.task_names, output_dir = %config.output_dir.display(), "starting run");
    run(&config)?;

    for path in output_files(&config).iter().filter(|p| p.exists()) {
        info!(path = %path.display(), "wrote");
    }
    Ok(())
}
