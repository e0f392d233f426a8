use anyhow::Result;
use clap::Parser;
use switchboard_common::observability::{init_logging, LogConfig};
use switchboard_config::SettingsLoader;

mod bootstrap;

#[derive(Parser)]
#[command(name = "switchboard", about = "Provider-aware LLM request broker")]
struct Cli {
    /// Optional settings file (YAML/TOML/JSON by extension).
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<std::path::PathBuf>,
    /// Override the listen address from the settings.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loader = SettingsLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut settings = loader.load()?;
    if let Some(bind) = cli.bind {
        settings.bind = bind;
    }

    let log_path = init_logging(LogConfig {
        emit_stderr: true,
        ..LogConfig::default()
    })?;
    tracing::info!(log = %log_path.display(), "switchboard starting");

    let bind = settings.bind.clone();
    let state = bootstrap::build(settings).await?;

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    switchboard_server::serve(listener, state).await
}
