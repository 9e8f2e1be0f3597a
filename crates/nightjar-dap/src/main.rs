use clap::Parser;
use nightjar_config::NightjarConfig;
use nightjar_dap::wire_server::{self, AdapterOptions};
use std::path::PathBuf;

/// JavaScript debug adapter.
///
/// Speaks DAP over stdio and attaches to runtimes exposing the inspector
/// protocol.
#[derive(Debug, Parser)]
#[command(name = "nightjar-dap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `NIGHTJAR_CONFIG` is used as a fallback. When neither are
    /// provided the adapter uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config);
    nightjar_dap::hardening::init(&config);

    wire_server::run_stdio(AdapterOptions::from_config(&config)).await
}

fn load_config(cli_path: Option<PathBuf>) -> NightjarConfig {
    let Some(path) = nightjar_config::resolve_config_path(cli_path) else {
        return NightjarConfig::default();
    };

    match NightjarConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "nightjar-dap: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            NightjarConfig::default()
        }
    }
}
