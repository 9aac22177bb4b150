use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gangway::cli::{resolve_config, Cli, Command};
use gangway::{factory, listener};

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .init();

    match cli.command {
        Command::Serve(opts) => {
            let cfg = resolve_config(opts.config.as_ref(), Some(&opts))?;
            listener::run(cfg, opts.config.as_deref())
        }
        Command::Factory(opts) => {
            let cfg = resolve_config(opts.config.as_ref(), None)?;
            factory::run(&opts.control, &cfg)
        }
    }
}
