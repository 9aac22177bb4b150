//! Command-line surface for the gangwayd binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(
    name = "gangwayd",
    version,
    about = "Connection broker and parallel-transfer portal daemon"
)]
pub struct Cli {
    /// Log filter, e.g. "info" or "gangway=debug"
    #[arg(long, default_value = "info", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the front listener and its agent factory
    Serve(ServeOpts),
    /// Run the agent factory (started internally by serve)
    Factory(FactoryOpts),
}

#[derive(Debug, Parser)]
pub struct ServeOpts {
    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address override (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Runtime directory override
    #[arg(long)]
    pub runtime_dir: Option<PathBuf>,

    /// Ceiling on live agents; overrides the config file
    #[arg(long)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Parser)]
pub struct FactoryOpts {
    /// Control socket to bind
    #[arg(long)]
    pub control: PathBuf,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Config file first, CLI flags on top.
pub fn resolve_config(
    config_path: Option<&PathBuf>,
    opts: Option<&ServeOpts>,
) -> anyhow::Result<ServerConfig> {
    let mut cfg = match config_path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(opts) = opts {
        if let Some(bind) = &opts.bind {
            cfg.bind = bind.clone();
        }
        if let Some(dir) = &opts.runtime_dir {
            cfg.runtime_dir = dir.clone();
        }
        if let Some(max) = opts.max_connections {
            cfg.max_connections = Some(max);
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_override_config() {
        let cli = Cli::parse_from([
            "gangwayd",
            "serve",
            "--bind",
            "127.0.0.1:9500",
            "--max-connections",
            "12",
        ]);
        let Command::Serve(opts) = cli.command else {
            panic!("expected serve");
        };
        let cfg = resolve_config(opts.config.as_ref(), Some(&opts)).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9500");
        assert_eq!(cfg.max_connections, Some(12));
        // untouched settings keep their defaults
        assert_eq!(cfg.max_connect_cnt, 7);
    }

    #[test]
    fn factory_requires_control_socket() {
        assert!(Cli::try_parse_from(["gangwayd", "factory"]).is_err());
        let cli = Cli::parse_from(["gangwayd", "factory", "--control", "/tmp/f.sock"]);
        let Command::Factory(opts) = cli.command else {
            panic!("expected factory");
        };
        assert_eq!(opts.control, PathBuf::from("/tmp/f.sock"));
    }
}
