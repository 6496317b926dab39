// SPDX-FileCopyrightText: 2024 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use std::fs;
use std::io::{self, Read};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log;
use simple_logger;

use spread_node_provisioner::config::{self, ConfigFile, Overrides, Properties};
use spread_node_provisioner::lxd;
use spread_node_provisioner::Provider;

const DEFAULT_PROVIDER: &str = "lxd";
const SSH_PORT: u16 = 22;

#[derive(Parser)]
#[command(name = "spread-node-provisioner")]
#[command(about = "Ad-hoc node provisioning for spread")]
#[command(version = option_env!("BUILD_GIT_VERSION").unwrap_or(env!("CARGO_PKG_VERSION")))]
struct Cli {
    /// Increase logging verbosity, repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a node and hand it off, printing its address.
    Allocate {
        system: String,
        user: String,
        password: String,
        /// Provider to create the node with.
        #[arg(long, default_value = DEFAULT_PROVIDER)]
        provider: String,
    },
    /// Create nodes, keep them until stdin is closed.
    Up {
        provider: String,
        #[arg(required = true)]
        systems: Vec<String>,
    },
    /// Remove the node with given address.
    Deallocate {
        /// Node address, as <addr>:<port>.
        addr: String,
        #[arg(long)]
        provider: Option<String>,
    },
    /// Remove all nodes.
    Cleanup {
        #[arg(long)]
        provider: Option<String>,
    },
}

fn log_level(verbose: u8) -> log::Level {
    match verbose {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

fn load_config() -> Result<ConfigFile> {
    let conf_name = config::config_file_name();
    let cfg_path = config::locate(conf_name)
        .with_context(|| format!("cannot find config file {}", conf_name))?;

    log::debug!("loading config from {}", cfg_path.to_string_lossy());

    let cfg = fs::File::open(&cfg_path).context("cannot open config file")?;
    ConfigFile::load(cfg).context("cannot load config file")
}

/// LXD driver for maintenance commands. Without an explicit provider the
/// defaults are used, no configuration file is needed.
fn lxd_driver(provider: Option<&str>) -> Result<lxd::LxdDriver<lxd::LxcCommandRunner>> {
    let (props, setup) = match provider {
        Some(name) => {
            let conf = load_config()?;
            let props = conf
                .provider_properties(name)
                .context("cannot set up provider")?;
            (props, conf.setup_steps().clone())
        }
        None => (Properties::new(DEFAULT_PROVIDER), Default::default()),
    };
    if let Some(backend) = props.get("type") {
        if backend != lxd::BACKEND_LABEL {
            return Err(anyhow!(
                "provider {} is of type {}, expected {}",
                props.name(),
                backend,
                lxd::BACKEND_LABEL
            ));
        }
    }
    lxd::driver(&props, setup).context("cannot set up LXD backend")
}

fn allocate(provider: &str, system: &str, user: &str, password: &str) -> Result<()> {
    let conf = load_config()?;
    let provider = Provider::from_config(provider, &conf, &Overrides::new())
        .with_context(|| format!("cannot set up provider {}", provider))?;

    let overrides = Overrides::from([
        ("user".to_string(), user.to_string()),
        ("password".to_string(), password.to_string()),
    ]);
    let node = provider
        .create_node(system, &overrides)
        .context("cannot allocate")?;

    // the node outlives this process, spread deallocates it later
    let node = provider
        .detach_node(node.name())
        .with_context(|| format!("node {} vanished", system))?;
    provider.close();

    let addr = node
        .addr()
        .with_context(|| format!("node {} has no address", system))?;
    let port = node.ports().first().copied().unwrap_or(SSH_PORT);
    println!("{}:{}", addr, port);
    Ok(())
}

fn up(provider: &str, systems: &[String]) -> Result<()> {
    let conf = load_config()?;
    let provider = Provider::from_config(provider, &conf, &Overrides::new())
        .with_context(|| format!("cannot set up provider {}", provider))?;

    let nodes = provider
        .create_nodes(systems)
        .context("cannot create nodes")?;
    for node in nodes {
        match node.addr() {
            Some(addr) => println!("{} {}", node.name(), addr),
            None => println!("{} -", node.name()),
        }
    }

    log::info!("nodes are up, close stdin to tear them down");
    let mut sink = Vec::new();
    let res = io::stdin().read_to_end(&mut sink);
    provider.close();
    res.map(|_| ()).context("cannot read stdin")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    simple_logger::init_with_level(log_level(cli.verbose)).context("cannot set up logging")?;

    match cli.command {
        Commands::Allocate {
            system,
            user,
            password,
            provider,
        } => allocate(&provider, &system, &user, &password),
        Commands::Up { provider, systems } => up(&provider, &systems),
        Commands::Deallocate { addr, provider } => {
            let (addr, _port) = addr
                .split_once(':')
                .ok_or_else(|| anyhow!("invalid address, expected <addr>:<port>"))?;

            lxd_driver(provider.as_deref())?
                .deallocate_by_addr(addr)
                .with_context(|| format!("cannot deallocate system with address {}", addr))
        }
        Commands::Cleanup { provider } => lxd_driver(provider.as_deref())?
            .deallocate_all()
            .context("cannot cleanup all nodes"),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_up() {
        let cli = Cli::try_parse_from(["prog", "-vv", "up", "lxd", "a", "b"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Up { provider, systems } => {
                assert_eq!(provider, "lxd");
                assert_eq!(systems, vec!["a", "b"]);
            }
            _ => panic!("unexpected command"),
        }

        assert!(Cli::try_parse_from(["prog", "up", "lxd"]).is_err());
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(0), log::Level::Warn);
        assert_eq!(log_level(2), log::Level::Debug);
        assert_eq!(log_level(7), log::Level::Trace);
    }
}
