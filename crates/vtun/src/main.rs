//! vtun: Local VPN tunnel tools
//!
//! Validates tunnel configurations and probes proxy endpoints. The engine
//! itself is embedded by the host app, which supplies the OS device.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vtun_engine::{TunnelConfig, probe_endpoints};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const USAGE: &str = "usage: vtun <command>

commands:
  check <config>   validate a TOML or JSON tunnel configuration
  probe <config>   measure connect latency to every proxy endpoint
  version          print the engine version";

enum Command {
    Check(PathBuf),
    Probe(PathBuf),
    Version,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let command = args.next().unwrap_or_default();
    let mut path = || -> Result<PathBuf> {
        args.next()
            .map(PathBuf::from)
            .with_context(|| format!("'{}' needs a config path\n\n{}", command, USAGE))
    };
    match command.as_str() {
        "check" => Ok(Command::Check(path()?)),
        "probe" => Ok(Command::Probe(path()?)),
        "version" | "--version" | "-V" => Ok(Command::Version),
        "" | "help" | "--help" | "-h" => bail!("{}", USAGE),
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    }
}

fn load(path: &Path) -> Result<TunnelConfig> {
    let config = TunnelConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn check(path: &Path) -> Result<()> {
    let config = load(path)?;
    println!("{}: ok", path.display());
    println!("  session   {}", config.session_name);
    println!("  address   {} (mtu {})", config.address, config.mtu);
    println!("  routes    {}", config.routes.len());
    println!("  bypass    {} ranges", config.bypass_ranges().len());
    println!("  udp       {}", if config.enable_udp { "on" } else { "dropped" });
    if config.is_pure_bypass() {
        println!("  mode      pure bypass");
    } else {
        println!("  endpoints {}", config.endpoints.len());
        for endpoint in &config.endpoints {
            println!("    {:<16} {:<24} group {}", endpoint.name, endpoint.addr, endpoint.group);
        }
    }
    println!("  idle      {}s", config.flow_idle_timeout_secs);
    Ok(())
}

async fn probe(path: &Path) -> Result<()> {
    let config = load(path)?;
    if config.endpoints.is_empty() {
        println!("no proxy endpoints configured");
        return Ok(());
    }

    info!("Probing {} endpoints", config.endpoints.len());
    for result in probe_endpoints(&config.endpoints, PROBE_TIMEOUT).await {
        match &result.latency {
            Ok(_) => println!(
                "{:<16} {:<24} {} ms",
                result.endpoint,
                result.addr,
                result.latency_ms().unwrap_or_default()
            ),
            Err(e) => println!("{:<16} {:<24} {}", result.endpoint, result.addr, e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    match parse_args(std::env::args().skip(1))? {
        Command::Check(path) => check(&path),
        Command::Probe(path) => probe(&path).await,
        Command::Version => {
            println!("vtun {}", vtun_engine::version());
            Ok(())
        }
    }
}
