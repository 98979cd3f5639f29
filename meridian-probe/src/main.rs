//! Diagnostic CLI for region names and account topology.

#![allow(clippy::print_stdout, reason = "CLI tool outputs to stdout")]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use meridian_core::gateway::GatewayTopologySource;
use meridian_core::routing::{canonical_region_name, normalize_region_name};
use meridian_core::telemetry::init_tracing;
use meridian_core::EndpointManager;
use meridian_types::DriverConfig;
use tracing::info;

mod cli;

use cli::{Cli, Commands, RegionCommands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Regions { command: RegionCommands::Normalize { name } } => {
            let normalized = normalize_region_name(&name);
            match canonical_region_name(&name) {
                Some(_) => println!("{normalized}"),
                None => println!("{normalized} (not a known region, passed through)"),
            }
        },
        Commands::Topology { endpoint, preferred_regions, application_region, multi_write, raw } => {
            let mut config = DriverConfig::from_env(endpoint.as_str()).context("invalid configuration")?;
            if !preferred_regions.is_empty() {
                config.preferred_regions = preferred_regions;
            }
            if application_region.is_some() {
                config.application_region = application_region;
            }
            config.use_multiple_write_locations |= multi_write;
            config.enable_background_refresh = false;
            config.check().context("invalid configuration")?;

            let source = Arc::new(GatewayTopologySource::new()?);
            let manager = EndpointManager::new(&config, source).context("invalid endpoint configuration")?;
            info!(endpoint = %endpoint, "Fetching account topology");
            manager.initialize().await.with_context(|| format!("failed to read topology from {endpoint}"))?;

            if raw {
                if let Some(topology) = manager.last_topology() {
                    println!("{}", serde_json::to_string_pretty(&topology)?);
                }
            }
            print_order("read", &manager.read_endpoints());
            print_order("write", &manager.write_endpoints());
        },
    }

    Ok(())
}

fn print_order(label: &str, endpoints: &[url::Url]) {
    println!("{label} endpoints:");
    for (index, endpoint) in endpoints.iter().enumerate() {
        println!("  {index}: {endpoint}");
    }
}
