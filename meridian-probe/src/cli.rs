use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn", env = "MERIDIAN_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Region name utilities
    Regions {
        #[command(subcommand)]
        command: RegionCommands,
    },
    /// Fetch an account topology and print the resolved endpoint order
    Topology {
        /// Account endpoint, e.g. https://acct.example.net/
        endpoint: String,
        /// Preferred region, in priority order (repeatable)
        #[arg(long = "preferred-region", short = 'p')]
        preferred_regions: Vec<String>,
        /// Region the application runs in
        #[arg(long, conflicts_with = "preferred_regions")]
        application_region: Option<String>,
        /// Allow writes to every write region
        #[arg(long)]
        multi_write: bool,
        /// Print the raw topology JSON as well
        #[arg(long)]
        raw: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum RegionCommands {
    /// Print the canonical form of a region name
    Normalize { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topology_flags() {
        let cli = Cli::parse_from([
            "meridian-probe",
            "topology",
            "https://acct.example.net/",
            "-p",
            "West US",
            "-p",
            "East US",
            "--multi-write",
        ]);
        match cli.command {
            Commands::Topology { preferred_regions, multi_write, application_region, .. } => {
                assert_eq!(preferred_regions, vec!["West US", "East US"]);
                assert!(multi_write);
                assert!(application_region.is_none());
            },
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_application_region_conflicts_with_preferred() {
        let parsed = Cli::try_parse_from([
            "meridian-probe",
            "topology",
            "https://acct.example.net/",
            "-p",
            "West US",
            "--application-region",
            "East US",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_regions_normalize() {
        let cli = Cli::parse_from(["meridian-probe", "regions", "normalize", "westus2"]);
        assert!(matches!(
            cli.command,
            Commands::Regions { command: RegionCommands::Normalize { ref name } } if name == "westus2"
        ));
    }
}
