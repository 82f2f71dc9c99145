mod commands;
mod ssh;
mod utils;

use clap::{Parser, Subcommand};
use gsm_cloud_aws::{AwsProvider, AwsRegions};
use gsm_config::Settings;
use gsm_core::{Catalog, Fleet, FleetOptions, Store};
use ssh::SshChannel;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gsm")]
#[command(about = "Game servers on cloud instances, one command each.", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Region to operate in (overrides settings.json)
    #[arg(long, global = true, env = "GSM_REGION")]
    region: Option<String>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a new game server
    Launch {
        /// Game to run (see `gsm games`). Optional with --from-snapshot.
        game: Option<String>,
        /// Server name (default: <game>-<id prefix>)
        #[arg(short, long)]
        name: Option<String>,
        /// Instance type (default: the game's default)
        #[arg(long)]
        instance_type: Option<String>,
        /// Config override, repeatable
        #[arg(short = 'c', long = "config", value_name = "KEY=VALUE")]
        config: Vec<String>,
        /// File with one KEY=VALUE per line
        #[arg(long)]
        config_file: Option<PathBuf>,
        /// Restore the data volume from a snapshot
        #[arg(long, value_name = "SNAPSHOT")]
        from_snapshot: Option<String>,
        /// Pin an elastic address to the new server
        #[arg(long)]
        pin: bool,
    },
    /// Stop the workload and power off the instance
    Pause {
        /// Server id, name or id prefix
        server: String,
    },
    /// Power on a paused server, or restart a stopped workload
    Resume {
        /// Server id, name or id prefix
        server: String,
    },
    /// Stop the workload, keep the instance running
    Stop {
        /// Server id, name or id prefix
        server: String,
    },
    /// Delete a server and every resource it owns
    Destroy {
        /// Server id, name or id prefix
        server: String,
    },
    /// Show one server
    Info {
        /// Server id, name or id prefix
        server: String,
    },
    /// List servers
    List,
    /// Snapshot a server's data volume
    Snapshot {
        /// Server id, name or id prefix
        server: String,
    },
    /// List snapshots
    Snapshots,
    /// Delete a snapshot
    #[command(name = "snapshot-delete")]
    SnapshotDelete {
        /// Snapshot record id or provider snapshot id
        snapshot: String,
    },
    /// Pin an elastic address to a server
    Pin {
        /// Server id, name or id prefix
        server: String,
        /// Reuse this existing allocation
        #[arg(long, value_name = "ALLOCATION_ID")]
        allocation: Option<String>,
    },
    /// Release a server's elastic address
    Unpin {
        /// Server id, name or id prefix
        server: String,
        /// Confirm releasing the address (it cannot be recovered)
        #[arg(short, long)]
        yes: bool,
    },
    /// List elastic addresses owned by gsm
    Addresses,
    /// List the games that can be launched
    Games,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays parseable
    utils::init_tracing(cli.verbose);

    let mut settings = Settings::load()?;
    if let Some(region) = cli.region {
        settings.region = region;
    }
    let catalog = load_catalog(&settings)?;

    // Games only needs the catalog
    if matches!(cli.command, Commands::Games) {
        commands::games::handle(&catalog);
        return Ok(());
    }

    let fleet = build_fleet(&settings, catalog).await;

    match cli.command {
        Commands::Launch {
            game,
            name,
            instance_type,
            config,
            config_file,
            from_snapshot,
            pin,
        } => {
            let request = commands::launch::request(
                game,
                name,
                instance_type,
                &config,
                config_file,
                from_snapshot,
                pin,
            )?;
            commands::launch::handle(&fleet, &request).await?;
        }
        Commands::Pause { server } => {
            commands::lifecycle::pause(&fleet, &server).await?;
        }
        Commands::Resume { server } => {
            commands::lifecycle::resume(&fleet, &server).await?;
        }
        Commands::Stop { server } => {
            commands::lifecycle::stop(&fleet, &server).await?;
        }
        Commands::Destroy { server } => {
            commands::lifecycle::destroy(&fleet, &server).await?;
        }
        Commands::Info { server } => {
            commands::list::info(&fleet, &server).await?;
        }
        Commands::List => {
            commands::list::list(&fleet).await?;
        }
        Commands::Snapshot { server } => {
            commands::snapshot::create(&fleet, &server).await?;
        }
        Commands::Snapshots => {
            commands::snapshot::list(&fleet).await?;
        }
        Commands::SnapshotDelete { snapshot } => {
            commands::snapshot::delete(&fleet, &snapshot).await?;
        }
        Commands::Pin { server, allocation } => {
            commands::address::pin(&fleet, &server, allocation.as_deref()).await?;
        }
        Commands::Unpin { server, yes } => {
            commands::address::unpin(&fleet, &server, yes).await?;
        }
        Commands::Addresses => {
            commands::address::list(&fleet).await?;
        }
        Commands::Games => {
            unreachable!("Games is handled before the fleet is built");
        }
    }

    Ok(())
}

fn load_catalog(settings: &Settings) -> anyhow::Result<Catalog> {
    match settings.catalog_file()? {
        Some(path) => {
            tracing::debug!("Loading catalog from {}", path.display());
            Ok(Catalog::load(&path)?)
        }
        None => Ok(Catalog::builtin()),
    }
}

async fn build_fleet(settings: &Settings, catalog: Catalog) -> Fleet {
    let options = FleetOptions::from_settings(settings);
    let provider = AwsProvider::new(settings.region.clone(), options.key_dir.clone()).await;
    let remote = SshChannel::new(options.poll.clone());

    let regions = AwsRegions::new(options.key_dir.clone());

    Fleet::new(
        Store::new(&settings.state_dir),
        catalog,
        Arc::new(provider),
        Arc::new(remote),
        options,
    )
    .with_regions(Arc::new(regions))
}
