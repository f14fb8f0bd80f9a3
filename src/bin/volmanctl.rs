//! `volmanctl` — local command-line stand-in for the network-facing
//! request/response surface spec.md §1 treats as an external collaborator.
//! Exercises a `VolumeManager` backed by the naive-copy backend and a
//! SQLite catalog, in-process, for one invocation at a time.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use volman::{
    Catalog, CreateStrategy, Flavor, IdentityOracle, IdentityRange, NaiveCopyBackend,
    VolumeManager, VolumeRegistry,
};

#[derive(Parser)]
#[command(name = "volmanctl", about = "Inspect and drive a volume manager instance")]
struct Cli {
    /// Root directory under which volume storage and the catalog database live.
    #[arg(long, env = "VOLMAN_HOME", default_value = "./volman-data")]
    home: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new, empty volume.
    Create {
        handle: String,
        #[arg(long, value_enum, default_value = "privileged")]
        flavor: FlavorArg,
    },
    /// Create a COW clone of an existing volume.
    Clone {
        handle: String,
        parent: String,
        #[arg(long, value_enum, default_value = "privileged")]
        flavor: FlavorArg,
    },
    /// Convert a volume to a different privilege flavor in place.
    SetFlavor {
        handle: String,
        #[arg(value_enum)]
        flavor: FlavorArg,
    },
    /// Write a subtree of a volume to a tar stream on stdout.
    StreamOut {
        handle: String,
        #[arg(default_value = "")]
        subpath: PathBuf,
    },
    /// Read a tar stream from stdin into a subtree of a volume.
    StreamIn {
        handle: String,
        #[arg(default_value = "")]
        subpath: PathBuf,
    },
    /// Destroy a volume. Fails while any COW child references it.
    Destroy { handle: String },
    /// List all known volumes.
    List,
    /// Show one volume's record.
    Inspect { handle: String },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum FlavorArg {
    Privileged,
    Unprivileged,
}

impl From<FlavorArg> for Flavor {
    fn from(f: FlavorArg) -> Self {
        match f {
            FlavorArg::Privileged => Flavor::Privileged,
            FlavorArg::Unprivileged => Flavor::Unprivileged,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    volman::logging::init_logging();
    let cli = Cli::parse();

    let catalog = Catalog::open(&cli.home.join("catalog.sqlite3"))
        .context("opening volume catalog")?;
    let registry = VolumeRegistry::new(catalog);
    registry.recover().await.context("recovering volume registry")?;

    let backend = Arc::new(
        NaiveCopyBackend::new(cli.home.join("volumes")).context("initializing backend")?,
    );
    let oracle = IdentityOracle::new(IdentityRange::from_env());
    let manager = VolumeManager::new(registry, backend, oracle);

    match cli.command {
        Command::Create { handle, flavor } => {
            let volume = manager
                .create_volume(handle, CreateStrategy::Empty, flavor.into())
                .await?;
            print_volume(&volume);
        }
        Command::Clone {
            handle,
            parent,
            flavor,
        } => {
            let volume = manager
                .create_volume(handle, CreateStrategy::Cow { parent }, flavor.into())
                .await?;
            print_volume(&volume);
        }
        Command::SetFlavor { handle, flavor } => {
            manager.set_flavor(&handle, flavor.into(), None).await?;
            println!("{handle}: flavor updated");
        }
        Command::StreamOut { handle, subpath } => {
            // `stdout().lock()` is `!Send` and can't cross into the manager's
            // blocking task; the owned, unlocked handle is `Send + Sync` and
            // still writes to the same underlying stream.
            manager
                .stream_out(&handle, &subpath, std::io::stdout(), None)
                .await?;
        }
        Command::StreamIn { handle, subpath } => {
            manager
                .stream_in(&handle, &subpath, std::io::stdin(), None)
                .await?;
            println!("{handle}: stream-in complete");
        }
        Command::Destroy { handle } => {
            manager.destroy(&handle).await?;
            println!("{handle}: destroyed");
        }
        Command::List => {
            for volume in manager.list().await {
                print_volume(&volume);
            }
        }
        Command::Inspect { handle } => {
            let volume = manager.lookup(&handle).await?;
            print_volume(&volume);
        }
    }

    Ok(())
}

fn print_volume(volume: &volman::Volume) {
    println!(
        "{}\t{}\t{:?}\t{:?}\t{}",
        volume.handle,
        volume.path.display(),
        volume.flavor,
        volume.status,
        volume.parent.as_deref().unwrap_or("-"),
    );
}
